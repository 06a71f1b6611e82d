//! Recovery flows: spawn failures, recovery actions, interrupt
//! escalation, group-chat faults.

use std::path::PathBuf;

use super::common::{start_engine, wait_until};
use switchyard::host::ToolType;
use switchyard::notify::Notification;
use switchyard::recovery::RecoveryAction;
use switchyard::route::ProcessTarget;
use switchyard::store::{InputMode, LogKind, SessionState, TabState};

#[tokio::test]
async fn test_spawn_failure_surfaces_session_error_with_log_entry() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine.host.fail_spawns("claude");
    engine
        .handle
        .send_message(session_id.clone(), None, "hello")
        .await
        .unwrap();

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;

    let session = engine.handle.snapshot(&session_id).unwrap();
    let tab = session.active_tab().unwrap();
    assert_eq!(tab.state, TabState::Idle);
    assert!(tab
        .logs
        .iter()
        .any(|l| l.kind == LogKind::Warning && l.text.contains("Failed to start agent")));
    assert!(session.agent_error.is_some());
}

#[tokio::test]
async fn test_start_new_session_creates_fresh_tab() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "hello")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();
    engine.host.assign_session(&process_id, "dead-token").await;
    engine
        .host
        .emit_fault(&process_id, "No conversation found with session ID dead-token")
        .await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;
    // Non-recoverable taxonomy entry.
    let session = engine.handle.snapshot(&session_id).unwrap();
    assert!(!session.agent_error.as_ref().unwrap().recoverable);

    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::StartNewSession)
        .await
        .unwrap();

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.tabs.len() == 2 && s.agent_error.is_none())
            .unwrap_or(false)
    })
    .await;

    let session = engine.handle.snapshot(&session_id).unwrap();
    let fresh = session.active_tab().unwrap();
    // The erroring conversation's resumption token is left behind.
    assert!(fresh.agent_session_id.is_none());
    assert!(fresh.logs.is_empty());
}

#[tokio::test]
async fn test_authenticate_switches_input_mode() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "hello")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();
    engine
        .host
        .emit_fault(&process_id, "401 Unauthorized: API key expired")
        .await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;

    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::Authenticate)
        .await
        .unwrap();

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.input_mode == InputMode::Terminal && s.agent_error.is_none())
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_retry_clears_error_without_spawning() {
    let engine = start_engine().await;
    let mut notifications = engine.handle.subscribe();
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "hello")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();
    engine.host.emit_fault(&process_id, "rate limit").await;
    engine.host.complete(&process_id, 1).await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;

    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::Retry)
        .await
        .unwrap();

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.agent_error.is_none())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(engine.host.spawn_count(), 1, "retry spawns nothing");

    // The invocation is notified for downstream observers.
    let mut saw_recovery = false;
    while let Ok(notification) = notifications.try_recv() {
        if let Notification::RecoveryInvoked { action, .. } = notification {
            assert_eq!(action, RecoveryAction::Retry);
            saw_recovery = true;
        }
    }
    assert!(saw_recovery);
}

#[tokio::test]
async fn test_interrupt_escalates_to_kill_when_no_exit() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "long task")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    engine
        .handle
        .send(switchyard::orchestrator::Command::Interrupt {
            session_id: session_id.clone(),
            tab_id: None,
        })
        .await
        .unwrap();

    wait_until(|| engine.host.interrupted().contains(&process_id)).await;
    // The mock never emits an exit; the escalation window (100ms in tests)
    // elapses and the engine kills.
    wait_until(|| engine.host.killed().contains(&process_id)).await;

    // The tab still settles to idle even though no exit event ever came.
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Idle)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_interrupt_answered_by_exit_never_escalates() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "task")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    engine
        .handle
        .send(switchyard::orchestrator::Command::Interrupt {
            session_id: session_id.clone(),
            tab_id: None,
        })
        .await
        .unwrap();
    wait_until(|| engine.host.interrupted().contains(&process_id)).await;

    // Cooperative exit in time: no kill.
    engine.host.complete(&process_id, 130).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(engine.host.killed().is_empty());
}

#[tokio::test]
async fn test_group_chat_fault_routes_to_chat_slot_not_sessions() {
    let engine = start_engine().await;
    let mut notifications = engine.handle.subscribe();
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    let chat_id = uuid::Uuid::new_v4();
    let tag = format!("group-chat-{}-moderator-1712345678", chat_id);
    engine.host.emit_fault(&tag, "moderator crashed").await;

    let error = loop {
        match notifications.recv().await.unwrap() {
            Notification::GroupChatFault(error) => break error,
            _ => continue,
        }
    };
    assert_eq!(error.chat_id, chat_id);
    assert_eq!(error.participant, "moderator");

    // No session picked up the failure.
    let session = engine.handle.snapshot(&session_id).unwrap();
    assert!(session.agent_error.is_none());
    assert_eq!(session.state, SessionState::Idle);
}

#[tokio::test]
async fn test_kill_of_already_gone_process_settles_tab() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "task")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();
    // The process dies on its own before the kill lands.
    engine.host.complete(&process_id, 0).await;

    let tab_id = engine
        .handle
        .snapshot(&session_id)
        .unwrap()
        .active_tab_id
        .clone();
    engine
        .handle
        .send(switchyard::orchestrator::Command::Kill {
            session_id: session_id.clone(),
            tab_id: Some(tab_id),
        })
        .await
        .unwrap();

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Idle)
            .unwrap_or(false)
    })
    .await;

    // "Not found" counted as success.
    assert!(engine.host.killed().contains(&ProcessTarget::agent_tag(
        &session_id,
        &engine.handle.snapshot(&session_id).unwrap().active_tab_id
    )));
}
