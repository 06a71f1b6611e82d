//! Execution-queue flows: FIFO draining, error suspension, recovery.

use std::path::PathBuf;

use super::common::{start_engine, wait_until};
use switchyard::host::ToolType;
use switchyard::recovery::RecoveryAction;
use switchyard::store::{SessionState, TabState};

#[tokio::test]
async fn test_three_queued_items_drain_fifo_one_per_completion() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    // First message spawns directly on the idle session.
    engine
        .handle
        .send_message(session_id.clone(), None, "m0")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;

    // Three more arrive while busy: queued, not spawned.
    for text in ["m1", "m2", "m3"] {
        engine
            .handle
            .send_message(session_id.clone(), None, text)
            .await
            .unwrap();
    }
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.queue.len() == 3)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(engine.host.spawn_count(), 1);

    // Each completion drains exactly one item, in arrival order.
    for (expected_spawns, expected_prompt) in [(2, "m1"), (3, "m2"), (4, "m3")] {
        let running = engine.host.last_process_id().unwrap();
        engine.host.complete(&running, 0).await;
        wait_until(|| engine.host.spawn_count() == expected_spawns).await;
        let spawned = engine.host.spawned();
        assert_eq!(
            spawned.last().unwrap().prompt.as_deref(),
            Some(expected_prompt)
        );
    }

    // Final completion leaves the session idle with an empty queue.
    let running = engine.host.last_process_id().unwrap();
    engine.host.complete(&running, 0).await;
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Idle && s.queue.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(engine.host.spawn_count(), 4);
}

#[tokio::test]
async fn test_drain_suspended_while_error_paused() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "first")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "queued")
        .await
        .unwrap();
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.queue.len() == 1)
            .unwrap_or(false)
    })
    .await;

    // The agent errors out, then exits. Draining must be a no-op.
    engine.host.emit_fault(&process_id, "429 rate limit").await;
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;
    engine.host.complete(&process_id, 1).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let session = engine.handle.snapshot(&session_id).unwrap();
    assert_eq!(session.queue.len(), 1, "queue preserved while paused");
    assert_eq!(engine.host.spawn_count(), 1);

    // RestartAgent clears the error and settles the tab, which counts as
    // the completion event that drains exactly one pending item.
    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::RestartAgent)
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 2).await;

    let spawned = engine.host.spawned();
    assert_eq!(spawned.last().unwrap().prompt.as_deref(), Some("queued"));
    let session = engine.handle.snapshot(&session_id).unwrap();
    assert!(session.agent_error.is_none());
    assert!(session.queue.is_empty());
}

#[tokio::test]
async fn test_queued_message_logs_user_entry_on_drain() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "first")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;

    engine
        .handle
        .send_message(session_id.clone(), None, "second")
        .await
        .unwrap();
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.queue.len() == 1)
            .unwrap_or(false)
    })
    .await;

    let process_id = engine.host.last_process_id().unwrap();
    engine.host.complete(&process_id, 0).await;
    wait_until(|| engine.host.spawn_count() == 2).await;

    let session = engine.handle.snapshot(&session_id).unwrap();
    let tab = session.active_tab().unwrap();
    let user_logs: Vec<_> = tab
        .logs
        .iter()
        .filter(|l| l.kind == switchyard::store::LogKind::User)
        .map(|l| l.text.clone())
        .collect();
    assert_eq!(user_logs, vec!["first".to_string(), "second".to_string()]);
    // Target-wins: the draining tab ends busy, never flickering idle.
    assert_eq!(tab.state, TabState::Busy);
}

#[tokio::test]
async fn test_resume_token_threads_through_spawns() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "first")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    // Agent assigns its resumption token mid-turn.
    engine.host.assign_session(&process_id, "resume-xyz").await;
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .and_then(|s| s.active_tab().map(|t| t.agent_session_id.is_some()))
            .unwrap_or(false)
    })
    .await;

    engine.host.complete(&process_id, 0).await;
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Idle)
            .unwrap_or(false)
    })
    .await;

    engine
        .handle
        .send_message(session_id.clone(), None, "second")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 2).await;

    let spawned = engine.host.spawned();
    assert_eq!(
        spawned.last().unwrap().agent_session_id.as_deref(),
        Some("resume-xyz")
    );
}
