//! Streaming and routing: coalesced output, batch-tag short-circuit,
//! hyphenated identifiers.

use std::path::PathBuf;

use super::common::{start_engine, wait_until};
use switchyard::host::{ToolType, UsageStats};
use switchyard::route::ProcessTarget;
use switchyard::store::{LogKind, SessionState};

#[tokio::test]
async fn test_fragments_flush_as_single_log_entry() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "hi")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    engine.host.emit_data(&process_id, "He").await;
    engine.host.emit_data(&process_id, "llo").await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .and_then(|s| {
                s.active_tab().map(|t| {
                    t.logs
                        .iter()
                        .any(|l| l.kind == LogKind::Assistant && l.text == "Hello")
                })
            })
            .unwrap_or(false)
    })
    .await;

    let session = engine.handle.snapshot(&session_id).unwrap();
    let assistant_entries: Vec<_> = session
        .active_tab()
        .unwrap()
        .logs
        .iter()
        .filter(|l| l.kind == LogKind::Assistant)
        .collect();
    assert_eq!(assistant_entries.len(), 1, "one entry, not one per fragment");
}

#[tokio::test]
async fn test_usage_accumulates_on_tab() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send_message(session_id.clone(), None, "hi")
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    engine
        .host
        .emit_usage(
            &process_id,
            UsageStats {
                input_tokens: 100,
                output_tokens: 40,
                total_tokens: 140,
                ..Default::default()
            },
        )
        .await;
    engine
        .host
        .emit_usage(
            &process_id,
            UsageStats {
                input_tokens: 60,
                output_tokens: 10,
                total_tokens: 70,
                ..Default::default()
            },
        )
        .await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .and_then(|s| s.active_tab().map(|t| t.usage.total_tokens == 210))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_batch_tagged_output_never_reaches_a_tab() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    let batch_tag = ProcessTarget::batch_tag(&session_id, 12345);
    engine.host.emit_data(&batch_tag, "history only").await;
    engine.host.complete(&batch_tag, 0).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let session = engine.handle.snapshot(&session_id).unwrap();
    for tab in &session.tabs {
        assert!(tab.logs.is_empty(), "batch output must not land in tabs");
    }
    assert_eq!(session.state, SessionState::Idle);
}

#[tokio::test]
async fn test_terminal_output_lands_as_terminal_entries() {
    let engine = start_engine().await;
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();

    engine
        .handle
        .send(switchyard::orchestrator::Command::RunTerminalCommand {
            session_id: session_id.clone(),
            command: "ls".into(),
        })
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 1).await;

    let tag = ProcessTarget::terminal_tag(&session_id);
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.terminal_busy)
            .unwrap_or(false)
    })
    .await;

    engine.host.emit_data(&tag, "Cargo.toml src tests").await;
    engine.host.complete(&tag, 0).await;

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| !s.terminal_busy && s.state == SessionState::Idle)
            .unwrap_or(false)
    })
    .await;

    let session = engine.handle.snapshot(&session_id).unwrap();
    let tab = session.active_tab().unwrap();
    assert!(tab
        .logs
        .iter()
        .any(|l| l.kind == LogKind::Terminal && l.text.contains("Cargo.toml")));
}
