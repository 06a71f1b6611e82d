//! Batch/auto-run flows: serial task execution, error pause/resume, stop,
//! and queue handoff.

use std::path::PathBuf;

use super::common::{start_engine, wait_until, TestEngine};
use switchyard::batch::BatchConfig;
use switchyard::notify::Notification;
use switchyard::host::ToolType;
use switchyard::recovery::RecoveryAction;
use switchyard::store::{SessionId, SessionState};

async fn session_with_batch(
    engine: &TestEngine,
    documents: &[&str],
    loop_enabled: bool,
) -> SessionId {
    let session_id = engine
        .handle
        .create_session(ToolType::Claude, PathBuf::from("/tmp/p"), None)
        .await
        .unwrap();
    engine
        .handle
        .start_batch(
            session_id.clone(),
            BatchConfig {
                documents: documents.iter().map(|d| d.to_string()).collect(),
                prompt_template: "Work on {document}".into(),
                loop_enabled,
            },
        )
        .await
        .unwrap();
    session_id
}

#[tokio::test]
async fn test_batch_runs_documents_serially_to_completion() {
    let engine = start_engine().await;
    let mut notifications = engine.handle.subscribe();
    let session_id = session_with_batch(&engine, &["doc1", "doc2", "doc3"], false).await;

    for (spawn_count, doc) in [(1, "doc1"), (2, "doc2"), (3, "doc3")] {
        wait_until(|| engine.host.spawn_count() == spawn_count).await;
        let spawned = engine.host.spawned();
        assert_eq!(
            spawned.last().unwrap().prompt.as_deref(),
            Some(format!("Work on {}", doc).as_str())
        );
        // Task N+1 never starts before task N's exit is observed.
        assert_eq!(engine.host.spawn_count(), spawn_count);
        let running = engine.host.last_process_id().unwrap();
        engine.host.complete(&running, 0).await;
    }

    // Completion reports aggregate stats.
    let outcome = loop {
        match notifications.recv().await.unwrap() {
            Notification::BatchCompleted { outcome, .. } => break outcome,
            _ => continue,
        }
    };
    assert_eq!(outcome.completed_tasks, 3);
    assert_eq!(outcome.total_tasks, 3);
    assert!(!outcome.stopped_early);

    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Idle)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(engine.host.spawn_count(), 3);
}

#[tokio::test]
async fn test_second_batch_on_same_session_rejected() {
    let engine = start_engine().await;
    let session_id = session_with_batch(&engine, &["doc1"], false).await;

    let result = engine
        .handle
        .start_batch(
            session_id,
            BatchConfig {
                documents: vec!["other".into()],
                prompt_template: "{document}".into(),
                loop_enabled: false,
            },
        )
        .await;
    assert!(result.is_err());

    // A different session is unaffected.
    let other = session_with_batch(&engine, &["doc-a"], false).await;
    assert!(engine.handle.snapshot(&other).is_some());
}

#[tokio::test]
async fn test_rate_limit_pauses_batch_and_resume_repeats_document() {
    let engine = start_engine().await;
    let session_id = session_with_batch(&engine, &["doc1", "doc2"], false).await;

    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();

    // Rate limited mid-task: the run freezes at the same document index.
    engine
        .host
        .emit_fault(&process_id, "429: rate limit exceeded")
        .await;
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
    assert_eq!(engine.host.spawn_count(), 1, "paused run spawns nothing");

    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::ResumeAfterError)
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 2).await;

    // Resume continues from the same index, not the next one.
    let spawned = engine.host.spawned();
    assert_eq!(
        spawned.last().unwrap().prompt.as_deref(),
        Some("Work on doc1")
    );
}

#[tokio::test]
async fn test_skip_current_document_moves_on() {
    let engine = start_engine().await;
    let session_id = session_with_batch(&engine, &["doc1", "doc2"], false).await;

    wait_until(|| engine.host.spawn_count() == 1).await;
    let process_id = engine.host.last_process_id().unwrap();
    engine
        .host
        .emit_fault(&process_id, "connection reset: ETIMEDOUT")
        .await;
    wait_until(|| {
        engine
            .handle
            .snapshot(&session_id)
            .map(|s| s.state == SessionState::Error)
            .unwrap_or(false)
    })
    .await;
    engine.host.complete(&process_id, 1).await;

    engine
        .handle
        .recover(session_id.clone(), RecoveryAction::SkipCurrentDocument)
        .await
        .unwrap();
    wait_until(|| engine.host.spawn_count() == 2).await;

    let spawned = engine.host.spawned();
    assert_eq!(
        spawned.last().unwrap().prompt.as_deref(),
        Some("Work on doc2")
    );
}

#[tokio::test]
async fn test_stop_honored_after_in_flight_task() {
    let engine = start_engine().await;
    let mut notifications = engine.handle.subscribe();
    let session_id = session_with_batch(&engine, &["doc1", "doc2", "doc3"], false).await;

    wait_until(|| engine.host.spawn_count() == 1).await;
    engine
        .handle
        .send(switchyard::orchestrator::Command::StopBatch {
            session_id: session_id.clone(),
        })
        .await
        .unwrap();

    // Stop is cooperative: nothing is killed, the task finishes first.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(engine.host.killed().is_empty());

    let running = engine.host.last_process_id().unwrap();
    engine.host.complete(&running, 0).await;

    let outcome = loop {
        match notifications.recv().await.unwrap() {
            Notification::BatchCompleted { outcome, .. } => break outcome,
            _ => continue,
        }
    };
    assert_eq!(outcome.completed_tasks, 1);
    assert_eq!(outcome.total_tasks, 3);
    assert!(outcome.stopped_early);
    assert_eq!(engine.host.spawn_count(), 1);
}

#[tokio::test]
async fn test_queue_handoff_after_batch_completes() {
    let engine = start_engine().await;
    let session_id = session_with_batch(&engine, &["doc1"], false).await;

    wait_until(|| engine.host.spawn_count() == 1).await;

    // A message arrives while the batch task runs: it queues.
    engine
        .handle
        .send_message(session_id.clone(), None, "after the batch")
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

    let running = engine.host.last_process_id().unwrap();
    engine.host.complete(&running, 0).await;

    // The processor hands off to the execution queue once the run is done.
    wait_until(|| engine.host.spawn_count() == 2).await;
    let spawned = engine.host.spawned();
    assert_eq!(
        spawned.last().unwrap().prompt.as_deref(),
        Some("after the batch")
    );
}

#[tokio::test]
async fn test_loop_mode_wraps_until_stopped() {
    let engine = start_engine().await;
    let session_id = session_with_batch(&engine, &["a", "b"], true).await;

    for expected in [1usize, 2, 3] {
        wait_until(|| engine.host.spawn_count() == expected).await;
        let running = engine.host.last_process_id().unwrap();
        engine.host.complete(&running, 0).await;
    }

    // Third spawn wrapped back to the first document.
    wait_until(|| engine.host.spawn_count() >= 3).await;
    let spawned = engine.host.spawned();
    assert_eq!(spawned[2].prompt.as_deref(), Some("Work on a"));

    engine
        .handle
        .send(switchyard::orchestrator::Command::StopBatch { session_id })
        .await
        .unwrap();
}
