//! Restore/migration flows: persisted snapshots come back spawnable, the
//! legacy tool-type fixup applies, queued work drains on startup, remote
//! probes run deferred.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::common::{wait_until, TestEngine};
use switchyard::config::Settings;
use switchyard::host::{MockProcessHost, RemoteConfig, ToolType};
use switchyard::orchestrator::Orchestrator;
use switchyard::persist::{Database, SessionRecord, SessionSnapshotStore};
use switchyard::restore::{RemoteMetadata, RemoteProbe};
use switchyard::store::{LogKind, QueuedItem, Session, SessionState};

fn snapshot_store(dir: &tempfile::TempDir) -> SessionSnapshotStore {
    let db = Database::open(dir.path().join("test.db")).unwrap();
    SessionSnapshotStore::new(db.connection())
}

async fn engine_restored_from(store: &SessionSnapshotStore) -> TestEngine {
    let (events_tx, events_rx) = mpsc::channel(1024);
    let host = Arc::new(MockProcessHost::new(events_tx));
    let mut settings = Settings::default();
    settings.flush_interval = Duration::from_millis(5);

    let (mut orchestrator, handle) = Orchestrator::new(host.clone(), events_rx, settings);
    orchestrator.restore(store).unwrap();
    tokio::spawn(orchestrator.run());
    TestEngine { handle, host }
}

#[tokio::test]
async fn test_restored_sessions_come_back_idle() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot_store(&dir);

    let mut session = Session::new(ToolType::Claude, PathBuf::from("/tmp/p"));
    session.tabs[0].mark_busy();
    session.ai_pid = Some(77);
    store.upsert(&SessionRecord::from(&session)).unwrap();

    let engine = engine_restored_from(&store).await;
    let restored = engine.handle.snapshot(&session.id).unwrap();
    assert_eq!(restored.state, SessionState::Idle);
    assert!(restored.ai_pid.is_none());
    assert!(restored.tabs[0].thinking_started_at.is_none());
}

#[tokio::test]
async fn test_legacy_terminal_tool_type_migrates_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot_store(&dir);

    let mut session = Session::new(ToolType::Terminal, PathBuf::from("/tmp/p"));
    session.tabs[0].agent_session_id = Some("resume-token".into());
    store.upsert(&SessionRecord::from(&session)).unwrap();

    let engine = engine_restored_from(&store).await;
    let restored = engine.handle.snapshot(&session.id).unwrap();
    assert_eq!(restored.tool_type, ToolType::Claude);

    let warnings: Vec<_> = restored.tabs[0]
        .logs
        .iter()
        .filter(|l| l.kind == LogKind::Warning)
        .collect();
    assert_eq!(warnings.len(), 1, "exactly one migration warning");
}

#[tokio::test]
async fn test_persisted_queue_drains_once_engine_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot_store(&dir);

    let mut session = Session::new(ToolType::Claude, PathBuf::from("/tmp/p"));
    let tab_id = session.tabs[0].id.clone();
    session
        .queue
        .push(QueuedItem::message(tab_id, "survived the restart", vec![]));
    store.upsert(&SessionRecord::from(&session)).unwrap();

    let engine = engine_restored_from(&store).await;
    wait_until(|| engine.host.spawn_count() == 1).await;

    let spawned = engine.host.spawned();
    assert_eq!(
        spawned.last().unwrap().prompt.as_deref(),
        Some("survived the restart")
    );
    wait_until(|| {
        engine
            .handle
            .snapshot(&session.id)
            .map(|s| s.queue.is_empty())
            .unwrap_or(false)
    })
    .await;
}

struct FailingProbe;

#[async_trait]
impl RemoteProbe for FailingProbe {
    async fn probe(&self, _remote: &RemoteConfig) -> anyhow::Result<RemoteMetadata> {
        anyhow::bail!("host unreachable")
    }
}

struct HealthyProbe;

#[async_trait]
impl RemoteProbe for HealthyProbe {
    async fn probe(&self, _remote: &RemoteConfig) -> anyhow::Result<RemoteMetadata> {
        Ok(RemoteMetadata {
            is_git_repo: true,
            default_branch: Some("main".into()),
        })
    }
}

async fn engine_with_probe(
    store: &SessionSnapshotStore,
    probe: Arc<dyn RemoteProbe>,
) -> TestEngine {
    let (events_tx, events_rx) = mpsc::channel(1024);
    let host = Arc::new(MockProcessHost::new(events_tx));
    let (orchestrator, handle) = Orchestrator::new(host.clone(), events_rx, Settings::default());
    let mut orchestrator = orchestrator.with_remote_probe(probe);
    orchestrator.restore(store).unwrap();
    tokio::spawn(orchestrator.run());
    TestEngine { handle, host }
}

#[tokio::test]
async fn test_failed_remote_probe_marks_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot_store(&dir);

    let session = Session::new(ToolType::Claude, PathBuf::from("/tmp/p")).with_remote(
        RemoteConfig {
            host: "dead-box".into(),
            user: None,
            port: None,
        },
    );
    store.upsert(&SessionRecord::from(&session)).unwrap();

    let engine = engine_with_probe(&store, Arc::new(FailingProbe)).await;

    // Startup is usable immediately; the failure lands afterwards.
    assert!(engine.handle.snapshot(&session.id).is_some());
    wait_until(|| {
        engine
            .handle
            .snapshot(&session.id)
            .map(|s| s.remote_connection_failed)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_successful_remote_probe_leaves_session_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot_store(&dir);

    let session = Session::new(ToolType::Claude, PathBuf::from("/tmp/p")).with_remote(
        RemoteConfig {
            host: "build-box".into(),
            user: Some("ci".into()),
            port: Some(22),
        },
    );
    store.upsert(&SessionRecord::from(&session)).unwrap();

    let engine = engine_with_probe(&store, Arc::new(HealthyProbe)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let restored = engine.handle.snapshot(&session.id).unwrap();
    assert!(!restored.remote_connection_failed);
}
