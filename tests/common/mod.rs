//! Shared test utilities for switchyard integration tests.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use switchyard::config::Settings;
use switchyard::host::MockProcessHost;
use switchyard::orchestrator::{Orchestrator, OrchestratorHandle};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
});

pub struct TestEngine {
    pub handle: OrchestratorHandle,
    pub host: Arc<MockProcessHost>,
}

/// Spin up an orchestrator on a mock host with test-friendly timings.
pub async fn start_engine() -> TestEngine {
    Lazy::force(&TRACING);

    let (events_tx, events_rx) = mpsc::channel(1024);
    let host = Arc::new(MockProcessHost::new(events_tx));

    let mut settings = Settings::default();
    settings.flush_interval = Duration::from_millis(5);
    settings.interrupt_escalation = Duration::from_millis(100);

    let (orchestrator, handle) = Orchestrator::new(host.clone(), events_rx, settings);
    tokio::spawn(orchestrator.run());

    TestEngine { handle, host }
}

/// Poll until the condition holds or two seconds pass.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
