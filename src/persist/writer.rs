//! Debounced snapshot writer.
//!
//! The engine sends a full record after every settled mutation; writing
//! each one would hammer the database during streaming. The writer
//! collapses a burst into one upsert per session per debounce window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::record::SessionRecord;
use super::sessions::SessionSnapshotStore;

/// Spawn the writer task. Drops the handle to let it run for the process
/// lifetime; closing the channel flushes pending records and stops it.
pub fn spawn_writer(
    store: SessionSnapshotStore,
    mut rx: mpsc::UnboundedReceiver<SessionRecord>,
    debounce: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut latest: HashMap<String, SessionRecord> = HashMap::new();
            latest.insert(first.id.to_string(), first);

            let deadline = tokio::time::Instant::now() + debounce;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    more = rx.recv() => match more {
                        Some(record) => {
                            latest.insert(record.id.to_string(), record);
                        }
                        // Channel closed: flush what we have and stop.
                        None => break,
                    }
                }
            }

            for record in latest.into_values() {
                if let Err(e) = store.upsert(&record) {
                    warn!(session_id = %record.id, error = %e, "failed to persist session");
                }
            }
        }
    })
}
