//! Constructor-injected inspection hooks.
//!
//! Debug tooling observes the engine through this interface instead of
//! ambient globals: the orchestrator calls it for every routed event and
//! settled mutation when one is installed.

use crate::host::HostEvent;
use crate::route::ProcessTarget;
use crate::store::{Session, SessionId};

pub trait Inspector: Send + Sync {
    /// A host event was parsed and is about to be dispatched.
    fn event_routed(&self, _event: &HostEvent, _target: &ProcessTarget) {}

    /// A mutation settled; the snapshot is what observers will see.
    fn mutation_applied(&self, _session: &Session) {}

    /// A batch run changed phase ("started", "advanced", "paused", ...).
    fn batch_transition(&self, _session_id: &SessionId, _phase: &str) {}
}

/// Inspector that counts activity, handy in tests and debug overlays.
#[derive(Debug, Default)]
pub struct CountingInspector {
    pub events: std::sync::atomic::AtomicU64,
    pub mutations: std::sync::atomic::AtomicU64,
}

impl Inspector for CountingInspector {
    fn event_routed(&self, _event: &HostEvent, _target: &ProcessTarget) {
        self.events
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn mutation_applied(&self, _session: &Session) {
        self.mutations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
