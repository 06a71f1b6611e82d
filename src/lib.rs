pub mod batch;
pub mod coalesce;
pub mod config;
pub mod host;
pub mod inspect;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod persist;
pub mod recovery;
pub mod restore;
pub mod route;
pub mod store;

pub use batch::{BatchConfig, BatchError, BatchOutcome, BatchRunner};
pub use coalesce::UpdateCoalescer;
pub use config::Settings;
pub use host::{
    CommandProcessHost, HostError, HostEvent, HostFault, MockProcessHost, ProcessHost,
    RemoteConfig, SpawnSpec, ToolType, UsageStats,
};
pub use inspect::Inspector;
pub use notify::Notification;
pub use orchestrator::{Command, Orchestrator, OrchestratorError, OrchestratorHandle};
pub use persist::{Database, SessionRecord, SessionSnapshotStore};
pub use recovery::RecoveryAction;
pub use restore::{RemoteProbe, RestoreReport};
pub use route::{GroupChatTarget, ProcessKind, ProcessTarget};
pub use store::{
    AgentError, AgentErrorKind, Session, SessionId, SessionState, SessionStore, Tab, TabId,
    TabState,
};
