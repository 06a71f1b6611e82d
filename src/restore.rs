//! Startup restore and migration.
//!
//! No spawned process survives a restart, so every persisted session comes
//! back with its runtime fields reset. Cheap fixups happen synchronously
//! here; expensive remote checks are deferred to a background pass the
//! orchestrator runs after the session list is already usable.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::host::{RemoteConfig, ToolType};
use crate::store::{LogEntry, Session, SessionId};

/// Text of the synthetic warning appended when a legacy tool type is
/// rewritten.
const TOOL_TYPE_MIGRATION_WARNING: &str =
    "This session was saved with an invalid tool type and has been reset to the default agent.";

/// What the restore pass changed, for logging and the deferred remote
/// check.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Sessions whose tool type was rewritten to the default agent.
    pub migrated_tool_types: Vec<SessionId>,
    /// Remote-bound sessions that still need a connectivity probe.
    pub pending_remote_probes: Vec<SessionId>,
}

/// Reset one restored session to a spawnable state.
///
/// Tabs go idle, thinking timers and transient error state clear, and pids
/// reset to "not yet spawned". Queue contents are deliberately kept: work
/// queued before the restart drains once the engine is ready.
pub fn normalize_session(session: &mut Session, default_agent: ToolType) -> RestoreReport {
    let mut report = RestoreReport::default();

    for tab in &mut session.tabs {
        tab.mark_idle();
        tab.agent_error = None;
    }
    session.agent_error = None;
    session.agent_error_tab_id = None;
    session.agent_error_paused = false;
    session.ai_pid = None;
    session.terminal_pid = None;
    session.terminal_busy = false;
    session.remote_connection_failed = false;

    // Legacy bug: agent sessions persisted with toolType "terminal". A
    // session that ever produced a resumption token is not a terminal.
    let has_agent_history = session
        .tabs
        .iter()
        .any(|tab| tab.agent_session_id.is_some());
    if session.tool_type.is_terminal() && has_agent_history {
        warn!(
            session_id = %session.id,
            default_agent = %default_agent.as_str(),
            "rewriting legacy terminal tool type"
        );
        session.tool_type = default_agent;
        if let Some(tab) = session.active_tab_mut() {
            tab.push_log(LogEntry::warning(TOOL_TYPE_MIGRATION_WARNING));
        }
        report.migrated_tool_types.push(session.id.clone());
    }

    if session.remote.is_some() {
        report.pending_remote_probes.push(session.id.clone());
    }

    session.recompute_state();
    report
}

/// Normalize a whole restored session list.
pub fn restore_sessions(
    sessions: &mut [Session],
    default_agent: ToolType,
) -> RestoreReport {
    let mut report = RestoreReport::default();
    for session in sessions.iter_mut() {
        let one = normalize_session(session, default_agent);
        report.migrated_tool_types.extend(one.migrated_tool_types);
        report
            .pending_remote_probes
            .extend(one.pending_remote_probes);
    }
    info!(
        restored = sessions.len(),
        migrated = report.migrated_tool_types.len(),
        remote = report.pending_remote_probes.len(),
        "session restore complete"
    );
    report
}

/// Metadata discovered by probing a remote execution target.
#[derive(Debug, Clone, Default)]
pub struct RemoteMetadata {
    pub is_git_repo: bool,
    pub default_branch: Option<String>,
}

/// Connectivity/metadata probe for remote-bound sessions. Runs in the
/// deferred background pass, never on the startup path.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn probe(&self, remote: &RemoteConfig) -> anyhow::Result<RemoteMetadata>;
}
