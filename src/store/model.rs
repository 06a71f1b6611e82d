//! Session and tab data model.
//!
//! These records are the single authoritative representation of engine
//! state. Derived fields (`state`, `busy_source`) are recomputed by the
//! store inside every mutation; nothing else is allowed to write them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host::{RemoteConfig, ToolType, UsageStats};

/// Identifier of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one tab within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Displayed session state. `Error` is sticky and overrides busy/idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Busy,
    Error,
}

/// What made a busy session busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusySource {
    Ai,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabState {
    Idle,
    Busy,
}

/// Input routing mode for a session. Switched to `Terminal` by the
/// `Authenticate` recovery action so login flows reach the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputMode {
    #[default]
    Agent,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    User,
    Assistant,
    Thinking,
    Terminal,
    Stderr,
    Tool,
    Warning,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub kind: LogKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(LogKind::User, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(LogKind::Warning, text)
    }
}

/// Closed classification of agent-reported failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AuthExpired,
    TokenExhaustion,
    RateLimited,
    NetworkError,
    AgentCrashed,
    PermissionDenied,
    SessionNotFound,
    Other,
}

/// A classified failure reported by an external agent process.
///
/// Created when the host reports a fault; destroyed only by an explicit
/// clear (one of the recovery actions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    pub recoverable: bool,
    /// Composite identifier of the process that reported the failure.
    pub process_id: String,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    /// Raw diagnostic payload, if the host forwarded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Work payload of a queued item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueuedPayload {
    Message {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<PathBuf>,
    },
    Command {
        command: String,
    },
}

/// One pending work item in a session's execution queue.
///
/// The target tab is captured at enqueue time and never rewritten; drain
/// resolves it against the tabs that still exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: Uuid,
    pub queued_at: DateTime<Utc>,
    pub tab_id: TabId,
    pub payload: QueuedPayload,
    /// Per-item override of the tab's read-only mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

impl QueuedItem {
    pub fn message(tab_id: TabId, text: impl Into<String>, images: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queued_at: Utc::now(),
            tab_id,
            payload: QueuedPayload::Message {
                text: text.into(),
                images,
            },
            read_only: None,
        }
    }

    pub fn command(tab_id: TabId, command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queued_at: Utc::now(),
            tab_id,
            payload: QueuedPayload::Command {
                command: command.into(),
            },
            read_only: None,
        }
    }
}

/// One independent conversation thread inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    /// Opaque resumption token assigned by the agent on its first response.
    pub agent_session_id: Option<String>,
    pub state: TabState,
    pub thinking_started_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub agent_error: Option<AgentError>,
    pub read_only: bool,
    pub show_thinking: bool,
    pub save_to_history: bool,
    pub unread: bool,
    /// Accumulated token usage across turns.
    pub usage: UsageStats,
    /// Raw output bytes received, folded through the batching engine.
    pub bytes_received: u64,
    pub created_at: DateTime<Utc>,
}

impl Tab {
    pub fn new() -> Self {
        Self {
            id: TabId::generate(),
            agent_session_id: None,
            state: TabState::Idle,
            thinking_started_at: None,
            logs: Vec::new(),
            agent_error: None,
            read_only: false,
            show_thinking: true,
            save_to_history: true,
            unread: false,
            usage: UsageStats::default(),
            bytes_received: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state == TabState::Busy
    }

    pub fn mark_busy(&mut self) {
        self.state = TabState::Busy;
        if self.thinking_started_at.is_none() {
            self.thinking_started_at = Some(Utc::now());
        }
    }

    pub fn mark_idle(&mut self) {
        self.state = TabState::Idle;
        self.thinking_started_at = None;
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }
}

impl Default for Tab {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical working context: a working directory, an agent kind, and an
/// ordered list of tabs (never empty while the session exists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub tool_type: ToolType,
    pub working_dir: PathBuf,
    /// Derived; recomputed by the store on every mutation.
    pub state: SessionState,
    /// Derived alongside `state`.
    pub busy_source: Option<BusySource>,
    pub tabs: Vec<Tab>,
    pub active_tab_id: TabId,
    /// Per-session FIFO of pending work. Lives inside the session record so
    /// queue draining and state transitions are one atomic step.
    pub queue: Vec<QueuedItem>,
    pub agent_error: Option<AgentError>,
    pub agent_error_tab_id: Option<TabId>,
    pub agent_error_paused: bool,
    pub input_mode: InputMode,
    pub ai_pid: Option<u32>,
    pub terminal_pid: Option<u32>,
    pub terminal_busy: bool,
    /// Slash commands discovered by the agent, cached for completion.
    pub slash_commands: Vec<String>,
    pub remote: Option<RemoteConfig>,
    pub remote_connection_failed: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(tool_type: ToolType, working_dir: PathBuf) -> Self {
        let tab = Tab::new();
        let active_tab_id = tab.id.clone();
        Self {
            id: SessionId::generate(),
            tool_type,
            working_dir,
            state: SessionState::Idle,
            busy_source: None,
            tabs: vec![tab],
            active_tab_id,
            queue: Vec::new(),
            agent_error: None,
            agent_error_tab_id: None,
            agent_error_paused: false,
            input_mode: InputMode::default(),
            ai_pid: None,
            terminal_pid: None,
            terminal_busy: false,
            slash_commands: Vec::new(),
            remote: None,
            remote_connection_failed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn tab(&self, id: &TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| &t.id == id)
    }

    pub fn tab_mut(&mut self, id: &TabId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| &t.id == id)
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.tab(&self.active_tab_id)
    }

    pub fn active_tab_mut(&mut self) -> Option<&mut Tab> {
        let id = self.active_tab_id.clone();
        self.tab_mut(&id)
    }

    pub fn any_tab_busy(&self) -> bool {
        self.tabs.iter().any(|t| t.is_busy())
    }

    /// Recompute the derived `state`/`busy_source` pair.
    ///
    /// Invariant: `error` whenever an agent error is attached (sticky);
    /// otherwise busy iff at least one tab is busy or the terminal is
    /// running a command.
    pub fn recompute_state(&mut self) {
        if self.agent_error.is_some() {
            self.state = SessionState::Error;
            // Busy source still reflects what is actually running.
            self.busy_source = if self.any_tab_busy() {
                Some(BusySource::Ai)
            } else if self.terminal_busy {
                Some(BusySource::Terminal)
            } else {
                None
            };
            return;
        }

        if self.any_tab_busy() {
            self.state = SessionState::Busy;
            self.busy_source = Some(BusySource::Ai);
        } else if self.terminal_busy {
            self.state = SessionState::Busy;
            self.busy_source = Some(BusySource::Terminal);
        } else {
            self.state = SessionState::Idle;
            self.busy_source = None;
        }
    }
}
