//! Process host boundary.
//!
//! Everything that actually owns an OS process lives behind the
//! [`ProcessHost`] trait: the engine asks a host to spawn, interrupt, or
//! kill, and the host reports back through a single asynchronous
//! [`HostEvent`] stream. The engine never touches a child process directly.

pub mod command;
pub mod mock;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::CommandProcessHost;
pub use mock::MockProcessHost;

/// Tool kind driven by a session.
///
/// `Terminal` is the special non-agent kind: a plain shell with no
/// conversation semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolType {
    Claude,
    Codex,
    Gemini,
    Opencode,
    Terminal,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Claude => "claude",
            ToolType::Codex => "codex",
            ToolType::Gemini => "gemini",
            ToolType::Opencode => "opencode",
            ToolType::Terminal => "terminal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "codex" => ToolType::Codex,
            "gemini" => ToolType::Gemini,
            "opencode" => ToolType::Opencode,
            "terminal" => ToolType::Terminal,
            _ => ToolType::Claude,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolType::Claude => "Claude Code",
            ToolType::Codex => "Codex CLI",
            ToolType::Gemini => "Gemini CLI",
            ToolType::Opencode => "OpenCode",
            ToolType::Terminal => "Terminal",
        }
    }

    /// Default binary name looked up on PATH.
    pub fn binary_name(&self) -> &'static str {
        match self {
            ToolType::Claude => "claude",
            ToolType::Codex => "codex",
            ToolType::Gemini => "gemini",
            ToolType::Opencode => "opencode",
            ToolType::Terminal => "sh",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolType::Terminal)
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for ToolType {
    fn default() -> Self {
        ToolType::Claude
    }
}

/// Remote execution target for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

/// Token usage reported by an agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub context_window: Option<i64>,
}

impl UsageStats {
    /// Fold another usage report into this accumulator.
    pub fn fold(&mut self, other: &UsageStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.total_tokens += other.total_tokens;
        if other.context_window.is_some() {
            self.context_window = other.context_window;
        }
    }
}

/// Lifecycle state of a tool invocation inside an agent turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolExecutionState {
    Started,
    Completed,
    Failed,
}

/// A tool invocation reported by an agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub state: ToolExecutionState,
    pub timestamp: DateTime<Utc>,
}

/// Raw, unclassified failure reported by a host.
///
/// Classification into an `AgentError` happens in the recovery layer, not
/// here. The host only forwards what the process said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HostFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }
}

/// Everything a host can tell the engine about a running process.
///
/// Every variant carries the composite process identifier the process was
/// spawned under; routing back to a session/tab is the engine's job.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Stdout fragment.
    Data { process_id: String, chunk: String },
    /// Stderr fragment.
    Stderr { process_id: String, chunk: String },
    /// Process exited.
    Exited {
        process_id: String,
        exit_code: Option<i32>,
    },
    /// Token usage report.
    Usage {
        process_id: String,
        stats: UsageStats,
    },
    /// The agent assigned its opaque resumption token.
    SessionAssigned {
        process_id: String,
        agent_session_id: String,
    },
    /// Slash commands discovered by the agent.
    SlashCommands {
        process_id: String,
        commands: Vec<String>,
    },
    /// Reasoning/thinking text fragment.
    ThinkingChunk { process_id: String, text: String },
    /// Tool invocation state change.
    ToolExecution {
        process_id: String,
        execution: ToolExecution,
    },
    /// Agent-reported failure.
    Fault {
        process_id: String,
        fault: HostFault,
    },
}

impl HostEvent {
    /// The composite identifier this event belongs to.
    pub fn process_id(&self) -> &str {
        match self {
            HostEvent::Data { process_id, .. }
            | HostEvent::Stderr { process_id, .. }
            | HostEvent::Exited { process_id, .. }
            | HostEvent::Usage { process_id, .. }
            | HostEvent::SessionAssigned { process_id, .. }
            | HostEvent::SlashCommands { process_id, .. }
            | HostEvent::ThinkingChunk { process_id, .. }
            | HostEvent::ToolExecution { process_id, .. }
            | HostEvent::Fault { process_id, .. } => process_id,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            HostEvent::Data { .. } => "Data",
            HostEvent::Stderr { .. } => "Stderr",
            HostEvent::Exited { .. } => "Exited",
            HostEvent::Usage { .. } => "Usage",
            HostEvent::SessionAssigned { .. } => "SessionAssigned",
            HostEvent::SlashCommands { .. } => "SlashCommands",
            HostEvent::ThinkingChunk { .. } => "ThinkingChunk",
            HostEvent::ToolExecution { .. } => "ToolExecution",
            HostEvent::Fault { .. } => "Fault",
        }
    }
}

/// Configuration for spawning one process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Composite identifier the host must tag every event with.
    pub process_id: String,
    pub tool_type: ToolType,
    pub cwd: PathBuf,
    /// Explicit command override (terminal processes); `None` means the
    /// tool's own binary.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub prompt: Option<String>,
    pub images: Vec<PathBuf>,
    /// Resumption token from a previous turn, if any.
    pub agent_session_id: Option<String>,
    pub read_only: bool,
    pub remote: Option<RemoteConfig>,
}

impl SpawnSpec {
    pub fn new(process_id: impl Into<String>, tool_type: ToolType, cwd: PathBuf) -> Self {
        Self {
            process_id: process_id.into(),
            tool_type,
            cwd,
            command: None,
            args: Vec::new(),
            prompt: None,
            images: Vec::new(),
            agent_session_id: None,
            read_only: false,
            remote: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_resume(mut self, agent_session_id: impl Into<String>) -> Self {
        self.agent_session_id = Some(agent_session_id.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Handle returned from a successful spawn.
#[derive(Debug, Clone, Copy)]
pub struct ProcessHandle {
    pub pid: u32,
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("process {0} is not running")]
    NotRunning(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Owner of real OS processes.
///
/// `spawn`/`interrupt`/`kill` are asynchronous requests; completion is only
/// observable through the event stream (an `Exited` event), never assumed
/// from the call returning.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle, HostError>;

    /// Request cooperative termination. A well-behaved process exits soon
    /// after and the host emits `Exited`.
    async fn interrupt(&self, process_id: &str) -> Result<(), HostError>;

    /// Force-kill. A process that is already gone is treated as success.
    async fn kill(&self, process_id: &str) -> Result<(), HostError>;
}
