//! Persisted session/tab records.
//!
//! The persisted shape is the in-memory model minus transient runtime
//! fields: no busy flags, no thinking timers, no error state, no pids.
//! Queue contents are part of the record on purpose.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::{RemoteConfig, ToolType, UsageStats};
use crate::store::{InputMode, LogEntry, QueuedItem, Session, SessionId, Tab, TabId, TabState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabRecord {
    pub id: TabId,
    pub agent_session_id: Option<String>,
    pub logs: Vec<LogEntry>,
    pub read_only: bool,
    pub show_thinking: bool,
    pub save_to_history: bool,
    pub unread: bool,
    pub usage: UsageStats,
    pub bytes_received: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&Tab> for TabRecord {
    fn from(tab: &Tab) -> Self {
        Self {
            id: tab.id.clone(),
            agent_session_id: tab.agent_session_id.clone(),
            logs: tab.logs.clone(),
            read_only: tab.read_only,
            show_thinking: tab.show_thinking,
            save_to_history: tab.save_to_history,
            unread: tab.unread,
            usage: tab.usage.clone(),
            bytes_received: tab.bytes_received,
            created_at: tab.created_at,
        }
    }
}

impl TabRecord {
    pub fn into_tab(self) -> Tab {
        Tab {
            id: self.id,
            agent_session_id: self.agent_session_id,
            state: TabState::Idle,
            thinking_started_at: None,
            logs: self.logs,
            agent_error: None,
            read_only: self.read_only,
            show_thinking: self.show_thinking,
            save_to_history: self.save_to_history,
            unread: self.unread,
            usage: self.usage,
            bytes_received: self.bytes_received,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub tool_type: ToolType,
    pub working_dir: PathBuf,
    pub active_tab_id: TabId,
    pub input_mode: InputMode,
    pub remote: Option<RemoteConfig>,
    pub tabs: Vec<TabRecord>,
    pub queue: Vec<QueuedItem>,
    pub slash_commands: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            tool_type: session.tool_type,
            working_dir: session.working_dir.clone(),
            active_tab_id: session.active_tab_id.clone(),
            input_mode: session.input_mode,
            remote: session.remote.clone(),
            tabs: session.tabs.iter().map(TabRecord::from).collect(),
            queue: session.queue.clone(),
            slash_commands: session.slash_commands.clone(),
            created_at: session.created_at,
        }
    }
}

impl SessionRecord {
    /// Rehydrate into a session with every transient field at its reset
    /// value. The restore pass normalizes further (tool-type migration,
    /// remote probe scheduling).
    pub fn into_session(self) -> Session {
        let mut tabs: Vec<Tab> = self.tabs.into_iter().map(TabRecord::into_tab).collect();
        if tabs.is_empty() {
            // A session must never exist with zero tabs, even if the row
            // was written by a buggy or truncated producer.
            tabs.push(Tab::new());
        }
        let active_tab_id = if tabs.iter().any(|t| t.id == self.active_tab_id) {
            self.active_tab_id
        } else {
            tabs[0].id.clone()
        };

        let mut session = Session {
            id: self.id,
            tool_type: self.tool_type,
            working_dir: self.working_dir,
            state: crate::store::SessionState::Idle,
            busy_source: None,
            tabs,
            active_tab_id,
            queue: self.queue,
            agent_error: None,
            agent_error_tab_id: None,
            agent_error_paused: false,
            input_mode: self.input_mode,
            ai_pid: None,
            terminal_pid: None,
            terminal_busy: false,
            slash_commands: self.slash_commands,
            remote: self.remote,
            remote_connection_failed: false,
            created_at: self.created_at,
        };
        session.recompute_state();
        session
    }
}
