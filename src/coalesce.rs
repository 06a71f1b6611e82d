//! Update batching engine.
//!
//! Streaming agents emit many small fragments per second per (session,
//! tab). Applying each as its own store mutation would be correct but
//! floods observers with redundant notifications. This engine buffers
//! fragments per (session, tab) key and hands back one consolidated delta
//! per session per flush tick, preserving arrival order within each key.
//!
//! The first fragment after a flush is the caller's cue to schedule the
//! next flush; fragments arriving before that tick only grow the buffer.

use std::sync::OnceLock;

use regex::Regex;

use crate::host::{ToolExecution, ToolExecutionState, UsageStats};
use crate::store::{LogEntry, LogKind, SessionId, Tab, TabId, TabState};

/// Minimum length before the tool-name-noise heuristic applies.
const NOISE_MIN_LEN: usize = 16;

fn noise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Unbroken run of concatenated capitalized words, the shape produced
    // when a stream degenerates into glued-together tool names.
    PATTERN.get_or_init(|| Regex::new(r"^(?:[A-Z][a-z0-9]{1,15}){4,}$").unwrap())
}

/// Heuristic: does this buffered text look like concatenated tool-name
/// noise rather than prose?
pub fn is_tool_name_noise(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() >= NOISE_MIN_LEN
        && !trimmed.contains(char::is_whitespace)
        && noise_pattern().is_match(trimmed)
}

/// Buffered updates for one (session, tab) key.
#[derive(Debug, Clone, Default)]
pub struct TabDelta {
    pub text: String,
    pub thinking: String,
    pub terminal: String,
    pub stderr: String,
    pub tools: Vec<ToolExecution>,
    pub unread: bool,
    pub bytes: u64,
    pub usage: Option<UsageStats>,
}

impl TabDelta {
    fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.thinking.is_empty()
            && self.terminal.is_empty()
            && self.stderr.is_empty()
            && self.tools.is_empty()
            && !self.unread
            && self.bytes == 0
            && self.usage.is_none()
    }

    /// Merge this delta into a tab as one mutation's worth of changes.
    pub fn apply_to(self, tab: &mut Tab) {
        tab.bytes_received += self.bytes;
        if let Some(usage) = &self.usage {
            tab.usage.fold(usage);
        }
        if self.unread {
            tab.unread = true;
        }

        if !self.text.is_empty() {
            append_or_push(tab, LogKind::Assistant, self.text);
        }
        if !self.thinking.is_empty() && tab.show_thinking {
            append_or_push(tab, LogKind::Thinking, self.thinking);
        }
        if !self.terminal.is_empty() {
            append_or_push(tab, LogKind::Terminal, self.terminal);
        }
        if !self.stderr.is_empty() {
            append_or_push(tab, LogKind::Stderr, self.stderr);
        }
        for tool in self.tools {
            let state = match tool.state {
                ToolExecutionState::Started => "started",
                ToolExecutionState::Completed => "completed",
                ToolExecutionState::Failed => "failed",
            };
            tab.push_log(LogEntry::new(
                LogKind::Tool,
                format!("{} [{}]", tool.tool_name, state),
            ));
        }
    }
}

/// Streamed fragments continue the trailing entry of the same kind while
/// the tab is still busy; otherwise they start a new entry.
fn append_or_push(tab: &mut Tab, kind: LogKind, text: String) {
    let streaming = tab.state == TabState::Busy;
    if streaming {
        if let Some(last) = tab.logs.last_mut() {
            if last.kind == kind {
                last.text.push_str(&text);
                return;
            }
        }
    }
    tab.push_log(LogEntry::new(kind, text));
}

/// Consolidated updates for one session, in per-tab arrival order.
#[derive(Debug)]
pub struct SessionFlush {
    pub session_id: SessionId,
    pub tabs: Vec<(TabId, TabDelta)>,
}

/// Per-(session, tab) buffer of pending updates.
#[derive(Debug, Default)]
pub struct UpdateCoalescer {
    pending: Vec<((SessionId, TabId), TabDelta)>,
}

impl UpdateCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.iter().all(|(_, delta)| delta.is_empty())
    }

    fn delta_mut(&mut self, session_id: &SessionId, tab_id: &TabId) -> &mut TabDelta {
        let pos = self
            .pending
            .iter()
            .position(|((s, t), _)| s == session_id && t == tab_id);
        match pos {
            Some(idx) => &mut self.pending[idx].1,
            None => {
                self.pending.push((
                    (session_id.clone(), tab_id.clone()),
                    TabDelta::default(),
                ));
                &mut self.pending.last_mut().expect("just pushed").1
            }
        }
    }

    /// Buffer an output fragment. Returns true when this is the first
    /// pending update since the last flush, i.e. the caller should
    /// schedule one.
    pub fn push_data(&mut self, session_id: &SessionId, tab_id: &TabId, chunk: &str) -> bool {
        let first = self.is_empty();
        let delta = self.delta_mut(session_id, tab_id);
        delta.bytes += chunk.len() as u64;
        delta.unread = true;

        // Suppress degenerate streams: if appending would turn the buffer
        // into concatenated tool-name noise, the new fragment replaces the
        // prior one instead of growing it.
        let mut combined = String::with_capacity(delta.text.len() + chunk.len());
        combined.push_str(&delta.text);
        combined.push_str(chunk);
        if is_tool_name_noise(&combined) {
            delta.text = chunk.to_string();
        } else {
            delta.text = combined;
        }
        first
    }

    /// Buffer terminal output; kept apart from agent text so transcripts
    /// keep their kinds straight.
    pub fn push_terminal(&mut self, session_id: &SessionId, tab_id: &TabId, chunk: &str) -> bool {
        let first = self.is_empty();
        let delta = self.delta_mut(session_id, tab_id);
        delta.bytes += chunk.len() as u64;
        delta.terminal.push_str(chunk);
        first
    }

    pub fn push_thinking(&mut self, session_id: &SessionId, tab_id: &TabId, text: &str) -> bool {
        let first = self.is_empty();
        let delta = self.delta_mut(session_id, tab_id);
        delta.thinking.push_str(text);
        first
    }

    pub fn push_stderr(&mut self, session_id: &SessionId, tab_id: &TabId, chunk: &str) -> bool {
        let first = self.is_empty();
        let delta = self.delta_mut(session_id, tab_id);
        delta.bytes += chunk.len() as u64;
        delta.stderr.push_str(chunk);
        first
    }

    pub fn push_tool(
        &mut self,
        session_id: &SessionId,
        tab_id: &TabId,
        execution: ToolExecution,
    ) -> bool {
        let first = self.is_empty();
        self.delta_mut(session_id, tab_id).tools.push(execution);
        first
    }

    pub fn push_usage(
        &mut self,
        session_id: &SessionId,
        tab_id: &TabId,
        stats: &UsageStats,
    ) -> bool {
        let first = self.is_empty();
        let delta = self.delta_mut(session_id, tab_id);
        delta
            .usage
            .get_or_insert_with(UsageStats::default)
            .fold(stats);
        first
    }

    /// Drain all buffered updates, grouped per session. Sessions and tabs
    /// come out in first-arrival order; nothing is reordered across ticks
    /// because the buffer is emptied whole.
    pub fn flush(&mut self) -> Vec<SessionFlush> {
        let mut flushes: Vec<SessionFlush> = Vec::new();
        for ((session_id, tab_id), delta) in self.pending.drain(..) {
            if delta.is_empty() {
                continue;
            }
            match flushes.iter_mut().find(|f| f.session_id == session_id) {
                Some(flush) => flush.tabs.push((tab_id, delta)),
                None => flushes.push(SessionFlush {
                    session_id,
                    tabs: vec![(tab_id, delta)],
                }),
            }
        }
        flushes
    }

    /// Drain buffered updates for a single session, leaving other sessions
    /// untouched. Used to settle ordering before applying an exit or fault
    /// for that session.
    pub fn flush_session(&mut self, session_id: &SessionId) -> Option<SessionFlush> {
        let mut tabs = Vec::new();
        self.pending.retain(|((s, t), delta)| {
            if s == session_id && !delta.is_empty() {
                tabs.push((t.clone(), delta.clone()));
                false
            } else {
                true
            }
        });
        if tabs.is_empty() {
            None
        } else {
            Some(SessionFlush {
                session_id: session_id.clone(),
                tabs,
            })
        }
    }
}
