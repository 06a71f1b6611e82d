//! Composite process-identifier grammar.
//!
//! Every host event carries one string identifier; this module recovers
//! `(session, tab?, kind)` from it without any shared registry. Grammar,
//! most specific first:
//!
//! - `{session}-ai-{tab}`: an AI turn bound to a tab. Session ids contain
//!   hyphens, so the split happens at the **last** `-ai-` occurrence.
//! - `{session}-terminal`: the session's shell.
//! - `{session}-batch-{stamp}`: unattended batch task whose output goes to
//!   history, never a tab; recognized before any tab lookup.
//! - anything else: plain session id, no tab. Some producers use bare ids
//!   on purpose, so unknown shapes degrade instead of failing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{SessionId, TabId};

const AI_MARKER: &str = "-ai-";
const TERMINAL_SUFFIX: &str = "-terminal";
const BATCH_MARKER: &str = "-batch-";
const GROUP_CHAT_PREFIX: &str = "group-chat-";

/// What kind of process an identifier addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProcessKind {
    /// Interactive or auto-run AI turn bound to a tab.
    Agent { tab_id: TabId },
    /// The session's shell process.
    Terminal,
    /// Unattended batch task; never routed to a tab.
    Batch { stamp: String },
    /// Bare session id with no recognized suffix.
    Plain,
}

/// Parsed routing target of one composite identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTarget {
    pub session_id: SessionId,
    pub kind: ProcessKind,
}

impl ProcessTarget {
    /// Parse a composite identifier. Infallible: unknown shapes degrade to
    /// `Plain` so a malformed producer can never crash routing.
    pub fn parse(raw: &str) -> Self {
        if let Some(idx) = raw.rfind(AI_MARKER) {
            let session = &raw[..idx];
            let tab = &raw[idx + AI_MARKER.len()..];
            if !session.is_empty() && !tab.is_empty() {
                return Self {
                    session_id: SessionId::from_string(session),
                    kind: ProcessKind::Agent {
                        tab_id: TabId::from_string(tab),
                    },
                };
            }
        }

        if let Some(session) = raw.strip_suffix(TERMINAL_SUFFIX) {
            if !session.is_empty() {
                return Self {
                    session_id: SessionId::from_string(session),
                    kind: ProcessKind::Terminal,
                };
            }
        }

        if let Some(idx) = raw.rfind(BATCH_MARKER) {
            let session = &raw[..idx];
            let stamp = &raw[idx + BATCH_MARKER.len()..];
            if !session.is_empty() && !stamp.is_empty() {
                return Self {
                    session_id: SessionId::from_string(session),
                    kind: ProcessKind::Batch {
                        stamp: stamp.to_string(),
                    },
                };
            }
        }

        Self {
            session_id: SessionId::from_string(raw),
            kind: ProcessKind::Plain,
        }
    }

    /// Tab this target delivers to, if any. Batch targets intentionally
    /// resolve to no tab.
    pub fn tab_id(&self) -> Option<&TabId> {
        match &self.kind {
            ProcessKind::Agent { tab_id } => Some(tab_id),
            _ => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.kind, ProcessKind::Batch { .. })
    }

    /// Identifier for an AI turn on a tab.
    pub fn agent_tag(session_id: &SessionId, tab_id: &TabId) -> String {
        format!("{}{}{}", session_id, AI_MARKER, tab_id)
    }

    /// Identifier for a session's shell.
    pub fn terminal_tag(session_id: &SessionId) -> String {
        format!("{}{}", session_id, TERMINAL_SUFFIX)
    }

    /// Identifier for an unattended batch task.
    pub fn batch_tag(session_id: &SessionId, stamp: i64) -> String {
        format!("{}{}{}", session_id, BATCH_MARKER, stamp)
    }
}

/// Parsed group-chat identifier.
///
/// Group chats use their own grammar (`group-chat-{uuid}-moderator-{ts}` /
/// `group-chat-{uuid}-{participant}-{ts}`) and route to an error slot keyed
/// by chat id and participant, not to a session/tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChatTarget {
    pub chat_id: Uuid,
    pub participant: String,
    pub stamp: String,
}

impl GroupChatTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(GROUP_CHAT_PREFIX)?;
        // The chat id is a fixed-width uuid, which keeps participant names
        // containing hyphens unambiguous.
        let uuid_part = rest.get(..36)?;
        let chat_id = Uuid::parse_str(uuid_part).ok()?;
        let rest = rest.get(36..)?.strip_prefix('-')?;

        let (participant, stamp) = rest.rsplit_once('-')?;
        if participant.is_empty() || stamp.is_empty() {
            return None;
        }
        Some(Self {
            chat_id,
            participant: participant.to_string(),
            stamp: stamp.to_string(),
        })
    }

    pub fn is_moderator(&self) -> bool {
        self.participant == "moderator"
    }
}
