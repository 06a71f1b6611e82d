//! Agent-error classification and recovery.
//!
//! Hosts report raw faults; this layer classifies them into the closed
//! `AgentErrorKind` taxonomy and defines the recovery actions the
//! orchestrator executes. Group-chat failures use their own, much simpler
//! slot keyed by chat id and participant.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host::HostFault;
use crate::route::GroupChatTarget;
use crate::store::{AgentError, AgentErrorKind, SessionId};

/// Recovery actions a user or automation can invoke on an erroring
/// session. Every one of them clears the attached error first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    /// Clear the error and hand control back; no new spawn.
    Retry,
    /// Create a fresh tab, discarding the erroring conversation's
    /// resumption token.
    StartNewSession,
    /// Kill the underlying process (if any) and leave the tab ready for
    /// the next message to respawn.
    RestartAgent,
    /// Switch the session's input to the terminal so the user can run the
    /// agent's login flow directly.
    Authenticate,
    /// Batch-specific: move past the document that errored.
    SkipCurrentDocument,
    /// Batch-specific: re-run the document that errored.
    ResumeAfterError,
    /// Batch-specific: tear the paused run down entirely.
    AbortBatchOnError,
}

impl RecoveryAction {
    pub fn is_batch_action(&self) -> bool {
        matches!(
            self,
            RecoveryAction::SkipCurrentDocument
                | RecoveryAction::ResumeAfterError
                | RecoveryAction::AbortBatchOnError
        )
    }
}

/// Classify a raw host fault into the closed error taxonomy.
///
/// Keyword matching over the reported message is what the wrapped CLIs
/// give us to work with; anything unrecognized lands in `Other` and stays
/// recoverable so the user keeps their options.
pub fn classify_fault(fault: &HostFault) -> (AgentErrorKind, bool) {
    let msg = fault.message.to_lowercase();

    let kind = if msg.contains("rate limit") || msg.contains("429") || msg.contains("too many requests")
    {
        AgentErrorKind::RateLimited
    } else if msg.contains("credit balance")
        || msg.contains("quota")
        || (msg.contains("token") && (msg.contains("exhaust") || msg.contains("limit reached")))
    {
        AgentErrorKind::TokenExhaustion
    } else if msg.contains("401")
        || msg.contains("unauthorized")
        || msg.contains("auth")
        || msg.contains("login")
        || msg.contains("api key")
    {
        AgentErrorKind::AuthExpired
    } else if msg.contains("403") || msg.contains("permission denied") || msg.contains("forbidden")
    {
        AgentErrorKind::PermissionDenied
    } else if msg.contains("no conversation found")
        || msg.contains("session not found")
        || msg.contains("unknown session")
    {
        AgentErrorKind::SessionNotFound
    } else if msg.contains("econnrefused")
        || msg.contains("enotfound")
        || msg.contains("etimedout")
        || msg.contains("network")
        || msg.contains("connection")
    {
        AgentErrorKind::NetworkError
    } else if msg.contains("crashed")
        || msg.contains("exited unexpectedly")
        || msg.contains("killed by signal")
        || msg.contains("segfault")
    {
        AgentErrorKind::AgentCrashed
    } else {
        AgentErrorKind::Other
    };

    // A crashed process or a dead resumption token cannot be retried in
    // place; everything else can.
    let recoverable = !matches!(
        kind,
        AgentErrorKind::AgentCrashed | AgentErrorKind::SessionNotFound
    );
    (kind, recoverable)
}

/// Build the classified error record for a fault on a session.
pub fn agent_error_from_fault(
    fault: &HostFault,
    process_id: &str,
    session_id: &SessionId,
) -> AgentError {
    let (kind, recoverable) = classify_fault(fault);
    AgentError {
        kind,
        message: fault.message.clone(),
        recoverable,
        process_id: process_id.to_string(),
        session_id: session_id.clone(),
        timestamp: Utc::now(),
        details: fault.details.clone(),
    }
}

/// Error recorded for one group-chat participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChatError {
    pub chat_id: Uuid,
    pub participant: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Parallel, simpler error slots for group chats: keyed by chat id and
/// participant name, no session/tab involvement.
#[derive(Debug, Default)]
pub struct GroupChatErrors {
    slots: HashMap<(Uuid, String), GroupChatError>,
}

impl GroupChatErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: &GroupChatTarget, fault: &HostFault) {
        let error = GroupChatError {
            chat_id: target.chat_id,
            participant: target.participant.clone(),
            message: fault.message.clone(),
            timestamp: Utc::now(),
        };
        self.slots
            .insert((target.chat_id, target.participant.clone()), error);
    }

    pub fn get(&self, chat_id: &Uuid, participant: &str) -> Option<&GroupChatError> {
        self.slots.get(&(*chat_id, participant.to_string()))
    }

    pub fn clear(&mut self, chat_id: &Uuid, participant: &str) -> Option<GroupChatError> {
        self.slots.remove(&(*chat_id, participant.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
