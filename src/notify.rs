//! Outbound notifications.
//!
//! Observers (UI, persistence mirrors, desktop notifications) receive full
//! snapshots and are expected to be idempotent re-renderers, not
//! incremental-diff consumers.

use serde::Serialize;

use crate::batch::BatchOutcome;
use crate::recovery::{GroupChatError, RecoveryAction};
use crate::store::{Session, SessionId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// A mutation settled; full session snapshot attached.
    SessionUpdated(Box<Session>),
    /// A batch run advanced to a new document.
    BatchProgress {
        session_id: SessionId,
        current_index: usize,
        total: usize,
        document: String,
    },
    /// A batch run settled (completed, stopped, or aborted).
    BatchCompleted {
        session_id: SessionId,
        outcome: BatchOutcome,
    },
    /// A recovery action was invoked on an erroring session.
    RecoveryInvoked {
        session_id: SessionId,
        action: RecoveryAction,
    },
    /// A group-chat participant reported a failure.
    GroupChatFault(GroupChatError),
}
