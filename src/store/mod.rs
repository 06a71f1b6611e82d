//! Authoritative session/tab state store.
//!
//! All engine state lives here and is only changed through the store's
//! mutation API, which recomputes derived session state inside the same
//! mutation that touched a tab flag. Mutations are serialized by the one
//! control thread that owns the store; observers only ever see settled
//! snapshots.

pub mod model;

use tracing::{debug, warn};

pub use model::{
    AgentError, AgentErrorKind, BusySource, InputMode, LogEntry, LogKind, QueuedItem,
    QueuedPayload, Session, SessionId, SessionState, Tab, TabId, TabState,
};

/// Which process a completion event settled.
#[derive(Debug, Clone)]
pub enum FinishedProcess {
    Tab(TabId),
    Terminal,
    /// Completion that maps to no concrete process (e.g. escalated kill of
    /// an already-gone pid). Still drains the queue.
    None,
}

/// A queue item resolved for dispatch: the tab it will run on plus the
/// original item. Returned as an intent; the caller performs the spawn.
#[derive(Debug, Clone)]
pub struct DispatchedItem {
    pub item: QueuedItem,
    pub tab_id: TabId,
}

/// Result of attempting to drain one queued item.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    /// Queue empty, nothing to do.
    Empty,
    /// An agent error is attached; queue preserved, nothing dequeued.
    Suspended,
    /// Head item dequeued and bound to a tab; caller must spawn.
    Dispatched(DispatchedItem),
    /// Head item dequeued but no tab could be resolved at all; only
    /// session-level bookkeeping was updated.
    NoTab(QueuedItem),
}

/// A tab removed by `close_tab`, with whether it should be saved.
#[derive(Debug, Clone)]
pub struct ClosedTab {
    pub tab: Tab,
    pub save_to_history: bool,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.push(session);
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| &s.id == id)?;
        Some(self.sessions.remove(idx))
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<Session> {
        self.session(id).cloned()
    }

    /// Atomic, functional update over one session. Derived state is
    /// recomputed after the updater runs, so no call site can leave a
    /// session with a stale busy/error flag. Returns the settled snapshot.
    pub fn apply_mutation<F>(&mut self, id: &SessionId, updater: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let session = self.sessions.iter_mut().find(|s| &s.id == id)?;
        updater(session);
        session.recompute_state();
        Some(session.clone())
    }

    /// Append a fresh idle tab and make it active.
    pub fn create_tab(&mut self, id: &SessionId) -> Option<TabId> {
        let mut created = None;
        self.apply_mutation(id, |session| {
            let tab = Tab::new();
            session.active_tab_id = tab.id.clone();
            created = Some(tab.id.clone());
            session.tabs.push(tab);
        })?;
        created
    }

    /// Close a tab. Closing the last tab never leaves the session empty: a
    /// fresh idle tab replaces it. Closing an unknown tab or session is a
    /// no-op, not a fault.
    pub fn close_tab(
        &mut self,
        id: &SessionId,
        tab_id: &TabId,
        skip_history: bool,
    ) -> Option<ClosedTab> {
        let mut closed = None;
        self.apply_mutation(id, |session| {
            let Some(idx) = session.tabs.iter().position(|t| &t.id == tab_id) else {
                debug!(session_id = %id, tab_id = %tab_id, "close of unknown tab ignored");
                return;
            };
            let tab = session.tabs.remove(idx);

            if session.tabs.is_empty() {
                let fresh = Tab::new();
                session.active_tab_id = fresh.id.clone();
                session.tabs.push(fresh);
            } else if session.active_tab_id == tab.id {
                let fallback = session.tabs[idx.min(session.tabs.len() - 1)].id.clone();
                session.active_tab_id = fallback;
            }

            let save = tab.save_to_history && !skip_history;
            closed = Some(ClosedTab {
                tab,
                save_to_history: save,
            });
        })?;
        closed
    }

    pub fn set_active_tab(&mut self, id: &SessionId, tab_id: &TabId) -> Option<Session> {
        self.apply_mutation(id, |session| {
            if session.tab(tab_id).is_some() {
                session.active_tab_id = tab_id.clone();
                if let Some(tab) = session.tab_mut(tab_id) {
                    tab.unread = false;
                }
            }
        })
    }

    /// Append a work item to the session's queue. Legal at any time.
    pub fn enqueue(&mut self, id: &SessionId, item: QueuedItem) -> Option<Session> {
        self.apply_mutation(id, |session| {
            session.queue.push(item);
        })
    }

    /// Settle a finished process and drain at most one queued item, as one
    /// atomic mutation.
    ///
    /// The finished tab is marked idle first; if the dequeued item targets
    /// that same tab it is re-marked busy before the mutation settles
    /// (target-wins), so observers never see an idle flicker.
    pub fn handle_completion(
        &mut self,
        id: &SessionId,
        finished: FinishedProcess,
    ) -> (DrainOutcome, Option<Session>) {
        let mut outcome = DrainOutcome::Empty;
        let snapshot = self.apply_mutation(id, |session| {
            match &finished {
                FinishedProcess::Tab(tab_id) => {
                    if let Some(tab) = session.tab_mut(tab_id) {
                        tab.mark_idle();
                    }
                    if !session.any_tab_busy() {
                        session.ai_pid = None;
                    }
                }
                FinishedProcess::Terminal => {
                    session.terminal_busy = false;
                    session.terminal_pid = None;
                }
                FinishedProcess::None => {}
            }

            outcome = Self::drain_one_inner(session);
        });
        (outcome, snapshot)
    }

    /// Drain without a completed process, used when work resumes after an
    /// error clear or a batch handoff.
    pub fn drain_one(&mut self, id: &SessionId) -> (DrainOutcome, Option<Session>) {
        self.handle_completion(id, FinishedProcess::None)
    }

    fn drain_one_inner(session: &mut Session) -> DrainOutcome {
        // An erroring agent must not race ahead on stale queued input.
        if session.agent_error.is_some() || session.agent_error_paused {
            if !session.queue.is_empty() {
                debug!(session_id = %session.id, "queue drain suspended by agent error");
                return DrainOutcome::Suspended;
            }
            return DrainOutcome::Empty;
        }

        if session.queue.is_empty() {
            return DrainOutcome::Empty;
        }
        let item = session.queue.remove(0);

        // The captured tab may have been closed; fall back to the tab the
        // user is looking at now.
        let resolved = if session.tab(&item.tab_id).is_some() {
            Some(item.tab_id.clone())
        } else if session.active_tab().is_some() {
            Some(session.active_tab_id.clone())
        } else {
            None
        };

        let Some(tab_id) = resolved else {
            warn!(
                session_id = %session.id,
                item_id = %item.id,
                "queued item had no resolvable tab; session bookkeeping only"
            );
            return DrainOutcome::NoTab(item);
        };

        if let Some(tab) = session.tab_mut(&tab_id) {
            tab.mark_busy();
            if let QueuedPayload::Message { text, .. } = &item.payload {
                tab.push_log(LogEntry::user(text.clone()));
            }
        }

        DrainOutcome::Dispatched(DispatchedItem { item, tab_id })
    }

    /// Attach an agent error to the session and the resolved tab. An
    /// explicit tab id from the identifier takes priority over the active
    /// tab.
    pub fn report_error(
        &mut self,
        id: &SessionId,
        error: AgentError,
        tab_hint: Option<TabId>,
    ) -> Option<Session> {
        self.apply_mutation(id, |session| {
            let tab_id = tab_hint
                .filter(|t| session.tab(t).is_some())
                .unwrap_or_else(|| session.active_tab_id.clone());
            if let Some(tab) = session.tab_mut(&tab_id) {
                tab.agent_error = Some(error.clone());
            }
            session.agent_error_tab_id = Some(tab_id);
            session.agent_error = Some(error);
            session.agent_error_paused = true;
        })
    }

    /// Destroy the attached agent error. The only way error state goes
    /// away.
    pub fn clear_error(&mut self, id: &SessionId) -> Option<Session> {
        self.apply_mutation(id, |session| {
            session.agent_error = None;
            session.agent_error_tab_id = None;
            session.agent_error_paused = false;
            for tab in &mut session.tabs {
                tab.agent_error = None;
            }
        })
    }
}
