//! The control loop.
//!
//! One logical thread owns the store and coordinates every concurrently
//! running external process: host events arrive on a single channel, get
//! routed by composite identifier, and are applied as serialized store
//! mutations. Commands from the UI/automation side flow in the opposite
//! direction. Nothing in here holds a lock across an await, and no async
//! callback captures session state: every mutation reads current state at
//! the moment it applies.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{BatchAdvance, BatchConfig, BatchError, BatchRunner, BatchTask};
use crate::coalesce::UpdateCoalescer;
use crate::config::Settings;
use crate::host::{HostEvent, HostFault, ProcessHost, RemoteConfig, SpawnSpec, ToolType};
use crate::inspect::Inspector;
use crate::notify::Notification;
use crate::persist::{SessionRecord, SessionSnapshotStore};
use crate::recovery::{
    agent_error_from_fault, GroupChatErrors, RecoveryAction,
};
use crate::restore::{restore_sessions, RemoteProbe};
use crate::route::{GroupChatTarget, ProcessKind, ProcessTarget};
use crate::store::{
    DrainOutcome, FinishedProcess, InputMode, LogEntry, QueuedItem, QueuedPayload, Session,
    SessionId, SessionState, SessionStore, TabId,
};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("engine is not running")]
    ChannelClosed,
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} already has {1} tabs")]
    TabLimitReached(SessionId, usize),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Commands accepted by the control loop.
pub enum Command {
    CreateSession {
        tool_type: ToolType,
        working_dir: PathBuf,
        remote: Option<RemoteConfig>,
        reply: oneshot::Sender<SessionId>,
    },
    CreateTab {
        session_id: SessionId,
        reply: oneshot::Sender<Result<TabId, OrchestratorError>>,
    },
    CloseTab {
        session_id: SessionId,
        tab_id: TabId,
        skip_history: bool,
    },
    SetActiveTab {
        session_id: SessionId,
        tab_id: TabId,
    },
    SendMessage {
        session_id: SessionId,
        tab_id: Option<TabId>,
        text: String,
        images: Vec<PathBuf>,
        read_only: Option<bool>,
    },
    RunSlashCommand {
        session_id: SessionId,
        tab_id: Option<TabId>,
        command: String,
    },
    RunTerminalCommand {
        session_id: SessionId,
        command: String,
    },
    /// Unattended one-off task; output goes to history, never a tab.
    RunUnattended {
        session_id: SessionId,
        prompt: String,
    },
    Interrupt {
        session_id: SessionId,
        tab_id: Option<TabId>,
    },
    Kill {
        session_id: SessionId,
        tab_id: Option<TabId>,
    },
    StartBatch {
        session_id: SessionId,
        config: BatchConfig,
        reply: oneshot::Sender<Result<(), BatchError>>,
    },
    StopBatch {
        session_id: SessionId,
    },
    Recover {
        session_id: SessionId,
        action: RecoveryAction,
    },
    /// Deferred remote probe settled; applied on the control thread.
    RemoteProbeResolved {
        session_id: SessionId,
        failed: bool,
    },
    Shutdown,
}

/// Cloneable front door to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
    store: Arc<Mutex<SessionStore>>,
}

impl OrchestratorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Read a settled snapshot. Reads never block the control loop for
    /// long; mutations all happen on the loop itself.
    pub fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.store.lock().snapshot(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.store
            .lock()
            .sessions()
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    pub async fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    pub async fn create_session(
        &self,
        tool_type: ToolType,
        working_dir: PathBuf,
        remote: Option<RemoteConfig>,
    ) -> Result<SessionId, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateSession {
            tool_type,
            working_dir,
            remote,
            reply,
        })
        .await?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    pub async fn create_tab(&self, session_id: SessionId) -> Result<TabId, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateTab { session_id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)?
    }

    pub async fn send_message(
        &self,
        session_id: SessionId,
        tab_id: Option<TabId>,
        text: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        self.send(Command::SendMessage {
            session_id,
            tab_id,
            text: text.into(),
            images: Vec::new(),
            read_only: None,
        })
        .await
    }

    pub async fn start_batch(
        &self,
        session_id: SessionId,
        config: BatchConfig,
    ) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartBatch {
            session_id,
            config,
            reply,
        })
        .await?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)??;
        Ok(())
    }

    pub async fn recover(
        &self,
        session_id: SessionId,
        action: RecoveryAction,
    ) -> Result<(), OrchestratorError> {
        self.send(Command::Recover { session_id, action }).await
    }

    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Shutdown).await
    }
}

pub struct Orchestrator {
    store: Arc<Mutex<SessionStore>>,
    host: Arc<dyn ProcessHost>,
    settings: Settings,
    batches: BatchRunner,
    group_chat_errors: GroupChatErrors,
    coalescer: UpdateCoalescer,
    flush_deadline: Option<Instant>,
    /// Interrupts awaiting an exit event, keyed by process identifier.
    escalations: HashMap<String, Instant>,
    /// Tags killed by us whose (possible) trailing exit event must not
    /// drain the queue a second time.
    killed_pending: HashSet<String>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    host_events_rx: mpsc::Receiver<HostEvent>,
    notifications: broadcast::Sender<Notification>,
    persist_tx: Option<mpsc::UnboundedSender<SessionRecord>>,
    remote_probe: Option<Arc<dyn RemoteProbe>>,
    inspector: Option<Arc<dyn Inspector>>,
}

impl Orchestrator {
    /// Build an orchestrator around a host. The host must have been
    /// constructed with the sending half of `host_events_rx`.
    pub fn new(
        host: Arc<dyn ProcessHost>,
        host_events_rx: mpsc::Receiver<HostEvent>,
        settings: Settings,
    ) -> (Self, OrchestratorHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (notifications, _) = broadcast::channel(1024);
        let store = Arc::new(Mutex::new(SessionStore::new()));

        let handle = OrchestratorHandle {
            commands: commands_tx.clone(),
            notifications: notifications.clone(),
            store: store.clone(),
        };

        let orchestrator = Self {
            store,
            host,
            settings,
            batches: BatchRunner::new(),
            group_chat_errors: GroupChatErrors::new(),
            coalescer: UpdateCoalescer::new(),
            flush_deadline: None,
            escalations: HashMap::new(),
            killed_pending: HashSet::new(),
            commands_tx,
            commands_rx,
            host_events_rx,
            notifications,
            persist_tx: None,
            remote_probe: None,
            inspector: None,
        };
        (orchestrator, handle)
    }

    /// Persist snapshots through a debounced writer feeding this store.
    pub fn with_persistence(mut self, tx: mpsc::UnboundedSender<SessionRecord>) -> Self {
        self.persist_tx = Some(tx);
        self
    }

    pub fn with_remote_probe(mut self, probe: Arc<dyn RemoteProbe>) -> Self {
        self.remote_probe = Some(probe);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Load persisted snapshots into the store before the loop starts.
    /// Cheap fixups happen inline; remote probes are deferred to the
    /// background once the loop runs.
    pub fn restore(&mut self, store: &SessionSnapshotStore) -> anyhow::Result<usize> {
        let records = store.load_all()?;
        let mut sessions: Vec<Session> = records
            .into_iter()
            .map(SessionRecord::into_session)
            .collect();
        let report = restore_sessions(&mut sessions, self.settings.default_agent);
        let count = sessions.len();

        {
            let mut guard = self.store.lock();
            for session in sessions {
                guard.insert(session);
            }
        }

        for session_id in report.pending_remote_probes {
            self.schedule_remote_probe(session_id);
        }
        Ok(count)
    }

    /// Run until shutdown. Consumes the orchestrator; interact through the
    /// handle.
    pub async fn run(mut self) {
        // Work queued before a restart drains as soon as the engine is
        // ready.
        let restored: Vec<SessionId> = {
            let guard = self.store.lock();
            guard
                .sessions()
                .iter()
                .filter(|s| !s.queue.is_empty() && s.state == SessionState::Idle)
                .map(|s| s.id.clone())
                .collect()
        };
        for session_id in restored {
            let (outcome, snapshot) = self.store.lock().drain_one(&session_id);
            self.commit_opt(snapshot);
            self.execute_drain(&session_id, outcome).await;
        }

        loop {
            let escalation_deadline = self.next_escalation_deadline();
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.host_events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_host_event(event).await,
                        None => break,
                    }
                }
                _ = sleep_until_opt(self.flush_deadline) => {
                    self.flush_updates();
                }
                _ = sleep_until_opt(escalation_deadline) => {
                    self.fire_due_escalations().await;
                }
            }
        }

        // Settle anything still buffered so observers see final state.
        self.flush_updates();
        info!("orchestrator stopped");
    }

    fn next_escalation_deadline(&self) -> Option<Instant> {
        self.escalations.values().min().copied()
    }

    // ------------------------------------------------------------------
    // Commit plumbing
    // ------------------------------------------------------------------

    fn commit(&self, snapshot: Session) {
        if let Some(inspector) = &self.inspector {
            inspector.mutation_applied(&snapshot);
        }
        if let Some(tx) = &self.persist_tx {
            let _ = tx.send(SessionRecord::from(&snapshot));
        }
        let _ = self
            .notifications
            .send(Notification::SessionUpdated(Box::new(snapshot)));
    }

    fn commit_opt(&self, snapshot: Option<Session>) {
        if let Some(snapshot) = snapshot {
            self.commit(snapshot);
        }
    }

    fn mutate<F>(&self, session_id: &SessionId, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let snapshot = self.store.lock().apply_mutation(session_id, f);
        let found = snapshot.is_some();
        self.commit_opt(snapshot);
        found
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::CreateSession {
                tool_type,
                working_dir,
                remote,
                reply,
            } => {
                let mut session = Session::new(tool_type, working_dir);
                if let Some(remote) = remote {
                    session = session.with_remote(remote);
                }
                let session_id = session.id.clone();
                let snapshot = session.clone();
                self.store.lock().insert(session);
                self.commit(snapshot);
                if self.store.lock().session(&session_id).map(|s| s.remote.is_some()) == Some(true)
                {
                    self.schedule_remote_probe(session_id.clone());
                }
                let _ = reply.send(session_id);
            }
            Command::CreateTab { session_id, reply } => {
                let result = self.create_tab(&session_id);
                let _ = reply.send(result);
            }
            Command::CloseTab {
                session_id,
                tab_id,
                skip_history,
            } => {
                let closed = self.store.lock().close_tab(&session_id, &tab_id, skip_history);
                if let Some(closed) = closed {
                    debug!(
                        session_id = %session_id,
                        tab_id = %closed.tab.id,
                        save = closed.save_to_history,
                        "tab closed"
                    );
                    let snapshot = self.store.lock().snapshot(&session_id);
                    self.commit_opt(snapshot);
                }
            }
            Command::SetActiveTab { session_id, tab_id } => {
                let snapshot = self.store.lock().set_active_tab(&session_id, &tab_id);
                self.commit_opt(snapshot);
            }
            Command::SendMessage {
                session_id,
                tab_id,
                text,
                images,
                read_only,
            } => {
                self.submit_work(
                    &session_id,
                    tab_id,
                    WorkPayload::Message { text, images },
                    read_only,
                )
                .await;
            }
            Command::RunSlashCommand {
                session_id,
                tab_id,
                command,
            } => {
                self.submit_work(&session_id, tab_id, WorkPayload::Command { command }, None)
                    .await;
            }
            Command::RunTerminalCommand {
                session_id,
                command,
            } => {
                self.run_terminal_command(&session_id, command).await;
            }
            Command::RunUnattended { session_id, prompt } => {
                self.run_unattended(&session_id, prompt).await;
            }
            Command::Interrupt {
                session_id,
                tab_id,
            } => {
                self.interrupt(&session_id, tab_id).await;
            }
            Command::Kill { session_id, tab_id } => {
                if let Some(tag) = self.resolve_process_tag(&session_id, tab_id) {
                    self.kill_and_settle(tag).await;
                }
            }
            Command::StartBatch {
                session_id,
                config,
                reply,
            } => {
                let result = self.start_batch(&session_id, config).await;
                let _ = reply.send(result);
            }
            Command::StopBatch { session_id } => {
                self.batches.request_stop(&session_id);
            }
            Command::Recover { session_id, action } => {
                self.recover(&session_id, action).await;
            }
            Command::RemoteProbeResolved { session_id, failed } => {
                self.mutate(&session_id, |session| {
                    session.remote_connection_failed = failed;
                });
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn create_tab(&mut self, session_id: &SessionId) -> Result<TabId, OrchestratorError> {
        let tab_count = {
            let guard = self.store.lock();
            let session = guard
                .session(session_id)
                .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.clone()))?;
            session.tabs.len()
        };
        if tab_count >= self.settings.max_tabs {
            return Err(OrchestratorError::TabLimitReached(
                session_id.clone(),
                tab_count,
            ));
        }

        let tab_id = self
            .store
            .lock()
            .create_tab(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.clone()))?;
        let snapshot = self.store.lock().snapshot(session_id);
        self.commit_opt(snapshot);
        Ok(tab_id)
    }

    /// Interactive work entry point: spawn directly when the target tab is
    /// free and the session allows it, queue otherwise.
    async fn submit_work(
        &mut self,
        session_id: &SessionId,
        tab_id: Option<TabId>,
        payload: WorkPayload,
        read_only: Option<bool>,
    ) {
        enum Decision {
            Spawn(TabId),
            Queue(TabId),
            Drop,
        }

        let decision = {
            let guard = self.store.lock();
            match guard.session(session_id) {
                None => {
                    warn!(session_id = %session_id, "work submitted to unknown session");
                    Decision::Drop
                }
                Some(session) => {
                    let target = tab_id
                        .filter(|t| session.tab(t).is_some())
                        .unwrap_or_else(|| session.active_tab_id.clone());
                    let tab = session.tab(&target);
                    let tab_idle = tab.map(|t| !t.is_busy()).unwrap_or(false);
                    let tab_read_only =
                        read_only.or(tab.map(|t| t.read_only)).unwrap_or(false);

                    // A busy or erroring session queues new work; the one
                    // exception is a free read-only tab, which may run in
                    // parallel with other tabs. Nothing spawns ahead of
                    // items already waiting in the queue.
                    let queue_clear = session.queue.is_empty();
                    if session.state == SessionState::Idle && tab_idle && queue_clear {
                        Decision::Spawn(target)
                    } else if tab_idle
                        && tab_read_only
                        && queue_clear
                        && session.agent_error.is_none()
                    {
                        Decision::Spawn(target)
                    } else {
                        Decision::Queue(target)
                    }
                }
            }
        };

        match decision {
            Decision::Drop => {}
            Decision::Queue(target) => {
                let item = match payload {
                    WorkPayload::Message { text, images } => {
                        let mut item = QueuedItem::message(target, text, images);
                        item.read_only = read_only;
                        item
                    }
                    WorkPayload::Command { command } => {
                        let mut item = QueuedItem::command(target, command);
                        item.read_only = read_only;
                        item
                    }
                };
                let snapshot = self.store.lock().enqueue(session_id, item);
                self.commit_opt(snapshot);
            }
            Decision::Spawn(target) => {
                let (prompt, images, log_user) = match payload {
                    WorkPayload::Message { text, images } => (text, images, true),
                    WorkPayload::Command { command } => (command, Vec::new(), false),
                };
                self.mutate(session_id, |session| {
                    if let Some(tab) = session.tab_mut(&target) {
                        tab.mark_busy();
                        if log_user {
                            tab.push_log(LogEntry::user(prompt.clone()));
                        }
                    }
                });
                self.spawn_agent_turn(session_id, &target, prompt, images, read_only)
                    .await;
            }
        }
    }

    async fn spawn_agent_turn(
        &mut self,
        session_id: &SessionId,
        tab_id: &TabId,
        prompt: String,
        images: Vec<PathBuf>,
        read_only: Option<bool>,
    ) {
        let spec = {
            let guard = self.store.lock();
            let Some(session) = guard.session(session_id) else {
                return;
            };
            let Some(tab) = session.tab(tab_id) else {
                return;
            };
            let tag = ProcessTarget::agent_tag(session_id, tab_id);
            let mut spec = SpawnSpec::new(tag, session.tool_type, session.working_dir.clone());
            spec.prompt = Some(prompt);
            spec.images = images;
            spec.agent_session_id = tab.agent_session_id.clone();
            spec.read_only = read_only.unwrap_or(tab.read_only);
            spec.remote = session.remote.clone();
            if let Some(binary) = self.settings.binary_for(session.tool_type) {
                spec.command = Some(binary.to_string());
            }
            spec
        };

        match self.host.spawn(spec).await {
            Ok(handle) => {
                self.mutate(session_id, |session| {
                    session.ai_pid = Some(handle.pid);
                });
            }
            Err(e) => {
                self.handle_spawn_failure(session_id, tab_id, &e.to_string());
            }
        }
    }

    /// Transport/spawn failures surface as session-level error state with
    /// a synthetic log entry; they are never silently dropped.
    fn handle_spawn_failure(&mut self, session_id: &SessionId, tab_id: &TabId, message: &str) {
        warn!(session_id = %session_id, tab_id = %tab_id, error = %message, "spawn failed");
        let tag = ProcessTarget::agent_tag(session_id, tab_id);
        let fault = HostFault::new(format!("Failed to start agent: {}", message));
        let error = agent_error_from_fault(&fault, &tag, session_id);

        self.mutate(session_id, |session| {
            if let Some(tab) = session.tab_mut(tab_id) {
                tab.mark_idle();
                tab.push_log(LogEntry::warning(fault.message.clone()));
            }
        });
        let snapshot = self
            .store
            .lock()
            .report_error(session_id, error, Some(tab_id.clone()));
        self.commit_opt(snapshot);
        if self.batches.pause_on_error(session_id) {
            self.inspect_batch(session_id, "paused");
        }
    }

    async fn run_terminal_command(&mut self, session_id: &SessionId, command: String) {
        let spec = {
            let guard = self.store.lock();
            let Some(session) = guard.session(session_id) else {
                return;
            };
            let tag = ProcessTarget::terminal_tag(session_id);
            let mut spec = SpawnSpec::new(tag, ToolType::Terminal, session.working_dir.clone());
            spec.prompt = Some(command);
            spec.remote = session.remote.clone();
            spec
        };

        match self.host.spawn(spec).await {
            Ok(handle) => {
                self.mutate(session_id, |session| {
                    session.terminal_busy = true;
                    session.terminal_pid = Some(handle.pid);
                });
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "terminal spawn failed");
                self.mutate(session_id, |session| {
                    if let Some(tab) = session.active_tab_mut() {
                        tab.push_log(LogEntry::warning(format!(
                            "Failed to start terminal: {}",
                            e
                        )));
                    }
                });
            }
        }
    }

    async fn run_unattended(&mut self, session_id: &SessionId, prompt: String) {
        let spec = {
            let guard = self.store.lock();
            let Some(session) = guard.session(session_id) else {
                return;
            };
            let tag = ProcessTarget::batch_tag(session_id, chrono::Utc::now().timestamp_millis());
            let mut spec = SpawnSpec::new(tag, session.tool_type, session.working_dir.clone());
            spec.prompt = Some(prompt);
            spec.remote = session.remote.clone();
            spec
        };
        if let Err(e) = self.host.spawn(spec).await {
            warn!(session_id = %session_id, error = %e, "unattended spawn failed");
        }
    }

    /// Resolve which process a session-level interrupt/kill means: an
    /// explicit tab, else the busiest thing the session is doing.
    fn resolve_process_tag(
        &self,
        session_id: &SessionId,
        tab_id: Option<TabId>,
    ) -> Option<String> {
        let guard = self.store.lock();
        let session = guard.session(session_id)?;
        if let Some(tab_id) = tab_id {
            return Some(ProcessTarget::agent_tag(session_id, &tab_id));
        }
        if let Some(tab) = session.tabs.iter().find(|t| t.is_busy()) {
            return Some(ProcessTarget::agent_tag(session_id, &tab.id));
        }
        if session.terminal_busy {
            return Some(ProcessTarget::terminal_tag(session_id));
        }
        None
    }

    async fn interrupt(&mut self, session_id: &SessionId, tab_id: Option<TabId>) {
        let Some(tag) = self.resolve_process_tag(session_id, tab_id) else {
            debug!(session_id = %session_id, "interrupt with nothing running");
            return;
        };
        if let Err(e) = self.host.interrupt(&tag).await {
            warn!(process_id = %tag, error = %e, "interrupt failed");
        }
        // If no exit arrives within the window, escalate to kill.
        self.escalations
            .insert(tag, Instant::now() + self.settings.interrupt_escalation);
    }

    async fn fire_due_escalations(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .escalations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in due {
            warn!(process_id = %tag, "interrupt unanswered; escalating to kill");
            self.kill_and_settle(tag).await;
        }
    }

    /// Kill a process and settle its tab to idle immediately, treating an
    /// already-gone process as success. A trailing exit event for the same
    /// tag is absorbed without draining the queue twice.
    async fn kill_and_settle(&mut self, tag: String) {
        self.escalations.remove(&tag);
        if let Err(e) = self.host.kill(&tag).await {
            warn!(process_id = %tag, error = %e, "kill failed");
        }
        self.killed_pending.insert(tag.clone());

        if let Some(flush) = self.coalescer.flush_session(&ProcessTarget::parse(&tag).session_id) {
            self.apply_session_flush(flush);
        }
        let target = ProcessTarget::parse(&tag);
        match target.kind {
            ProcessKind::Agent { tab_id } => {
                self.settle_agent_exit(&target.session_id, &tab_id).await;
            }
            ProcessKind::Terminal => {
                let session_id = target.session_id.clone();
                self.settle_non_agent_exit(&session_id, FinishedProcess::Terminal)
                    .await;
            }
            ProcessKind::Batch { .. } | ProcessKind::Plain => {}
        }
    }

    async fn start_batch(
        &mut self,
        session_id: &SessionId,
        config: BatchConfig,
    ) -> Result<(), BatchError> {
        if self.store.lock().session(session_id).is_none() {
            return Err(BatchError::NotRunning(session_id.clone()));
        }
        let total = config.documents.len();
        let task = self.batches.start(session_id, config)?;
        self.inspect_batch(session_id, "started");
        self.notify_batch_progress(session_id, &task, total);
        self.spawn_batch_task(session_id, task).await;
        Ok(())
    }

    async fn spawn_batch_task(&mut self, session_id: &SessionId, task: BatchTask) {
        // Batch tasks run on the session's active tab through the same
        // spawn path as interactive turns.
        let tab_id = {
            let guard = self.store.lock();
            guard
                .session(session_id)
                .map(|session| session.active_tab_id.clone())
        };
        let Some(tab_id) = tab_id else { return };

        self.mutate(session_id, |session| {
            if let Some(tab) = session.tab_mut(&tab_id) {
                tab.mark_busy();
            }
        });
        self.spawn_agent_turn(session_id, &tab_id, task.prompt, Vec::new(), None)
            .await;
    }

    fn notify_batch_progress(&self, session_id: &SessionId, task: &BatchTask, total: usize) {
        let _ = self.notifications.send(Notification::BatchProgress {
            session_id: session_id.clone(),
            current_index: task.index,
            total,
            document: task.document.clone(),
        });
    }

    async fn recover(&mut self, session_id: &SessionId, action: RecoveryAction) {
        let _ = self.notifications.send(Notification::RecoveryInvoked {
            session_id: session_id.clone(),
            action,
        });

        // Every recovery action clears the attached error first.
        let error_tab = {
            let guard = self.store.lock();
            guard
                .session(session_id)
                .and_then(|s| s.agent_error_tab_id.clone())
        };
        let snapshot = self.store.lock().clear_error(session_id);
        self.commit_opt(snapshot);

        match action {
            RecoveryAction::Retry => {
                // No new spawn; the next completion event resumes draining.
            }
            RecoveryAction::StartNewSession => {
                // Fresh tab, fresh conversation: the erroring resumption
                // token stays behind on the old tab.
                if let Err(e) = self.create_tab(session_id) {
                    warn!(session_id = %session_id, error = %e, "failed to create recovery tab");
                }
            }
            RecoveryAction::RestartAgent => {
                if let Some(tab_id) = error_tab {
                    let tag = ProcessTarget::agent_tag(session_id, &tab_id);
                    self.kill_and_settle(tag).await;
                }
            }
            RecoveryAction::Authenticate => {
                self.mutate(session_id, |session| {
                    session.input_mode = InputMode::Terminal;
                });
            }
            RecoveryAction::SkipCurrentDocument => {
                match self.batches.skip_current(session_id) {
                    Ok(advance) => self.apply_batch_advance(session_id, advance).await,
                    Err(e) => warn!(session_id = %session_id, error = %e, "skip failed"),
                }
            }
            RecoveryAction::ResumeAfterError => {
                match self.batches.resume_after_error(session_id) {
                    Ok(task) => {
                        self.inspect_batch(session_id, "resumed");
                        let total = self
                            .batches
                            .run(session_id)
                            .map(|r| r.documents.len())
                            .unwrap_or(0);
                        self.notify_batch_progress(session_id, &task, total);
                        self.spawn_batch_task(session_id, task).await;
                    }
                    Err(e) => warn!(session_id = %session_id, error = %e, "resume failed"),
                }
            }
            RecoveryAction::AbortBatchOnError => match self.batches.abort(session_id) {
                Ok(outcome) => {
                    self.inspect_batch(session_id, "aborted");
                    let _ = self.notifications.send(Notification::BatchCompleted {
                        session_id: session_id.clone(),
                        outcome,
                    });
                    self.handoff_queue(session_id).await;
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "abort failed"),
            },
        }
    }

    // ------------------------------------------------------------------
    // Host events
    // ------------------------------------------------------------------

    async fn handle_host_event(&mut self, event: HostEvent) {
        // Group chats have their own identifier grammar and error slot.
        if let HostEvent::Fault { process_id, fault } = &event {
            if let Some(target) = GroupChatTarget::parse(process_id) {
                self.group_chat_errors.record(&target, fault);
                if let Some(error) =
                    self.group_chat_errors.get(&target.chat_id, &target.participant)
                {
                    let _ = self
                        .notifications
                        .send(Notification::GroupChatFault(error.clone()));
                }
                return;
            }
        }

        let target = ProcessTarget::parse(event.process_id());
        if let Some(inspector) = &self.inspector {
            inspector.event_routed(&event, &target);
        }

        // Batch-tagged output is intentionally not delivered to any tab.
        if target.is_batch() {
            if let HostEvent::Exited { process_id, exit_code } = &event {
                debug!(process_id = %process_id, ?exit_code, "unattended task finished");
            }
            return;
        }

        let session_id = target.session_id.clone();
        match event {
            HostEvent::Data { chunk, .. } => {
                let scheduled = match self.delivery_tab(&target) {
                    Some(tab_id) => match target.kind {
                        ProcessKind::Agent { .. } => {
                            self.coalescer.push_data(&session_id, &tab_id, &chunk)
                        }
                        _ => self.coalescer.push_terminal(&session_id, &tab_id, &chunk),
                    },
                    None => false,
                };
                self.schedule_flush(scheduled);
            }
            HostEvent::Stderr { chunk, .. } => {
                let scheduled = match self.delivery_tab(&target) {
                    Some(tab_id) => self.coalescer.push_stderr(&session_id, &tab_id, &chunk),
                    None => false,
                };
                self.schedule_flush(scheduled);
            }
            HostEvent::ThinkingChunk { text, .. } => {
                let scheduled = match self.delivery_tab(&target) {
                    Some(tab_id) => self.coalescer.push_thinking(&session_id, &tab_id, &text),
                    None => false,
                };
                self.schedule_flush(scheduled);
            }
            HostEvent::Usage { stats, .. } => {
                let scheduled = match self.delivery_tab(&target) {
                    Some(tab_id) => self.coalescer.push_usage(&session_id, &tab_id, &stats),
                    None => false,
                };
                self.schedule_flush(scheduled);
            }
            HostEvent::ToolExecution { execution, .. } => {
                let scheduled = match self.delivery_tab(&target) {
                    Some(tab_id) => self.coalescer.push_tool(&session_id, &tab_id, execution),
                    None => false,
                };
                self.schedule_flush(scheduled);
            }
            HostEvent::SessionAssigned {
                agent_session_id, ..
            } => {
                if let Some(tab_id) = target.tab_id().cloned() {
                    self.mutate(&session_id, |session| {
                        if let Some(tab) = session.tab_mut(&tab_id) {
                            tab.agent_session_id = Some(agent_session_id.clone());
                        }
                    });
                }
            }
            HostEvent::SlashCommands { commands, .. } => {
                self.mutate(&session_id, |session| {
                    session.slash_commands = commands.clone();
                });
            }
            HostEvent::Fault { process_id, fault } => {
                self.handle_fault(&session_id, &process_id, target.tab_id().cloned(), fault)
                    .await;
            }
            HostEvent::Exited {
                process_id,
                exit_code,
            } => {
                self.handle_exit(&session_id, &process_id, &target, exit_code)
                    .await;
            }
        }
    }

    /// Which tab a streaming event lands on: the tagged tab for agent
    /// processes, the active tab for terminal/plain output.
    fn delivery_tab(&self, target: &ProcessTarget) -> Option<TabId> {
        match &target.kind {
            ProcessKind::Agent { tab_id } => Some(tab_id.clone()),
            ProcessKind::Terminal | ProcessKind::Plain => {
                let guard = self.store.lock();
                guard
                    .session(&target.session_id)
                    .map(|s| s.active_tab_id.clone())
            }
            ProcessKind::Batch { .. } => None,
        }
    }

    fn schedule_flush(&mut self, first_fragment: bool) {
        if first_fragment && self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.settings.flush_interval);
        }
    }

    fn flush_updates(&mut self) {
        self.flush_deadline = None;
        for flush in self.coalescer.flush() {
            self.apply_session_flush(flush);
        }
    }

    /// One mutation per affected session merging all buffered tab deltas.
    fn apply_session_flush(&mut self, flush: crate::coalesce::SessionFlush) {
        let session_id = flush.session_id.clone();
        self.mutate(&session_id, |session| {
            let active = session.active_tab_id.clone();
            for (tab_id, delta) in flush.tabs {
                let Some(tab) = session.tab_mut(&tab_id) else {
                    // The tab closed while output was buffered; the
                    // fragment is dropped, not fatal.
                    debug!(session_id = %session.id, tab_id = %tab_id, "flush for closed tab dropped");
                    continue;
                };
                delta.apply_to(tab);
                if tab_id == active {
                    tab.unread = false;
                }
            }
        });
    }

    async fn handle_fault(
        &mut self,
        session_id: &SessionId,
        process_id: &str,
        tab_hint: Option<TabId>,
        fault: HostFault,
    ) {
        // Buffered output lands before the error so transcripts stay
        // intact and ordered.
        if let Some(flush) = self.coalescer.flush_session(session_id) {
            self.apply_session_flush(flush);
        }

        let error = agent_error_from_fault(&fault, process_id, session_id);
        info!(
            session_id = %session_id,
            kind = ?error.kind,
            recoverable = error.recoverable,
            "agent error reported"
        );
        let snapshot = self.store.lock().report_error(session_id, error, tab_hint);
        self.commit_opt(snapshot);

        // An active batch run pauses in place rather than aborting.
        if self.batches.pause_on_error(session_id) {
            self.inspect_batch(session_id, "paused");
        }
    }

    async fn handle_exit(
        &mut self,
        session_id: &SessionId,
        process_id: &str,
        target: &ProcessTarget,
        exit_code: Option<i32>,
    ) {
        debug!(process_id = %process_id, ?exit_code, "process exited");
        self.escalations.remove(process_id);

        // Apply buffered fragments before the exit so per-key ordering
        // holds.
        if let Some(flush) = self.coalescer.flush_session(session_id) {
            self.apply_session_flush(flush);
        }

        if self.killed_pending.remove(process_id) {
            // Already settled at kill time; just make sure the tab is
            // idle without draining again.
            if let Some(tab_id) = target.tab_id() {
                let tab_id = tab_id.clone();
                self.mutate(session_id, |session| {
                    if let Some(tab) = session.tab_mut(&tab_id) {
                        tab.mark_idle();
                    }
                });
            }
            return;
        }

        match &target.kind {
            ProcessKind::Agent { tab_id } => {
                let tab_id = tab_id.clone();
                self.settle_agent_exit(session_id, &tab_id).await;
            }
            ProcessKind::Terminal => {
                self.settle_non_agent_exit(session_id, FinishedProcess::Terminal)
                    .await;
            }
            ProcessKind::Plain => {
                self.settle_non_agent_exit(session_id, FinishedProcess::None)
                    .await;
            }
            ProcessKind::Batch { .. } => {}
        }
    }

    /// Terminal/plain completions drain the queue like any other, except
    /// while a batch run owns the session: the run serializes all agent
    /// work, so only its own settlement hands off to the queue.
    async fn settle_non_agent_exit(&mut self, session_id: &SessionId, finished: FinishedProcess) {
        if self.batches.is_active(session_id) {
            self.mutate(session_id, |session| {
                if matches!(finished, FinishedProcess::Terminal) {
                    session.terminal_busy = false;
                    session.terminal_pid = None;
                }
            });
            return;
        }
        let (outcome, snapshot) = self.store.lock().handle_completion(session_id, finished);
        self.commit_opt(snapshot);
        self.execute_drain(session_id, outcome).await;
    }

    /// Settle an agent tab exit: batch runs advance (strictly serial, one
    /// task per exit); interactive turns drain the queue.
    async fn settle_agent_exit(&mut self, session_id: &SessionId, tab_id: &TabId) {
        if self.batches.is_active(session_id) {
            self.mutate(session_id, |session| {
                if let Some(tab) = session.tab_mut(tab_id) {
                    tab.mark_idle();
                }
                if !session.any_tab_busy() {
                    session.ai_pid = None;
                }
            });
            if let Some(advance) = self.batches.on_task_exit(session_id) {
                self.apply_batch_advance(session_id, advance).await;
            }
            return;
        }

        let (outcome, snapshot) = self
            .store
            .lock()
            .handle_completion(session_id, FinishedProcess::Tab(tab_id.clone()));
        self.commit_opt(snapshot);
        self.execute_drain(session_id, outcome).await;
    }

    async fn apply_batch_advance(&mut self, session_id: &SessionId, advance: BatchAdvance) {
        match advance {
            BatchAdvance::Next(task) => {
                self.inspect_batch(session_id, "advanced");
                let total = self
                    .batches
                    .run(session_id)
                    .map(|r| r.documents.len())
                    .unwrap_or(0);
                self.notify_batch_progress(session_id, &task, total);
                self.spawn_batch_task(session_id, task).await;
            }
            BatchAdvance::Completed(outcome) | BatchAdvance::StoppedByUser(outcome) => {
                self.inspect_batch(session_id, "settled");
                let _ = self.notifications.send(Notification::BatchCompleted {
                    session_id: session_id.clone(),
                    outcome,
                });
                // Interactively queued messages must not be stranded once
                // the run is over.
                self.handoff_queue(session_id).await;
            }
            BatchAdvance::Paused => {}
        }
    }

    async fn handoff_queue(&mut self, session_id: &SessionId) {
        let (outcome, snapshot) = self.store.lock().drain_one(session_id);
        self.commit_opt(snapshot);
        self.execute_drain(session_id, outcome).await;
    }

    async fn execute_drain(&mut self, session_id: &SessionId, outcome: DrainOutcome) {
        match outcome {
            DrainOutcome::Empty | DrainOutcome::Suspended => {}
            DrainOutcome::NoTab(item) => {
                warn!(session_id = %session_id, item_id = %item.id, "dropped queued item with no tab");
            }
            DrainOutcome::Dispatched(dispatched) => {
                let read_only = dispatched.item.read_only;
                let (prompt, images) = match dispatched.item.payload {
                    QueuedPayload::Message { text, images } => (text, images),
                    QueuedPayload::Command { command } => (command, Vec::new()),
                };
                self.spawn_agent_turn(session_id, &dispatched.tab_id, prompt, images, read_only)
                    .await;
            }
        }
    }

    fn schedule_remote_probe(&self, session_id: SessionId) {
        let Some(probe) = self.remote_probe.clone() else {
            return;
        };
        let remote = {
            let guard = self.store.lock();
            guard.session(&session_id).and_then(|s| s.remote.clone())
        };
        let Some(remote) = remote else { return };

        // Deferred background pass: never blocks startup, and a failure
        // marks the session instead of leaving stale data.
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let failed = match probe.probe(&remote).await {
                Ok(metadata) => {
                    debug!(session_id = %session_id, ?metadata, "remote probe succeeded");
                    false
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "remote probe failed");
                    true
                }
            };
            let _ = commands
                .send(Command::RemoteProbeResolved { session_id, failed })
                .await;
        });
    }

    fn inspect_batch(&self, session_id: &SessionId, phase: &str) {
        if let Some(inspector) = &self.inspector {
            inspector.batch_transition(session_id, phase);
        }
    }
}

enum WorkPayload {
    Message { text: String, images: Vec<PathBuf> },
    Command { command: String },
}

/// Sleep until the deadline, or forever when there is none. Keeps
/// `select!` branches alive without polling.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
