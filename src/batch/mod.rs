//! Batch/auto-run processor.
//!
//! One sequential runner per session over an ordered document list. The
//! run state machine layers on top of the session state machine without
//! replacing it: tasks are spawned through the same store/host path as
//! interactive turns, and the runner only advances when a task's exit
//! event is observed. Runs on different sessions are fully concurrent; a
//! second run on the same session is rejected.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::SessionId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("a batch run is already active for session {0}")]
    AlreadyRunning(SessionId),
    #[error("batch run needs at least one document")]
    NoDocuments,
    #[error("no batch run is active for session {0}")]
    NotRunning(SessionId),
    #[error("batch run for session {0} is not paused on an error")]
    NotPaused(SessionId),
}

/// Configuration of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub documents: Vec<String>,
    /// Prompt template; `{document}` is replaced with the current document.
    pub prompt_template: String,
    pub loop_enabled: bool,
}

/// Aggregate result reported when a run settles. Downstream bookkeeping
/// (achievements, PR creation, leaderboards) consumes this; none of it
/// happens here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub elapsed: Duration,
    pub stopped_early: bool,
}

/// One task the runner wants spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub index: usize,
    pub document: String,
    pub prompt: String,
}

/// Live state of one session's run.
#[derive(Debug)]
pub struct BatchRun {
    pub documents: Vec<String>,
    pub current_index: usize,
    pub running: bool,
    pub error_paused: bool,
    pub prompt_template: String,
    pub loop_enabled: bool,
    pub completed_tasks: usize,
    stop_requested: bool,
    started_at: Instant,
}

impl BatchRun {
    fn new(config: BatchConfig) -> Self {
        Self {
            documents: config.documents,
            current_index: 0,
            running: true,
            error_paused: false,
            prompt_template: config.prompt_template,
            loop_enabled: config.loop_enabled,
            completed_tasks: 0,
            stop_requested: false,
            started_at: Instant::now(),
        }
    }

    fn task_at(&self, index: usize) -> BatchTask {
        let document = self.documents[index].clone();
        let prompt = if self.prompt_template.contains("{document}") {
            self.prompt_template.replace("{document}", &document)
        } else {
            format!("{}\n\n{}", self.prompt_template, document)
        };
        BatchTask {
            index,
            document,
            prompt,
        }
    }

    fn outcome(&self, stopped_early: bool) -> BatchOutcome {
        BatchOutcome {
            completed_tasks: self.completed_tasks,
            total_tasks: self.documents.len(),
            elapsed: self.started_at.elapsed(),
            stopped_early,
        }
    }
}

/// What the runner decided after a task exit (or a recovery action).
#[derive(Debug)]
pub enum BatchAdvance {
    /// Spawn the next task.
    Next(BatchTask),
    /// All documents processed; run removed.
    Completed(BatchOutcome),
    /// Cooperative stop honored after the in-flight task finished.
    StoppedByUser(BatchOutcome),
    /// Run is paused on an error; nothing to spawn.
    Paused,
}

/// Per-session batch runs. Owns only run bookkeeping; all session state
/// flows through the store's mutation API.
#[derive(Debug, Default)]
pub struct BatchRunner {
    runs: HashMap<SessionId, BatchRun>,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.runs.contains_key(session_id)
    }

    pub fn is_paused(&self, session_id: &SessionId) -> bool {
        self.runs
            .get(session_id)
            .map(|run| run.error_paused)
            .unwrap_or(false)
    }

    pub fn run(&self, session_id: &SessionId) -> Option<&BatchRun> {
        self.runs.get(session_id)
    }

    /// Start a run and return its first task. Rejects a second run on the
    /// same session; independent sessions run concurrently.
    pub fn start(
        &mut self,
        session_id: &SessionId,
        config: BatchConfig,
    ) -> Result<BatchTask, BatchError> {
        if self.runs.contains_key(session_id) {
            return Err(BatchError::AlreadyRunning(session_id.clone()));
        }
        if config.documents.is_empty() {
            return Err(BatchError::NoDocuments);
        }

        let run = BatchRun::new(config);
        let task = run.task_at(0);
        info!(session_id = %session_id, total = run.documents.len(), "batch run started");
        self.runs.insert(session_id.clone(), run);
        Ok(task)
    }

    /// Request a cooperative stop: honored only after the in-flight task
    /// completes. Returns false if no run is active.
    pub fn request_stop(&mut self, session_id: &SessionId) -> bool {
        match self.runs.get_mut(session_id) {
            Some(run) => {
                run.stop_requested = true;
                debug!(session_id = %session_id, "batch stop requested");
                true
            }
            None => false,
        }
    }

    /// Advance after the in-flight task's exit event. Never called before
    /// the exit is observed, which is what keeps tasks strictly serial.
    pub fn on_task_exit(&mut self, session_id: &SessionId) -> Option<BatchAdvance> {
        let run = self.runs.get_mut(session_id)?;

        if run.error_paused {
            // The failing task's exit is consumed without advancing; the
            // index stays put for resume/skip/abort.
            return Some(BatchAdvance::Paused);
        }

        run.completed_tasks += 1;

        if run.stop_requested {
            let outcome = run.outcome(true);
            self.runs.remove(session_id);
            info!(session_id = %session_id, "batch run stopped by user");
            return Some(BatchAdvance::StoppedByUser(outcome));
        }

        let next = run.current_index + 1;
        if next < run.documents.len() {
            run.current_index = next;
            return Some(BatchAdvance::Next(run.task_at(next)));
        }

        if run.loop_enabled {
            run.current_index = 0;
            return Some(BatchAdvance::Next(run.task_at(0)));
        }

        let outcome = run.outcome(false);
        self.runs.remove(session_id);
        info!(session_id = %session_id, completed = outcome.completed_tasks, "batch run completed");
        Some(BatchAdvance::Completed(outcome))
    }

    /// Freeze the run at its current index when an agent error lands.
    pub fn pause_on_error(&mut self, session_id: &SessionId) -> bool {
        match self.runs.get_mut(session_id) {
            Some(run) => {
                run.error_paused = true;
                run.running = false;
                debug!(
                    session_id = %session_id,
                    index = run.current_index,
                    "batch run paused on error"
                );
                true
            }
            None => false,
        }
    }

    /// Resume from the exact document index the error froze.
    pub fn resume_after_error(&mut self, session_id: &SessionId) -> Result<BatchTask, BatchError> {
        let run = self
            .runs
            .get_mut(session_id)
            .ok_or_else(|| BatchError::NotRunning(session_id.clone()))?;
        if !run.error_paused {
            return Err(BatchError::NotPaused(session_id.clone()));
        }
        run.error_paused = false;
        run.running = true;
        Ok(run.task_at(run.current_index))
    }

    /// Skip the document that errored and move on. Completing the list by
    /// skipping still ends the run.
    pub fn skip_current(&mut self, session_id: &SessionId) -> Result<BatchAdvance, BatchError> {
        let run = self
            .runs
            .get_mut(session_id)
            .ok_or_else(|| BatchError::NotRunning(session_id.clone()))?;
        if !run.error_paused {
            return Err(BatchError::NotPaused(session_id.clone()));
        }
        run.error_paused = false;
        run.running = true;

        let next = run.current_index + 1;
        if next < run.documents.len() {
            run.current_index = next;
            return Ok(BatchAdvance::Next(run.task_at(next)));
        }
        if run.loop_enabled {
            run.current_index = 0;
            return Ok(BatchAdvance::Next(run.task_at(0)));
        }
        let outcome = run.outcome(true);
        self.runs.remove(session_id);
        Ok(BatchAdvance::Completed(outcome))
    }

    /// Abort a paused run entirely.
    pub fn abort(&mut self, session_id: &SessionId) -> Result<BatchOutcome, BatchError> {
        let run = self
            .runs
            .remove(session_id)
            .ok_or_else(|| BatchError::NotRunning(session_id.clone()))?;
        info!(session_id = %session_id, "batch run aborted");
        Ok(run.outcome(true))
    }
}
