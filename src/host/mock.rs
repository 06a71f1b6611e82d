//! Scripted process host for deterministic testing.
//!
//! Records every spawn and emits events only when the test says so, so
//! integration tests can drive completion, faults, and streaming without
//! real CLI processes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    HostError, HostEvent, HostFault, ProcessHandle, ProcessHost, SpawnSpec, UsageStats,
};

#[derive(Default)]
struct MockState {
    spawned: Vec<SpawnSpec>,
    running: HashSet<String>,
    interrupted: Vec<String>,
    killed: Vec<String>,
}

pub struct MockProcessHost {
    events: mpsc::Sender<HostEvent>,
    state: Mutex<MockState>,
    next_pid: AtomicU32,
    /// When set, `spawn` fails with this message instead of recording.
    fail_spawn_with: Mutex<Option<String>>,
}

impl MockProcessHost {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(MockState::default()),
            next_pid: AtomicU32::new(1000),
            fail_spawn_with: Mutex::new(None),
        }
    }

    /// Make the next spawns fail as if the binary were missing.
    pub fn fail_spawns(&self, binary: impl Into<String>) {
        *self.fail_spawn_with.lock() = Some(binary.into());
    }

    pub fn spawned(&self) -> Vec<SpawnSpec> {
        self.state.lock().spawned.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawned.len()
    }

    pub fn is_running(&self, process_id: &str) -> bool {
        self.state.lock().running.contains(process_id)
    }

    pub fn interrupted(&self) -> Vec<String> {
        self.state.lock().interrupted.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    /// Identifier of the most recent spawn, if any.
    pub fn last_process_id(&self) -> Option<String> {
        self.state
            .lock()
            .spawned
            .last()
            .map(|spec| spec.process_id.clone())
    }

    pub async fn emit_data(&self, process_id: &str, chunk: &str) {
        let _ = self
            .events
            .send(HostEvent::Data {
                process_id: process_id.to_string(),
                chunk: chunk.to_string(),
            })
            .await;
    }

    pub async fn emit_thinking(&self, process_id: &str, text: &str) {
        let _ = self
            .events
            .send(HostEvent::ThinkingChunk {
                process_id: process_id.to_string(),
                text: text.to_string(),
            })
            .await;
    }

    pub async fn emit_usage(&self, process_id: &str, stats: UsageStats) {
        let _ = self
            .events
            .send(HostEvent::Usage {
                process_id: process_id.to_string(),
                stats,
            })
            .await;
    }

    pub async fn assign_session(&self, process_id: &str, agent_session_id: &str) {
        let _ = self
            .events
            .send(HostEvent::SessionAssigned {
                process_id: process_id.to_string(),
                agent_session_id: agent_session_id.to_string(),
            })
            .await;
    }

    pub async fn emit_fault(&self, process_id: &str, message: &str) {
        let _ = self
            .events
            .send(HostEvent::Fault {
                process_id: process_id.to_string(),
                fault: HostFault::new(message),
            })
            .await;
    }

    /// Complete a running process with the given exit code.
    pub async fn complete(&self, process_id: &str, exit_code: i32) {
        self.state.lock().running.remove(process_id);
        let _ = self
            .events
            .send(HostEvent::Exited {
                process_id: process_id.to_string(),
                exit_code: Some(exit_code),
            })
            .await;
    }
}

#[async_trait]
impl ProcessHost for MockProcessHost {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle, HostError> {
        if let Some(binary) = self.fail_spawn_with.lock().clone() {
            return Err(HostError::BinaryNotFound(binary));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.running.insert(spec.process_id.clone());
        state.spawned.push(spec);
        Ok(ProcessHandle { pid })
    }

    async fn interrupt(&self, process_id: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if !state.running.contains(process_id) {
            return Err(HostError::NotRunning(process_id.to_string()));
        }
        state.interrupted.push(process_id.to_string());
        Ok(())
    }

    async fn kill(&self, process_id: &str) -> Result<(), HostError> {
        // Killing something already gone is success, matching real hosts.
        let mut state = self.state.lock();
        state.running.remove(process_id);
        state.killed.push(process_id.to_string());
        Ok(())
    }
}
