//! Local process host backed by `tokio::process`.
//!
//! Spawns one child per [`SpawnSpec`], pipes stdout/stderr line-wise into
//! the shared event channel, and reports exit codes. This host speaks no
//! agent protocol; adapters that parse an agent's framing into usage or
//! session events layer on top of the raw `Data` stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{HostError, HostEvent, ProcessHandle, ProcessHost, SpawnSpec, ToolType};

pub struct CommandProcessHost {
    events: mpsc::Sender<HostEvent>,
    /// Composite identifier -> OS pid for everything currently running.
    running: Mutex<HashMap<String, u32>>,
}

impl CommandProcessHost {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            events,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_binary(spec: &SpawnSpec) -> Result<PathBuf, HostError> {
        let name = spec
            .command
            .as_deref()
            .unwrap_or_else(|| spec.tool_type.binary_name());
        which::which(name).map_err(|_| HostError::BinaryNotFound(name.to_string()))
    }

    fn build_command(binary: &PathBuf, spec: &SpawnSpec) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(&spec.args);

        if let Some(prompt) = &spec.prompt {
            if spec.tool_type == ToolType::Terminal {
                cmd.arg("-c").arg(prompt);
            } else {
                cmd.arg(prompt);
            }
        }
        if let Some(token) = &spec.agent_session_id {
            cmd.arg("--resume").arg(token);
        }

        cmd.current_dir(&spec.cwd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn pid_of(&self, process_id: &str) -> Option<u32> {
        self.running.lock().get(process_id).copied()
    }

    #[cfg(unix)]
    fn signal(pid: u32, sig: i32) -> Result<(), HostError> {
        // ESRCH means the process already exited, which is what we wanted.
        let rc = unsafe { libc::kill(pid as i32, sig) };
        if rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(HostError::Io(std::io::Error::last_os_error()))
        }
    }
}

#[async_trait]
impl ProcessHost for CommandProcessHost {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle, HostError> {
        if spec.remote.is_some() {
            return Err(HostError::NotSupported(
                "remote execution requires a remote-capable host".into(),
            ));
        }

        let binary = Self::resolve_binary(&spec)?;
        let mut cmd = Self::build_command(&binary, &spec);
        let mut child = cmd.spawn().map_err(HostError::SpawnFailed)?;

        let pid = child
            .id()
            .ok_or_else(|| HostError::NotRunning(spec.process_id.clone()))?;
        self.running.lock().insert(spec.process_id.clone(), pid);
        debug!(process_id = %spec.process_id, pid, binary = %binary.display(), "spawned process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            let events = self.events.clone();
            let process_id = spec.process_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let event = HostEvent::Data {
                        process_id: process_id.clone(),
                        chunk: line,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(stderr) = stderr {
            let events = self.events.clone();
            let process_id = spec.process_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let event = HostEvent::Stderr {
                        process_id: process_id.clone(),
                        chunk: line,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Exit watcher: the Exited event is the only completion signal the
        // engine ever gets, so it must fire even if waiting fails.
        {
            let events = self.events.clone();
            let process_id = spec.process_id.clone();
            tokio::spawn(async move {
                let exit_code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(process_id = %process_id, error = %e, "failed to wait on child");
                        None
                    }
                };
                let _ = events
                    .send(HostEvent::Exited {
                        process_id,
                        exit_code,
                    })
                    .await;
            });
        }

        Ok(ProcessHandle { pid })
    }

    async fn interrupt(&self, process_id: &str) -> Result<(), HostError> {
        let Some(pid) = self.pid_of(process_id) else {
            return Err(HostError::NotRunning(process_id.to_string()));
        };
        #[cfg(unix)]
        {
            Self::signal(pid, libc::SIGINT)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(HostError::NotSupported(
                "interrupt not implemented on this platform".into(),
            ))
        }
    }

    async fn kill(&self, process_id: &str) -> Result<(), HostError> {
        // Already gone counts as killed.
        let Some(pid) = self.pid_of(process_id) else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            let result = Self::signal(pid, libc::SIGKILL);
            self.running.lock().remove(process_id);
            result
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(HostError::NotSupported(
                "kill not implemented on this platform".into(),
            ))
        }
    }
}
