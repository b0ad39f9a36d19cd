//! Supervised helper processes.
//!
//! Each process is owned by a watcher task that either observes the exit or kills the
//! child when asked to stop. Supervised processes report any exit they did not ask for
//! to the shutdown coordinator.

use crate::harness::config::ProcessSpec;
use crate::runtime::fatal::{ShutdownCoordinator, ShutdownReason};
use crate::runtime::telemetry::Telemetry;
use anyhow::Error as AnyError;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug)]
pub enum ProcessError {
    Spawn { process: String, source: io::Error },
    /// The process exited while the harness was still waiting for it to become ready.
    ExitedEarly { process: String, status: String },
    /// A run-to-completion process finished with a non-zero status.
    Failed { process: String, status: String },
    NotReady { process: String, source: AnyError },
}

impl ProcessError {
    pub fn process(&self) -> &str {
        match self {
            ProcessError::Spawn { process, .. }
            | ProcessError::ExitedEarly { process, .. }
            | ProcessError::Failed { process, .. }
            | ProcessError::NotReady { process, .. } => process,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Spawn { process, source } => {
                write!(f, "failed to spawn {process}: {source}")
            }
            ProcessError::ExitedEarly { process, status } => {
                write!(f, "{process} exited before becoming ready ({status})")
            }
            ProcessError::Failed { process, status } => write!(f, "{process} failed ({status})"),
            ProcessError::NotReady { process, source } => {
                write!(f, "{process} did not become ready: {source}")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::NotReady { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// How a process ended. `status` is `None` when waiting on the child failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: Option<ExitStatus>,
    pub killed: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status.map(|status| status.success()).unwrap_or(false)
    }

    pub fn describe(&self) -> String {
        match self.status {
            Some(status) => status.to_string(),
            None => "unknown status".to_owned(),
        }
    }
}

struct ProcessShared {
    name: String,
    state: Mutex<ProcessState>,
    exit: watch::Sender<Option<ProcessExit>>,
}

impl ProcessShared {
    fn set_state(&self, next: ProcessState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn finish(&self, state: ProcessState, exit: ProcessExit) {
        self.set_state(state);
        self.exit.send_replace(Some(exit));
    }
}

pub struct ManagedProcess {
    shared: Arc<ProcessShared>,
    pid: Option<u32>,
    stop: CancellationToken,
    stop_requested: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.shared.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedProcess {
    /// Spawns `spec`. With a `supervisor`, any exit not requested through
    /// [`ManagedProcess::stop`] triggers a harness-wide shutdown.
    pub fn spawn(
        spec: &ProcessSpec,
        supervisor: Option<ShutdownCoordinator>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        if spec.inherit_output {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            process: spec.name.clone(),
            source,
        })?;
        let pid = child.id();
        telemetry.record_process_spawned();
        tracing::info!(process = %spec.name, pid, program = %spec.program, "process spawned");

        let (exit, _) = watch::channel(None);
        let shared = Arc::new(ProcessShared {
            name: spec.name.clone(),
            state: Mutex::new(ProcessState::Starting),
            exit,
        });
        let stop = CancellationToken::new();
        let watcher = tokio::spawn(watch_child(
            child,
            shared.clone(),
            stop.clone(),
            supervisor,
            telemetry,
        ));

        Ok(Self {
            shared,
            pid,
            stop,
            stop_requested: AtomicBool::new(false),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(ProcessState::Failed)
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.shared.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit().is_none()
    }

    pub fn mark_ready(&self) {
        self.transition(ProcessState::Starting, ProcessState::Ready);
    }

    pub fn mark_running(&self) {
        self.transition(ProcessState::Ready, ProcessState::Running);
    }

    /// Resolves once the process has exited (on its own or after [`ManagedProcess::stop`]).
    pub async fn wait_for_exit(&self) -> ProcessExit {
        let mut exit = self.shared.exit.subscribe();
        loop {
            if let Some(record) = *exit.borrow_and_update() {
                return record;
            }
            if exit.changed().await.is_err() {
                return ProcessExit {
                    status: None,
                    killed: false,
                };
            }
        }
    }

    /// Kills the process if it is still alive and waits for the watcher. Only the first
    /// call acts; it returns `true` when it killed a live process.
    pub async fn stop(&self) -> bool {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.stop.cancel();
        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = watcher {
            if let Err(err) = handle.await {
                tracing::warn!(process = %self.name(), error = %err, "process watcher panicked");
            }
        }

        self.exit().map(|exit| exit.killed).unwrap_or(false)
    }

    fn transition(&self, from: ProcessState, to: ProcessState) {
        if let Ok(mut state) = self.shared.state.lock() {
            if *state == from {
                *state = to;
            }
        }
    }
}

async fn watch_child(
    mut child: Child,
    shared: Arc<ProcessShared>,
    stop: CancellationToken,
    supervisor: Option<ShutdownCoordinator>,
    telemetry: Arc<Telemetry>,
) {
    let name = shared.name.clone();
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            if let Err(err) = child.kill().await {
                tracing::warn!(process = %name, error = %err, "failed to kill process");
            }
            let status = child.try_wait().ok().flatten();
            tracing::info!(process = %name, "process stopped");
            shared.finish(ProcessState::Stopped, ProcessExit { status, killed: true });
        }
        status = child.wait() => {
            let exit = ProcessExit {
                status: status
                    .map_err(|err| {
                        tracing::warn!(process = %name, error = %err, "failed to wait for process");
                    })
                    .ok(),
                killed: false,
            };

            if let Some(coordinator) = supervisor {
                telemetry.record_process_failure();
                shared.finish(ProcessState::Failed, exit);
                tracing::error!(process = %name, status = %exit.describe(), "supervised process exited");
                coordinator.trigger(ShutdownReason::ProcessExited {
                    process: name,
                    status: exit.describe(),
                });
            } else if exit.success() {
                tracing::info!(process = %name, "process exited");
                shared.finish(ProcessState::Stopped, exit);
            } else {
                telemetry.record_process_failure();
                tracing::warn!(process = %name, status = %exit.describe(), "process exited with failure");
                shared.finish(ProcessState::Failed, exit);
            }
        }
    }
}
