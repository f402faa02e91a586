//! Process pair supervision: launch, liveness and two-phase termination.
//!
//! Every process is spawned with piped output and `kill_on_drop(true)` so a
//! dropped handle can never leave an orphan. Termination always asks first
//! (`SIGTERM` on unix) and only kills after the grace period; the
//! coordinator writes checkpoints on the way out and a bare kill can leave
//! them half-written.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProcessSpec;
use crate::{AppError, Result};

/// Poll interval while waiting for a signalled process to exit.
const EXIT_POLL: Duration = Duration::from_millis(25);

/// Upper bound on reaping a process after it was killed.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports from background workers to the session's control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The liveness monitor saw a process exit.
    ProcessExited {
        /// Display name of the process.
        name: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// A process's output queue delivered its closed marker.
    StreamClosed {
        /// Display name of the process.
        name: String,
    },
}

/// Sender used by monitors and the multiplexer.
pub type EventSender = mpsc::UnboundedSender<SupervisorEvent>;

/// Result of a non-blocking liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Still running.
    Running,
    /// Exited with the given code (`None` for a signal death).
    Exited(Option<i32>),
}

/// How a termination request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited.
    AlreadyExited(Option<i32>),
    /// The process honored the termination request within the grace period.
    Graceful(Option<i32>),
    /// The grace period ran out and the process was killed.
    Killed,
}

struct ProcessInner {
    name: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    exit: Mutex<Option<Option<i32>>>,
    launched_at: Instant,
}

/// Shared handle to one supervised child process.
///
/// Cloning is cheap; all clones observe the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Start `spec` in `cwd` with captured output and an overlaid environment.
///
/// The child inherits the ambient environment; `spec.env` entries replace
/// or add variables on top of it.
///
/// # Errors
///
/// Returns `AppError::LaunchFailed` if the executable cannot be started.
pub fn launch(spec: &ProcessSpec, cwd: &Path) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        AppError::LaunchFailed(format!(
            "failed to start {} ({}): {err}",
            spec.name, spec.program
        ))
    })?;

    let pid = child.id();
    info!(
        process = spec.name,
        pid = pid.unwrap_or(0),
        program = spec.program,
        "process launched"
    );

    Ok(ProcessHandle {
        inner: Arc::new(ProcessInner {
            name: spec.name.clone(),
            pid,
            child: Mutex::new(child),
            exit: Mutex::new(None),
            launched_at: Instant::now(),
        }),
    })
}

impl ProcessHandle {
    /// Display name given at launch.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS process id, if the process was still running when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// When the process was started.
    #[must_use]
    pub fn launched_at(&self) -> Instant {
        self.inner.launched_at
    }

    /// Take the captured stdout and stderr pipes. Returns `None` after the first call.
    #[must_use]
    pub fn take_output(&self) -> Option<(ChildStdout, ChildStderr)> {
        let mut child = lock(&self.inner.child);
        match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => Some((out, err)),
            _ => None,
        }
    }

    /// Non-blocking liveness check. Reaps the process once it has exited.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        let mut exit = lock(&self.inner.exit);
        if let Some(code) = *exit {
            return Liveness::Exited(code);
        }

        let polled = lock(&self.inner.child).try_wait();
        match polled {
            Ok(None) => Liveness::Running,
            Ok(Some(status)) => {
                *exit = Some(status.code());
                Liveness::Exited(status.code())
            }
            Err(err) => {
                // Unpollable children are treated as gone.
                warn!(process = self.inner.name, %err, "failed to poll child process status");
                *exit = Some(None);
                Liveness::Exited(None)
            }
        }
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Running
    }

    /// Ask the process to exit, killing it if it is still running after `grace`.
    ///
    /// An already-exited process is a success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the process survives the kill.
    pub async fn terminate(&self, grace: Duration) -> Result<TerminateOutcome> {
        let name = self.inner.name.as_str();

        if let Liveness::Exited(code) = self.liveness() {
            debug!(process = name, ?code, "process already exited");
            return Ok(TerminateOutcome::AlreadyExited(code));
        }

        match self.inner.pid.map(request_graceful_exit) {
            Some(Ok(())) => {
                info!(process = name, ?grace, "termination requested");
                if let Some(code) = self.wait_exit(grace).await {
                    info!(process = name, ?code, "process exited gracefully");
                    return Ok(TerminateOutcome::Graceful(code));
                }
                warn!(
                    process = name,
                    "process did not exit within grace period, forcing kill"
                );
            }
            Some(Err(err)) => {
                warn!(process = name, %err, "termination request failed, forcing kill");
            }
            None => {
                warn!(process = name, "process has no pid, forcing kill");
            }
        }

        if let Liveness::Exited(code) = self.liveness() {
            return Ok(TerminateOutcome::Graceful(code));
        }

        let killed = lock(&self.inner.child).start_kill();
        if let Err(err) = killed {
            warn!(process = name, %err, "failed to send kill");
        }

        match self.wait_exit(KILL_REAP_TIMEOUT).await {
            Some(_) => {
                info!(process = name, "process killed");
                Ok(TerminateOutcome::Killed)
            }
            None => Err(AppError::Io(format!(
                "{name} still running after kill"
            ))),
        }
    }

    /// Poll until the process exits or `limit` elapses.
    async fn wait_exit(&self, limit: Duration) -> Option<Option<i32>> {
        let deadline = Instant::now() + limit;
        loop {
            if let Liveness::Exited(code) = self.liveness() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> std::result::Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|err| format!("pid {pid} out of range: {err}"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|err| format!("SIGTERM to {pid}: {err}"))
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: u32) -> std::result::Result<(), String> {
    Err("graceful termination is not supported on this platform".into())
}

/// Spawn a background task that polls `process` every `interval` and
/// reports its exit.
///
/// The task ends after reporting, or when `cancel` fires. A process that
/// exits after cancellation is not reported; shutdown is already underway.
#[must_use]
pub fn spawn_liveness_monitor(
    process: ProcessHandle,
    interval: Duration,
    events: EventSender,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("liveness_monitor", process = process.name());
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("liveness monitor cancelled");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                if let Liveness::Exited(code) = process.liveness() {
                    info!(?code, "supervised process exited");
                    let event = SupervisorEvent::ProcessExited {
                        name: process.name().to_owned(),
                        code,
                    };
                    if events.send(event).is_err() {
                        debug!("session control loop gone before exit report");
                    }
                    break;
                }
            }
        }
        .instrument(span),
    )
}
