//! Session state machine and the single-session orchestrator.
//!
//! A [`Session`] is one run, from start request to a terminal state. It
//! is single-use: once `Stopped` or `Failed` a fresh session must be built.
//! [`Orchestrator`] owns the current session and refuses to start another
//! while it is active.
//!
//! `start` runs the synchronous part of the lifecycle in the caller's task
//! (validation, endpoint clearing, rendering, coordinator launch) and
//! surfaces those errors directly. A supervised control task then waits
//! for readiness, launches the worker, and watches both processes until a
//! stop request or an exit ends the run. Whatever ends it, the
//! [`ShutdownProtocol`] runs exactly once before the terminal state is
//! published.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cleanup::{remove_endpoint, CleanupReport, ShutdownProtocol};
use super::multiplexer::OutputMultiplexer;
use super::readiness::{settle, wait_for_ready, ReadinessOptions};
use super::supervisor::{
    launch, spawn_liveness_monitor, Liveness, ProcessHandle, SupervisorEvent,
};
use crate::config::SupervisorConfig;
use crate::models::log::{EventSender, SessionEvent, SessionLog};
use crate::models::params::SimulationParams;
use crate::models::session::{SessionState, WorkdirName};
use crate::render::{ConfigRenderer, RenderContext};
use crate::{AppError, Result};

/// Timestamps of the launch sequence, for verifying the ordering contract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTrace {
    /// Coordinator spawned.
    pub coordinator_launched_at: Option<Instant>,
    /// Endpoint observed on disk.
    pub endpoint_ready_at: Option<Instant>,
    /// Worker spawned.
    pub worker_launched_at: Option<Instant>,
    /// Number of worker launches; never more than one.
    pub worker_launches: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One orchestrated run.
pub struct Session {
    id: Uuid,
    name: String,
    workdir: PathBuf,
    endpoint: PathBuf,
    config: Arc<SupervisorConfig>,
    renderer: Arc<dyn ConfigRenderer>,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    failure: Mutex<Option<AppError>>,
    params: OnceLock<SimulationParams>,
    log: Arc<SessionLog>,
    cancel: CancellationToken,
    shutdown: ShutdownProtocol,
    multiplexer: Arc<OutputMultiplexer>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    processes: Mutex<Vec<ProcessHandle>>,
    trace: Mutex<LaunchTrace>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build an idle session for the working directory `workdir_name`.
    ///
    /// The name is validated by [`start`](Self::start), not here.
    #[must_use]
    pub fn new(
        config: Arc<SupervisorConfig>,
        renderer: Arc<dyn ConfigRenderer>,
        workdir_name: &str,
        observer: Option<EventSender>,
    ) -> Arc<Self> {
        let log = Arc::new(SessionLog::new(observer));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let multiplexer = OutputMultiplexer::new(Arc::clone(&log), events_tx.clone());
        let workdir = config.workdir_for(workdir_name.trim());
        let endpoint = config.endpoint_path();
        let shutdown = ShutdownProtocol::new(
            endpoint.clone(),
            config.staging_dir.clone(),
            workdir.clone(),
            config.artifacts.clone(),
            config.timing.terminate_grace(),
        );
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Arc::new(Self {
            id: Uuid::new_v4(),
            name: workdir_name.trim().to_owned(),
            workdir,
            endpoint,
            config,
            renderer,
            state: Mutex::new(SessionState::Idle),
            state_tx,
            failure: Mutex::new(None),
            params: OnceLock::new(),
            log,
            cancel: CancellationToken::new(),
            shutdown,
            multiplexer,
            events_rx: Mutex::new(Some(events_rx)),
            events_tx,
            processes: Mutex::new(Vec::new()),
            trace: Mutex::new(LaunchTrace::default()),
            readers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            control: Mutex::new(None),
        })
    }

    /// Unique run identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Working-directory name as given.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working directory artifacts are relocated into.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// IPC endpoint path.
    #[must_use]
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Cause of a `Failed` session.
    #[must_use]
    pub fn failure(&self) -> Option<AppError> {
        lock(&self.failure).clone()
    }

    /// Parameter snapshot, once `start` accepted it.
    #[must_use]
    pub fn params(&self) -> Option<&SimulationParams> {
        self.params.get()
    }

    /// The session log.
    #[must_use]
    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    /// Launch-sequence timestamps.
    #[must_use]
    pub fn launch_trace(&self) -> LaunchTrace {
        *lock(&self.trace)
    }

    /// Handles of the processes launched so far.
    #[must_use]
    pub fn processes(&self) -> Vec<ProcessHandle> {
        lock(&self.processes).clone()
    }

    /// Whether any launched process is still running.
    #[must_use]
    pub fn any_process_alive(&self) -> bool {
        self.processes().iter().any(ProcessHandle::is_alive)
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the session is `Stopped` or `Failed`.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.subscribe();
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Start the run with `params`.
    ///
    /// Returns once the coordinator is launched; readiness and the worker
    /// launch continue in the background.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyRunning` — the session was already started.
    /// - `AppError::InvalidParameters` — bad working-directory name or parameters.
    /// - `AppError::StaleEndpointRemovalFailed` — a leftover endpoint could not be removed.
    /// - `AppError::Render` — inputs could not be written.
    /// - `AppError::LaunchFailed` — the coordinator could not be started.
    ///
    /// Except for `AlreadyRunning`, each leaves the session `Failed`.
    pub async fn start(self: &Arc<Self>, params: SimulationParams) -> Result<()> {
        let span = info_span!("session", id = %self.id, workdir = %self.name);
        self.start_inner(params).instrument(span).await
    }

    async fn start_inner(self: &Arc<Self>, params: SimulationParams) -> Result<()> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(AppError::AlreadyRunning(format!(
                "session '{}' is {current}",
                self.name
            )));
        }

        let name = match WorkdirName::parse(&self.name).and_then(|name| {
            params.validate()?;
            Ok(name)
        }) {
            Ok(name) => name,
            Err(err) => {
                self.record_failure(&err);
                self.transition(SessionState::Failed);
                return Err(err);
            }
        };

        let params = self.params.get_or_init(|| params);
        self.transition(SessionState::Preparing);
        self.log.info(format!("Starting session in {}", self.workdir.display()));
        self.log.info("Current parameter values:");
        for (key, value) in params.entries() {
            self.log.info(format!("  {key}: {value}"));
        }

        if let Err(err) = self.prepare(&name, params) {
            self.finish(Some(err.clone())).await;
            return Err(err);
        }

        if self.cancel.is_cancelled() {
            self.finish(None).await;
            return Ok(());
        }

        self.transition(SessionState::WaitingForReadiness);
        let coordinator = match self.launch_process(true) {
            Ok(handle) => handle,
            Err(err) => {
                self.finish(Some(err.clone())).await;
                return Err(err);
            }
        };
        lock(&self.trace).coordinator_launched_at = Some(coordinator.launched_at());

        let drain = self
            .multiplexer
            .spawn_drain(self.config.timing.drain_interval(), self.cancel.clone());
        lock(&self.tasks).push(drain);

        self.log.info(format!(
            "Waiting for {} to initialize...",
            self.config.coordinator.name
        ));

        let this = Arc::clone(self);
        let span = info_span!("session_control", id = %self.id);
        let control = tokio::spawn(this.drive(coordinator).instrument(span));
        *lock(&self.control) = Some(control);
        Ok(())
    }

    /// Ask the session to end and wait for its terminal state.
    ///
    /// A no-op in `Idle`, `Stopped` and `Failed`.
    pub async fn stop(&self) -> SessionState {
        let current = self.state();
        if current == SessionState::Idle || current.is_terminal() {
            debug!(state = %current, "stop ignored");
            return current;
        }
        if !self.cancel.is_cancelled() {
            info!(state = %current, "stop requested");
            self.log.info("Stopping simulation...");
            self.cancel.cancel();
        }
        self.wait_terminal().await
    }

    /// End the session through its stop path and report the cleanup state.
    ///
    /// An `Idle` session has nothing to clean up and is left untouched. An
    /// active session is stopped first, so cleanup always sees every
    /// launched process. Only the first cleanup run has any effect; later
    /// calls return a skipped report.
    pub async fn cleanup(&self) -> CleanupReport {
        let current = self.state();
        if current == SessionState::Idle {
            debug!("cleanup ignored for idle session");
            return CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            };
        }
        if !current.is_terminal() {
            self.stop().await;
        }
        self.run_shutdown().await
    }

    async fn run_shutdown(&self) -> CleanupReport {
        let processes = self.processes();
        self.shutdown.run(&processes, &self.log).await
    }

    fn transition(&self, next: SessionState) -> bool {
        let from = {
            let mut state = lock(&self.state);
            let from = *state;
            if !from.can_transition_to(next) {
                warn!(%from, to = %next, "illegal session transition ignored");
                return false;
            }
            *state = next;
            from
        };

        info!(%from, to = %next, "session state changed");
        self.state_tx.send_replace(next);
        self.log.info(format!("session entered state {next}"));
        self.log.notify(SessionEvent::StateChanged { from, to: next });
        true
    }

    fn record_failure(&self, err: &AppError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(err.clone());
        }
        drop(failure);
        self.log.error(format!("Error: {err}"));
    }

    /// Create the working directory, clear a stale endpoint and render inputs.
    fn prepare(&self, name: &WorkdirName, params: &SimulationParams) -> Result<()> {
        if !self.workdir.is_dir() {
            std::fs::create_dir_all(&self.workdir).map_err(|err| {
                AppError::Render(format!(
                    "failed to create working directory {}: {err}",
                    self.workdir.display()
                ))
            })?;
            self.log.info(format!(
                "Created working directory: {}",
                self.workdir.display()
            ));
        }

        match remove_endpoint(&self.endpoint) {
            Ok(true) => self.log.info("Removed existing socket file"),
            Ok(false) => {}
            Err(err) => {
                return Err(AppError::StaleEndpointRemovalFailed(format!(
                    "{}: {err}",
                    self.endpoint.display()
                )))
            }
        }

        let ctx = RenderContext {
            params,
            workdir: &self.workdir,
            staging_dir: &self.config.staging_dir,
            socket_name: &self.config.endpoint.socket_name,
        };
        let written = self.renderer.render(&ctx)?;
        for path in written {
            self.log.info(format!("Wrote {}", path.display()));
        }
        debug!(workdir = name.as_str(), "session prepared");
        Ok(())
    }

    /// Launch one side of the pair and start draining its output.
    fn launch_process(&self, coordinator: bool) -> Result<ProcessHandle> {
        let spec = if coordinator {
            &self.config.coordinator
        } else {
            &self.config.worker
        };
        self.log.info(format!("Starting {} process...", spec.name));

        let handle = launch(spec, &self.config.staging_dir)?;
        lock(&self.processes).push(handle.clone());

        if let Some((stdout, stderr)) = handle.take_output() {
            let reader = self.multiplexer.attach(&spec.name, stdout, stderr);
            lock(&self.readers).push(reader);
        }
        Ok(handle)
    }

    /// Background half of the lifecycle.
    async fn drive(self: Arc<Self>, coordinator: ProcessHandle) {
        let cause = match self.reach_running(&coordinator).await {
            Ok(()) => self.supervise().await,
            Err(err) => Some(err),
        };
        self.finish(cause).await;
    }

    /// Wait for the endpoint, then launch the worker.
    async fn reach_running(&self, coordinator: &ProcessHandle) -> Result<()> {
        let timing = &self.config.timing;
        let opts = ReadinessOptions {
            timeout: timing.readiness_timeout(),
            poll_interval: timing.readiness_poll(),
        };

        wait_for_ready(&self.endpoint, opts, &self.cancel, || coordinator.liveness()).await?;
        lock(&self.trace).endpoint_ready_at = Some(Instant::now());
        self.log.info(format!(
            "{} socket file detected, starting {}...",
            self.config.coordinator.name, self.config.worker.name
        ));

        if !settle(timing.post_ready_delay(), &self.cancel).await {
            return Err(AppError::Cancelled);
        }
        if let Liveness::Exited(code) = coordinator.liveness() {
            return Err(AppError::UnexpectedExit {
                process: coordinator.name().to_owned(),
                code,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let worker = self.launch_process(false)?;
        {
            let mut trace = lock(&self.trace);
            trace.worker_launched_at = Some(worker.launched_at());
            trace.worker_launches += 1;
        }

        self.transition(SessionState::Running);

        let interval = timing.liveness_interval();
        let mut tasks = lock(&self.tasks);
        for process in [coordinator.clone(), worker] {
            tasks.push(spawn_liveness_monitor(
                process,
                interval,
                self.events_tx.clone(),
                self.cancel.clone(),
            ));
        }
        Ok(())
    }

    /// Watch a running session until something ends it.
    ///
    /// Returns the failure cause, or `None` for a requested stop or a clean exit.
    async fn supervise(&self) -> Option<AppError> {
        let Some(mut events) = lock(&self.events_rx).take() else {
            warn!("session events already consumed");
            return None;
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                event = events.recv() => match event {
                    Some(SupervisorEvent::ProcessExited { name, code }) => {
                        return self.on_process_exit(&name, code);
                    }
                    Some(SupervisorEvent::StreamClosed { name }) => {
                        self.log.info(format!("{name} output stream closed"));
                        let exited = self
                            .processes()
                            .into_iter()
                            .find(|p| p.name() == name)
                            .map(|p| p.liveness());
                        if let Some(Liveness::Exited(code)) = exited {
                            return self.on_process_exit(&name, code);
                        }
                    }
                    None => return None,
                },
            }
        }
    }

    fn on_process_exit(&self, name: &str, code: Option<i32>) -> Option<AppError> {
        if code == Some(0) {
            self.log.info(format!("{name} process finished with code 0"));
            self.log.info("All processes have finished");
            None
        } else {
            let shown = code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
            self.log.error(format!(
                "{name} process exited unexpectedly with code {shown}"
            ));
            Some(AppError::UnexpectedExit {
                process: name.to_owned(),
                code,
            })
        }
    }

    /// Stop everything, clean up once, and publish the terminal state.
    async fn finish(&self, cause: Option<AppError>) {
        let cause = cause.filter(|err| *err != AppError::Cancelled);
        if let Some(err) = &cause {
            self.record_failure(err);
        }

        self.transition(SessionState::Stopping);
        self.cancel.cancel();

        let report = self.run_shutdown().await;
        debug!(?report, "cleanup finished");

        self.join_background().await;
        self.multiplexer.drain_once();

        let terminal = if cause.is_some() {
            SessionState::Failed
        } else {
            SessionState::Stopped
        };
        self.transition(terminal);
    }

    /// Let readers reach end-of-stream and reap the cancelled tasks.
    async fn join_background(&self) {
        let deadline = Instant::now() + self.config.timing.reader_shutdown();
        let readers = std::mem::take(&mut *lock(&self.readers));
        let tasks = std::mem::take(&mut *lock(&self.tasks));

        for mut handle in readers.into_iter().chain(tasks) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("background task still running at shutdown, aborting");
                handle.abort();
            }
        }
    }
}

/// Owns the current session and enforces one active run at a time.
pub struct Orchestrator {
    config: Arc<SupervisorConfig>,
    renderer: Arc<dyn ConfigRenderer>,
    observer: Option<EventSender>,
    current: Mutex<Option<Arc<Session>>>,
}

impl Orchestrator {
    /// Create an orchestrator with no session.
    #[must_use]
    pub fn new(config: Arc<SupervisorConfig>, renderer: Arc<dyn ConfigRenderer>) -> Self {
        Self {
            config,
            renderer,
            observer: None,
            current: Mutex::new(None),
        }
    }

    /// Forward every session's records and state changes to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: EventSender) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Configuration shared by every session.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The most recent session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Session>> {
        lock(&self.current).clone()
    }

    /// State of the most recent session, `Idle` if none was started.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.current()
            .map_or(SessionState::Idle, |session| session.state())
    }

    /// Start a fresh session in `workdir_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` while another session is active,
    /// otherwise any start-time error of [`Session::start`]. A session that
    /// fails to start is kept as the current one so its log stays readable.
    pub async fn start(&self, workdir_name: &str, params: SimulationParams) -> Result<Arc<Session>> {
        let session = {
            let mut current = lock(&self.current);
            if let Some(active) = current.as_ref() {
                let state = active.state();
                if !state.is_terminal() {
                    return Err(AppError::AlreadyRunning(format!(
                        "session '{}' is {state}",
                        active.name()
                    )));
                }
            }
            let session = Session::new(
                Arc::clone(&self.config),
                Arc::clone(&self.renderer),
                workdir_name,
                self.observer.clone(),
            );
            *current = Some(Arc::clone(&session));
            session
        };

        session.start(params).await?;
        Ok(session)
    }

    /// Stop the current session. Returns its final state, or `None` if there is none.
    pub async fn stop(&self) -> Option<SessionState> {
        let session = self.current()?;
        Some(session.stop().await)
    }
}
