//! Supervisor configuration parsing and validation.
//!
//! Every field has a default, so an empty TOML document reproduces the
//! stock i-PI + LAMMPS water setup: the coordinator runs `run_ipi.py`, the
//! worker runs `run_lammps.py`, and the endpoint lives at
//! `/tmp/ipi_water_ipi`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// How one external process is started.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessSpec {
    /// Display name; used as the source tag in the session log.
    pub name: String,
    /// Executable path or name resolved through `PATH`.
    pub program: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    fn python_script(name: &str, script: &str, env_key: &str) -> Self {
        Self {
            name: name.to_owned(),
            program: "python3".to_owned(),
            args: vec![script.to_owned()],
            env: BTreeMap::from([(env_key.to_owned(), "600".to_owned())]),
        }
    }
}

fn default_coordinator() -> ProcessSpec {
    ProcessSpec::python_script("I-PI", "run_ipi.py", "IPI_TIMEOUT")
}

fn default_worker() -> ProcessSpec {
    ProcessSpec::python_script("LAMMPS", "run_lammps.py", "LAMMPS_IPI_TIMEOUT")
}

/// Location of the coordinator's unix socket.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EndpointConfig {
    /// Directory the coordinator creates its socket in.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Socket name shared by both engines.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_socket_name() -> String {
    "water_ipi".into()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            socket_name: default_socket_name(),
        }
    }
}

/// Polling intervals, timeouts and grace periods, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Upper bound on waiting for the endpoint to appear.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,
    /// Endpoint existence poll interval.
    #[serde(default = "default_short_interval")]
    pub readiness_poll_ms: u64,
    /// Extra settle time between endpoint detection and worker launch.
    #[serde(default = "default_post_ready_delay")]
    pub post_ready_delay_ms: u64,
    /// Process liveness poll interval while running.
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_ms: u64,
    /// Output queue drain interval.
    #[serde(default = "default_short_interval")]
    pub drain_interval_ms: u64,
    /// Time a process gets to honor a termination request before it is killed.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_ms: u64,
    /// Time output readers get to reach end-of-stream after the processes are gone.
    #[serde(default = "default_reader_shutdown")]
    pub reader_shutdown_ms: u64,
}

fn default_readiness_timeout() -> u64 {
    30_000
}

fn default_short_interval() -> u64 {
    100
}

fn default_post_ready_delay() -> u64 {
    5_000
}

fn default_liveness_interval() -> u64 {
    500
}

fn default_terminate_grace() -> u64 {
    5_000
}

fn default_reader_shutdown() -> u64 {
    2_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: default_readiness_timeout(),
            readiness_poll_ms: default_short_interval(),
            post_ready_delay_ms: default_post_ready_delay(),
            liveness_interval_ms: default_liveness_interval(),
            drain_interval_ms: default_short_interval(),
            terminate_grace_ms: default_terminate_grace(),
            reader_shutdown_ms: default_reader_shutdown(),
        }
    }
}

impl TimingConfig {
    /// Readiness wait upper bound.
    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Endpoint poll interval.
    #[must_use]
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    /// Settle delay after the endpoint appears.
    #[must_use]
    pub fn post_ready_delay(&self) -> Duration {
        Duration::from_millis(self.post_ready_delay_ms)
    }

    /// Liveness poll interval.
    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Output drain interval.
    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Termination grace period.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Reader shutdown bound.
    #[must_use]
    pub fn reader_shutdown(&self) -> Duration {
        Duration::from_millis(self.reader_shutdown_ms)
    }
}

fn default_dot() -> PathBuf {
    PathBuf::from(".")
}

fn default_artifacts() -> Vec<String> {
    ["input.xml", "init.xyz", "water.data", "in.water_ipi", "log.lammps"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Top-level configuration parsed from `pimd.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Parent directory of per-session working directories.
    #[serde(default = "default_dot")]
    pub sessions_root: PathBuf,
    /// Directory the engines run in and leave their transient files.
    #[serde(default = "default_dot")]
    pub staging_dir: PathBuf,
    /// IPC endpoint location.
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Process owning time-stepping; opens the endpoint.
    #[serde(default = "default_coordinator")]
    pub coordinator: ProcessSpec,
    /// Process computing forces; connects to the endpoint.
    #[serde(default = "default_worker")]
    pub worker: ProcessSpec,
    /// Poll intervals and timeouts.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Transient files relocated into the working directory on cleanup.
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sessions_root: default_dot(),
            staging_dir: default_dot(),
            endpoint: EndpointConfig::default(),
            coordinator: default_coordinator(),
            worker: default_worker(),
            timing: TimingConfig::default(),
            artifacts: default_artifacts(),
        }
    }
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Filesystem path of the IPC endpoint, `<socket_dir>/ipi_<socket_name>`.
    #[must_use]
    pub fn endpoint_path(&self) -> PathBuf {
        self.endpoint
            .socket_dir
            .join(format!("ipi_{}", self.endpoint.socket_name))
    }

    /// Working directory for a session with the given name.
    #[must_use]
    pub fn workdir_for(&self, name: &str) -> PathBuf {
        self.sessions_root.join(name)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        for spec in [&self.coordinator, &self.worker] {
            if spec.name.trim().is_empty() {
                return Err(AppError::Config("process name must not be empty".into()));
            }
            if spec.program.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "program for {} must not be empty",
                    spec.name
                )));
            }
        }

        if self.coordinator.name == self.worker.name {
            return Err(AppError::Config(
                "coordinator and worker names must differ".into(),
            ));
        }

        let name = &self.endpoint.socket_name;
        if name.is_empty() || name.contains(['/', '\\', '\0']) {
            return Err(AppError::Config(format!(
                "socket_name '{name}' is not a plain file name"
            )));
        }

        let t = &self.timing;
        let intervals = [
            ("readiness_timeout_ms", t.readiness_timeout_ms),
            ("readiness_poll_ms", t.readiness_poll_ms),
            ("liveness_interval_ms", t.liveness_interval_ms),
            ("drain_interval_ms", t.drain_interval_ms),
        ];
        if let Some((field, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(AppError::Config(format!(
                "timing.{field} must be greater than zero"
            )));
        }

        if let Some(bad) = self
            .artifacts
            .iter()
            .find(|a| a.is_empty() || a.contains(['/', '\\']))
        {
            return Err(AppError::Config(format!(
                "artifact '{bad}' must be a plain file name"
            )));
        }

        Ok(())
    }
}
