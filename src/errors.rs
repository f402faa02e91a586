//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering every session failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Working-directory name or simulation parameters rejected.
    InvalidParameters(String),
    /// A session is already active.
    AlreadyRunning(String),
    /// A leftover IPC endpoint could not be removed before start.
    StaleEndpointRemovalFailed(String),
    /// The render collaborator failed to produce the engine inputs.
    Render(String),
    /// An external process could not be started.
    LaunchFailed(String),
    /// The coordinator endpoint did not appear in time.
    ReadinessTimeout(String),
    /// The coordinator exited before its endpoint appeared.
    CoordinatorExitedEarly {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// A supervised process exited while the session was running.
    UnexpectedExit {
        /// Display name of the process.
        process: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// A wait was interrupted by a stop request.
    Cancelled,
    /// An artifact could not be relocated during cleanup.
    CleanupFileMove(String),
    /// The IPC endpoint could not be removed during cleanup.
    CleanupEndpointRemove(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error ends a session. Cleanup-phase errors are logged only.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::CleanupFileMove(_) | Self::CleanupEndpointRemove(_)
        )
    }
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_owned(), |c| format!("code {c}"))
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidParameters(msg) => write!(f, "invalid parameters: {msg}"),
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::StaleEndpointRemovalFailed(msg) => {
                write!(f, "stale endpoint removal failed: {msg}")
            }
            Self::Render(msg) => write!(f, "render: {msg}"),
            Self::LaunchFailed(msg) => write!(f, "launch failed: {msg}"),
            Self::ReadinessTimeout(msg) => write!(f, "readiness timeout: {msg}"),
            Self::CoordinatorExitedEarly { code } => write!(
                f,
                "coordinator exited early: {} before endpoint appeared",
                describe_code(*code)
            ),
            Self::UnexpectedExit { process, code } => write!(
                f,
                "unexpected exit: {process} exited with {}",
                describe_code(*code)
            ),
            Self::Cancelled => write!(f, "cancelled: stop requested"),
            Self::CleanupFileMove(msg) => write!(f, "cleanup file move: {msg}"),
            Self::CleanupEndpointRemove(msg) => write!(f, "cleanup endpoint remove: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
