//! Session lifecycle states and the working-directory identity.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Lifecycle state of one orchestrated run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Constructed, nothing started.
    Idle,
    /// Validating, clearing the endpoint and rendering inputs.
    Preparing,
    /// Coordinator launched, endpoint not yet observed.
    WaitingForReadiness,
    /// Both processes launched and output is being drained.
    Running,
    /// Shutdown and cleanup in progress.
    Stopping,
    /// Ended normally or on request.
    Stopped,
    /// Ended because of an error.
    Failed,
}

impl SessionState {
    /// `Stopped` and `Failed` are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether a new run may replace a session in this state.
    #[must_use]
    pub fn accepts_new_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Any non-terminal state may fail; any active state may begin stopping.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Preparing)
                | (Self::Preparing, Self::WaitingForReadiness)
                | (Self::WaitingForReadiness, Self::Running)
                | (
                    Self::Preparing | Self::WaitingForReadiness | Self::Running,
                    Self::Stopping
                )
                | (Self::Stopping, Self::Stopped)
                | (
                    Self::Idle
                        | Self::Preparing
                        | Self::WaitingForReadiness
                        | Self::Running
                        | Self::Stopping,
                    Self::Failed
                )
        )
    }

    /// Human-readable name used in log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing => "Preparing",
            Self::WaitingForReadiness => "WaitingForReadiness",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, filesystem-safe working-directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkdirName(String);

impl WorkdirName {
    /// Accept a single path component made of printable characters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParameters` for empty names, `.`/`..`,
    /// path separators, or control characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(AppError::InvalidParameters(
                "working directory name cannot be empty".into(),
            ));
        }
        if name == "." || name == ".." {
            return Err(AppError::InvalidParameters(format!(
                "working directory name '{name}' is reserved"
            )));
        }
        if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
            return Err(AppError::InvalidParameters(format!(
                "working directory name '{name}' must be a single plain path component"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// Borrow the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkdirName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
