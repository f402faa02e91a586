//! Coordinator readiness detection.
//!
//! The coordinator signals that it accepts connections by creating its
//! socket file. The worker must never be launched before that file exists,
//! so the session blocks here between the two launches.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::supervisor::Liveness;
use crate::{AppError, Result};

/// Bounds for one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOptions {
    /// Give up after this long.
    pub timeout: Duration,
    /// Check the endpoint and the coordinator this often.
    pub poll_interval: Duration,
}

/// Wait until `endpoint` exists.
///
/// `coordinator` is consulted on every poll; an exit before the endpoint
/// appears fails fast. The wait is woken immediately by `cancel`.
///
/// Returns the time spent waiting.
///
/// # Errors
///
/// - `AppError::CoordinatorExitedEarly` — the coordinator exited first.
/// - `AppError::ReadinessTimeout` — `opts.timeout` elapsed.
/// - `AppError::Cancelled` — `cancel` fired.
pub async fn wait_for_ready<F>(
    endpoint: &Path,
    opts: ReadinessOptions,
    cancel: &CancellationToken,
    mut coordinator: F,
) -> Result<Duration>
where
    F: FnMut() -> Liveness,
{
    let started = Instant::now();
    let deadline = started + opts.timeout;

    loop {
        if cancel.is_cancelled() {
            debug!("readiness wait cancelled");
            return Err(AppError::Cancelled);
        }

        match endpoint.try_exists() {
            Ok(true) => {
                let waited = started.elapsed();
                info!(endpoint = %endpoint.display(), ?waited, "endpoint appeared");
                return Ok(waited);
            }
            Ok(false) => {}
            Err(err) => {
                // Permission problems on the parent directory look like absence.
                warn!(endpoint = %endpoint.display(), %err, "failed to probe endpoint");
            }
        }

        if let Liveness::Exited(code) = coordinator() {
            warn!(?code, "coordinator exited before endpoint appeared");
            return Err(AppError::CoordinatorExitedEarly { code });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(AppError::ReadinessTimeout(format!(
                "{} did not appear within {:?}",
                endpoint.display(),
                opts.timeout
            )));
        }

        let nap = opts.poll_interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("readiness wait cancelled");
                return Err(AppError::Cancelled);
            }
            () = tokio::time::sleep(nap) => {}
        }
    }
}

/// Sleep for `delay`, returning `false` if `cancel` fired first.
pub async fn settle(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
