//! Shutdown and cleanup protocol.
//!
//! Runs at most once per session no matter how many stop triggers race
//! for it. The steps are: terminate the processes, remove the endpoint,
//! relocate the artifacts. Every step runs even if an earlier one failed,
//! and failures are reported, never returned.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, info_span, warn, Instrument};

use super::supervisor::{ProcessHandle, TerminateOutcome};
use crate::models::log::SessionLog;
use crate::{AppError, Result};

/// What one cleanup pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// `true` when another caller had already run cleanup.
    pub skipped: bool,
    /// Termination result per process name.
    pub terminated: Vec<(String, TerminateOutcome)>,
    /// Whether an endpoint file was removed.
    pub endpoint_removed: bool,
    /// Artifact names moved into the working directory.
    pub relocated: Vec<String>,
    /// Non-fatal failures, in the order they happened.
    pub errors: Vec<AppError>,
}

/// Once-only cleanup for one session.
#[derive(Debug)]
pub struct ShutdownProtocol {
    ran: AtomicBool,
    endpoint: PathBuf,
    staging_dir: PathBuf,
    workdir: PathBuf,
    artifacts: Vec<String>,
    grace: Duration,
}

impl ShutdownProtocol {
    /// Prepare cleanup for a session.
    #[must_use]
    pub fn new(
        endpoint: PathBuf,
        staging_dir: PathBuf,
        workdir: PathBuf,
        artifacts: Vec<String>,
        grace: Duration,
    ) -> Self {
        Self {
            ran: AtomicBool::new(false),
            endpoint,
            staging_dir,
            workdir,
            artifacts,
            grace,
        }
    }

    /// Whether cleanup has been claimed by some caller.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Run cleanup unless it already ran. Later calls return a skipped report.
    pub async fn run(&self, processes: &[ProcessHandle], log: &SessionLog) -> CleanupReport {
        if self
            .ran
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("cleanup already ran, skipping");
            return CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            };
        }

        let span = info_span!("cleanup", workdir = %self.workdir.display());
        async move {
            let mut report = CleanupReport::default();

            self.terminate_all(processes, log, &mut report).await;

            match remove_endpoint(&self.endpoint) {
                Ok(true) => {
                    log.info("Cleaned up socket file");
                    report.endpoint_removed = true;
                }
                Ok(false) => {}
                Err(err) => {
                    let err = AppError::CleanupEndpointRemove(err.to_string());
                    log.warn(format!("Warning: Could not remove socket file: {err}"));
                    report.errors.push(err);
                }
            }

            let (relocated, errors) =
                relocate_artifacts(&self.staging_dir, &self.workdir, &self.artifacts);
            for err in &errors {
                log.warn(format!("Error moving file: {err}"));
            }
            if !relocated.is_empty() {
                log.info(format!(
                    "Moved {} to {}",
                    relocated.join(", "),
                    self.workdir.display()
                ));
            }
            report.relocated = relocated;
            report.errors.extend(errors);

            info!(
                relocated = report.relocated.len(),
                errors = report.errors.len(),
                "cleanup complete"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn terminate_all(
        &self,
        processes: &[ProcessHandle],
        log: &SessionLog,
        report: &mut CleanupReport,
    ) {
        let grace = self.grace;
        let results = join_all(processes.iter().map(|p| p.terminate(grace))).await;

        for (process, result) in processes.iter().zip(results) {
            let name = process.name().to_owned();
            match result {
                Ok(outcome) => {
                    match outcome {
                        TerminateOutcome::AlreadyExited(_) => {}
                        TerminateOutcome::Graceful(_) => log.info(format!("{name} process stopped")),
                        TerminateOutcome::Killed => log.warn(format!(
                            "{name} process ignored termination request and was killed"
                        )),
                    }
                    report.terminated.push((name, outcome));
                }
                Err(err) => {
                    warn!(process = name, %err, "termination failed");
                    log.error(format!("Failed to stop {name}: {err}"));
                    report.errors.push(err);
                }
            }
        }
    }
}

/// Remove the endpoint file if present. Returns whether something was removed.
///
/// # Errors
///
/// Returns the underlying I/O error when the file exists but cannot be removed.
pub fn remove_endpoint(endpoint: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(endpoint) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Move each named file from `from` into `to`, replacing existing files.
///
/// Missing sources are skipped. Returns the names moved and one
/// `CleanupFileMove` error per failed file.
#[must_use]
pub fn relocate_artifacts(
    from: &Path,
    to: &Path,
    names: &[String],
) -> (Vec<String>, Vec<AppError>) {
    let mut moved = Vec::new();
    let mut errors = Vec::new();

    if same_dir(from, to) {
        return (moved, errors);
    }

    for name in names {
        let src = from.join(name);
        if !src.is_file() {
            continue;
        }
        match move_file(&src, &to.join(name)) {
            Ok(()) => moved.push(name.clone()),
            Err(err) => {
                warn!(file = name, %err, "failed to relocate artifact");
                errors.push(AppError::CleanupFileMove(format!("{name}: {err}")));
            }
        }
    }

    (moved, errors)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Rename `src` to `dest`, falling back to copy + delete across filesystems.
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)?;
    std::fs::remove_file(src)?;
    Ok(())
}
