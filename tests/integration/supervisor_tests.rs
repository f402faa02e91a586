//! Integration tests for process launch, liveness and two-phase termination.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pimd_orchestrator::config::ProcessSpec;
use pimd_orchestrator::orchestrator::supervisor::{
    launch, spawn_liveness_monitor, Liveness, SupervisorEvent, TerminateOutcome,
};
use pimd_orchestrator::AppError;

use super::test_helpers::sh_spec;

async fn wait_until_exited(handle: &pimd_orchestrator::orchestrator::supervisor::ProcessHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.is_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("process did not exit");
}

/// A missing executable is a launch failure naming the process.
#[tokio::test]
async fn missing_program_fails_to_launch() {
    let spec = ProcessSpec {
        program: "/nonexistent/lmp_serial".to_owned(),
        ..sh_spec("LAMMPS", "")
    };
    let err = launch(&spec, Path::new(".")).unwrap_err();
    assert!(matches!(err, AppError::LaunchFailed(ref msg) if msg.contains("LAMMPS")));
}

/// Overlay variables reach the child alongside the inherited environment.
#[tokio::test]
async fn environment_overlay_is_applied() {
    let mut spec = sh_spec("I-PI", "echo \"$IPI_TIMEOUT:${PATH:+has-path}\"");
    spec.env.insert("IPI_TIMEOUT".to_owned(), "600".to_owned());

    let handle = launch(&spec, Path::new(".")).unwrap();
    let (mut stdout, _stderr) = handle.take_output().unwrap();
    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();

    assert_eq!(out.trim(), "600:has-path");
    assert!(handle.take_output().is_none());
}

/// The process runs in the requested directory.
#[tokio::test]
async fn runs_in_given_directory() {
    let dir = tempfile::tempdir().unwrap();
    let handle = launch(&sh_spec("LAMMPS", "echo x > marker"), dir.path()).unwrap();
    wait_until_exited(&handle).await;
    assert!(dir.path().join("marker").exists());
}

/// Liveness reports the exit code once the process is gone.
#[tokio::test]
async fn liveness_reports_exit_code() {
    let handle = launch(&sh_spec("LAMMPS", "exit 3"), Path::new(".")).unwrap();
    wait_until_exited(&handle).await;
    assert_eq!(handle.liveness(), Liveness::Exited(Some(3)));
}

/// A process that honors SIGTERM ends gracefully.
#[cfg(unix)]
#[tokio::test]
async fn terminate_is_graceful_when_honored() {
    let handle = launch(&sh_spec("I-PI", "exec sleep 30"), Path::new(".")).unwrap();
    assert!(handle.is_alive());

    let outcome = handle.terminate(Duration::from_secs(2)).await.unwrap();

    assert_eq!(outcome, TerminateOutcome::Graceful(None));
    assert!(!handle.is_alive());
}

/// A process that ignores SIGTERM is killed after the grace period.
#[cfg(unix)]
#[tokio::test]
async fn terminate_escalates_to_kill() {
    let script = "trap '' TERM; echo armed; while :; do sleep 0.05; done";
    let handle = launch(&sh_spec("LAMMPS", script), Path::new(".")).unwrap();
    let (stdout, _stderr) = handle.take_output().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("armed"));

    let started = tokio::time::Instant::now();
    let outcome = handle.terminate(Duration::from_millis(300)).await.unwrap();

    assert_eq!(outcome, TerminateOutcome::Killed);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!handle.is_alive());
}

/// Terminating an exited process succeeds without signalling.
#[tokio::test]
async fn terminate_already_exited_is_success() {
    let handle = launch(&sh_spec("I-PI", "exit 0"), Path::new(".")).unwrap();
    wait_until_exited(&handle).await;

    let outcome = handle.terminate(Duration::from_secs(1)).await.unwrap();

    assert_eq!(outcome, TerminateOutcome::AlreadyExited(Some(0)));
}

/// The liveness monitor reports an exit exactly once.
#[tokio::test]
async fn monitor_reports_exit() {
    let handle = launch(&sh_spec("LAMMPS", "sleep 0.1; exit 4"), Path::new(".")).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = spawn_liveness_monitor(
        handle,
        Duration::from_millis(20),
        tx,
        CancellationToken::new(),
    );

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        SupervisorEvent::ProcessExited {
            name: "LAMMPS".into(),
            code: Some(4)
        }
    );
    task.await.unwrap();
    assert!(rx.recv().await.is_none());
}

/// A cancelled monitor stops without reporting.
#[tokio::test]
async fn monitor_stops_on_cancel() {
    let handle = launch(&sh_spec("I-PI", "exec sleep 30"), Path::new(".")).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = spawn_liveness_monitor(handle.clone(), Duration::from_millis(20), tx, cancel.clone());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert!(rx.recv().await.is_none());
    handle.terminate(Duration::from_secs(2)).await.unwrap();
}
