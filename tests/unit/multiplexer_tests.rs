//! Unit tests for `OutputMultiplexer` queueing, draining and closure reports.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pimd_orchestrator::models::log::{RecordLevel, SessionLog};
use pimd_orchestrator::orchestrator::multiplexer::OutputMultiplexer;
use pimd_orchestrator::orchestrator::supervisor::SupervisorEvent;

/// Reader that fails on the first poll.
struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("pipe broke")))
    }
}

fn setup() -> (
    Arc<SessionLog>,
    Arc<OutputMultiplexer>,
    mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    let log = Arc::new(SessionLog::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let mux = OutputMultiplexer::new(Arc::clone(&log), tx);
    (log, mux, rx)
}

/// Lines from one source reach the log in production order.
#[test]
fn preserves_per_source_order() {
    let (log, mux, _rx) = setup();
    let ipi = mux.register("I-PI");
    let lammps = mux.register("LAMMPS");

    ipi.line("A");
    lammps.line("x");
    ipi.line("B");
    lammps.line("y");
    ipi.line("C");

    assert_eq!(mux.drain_once(), 5);
    assert_eq!(log.lines_from("I-PI"), ["A", "B", "C"]);
    assert_eq!(log.lines_from("LAMMPS"), ["x", "y"]);
}

/// Draining an empty multiplexer is a no-op.
#[test]
fn drain_without_output_appends_nothing() {
    let (log, mux, _rx) = setup();
    let _producer = mux.register("I-PI");
    assert_eq!(mux.drain_once(), 0);
    assert!(log.snapshot().is_empty());
    assert_eq!(mux.open_streams(), 1);
}

/// The closed marker is reported once as `StreamClosed`.
#[test]
fn closed_marker_reports_stream_closed_once() {
    let (log, mux, mut rx) = setup();
    let producer = mux.register("LAMMPS");
    producer.line("final line");
    producer.close();

    mux.drain_once();
    mux.drain_once();

    assert_eq!(log.lines_from("LAMMPS"), ["final line"]);
    assert_eq!(
        rx.try_recv().unwrap(),
        SupervisorEvent::StreamClosed {
            name: "LAMMPS".into()
        }
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(mux.open_streams(), 0);
}

/// A producer dropped without a marker counts as closed.
#[test]
fn dropped_producer_counts_as_closed() {
    let (_log, mux, mut rx) = setup();
    drop(mux.register("I-PI"));
    mux.drain_once();
    assert!(matches!(
        rx.try_recv(),
        Ok(SupervisorEvent::StreamClosed { ref name }) if name == "I-PI"
    ));
}

/// Attached pipes are merged under one source tag and closed after both end.
#[tokio::test]
async fn attach_merges_both_pipes() {
    let (log, mux, mut rx) = setup();
    let (mut out_w, out_r) = tokio::io::duplex(256);
    let (mut err_w, err_r) = tokio::io::duplex(256);

    let reader = mux.attach("I-PI", out_r, err_r);
    out_w.write_all(b"A\nB\n").await.unwrap();
    err_w.write_all(b"warning: slow\n").await.unwrap();
    out_w.write_all(b"C\n").await.unwrap();
    drop(out_w);
    drop(err_w);

    tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap();
    mux.drain_once();

    let lines = log.lines_from("I-PI");
    let stdout: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| *l != "warning: slow")
        .collect();
    assert_eq!(stdout, ["A", "B", "C"]);
    assert!(lines.iter().any(|l| l == "warning: slow"));
    assert!(matches!(
        rx.try_recv(),
        Ok(SupervisorEvent::StreamClosed { ref name }) if name == "I-PI"
    ));
}

/// A read failure becomes an error line and ends only that pipe.
#[tokio::test]
async fn read_error_becomes_error_line() {
    let (log, mux, mut rx) = setup();
    let stdout: &'static [u8] = b"still here\n";

    let reader = mux.attach("LAMMPS", stdout, FailingReader);
    tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap();
    mux.drain_once();

    let records = log.snapshot();
    assert!(records
        .iter()
        .any(|r| r.level == RecordLevel::Error && r.text.starts_with("Error reading output:")));
    assert!(records.iter().any(|r| r.text == "still here"));
    assert!(rx.try_recv().is_ok());
}

/// The drain task moves queued lines into the log without explicit calls.
#[tokio::test]
async fn drain_task_moves_lines_periodically() {
    let (log, mux, _rx) = setup();
    let cancel = CancellationToken::new();
    let task = mux.spawn_drain(Duration::from_millis(10), cancel.clone());

    let producer = mux.register("LAMMPS");
    producer.line("Step 0");
    mux.flush();

    tokio::time::timeout(Duration::from_secs(5), async {
        while log.lines_from("LAMMPS").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
