//! Unit tests for `SessionLog` ordering and observer forwarding.

use tokio::sync::mpsc;

use pimd_orchestrator::models::log::{
    LogRecord, RecordLevel, SessionEvent, SessionLog, SESSION_SOURCE,
};

/// Records keep append order and their source tag.
#[test]
fn records_keep_append_order() {
    let log = SessionLog::default();
    log.info("Starting session");
    log.append("I-PI", RecordLevel::Info, "A");
    log.append("LAMMPS", RecordLevel::Info, "x");
    log.append("I-PI", RecordLevel::Info, "B");

    let sources: Vec<String> = log.snapshot().into_iter().map(|r| r.source).collect();
    assert_eq!(sources, [SESSION_SOURCE, "I-PI", "LAMMPS", "I-PI"]);
    assert_eq!(log.lines_from("I-PI"), ["A", "B"]);
    assert!(log.contains("Starting"));
    assert!(!log.contains("absent"));
}

/// Level helpers tag records with the orchestrator source.
#[test]
fn level_helpers_use_session_source() {
    let log = SessionLog::default();
    log.warn("careful");
    log.error("broken");

    let levels: Vec<RecordLevel> = log.snapshot().into_iter().map(|r| r.level).collect();
    assert_eq!(levels, [RecordLevel::Warn, RecordLevel::Error]);
    assert_eq!(log.lines_from(SESSION_SOURCE), ["careful", "broken"]);
}

/// Every appended record is forwarded to the observer.
#[test]
fn observer_receives_records() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let log = SessionLog::new(Some(tx));
    log.append("LAMMPS", RecordLevel::Info, "Step 100");

    match rx.try_recv().expect("record forwarded") {
        SessionEvent::Record(record) => {
            assert_eq!(record.source, "LAMMPS");
            assert_eq!(record.text, "Step 100");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// A departed observer does not stop the log from recording.
#[test]
fn dropped_observer_is_tolerated() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let log = SessionLog::new(Some(tx));
    log.info("still recorded");
    assert_eq!(log.snapshot().len(), 1);
}

/// Records serialize with snake_case levels.
#[test]
fn record_serializes_to_json() {
    let log = SessionLog::default();
    log.error("Error: boom");
    let record: LogRecord = log.snapshot().remove(0);

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["level"], "error");
    assert_eq!(json["source"], SESSION_SOURCE);
    let back: LogRecord = serde_json::from_value(json).unwrap();
    assert_eq!(back, record);
}

/// Concurrent appenders hand the observer records in log order with
/// non-decreasing timestamps.
#[test]
fn concurrent_appends_reach_observer_in_log_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let log = SessionLog::new(Some(tx));

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let log = &log;
            scope.spawn(move || {
                for line in 0..200 {
                    log.info(format!("worker {worker} line {line}"));
                }
            });
        }
    });

    let mut observed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Record(record) = event {
            observed.push(record);
        }
    }

    let stored = log.snapshot();
    assert_eq!(stored.len(), 800);
    assert_eq!(observed, stored);
    assert!(stored
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}
