//! Session log records and observer notifications.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::session::SessionState;

/// Source tag for records produced by the orchestrator itself.
pub const SESSION_SOURCE: &str = "session";

/// Severity of a log record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordLevel {
    /// Process output or routine status.
    Info,
    /// Recoverable problem.
    Warn,
    /// Failure cause or stream error.
    Error,
}

/// One timestamped, source-tagged line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LogRecord {
    /// Time the record reached the log.
    pub timestamp: DateTime<Utc>,
    /// `session` or the process display name.
    pub source: String,
    /// Severity.
    pub level: RecordLevel,
    /// Line text without trailing newline.
    pub text: String,
}

/// Notification delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A record was appended to the session log.
    Record(LogRecord),
    /// The session moved between lifecycle states.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
}

/// Sender half handed to a session by whoever displays it.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Append-only, ordered session log.
///
/// Records are kept for the session's lifetime and mirrored to the
/// optional observer channel as they arrive.
#[derive(Debug, Default)]
pub struct SessionLog {
    records: Mutex<Vec<LogRecord>>,
    observer: Option<EventSender>,
}

impl SessionLog {
    /// Create a log that forwards to `observer` when present.
    #[must_use]
    pub fn new(observer: Option<EventSender>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            observer,
        }
    }

    /// Append a record.
    ///
    /// Stamping, storing and forwarding happen under one lock, so the
    /// observer sees records in log order with non-decreasing timestamps.
    pub fn append(&self, source: &str, level: RecordLevel, text: impl Into<String>) {
        let text = text.into();
        debug!(source, text = %text, "session log");

        let mut records = self.lock_records();
        let record = LogRecord {
            timestamp: Utc::now(),
            source: source.to_owned(),
            level,
            text,
        };
        records.push(record.clone());
        self.forward(SessionEvent::Record(record));
    }

    /// Append an `Info` record from the orchestrator.
    pub fn info(&self, text: impl Into<String>) {
        self.append(SESSION_SOURCE, RecordLevel::Info, text);
    }

    /// Append a `Warn` record from the orchestrator.
    pub fn warn(&self, text: impl Into<String>) {
        self.append(SESSION_SOURCE, RecordLevel::Warn, text);
    }

    /// Append an `Error` record from the orchestrator.
    pub fn error(&self, text: impl Into<String>) {
        self.append(SESSION_SOURCE, RecordLevel::Error, text);
    }

    /// Forward an event to the observer, if it is still listening.
    ///
    /// Ordered with respect to appended records.
    pub fn notify(&self, event: SessionEvent) {
        let _records = self.lock_records();
        self.forward(event);
    }

    fn forward(&self, event: SessionEvent) {
        if let Some(tx) = &self.observer {
            if tx.send(event).is_err() {
                warn!("session observer dropped; events are only kept in the log");
            }
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<LogRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of every record so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.lock_records().clone()
    }

    /// Texts of the records tagged with `source`, in log order.
    #[must_use]
    pub fn lines_from(&self, source: &str) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.source == source)
            .map(|r| r.text)
            .collect()
    }

    /// Whether any record contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.snapshot().iter().any(|r| r.text.contains(needle))
    }
}
