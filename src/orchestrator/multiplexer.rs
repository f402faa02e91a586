//! Output multiplexer: merges per-process output into the session log.
//!
//! Each attached process gets a reader task that frames stdout and stderr
//! into lines and pushes them onto that process's own unbounded queue.
//! Producers never wait on the consumer. A single drain step empties every
//! queue in registration order and appends the lines to the [`SessionLog`],
//! so lines from one process keep their order while lines from different
//! processes interleave by drain timing.
//!
//! When both pipes of a process reach end-of-stream its reader pushes
//! [`StreamItem::Closed`]. The drain step reports that as
//! [`SupervisorEvent::StreamClosed`], letting the session notice completion
//! without waiting for the next liveness tick.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::codec::OutputLineCodec;
use super::supervisor::{EventSender, SupervisorEvent};
use crate::models::log::{RecordLevel, SessionLog};

/// Item carried by a per-process queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// One line of output.
    Line {
        /// Line text.
        text: String,
        /// `Error` for read failures, `Info` otherwise.
        level: RecordLevel,
    },
    /// Both pipes reached end-of-stream.
    Closed,
}

/// Producer side of one per-process queue.
#[derive(Debug, Clone)]
pub struct StreamProducer {
    source: String,
    tx: mpsc::UnboundedSender<StreamItem>,
}

impl StreamProducer {
    /// Source tag of this queue.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Queue one output line.
    pub fn line(&self, text: impl Into<String>) {
        self.push(StreamItem::Line {
            text: text.into(),
            level: RecordLevel::Info,
        });
    }

    /// Queue a read-error line.
    pub fn error(&self, text: impl Into<String>) {
        self.push(StreamItem::Line {
            text: text.into(),
            level: RecordLevel::Error,
        });
    }

    /// Queue the closed marker.
    pub fn close(&self) {
        self.push(StreamItem::Closed);
    }

    fn push(&self, item: StreamItem) {
        if self.tx.send(item).is_err() {
            debug!(source = self.source, "multiplexer dropped; discarding output");
        }
    }
}

struct StreamQueue {
    source: String,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    closed: bool,
}

/// Merges every attached process's output into one ordered log.
pub struct OutputMultiplexer {
    queues: Mutex<Vec<StreamQueue>>,
    log: Arc<SessionLog>,
    events: EventSender,
    flush: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OutputMultiplexer {
    /// Create a multiplexer writing into `log` and reporting closures on `events`.
    #[must_use]
    pub fn new(log: Arc<SessionLog>, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Vec::new()),
            log,
            events,
            flush: Notify::new(),
        })
    }

    /// Create a new queue tagged `source` and return its producer.
    #[must_use]
    pub fn register(&self, source: &str) -> StreamProducer {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.queues).push(StreamQueue {
            source: source.to_owned(),
            rx,
            closed: false,
        });
        StreamProducer {
            source: source.to_owned(),
            tx,
        }
    }

    /// Register `source` and spawn a reader task over its two pipes.
    pub fn attach<O, E>(&self, source: &str, stdout: O, stderr: E) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let producer = self.register(source);
        let span = info_span!("output_reader", source);
        tokio::spawn(read_streams(producer, stdout, stderr).instrument(span))
    }

    /// Number of queues that have not delivered their closed marker.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        lock(&self.queues).iter().filter(|q| !q.closed).count()
    }

    /// Wake the drain loop immediately.
    pub fn flush(&self) {
        self.flush.notify_one();
    }

    /// Move everything currently queued into the log. Returns the line count.
    pub fn drain_once(&self) -> usize {
        let mut appended = 0;
        let mut closed_now = Vec::new();

        {
            let mut queues = lock(&self.queues);
            for queue in queues.iter_mut().filter(|q| !q.closed) {
                loop {
                    match queue.rx.try_recv() {
                        Ok(StreamItem::Line { text, level }) => {
                            self.log.append(&queue.source, level, text);
                            appended += 1;
                        }
                        Ok(StreamItem::Closed)
                        | Err(mpsc::error::TryRecvError::Disconnected) => {
                            queue.closed = true;
                            closed_now.push(queue.source.clone());
                            break;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                    }
                }
            }
        }

        for name in closed_now {
            debug!(source = name, "output stream closed");
            if self.events.send(SupervisorEvent::StreamClosed { name }).is_err() {
                debug!("session control loop gone before stream closure report");
            }
        }

        appended
    }

    /// Spawn the periodic drain task.
    ///
    /// Drains every `interval`, or at once after [`flush`](Self::flush),
    /// until `cancel` fires.
    #[must_use]
    pub fn spawn_drain(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            debug!("drain loop cancelled");
                            break;
                        }
                        _ = ticker.tick() => {}
                        () = this.flush.notified() => {}
                    }
                    this.drain_once();
                }
            }
            .instrument(info_span!("output_drain")),
        )
    }
}

/// Read both pipes line by line until each reaches end-of-stream.
///
/// A read error is queued as an error line and ends that pipe only.
async fn read_streams<O, E>(producer: StreamProducer, stdout: O, stderr: E)
where
    O: AsyncRead + Unpin + Send,
    E: AsyncRead + Unpin + Send,
{
    let mut out = FramedRead::new(stdout, OutputLineCodec::new());
    let mut err = FramedRead::new(stderr, OutputLineCodec::new());
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            item = out.next(), if out_open => {
                out_open = forward(&producer, item, "stdout");
            }
            item = err.next(), if err_open => {
                err_open = forward(&producer, item, "stderr");
            }
        }
    }

    producer.close();
}

/// Queue one framed item. Returns whether the pipe is still open.
fn forward(
    producer: &StreamProducer,
    item: Option<Result<String, crate::AppError>>,
    pipe: &str,
) -> bool {
    match item {
        Some(Ok(line)) => {
            producer.line(line);
            true
        }
        Some(Err(e)) => {
            warn!(source = producer.source(), pipe, error = %e, "output read failed");
            producer.error(format!("Error reading output: {e}"));
            false
        }
        None => false,
    }
}
