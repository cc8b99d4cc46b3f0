//! Application events & the queue that carries them to the background loop.
//!
//! Application threads are producers only. They build an [`ApplicationEvent`],
//! submit it, and may block on the returned [`CompletionHandle`] with a
//! deadline. The background loop is the single consumer; it drains the queue
//! every tick and hands each event to the processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::metadata::ClusterSnapshot;
use crate::protocol::{PartitionOffsets, Record};

/// Create a linked completer/handle pair.
///
/// The completer side is consumed on resolution, so resolving twice is not
/// expressible; the handle side observes exactly one result or, if the
/// runtime tears down without resolving, a shutdown error.
pub fn completion<T: Send>() -> (Completer<T>, CompletionHandle<T>) {
    let (tx, rx) = sync_channel(1);
    (Completer { tx }, CompletionHandle { rx })
}

/// Write half of a completion pair, held by the runtime.
#[derive(Debug)]
pub struct Completer<T: Send> {
    tx: SyncSender<Result<T>>,
}

impl<T: Send> Completer<T> {
    /// Resolve the waiting handle. Consumes the completer.
    pub fn complete(self, result: Result<T>) {
        // The waiter may have abandoned the handle after its own deadline;
        // a full or disconnected channel is not an error here.
        let _ = self.tx.try_send(result);
    }
}

/// Read half of a completion pair, held by the submitting thread.
#[derive(Debug)]
pub struct CompletionHandle<T: Send> {
    rx: Receiver<Result<T>>,
}

impl<T: Send> CompletionHandle<T> {
    /// Block until the runtime resolves the event, up to `timeout`.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::RequestTimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(Error::RuntimeClosed),
        }
    }

    /// Block until the runtime resolves the event, up to the absolute
    /// deadline.
    pub fn wait_deadline(self, deadline: Instant) -> Result<T> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.wait(timeout)
    }
}

/// Commands an application thread can submit to the runtime.
///
/// Each variant owns its parameters (copy-on-submit) and, where the
/// operation has a result, the completer that resolves the submitting
/// thread's handle. Consumed exactly once by the processor.
#[derive(Debug)]
pub enum ApplicationEvent {
    /// Commit the given offsets for the group.
    Commit {
        offsets: PartitionOffsets,
        completion: Option<Completer<()>>,
    },
    /// Flush outstanding commits ahead of shutdown and stop the commit
    /// manager from scheduling new ones.
    CommitOnClose,
    /// Ask the heartbeat manager to emit a heartbeat on its next poll.
    HeartbeatNow,
    /// Leave the consumer group.
    LeaveGroup {
        completion: Option<Completer<()>>,
    },
    /// Resolve offsets for the given (topic, partition, timestamp) triples
    /// and move fetch positions there.
    ResetPositions {
        partitions: Vec<(String, i32, i64)>,
        completion: Option<Completer<PartitionOffsets>>,
    },
    /// Drain currently buffered records and free their partitions for the
    /// next fetch.
    FetchNow {
        completion: Completer<Vec<Record>>,
    },
    /// Refresh topic metadata and return a snapshot of the new view.
    MetadataRefresh {
        topics: Vec<String>,
        completion: Option<Completer<ClusterSnapshot>>,
    },
    /// Begin the two-phase shutdown sequence.
    Shutdown {
        completion: Option<Completer<()>>,
    },
}

impl ApplicationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ApplicationEvent::Commit { .. } => "commit",
            ApplicationEvent::CommitOnClose => "commit-on-close",
            ApplicationEvent::HeartbeatNow => "heartbeat-now",
            ApplicationEvent::LeaveGroup { .. } => "leave-group",
            ApplicationEvent::ResetPositions { .. } => "reset-positions",
            ApplicationEvent::FetchNow { .. } => "fetch-now",
            ApplicationEvent::MetadataRefresh { .. } => "metadata-refresh",
            ApplicationEvent::Shutdown { .. } => "shutdown",
        }
    }

    /// Events that are still accepted once shutdown has begun.
    pub fn is_close_related(&self) -> bool {
        matches!(
            self,
            ApplicationEvent::CommitOnClose
                | ApplicationEvent::LeaveGroup { .. }
                | ApplicationEvent::Shutdown { .. }
        )
    }

    /// Resolve the event's completion handle, if any, with an error.
    pub fn fail(self, error: Error) {
        match self {
            ApplicationEvent::Commit {
                completion: Some(completion),
                ..
            } => completion.complete(Err(error)),
            ApplicationEvent::LeaveGroup {
                completion: Some(completion),
            } => completion.complete(Err(error)),
            ApplicationEvent::ResetPositions {
                completion: Some(completion),
                ..
            } => completion.complete(Err(error)),
            ApplicationEvent::FetchNow { completion } => completion.complete(Err(error)),
            ApplicationEvent::MetadataRefresh {
                completion: Some(completion),
                ..
            } => completion.complete(Err(error)),
            ApplicationEvent::Shutdown {
                completion: Some(completion),
            } => completion.complete(Err(error)),
            _ => {}
        }
    }
}

/// Multi-producer, single-consumer inbox between application threads and the
/// background loop.
///
/// Submission order is preserved per producer. There is no bound: callers
/// that need backpressure block on their own completion handles.
#[derive(Clone, Debug)]
pub struct EventQueue {
    tx: UnboundedSender<ApplicationEvent>,
    wakeup: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl EventQueue {
    pub(crate) fn channel() -> (EventQueue, UnboundedReceiver<ApplicationEvent>) {
        let (tx, rx) = unbounded_channel();
        let queue = EventQueue {
            tx,
            wakeup: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (queue, rx)
    }

    /// Enqueue an event without blocking.
    ///
    /// Once shutdown has begun, non-close events fail fast with
    /// [`Error::RuntimeClosed`] instead of silently queueing; their
    /// completion handles are resolved with the same error.
    pub fn submit(&self, event: ApplicationEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) && !event.is_close_related() {
            tracing::debug!("Rejecting {} event, runtime is closing", event.name());
            event.fail(Error::RuntimeClosed);
            return Err(Error::RuntimeClosed);
        }
        match self.tx.send(event) {
            Ok(()) => {
                // Cut the loop's bounded I/O wait short so the event is
                // observed promptly.
                self.wakeup.notify_one();
                Ok(())
            }
            Err(send_error) => {
                send_error.0.fail(Error::RuntimeClosed);
                Err(Error::RuntimeClosed)
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn wakeup_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }
}
