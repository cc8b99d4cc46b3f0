//! The application-facing runtime handle.
//!
//! [`RuntimeBuilder`] spawns the background loop on its own OS thread with a
//! current-thread async runtime, so the loop's single-threaded ownership
//! model holds by construction. The returned [`ConsumerRuntime`] is the
//! synchronous surface: every method builds an event, submits it, and blocks
//! on the completion handle with a deadline. The handle itself holds no
//! protocol state and is cheap to share behind a reference.

use std::thread::JoinHandle;
use std::time::Duration;

use crate::background::BackgroundEventLoop;
use crate::config::{FetchParams, OffsetResetStrategy, RuntimeConfig};
use crate::error::{Error, Result};
use crate::events::{completion, ApplicationEvent, EventQueue};
use crate::metadata::ClusterSnapshot;
use crate::protocol::{PartitionOffsets, Record};
use crate::transport::{BrokerAddress, Transport};

pub struct ConsumerRuntime {
    queue: EventQueue,
    default_timeout: Duration,
    close_budget: Duration,
    thread: Option<JoinHandle<()>>,
}

impl ConsumerRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Commit offsets and wait for the broker to acknowledge.
    pub fn commit(&self, offsets: PartitionOffsets) -> Result<()> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::Commit {
            offsets,
            completion: Some(completer),
        })?;
        handle.wait(self.default_timeout)
    }

    /// Commit offsets without waiting; failures are not reported.
    pub fn commit_async(&self, offsets: PartitionOffsets) -> Result<()> {
        self.queue.submit(ApplicationEvent::Commit {
            offsets,
            completion: None,
        })
    }

    /// Take whatever records have been fetched since the last call. Returns
    /// an empty batch when nothing is buffered yet.
    pub fn fetch(&self) -> Result<Vec<Record>> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::FetchNow {
            completion: completer,
        })?;
        handle.wait(self.default_timeout)
    }

    /// Resolve offsets for the given (topic, partition, timestamp) triples
    /// and move the fetch positions there.
    pub fn reset_positions(
        &self,
        partitions: Vec<(String, i32, i64)>,
    ) -> Result<PartitionOffsets> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::ResetPositions {
            partitions,
            completion: Some(completer),
        })?;
        handle.wait(self.default_timeout)
    }

    /// Force a metadata refresh and return the fresh view.
    pub fn refresh_metadata(&self, topics: Vec<String>) -> Result<ClusterSnapshot> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::MetadataRefresh {
            topics,
            completion: Some(completer),
        })?;
        handle.wait(self.default_timeout)
    }

    /// Ask for a heartbeat ahead of the interval.
    pub fn heartbeat_now(&self) -> Result<()> {
        self.queue.submit(ApplicationEvent::HeartbeatNow)
    }

    /// Leave the consumer group without shutting the runtime down.
    pub fn leave_group(&self) -> Result<()> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::LeaveGroup {
            completion: Some(completer),
        })?;
        handle.wait(self.default_timeout)
    }

    pub(crate) fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Synchronous cluster-state view backed by this runtime.
    pub fn cluster_state(&self, timeout: Duration) -> crate::facade::ClusterStateFacade {
        crate::facade::ClusterStateFacade::new(self.queue.clone(), timeout)
    }

    /// Shut down: flush commits, leave the group, stop the loop thread.
    /// Idempotent; later calls return once the thread is gone.
    pub fn shutdown(&mut self) -> Result<()> {
        let (completer, handle) = completion();
        let submitted = self.queue.submit(ApplicationEvent::Shutdown {
            completion: Some(completer),
        });
        let result = match submitted {
            // Give the close phase its full budget plus the usual slack for
            // the final network round trips.
            Ok(()) => handle.wait(self.close_budget + self.default_timeout),
            // The loop is already gone; nothing left to wait for.
            Err(Error::RuntimeClosed) => Ok(()),
            Err(error) => Err(error),
        };
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Background loop thread panicked");
            }
        }
        result
    }
}

impl Drop for ConsumerRuntime {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.shutdown();
        }
    }
}

/// Configures and spawns a [`ConsumerRuntime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn client_id(mut self, client_id: &str) -> Self {
        self.config.client_id = client_id.to_owned();
        self
    }

    /// Enable group mode.
    pub fn group(mut self, group_id: &str) -> Self {
        self.config.group_id = Some(group_id.to_owned());
        self
    }

    pub fn bootstrap(mut self, addrs: Vec<BrokerAddress>) -> Self {
        self.config.bootstrap = addrs;
        self
    }

    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.config.topics = topics;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// `None` disables periodic auto-commit.
    pub fn auto_commit_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.auto_commit_interval = interval;
        self
    }

    pub fn auto_offset_reset(mut self, strategy: OffsetResetStrategy) -> Self {
        self.config.auto_offset_reset = strategy;
        self
    }

    pub fn fetch_params(mut self, params: FetchParams) -> Self {
        self.config.fetch = params;
        self
    }

    pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
        self.config.metadata_ttl = ttl;
        self
    }

    pub fn max_in_flight_per_node(mut self, max: usize) -> Self {
        self.config.max_in_flight_per_node = max;
        self
    }

    pub fn max_idle_sleep(mut self, sleep: Duration) -> Self {
        self.config.max_idle_sleep = sleep;
        self
    }

    pub fn close_budget(mut self, budget: Duration) -> Self {
        self.config.close_budget = budget;
        self
    }

    /// Spawn the background loop on a dedicated thread, driven by the given
    /// transport.
    pub fn spawn<T: Transport>(self, transport: T) -> Result<ConsumerRuntime> {
        let config = self.config;
        let (queue, rx) = EventQueue::channel();
        let mut event_loop =
            BackgroundEventLoop::new(config.clone(), transport, queue.clone(), rx);

        // The loop runs on a current-thread async runtime: one thread owns
        // all protocol state, cooperative suspension happens only inside the
        // delegate's bounded poll.
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::IoError(e.kind()))?;
        let thread = std::thread::Builder::new()
            .name(format!("{}-runtime", config.client_id))
            .spawn(move || tokio_runtime.block_on(event_loop.run()))
            .map_err(|e| Error::IoError(e.kind()))?;

        Ok(ConsumerRuntime {
            queue,
            default_timeout: config.request_timeout,
            close_budget: config.close_budget,
            thread: Some(thread),
        })
    }
}
