//! The single-threaded background loop.
//!
//! One task owns every piece of runtime state: the managers, the shared
//! metadata view, and the network delegate. Each tick drains the application
//! event queue, polls the managers for requests, runs one bounded network
//! cycle, and routes completed responses back. Nothing here is shared with
//! application threads except the queue and the completion handles, so no
//! state needs a lock.
//!
//! Shutdown is a distinct phase: the queue stops accepting new work, the
//! commit flush and the group leave go out, and the loop keeps ticking on a
//! restricted poll until both have resolved or the close budget lapses. A
//! fatal protocol error forces the same phase, with the error carried to
//! anything still waiting.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::RuntimeConfig;
use crate::delegate::NetworkClientDelegate;
use crate::error::Error;
use crate::events::{ApplicationEvent, Completer, EventQueue};
use crate::managers::{RequestManagers, Signal};
use crate::metadata::ClusterMetadata;
use crate::processor;
use crate::protocol::Broker;
use crate::transport::{BrokerAddress, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopState {
    Starting,
    Running,
    Closing,
    Closed,
}

pub(crate) struct BackgroundEventLoop<T: Transport> {
    config: RuntimeConfig,
    state: LoopState,
    queue: EventQueue,
    rx: UnboundedReceiver<ApplicationEvent>,
    managers: RequestManagers,
    delegate: NetworkClientDelegate<T>,
    metadata: ClusterMetadata,
    close_deadline: Option<Instant>,
    shutdown_completions: Vec<Completer<()>>,
    fatal: Option<Error>,
}

impl<T: Transport> BackgroundEventLoop<T> {
    pub fn new(
        config: RuntimeConfig,
        transport: T,
        queue: EventQueue,
        rx: UnboundedReceiver<ApplicationEvent>,
    ) -> Self {
        let mut delegate = NetworkClientDelegate::new(
            transport,
            queue.wakeup_handle(),
            config.max_in_flight_per_node,
            config.retry_backoff,
            config.retry_backoff_max,
        );
        // Bootstrap nodes carry placeholder negative ids until a metadata
        // response names the real brokers.
        for (index, addr) in config.bootstrap.iter().enumerate() {
            delegate.register_node(-(index as i32) - 1, addr.clone());
        }
        let managers = RequestManagers::new(&config);
        let metadata = ClusterMetadata::new(config.metadata_ttl);
        Self {
            config,
            state: LoopState::Starting,
            queue,
            rx,
            managers,
            delegate,
            metadata,
            close_deadline: None,
            shutdown_completions: vec![],
            fatal: None,
        }
    }

    /// Run until shutdown completes. This is the loop thread's whole life.
    pub async fn run(&mut self) {
        tracing::debug!("Background loop running");
        self.state = LoopState::Running;
        while self.state != LoopState::Closed {
            self.run_once(Instant::now()).await;
        }
        self.finish_close();
        tracing::debug!("Background loop stopped");
    }

    /// One tick: drain events, poll managers, one bounded network cycle,
    /// route responses, apply signals.
    async fn run_once(&mut self, now: Instant) {
        self.drain_events(now);

        let (delay, requests) = match self.state {
            LoopState::Running => self.managers.poll_all(now, &self.metadata),
            LoopState::Closing => self.managers.poll_all_on_shutdown(now, &self.metadata),
            LoopState::Starting | LoopState::Closed => return,
        };
        for request in requests {
            self.delegate.send(request);
        }

        if self.state == LoopState::Closing && self.close_finished(now) {
            self.state = LoopState::Closed;
            return;
        }

        let mut timeout = delay.min(self.config.max_idle_sleep);
        if let Some(deadline) = self.close_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        let completed = self.delegate.poll(timeout, now).await;
        for response in completed {
            let signals = self.managers.route(response, now, &self.metadata);
            for signal in signals {
                self.apply_signal(signal, now);
            }
        }
    }

    fn drain_events(&mut self, now: Instant) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                ApplicationEvent::Shutdown { completion } => self.enter_closing(completion, now),
                event if self.state == LoopState::Closing && !event.is_close_related() => {
                    // Queued before the close flag was visible to its
                    // producer; too late to honor.
                    event.fail(self.close_error());
                }
                event => processor::process(
                    event,
                    &mut self.managers,
                    &mut self.delegate,
                    &self.metadata,
                    now,
                ),
            }
        }
    }

    /// Begin the two-phase shutdown: stop intake, flush commits, leave the
    /// group, and bound the rest with the close budget.
    fn enter_closing(&mut self, completion: Option<Completer<()>>, now: Instant) {
        if let Some(completion) = completion {
            self.shutdown_completions.push(completion);
        }
        if self.state == LoopState::Closing {
            return;
        }
        tracing::debug!("Shutdown requested, entering close phase");
        self.state = LoopState::Closing;
        self.queue.mark_closed();
        self.close_deadline = Some(now + self.config.close_budget);

        processor::process(
            ApplicationEvent::CommitOnClose,
            &mut self.managers,
            &mut self.delegate,
            &self.metadata,
            now,
        );
        if let Some(heartbeat) = self.managers.heartbeat.as_mut() {
            heartbeat.request_leave(None);
        }
    }

    /// The error undrained events are failed with: the fatal condition that
    /// forced the close when there is one, a plain shutdown error otherwise.
    fn close_error(&self) -> Error {
        self.fatal.clone().unwrap_or(Error::RuntimeClosed)
    }

    /// Close is done when the flush and the leave have both resolved, or the
    /// budget has lapsed.
    fn close_finished(&self, now: Instant) -> bool {
        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                tracing::warn!("Close budget lapsed with work outstanding");
                return true;
            }
        }
        let still_leaving = self
            .managers
            .heartbeat
            .as_ref()
            .map(|h| !h.has_left())
            .unwrap_or(false);
        let still_committing = self
            .managers
            .commit
            .as_ref()
            .map(|c| c.has_outstanding())
            .unwrap_or(false);
        !still_leaving && !still_committing && !self.delegate.has_pending()
    }

    /// Terminal cleanup: nothing submitted from here on can succeed.
    fn finish_close(&mut self) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                ApplicationEvent::Shutdown { completion } => {
                    if let Some(completion) = completion {
                        self.shutdown_completions.push(completion);
                    }
                }
                event => event.fail(self.close_error()),
            }
        }
        self.delegate.close();
        for completion in self.shutdown_completions.drain(..) {
            completion.complete(Ok(()));
        }
    }

    fn apply_signal(&mut self, signal: Signal, now: Instant) {
        match signal {
            Signal::CoordinatorFound {
                node_id,
                host,
                port,
            } => {
                self.delegate.register_node(
                    node_id,
                    BrokerAddress {
                        host: host.clone(),
                        port,
                    },
                );
                self.metadata.upsert_broker(Broker {
                    node_id,
                    host,
                    port,
                });
                self.metadata.set_coordinator(node_id);
            }
            Signal::CoordinatorUnknown => self.metadata.clear_coordinator(),
            Signal::MetadataUpdated { brokers, topics } => {
                for broker in &brokers {
                    self.delegate.register_node(
                        broker.node_id,
                        BrokerAddress {
                            host: broker.host.clone(),
                            port: broker.port,
                        },
                    );
                }
                self.metadata.update(brokers, topics, now);
            }
            Signal::MetadataStale => self.metadata.request_refresh(),
            Signal::MembershipUpdated {
                member_id,
                member_epoch,
            } => {
                if let Some(commit) = self.managers.commit.as_mut() {
                    commit.set_membership(member_id, member_epoch);
                }
            }
            Signal::AssignmentChanged(assignment) => {
                let added = self.managers.fetch.set_assignment(&assignment);
                self.reset_by_strategy(added);
            }
            Signal::PositionsNeeded(partitions) => self.reset_by_strategy(partitions),
            Signal::PositionsReset(offsets) => self.managers.fetch.set_positions(&offsets),
            Signal::Fatal(error) => {
                tracing::error!("Runtime entered a fatal state, shutting down: {}", error);
                if self.fatal.is_none() {
                    self.fatal = Some(error);
                }
                if self.state == LoopState::Running {
                    self.enter_closing(None, now);
                }
            }
        }
    }

    /// Resolve positions for partitions that have none, using the configured
    /// reset strategy.
    fn reset_by_strategy(&mut self, partitions: Vec<(String, i32)>) {
        if partitions.is_empty() {
            return;
        }
        let timestamp = self.managers.fetch.reset_timestamp();
        let triples = partitions
            .into_iter()
            .map(|(topic, partition)| (topic, partition, timestamp))
            .collect();
        self.managers.offsets.request_reset(triples, None);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::OffsetResetStrategy;
    use crate::error::KafkaCode;
    use crate::events::completion;
    use crate::protocol::{
        FetchedPartition, Partition, PartitionOffsets, Record, RequestBody, ResponseBody, Topic,
        LEAVE_EPOCH,
    };
    use crate::transport::mock::InMemoryTransport;
    use crate::transport::WireRequest;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            group_id: Some(String::from("the-data-boyz")),
            bootstrap: vec![BrokerAddress {
                host: String::from("localhost"),
                port: 9092,
            }],
            topics: vec![String::from("purchases")],
            auto_commit_interval: None,
            auto_offset_reset: OffsetResetStrategy::Earliest,
            max_idle_sleep: Duration::from_millis(1),
            close_budget: Duration::from_secs(5),
            ..RuntimeConfig::default()
        }
    }

    /// A one-broker, one-topic cluster that joins members immediately and
    /// serves three records from offset zero.
    fn scripted_broker(commits: Arc<Mutex<Vec<RequestBody>>>) -> InMemoryTransport {
        let epoch = Arc::new(AtomicI64::new(0));
        InMemoryTransport::new(move |_, request: &WireRequest| {
            Some(match &request.body {
                RequestBody::FindCoordinator { .. } => ResponseBody::FindCoordinator {
                    error_code: KafkaCode::None,
                    node_id: 1,
                    host: String::from("localhost"),
                    port: 9092,
                },
                RequestBody::Heartbeat { member_epoch, .. } => {
                    if *member_epoch == LEAVE_EPOCH {
                        ResponseBody::Heartbeat {
                            error_code: KafkaCode::None,
                            member_id: String::from("member-1"),
                            member_epoch: LEAVE_EPOCH,
                            heartbeat_interval_ms: 3000,
                            assignment: None,
                        }
                    } else {
                        let first = epoch.fetch_add(1, Ordering::SeqCst) == 0;
                        ResponseBody::Heartbeat {
                            error_code: KafkaCode::None,
                            member_id: String::from("member-1"),
                            member_epoch: 1,
                            heartbeat_interval_ms: 3000,
                            assignment: first.then(|| {
                                crate::protocol::TopicPartitions::from([(
                                    String::from("purchases"),
                                    vec![0],
                                )])
                            }),
                        }
                    }
                }
                RequestBody::OffsetCommit { .. } => {
                    commits.lock().unwrap().push(request.body.clone());
                    ResponseBody::OffsetCommit {
                        error_code: KafkaCode::None,
                    }
                }
                RequestBody::ListOffsets { partitions } => ResponseBody::ListOffsets {
                    error_code: KafkaCode::None,
                    offsets: partitions.iter().map(|(t, p, _)| (t.clone(), *p, 0)).collect(),
                },
                RequestBody::Metadata { .. } => ResponseBody::Metadata {
                    error_code: KafkaCode::None,
                    brokers: vec![Broker {
                        node_id: 1,
                        host: String::from("localhost"),
                        port: 9092,
                    }],
                    topics: vec![Topic {
                        name: String::from("purchases"),
                        partitions: vec![Partition {
                            partition_index: 0,
                            leader_id: 1,
                        }],
                    }],
                },
                RequestBody::Fetch { partitions, .. } => ResponseBody::Fetch {
                    error_code: KafkaCode::None,
                    partitions: partitions
                        .iter()
                        .map(|slot| FetchedPartition {
                            topic: slot.topic.clone(),
                            partition: slot.partition,
                            error_code: KafkaCode::None,
                            high_watermark: 3,
                            records: (slot.offset..3)
                                .map(|offset| Record {
                                    topic: slot.topic.clone(),
                                    partition: slot.partition,
                                    offset,
                                    timestamp: 0,
                                    key: Bytes::new(),
                                    value: Bytes::from_static(b"v"),
                                })
                                .collect(),
                        })
                        .collect(),
                },
            })
        })
    }

    fn event_loop(
        config: RuntimeConfig,
        transport: InMemoryTransport,
    ) -> (BackgroundEventLoop<InMemoryTransport>, EventQueue) {
        let (queue, rx) = EventQueue::channel();
        let event_loop = BackgroundEventLoop::new(config, transport, queue.clone(), rx);
        (event_loop, queue)
    }

    async fn tick(event_loop: &mut BackgroundEventLoop<InMemoryTransport>, times: usize) {
        for _ in 0..times {
            event_loop.run_once(Instant::now()).await;
        }
    }

    #[tokio::test]
    async fn startup_joins_the_group_and_fetches_records() {
        let commits = Arc::new(Mutex::new(vec![]));
        let (mut event_loop, queue) = event_loop(test_config(), scripted_broker(commits));
        event_loop.state = LoopState::Running;

        // Bootstrap, coordinator discovery, join, reconcile, offset reset,
        // and the first fetch all happen over a handful of ticks.
        tick(&mut event_loop, 15).await;

        let (completer, handle) = completion();
        queue
            .submit(ApplicationEvent::FetchNow {
                completion: completer,
            })
            .unwrap();
        tick(&mut event_loop, 2).await;

        let records = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 0);
        assert_eq!(event_loop.metadata.coordinator(), Some(1));
    }

    #[tokio::test]
    async fn shutdown_flushes_commits_and_leaves_the_group() {
        let commits = Arc::new(Mutex::new(vec![]));
        let (mut event_loop, queue) =
            event_loop(test_config(), scripted_broker(Arc::clone(&commits)));
        event_loop.state = LoopState::Running;
        tick(&mut event_loop, 15).await;

        queue
            .submit(ApplicationEvent::Commit {
                offsets: PartitionOffsets::from([((String::from("purchases"), 0), 3)]),
                completion: None,
            })
            .unwrap();
        let (completer, handle) = completion();
        queue
            .submit(ApplicationEvent::Shutdown {
                completion: Some(completer),
            })
            .unwrap();

        tick(&mut event_loop, 10).await;
        assert_eq!(event_loop.state, LoopState::Closed);
        event_loop.finish_close();
        assert_eq!(handle.wait(Duration::from_millis(100)), Ok(()));

        // The pending commit went out as part of the flush, with the member
        // epoch it was granted.
        let commits = commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        match &commits[0] {
            RequestBody::OffsetCommit {
                member_epoch,
                offsets,
                ..
            } => {
                assert_eq!(*member_epoch, 1);
                assert_eq!(offsets.get(&(String::from("purchases"), 0)), Some(&3));
            }
            other => panic!("unexpected request {:?}", other),
        }

        // And the group heard the leave.
        let left = event_loop
            .delegate
            .transport()
            .sent
            .iter()
            .any(|(_, request)| {
                matches!(
                    &request.body,
                    RequestBody::Heartbeat { member_epoch, .. } if *member_epoch == LEAVE_EPOCH
                )
            });
        assert!(left);
    }

    #[tokio::test]
    async fn events_after_shutdown_fail_fast() {
        let commits = Arc::new(Mutex::new(vec![]));
        let (mut event_loop, queue) = event_loop(test_config(), scripted_broker(commits));
        event_loop.state = LoopState::Running;
        tick(&mut event_loop, 15).await;

        queue
            .submit(ApplicationEvent::Shutdown { completion: None })
            .unwrap();
        tick(&mut event_loop, 1).await;

        let (completer, handle) = completion();
        let result = queue.submit(ApplicationEvent::FetchNow {
            completion: completer,
        });
        assert_eq!(result, Err(Error::RuntimeClosed));
        assert_eq!(
            handle.wait(Duration::from_millis(10)),
            Err(Error::RuntimeClosed)
        );
    }

    #[tokio::test]
    async fn fatal_error_closes_the_loop_instead_of_retrying() {
        // The cluster refuses the group outright; everything else is normal.
        let transport = InMemoryTransport::new(|_, request: &WireRequest| {
            Some(match &request.body {
                RequestBody::FindCoordinator { .. } => ResponseBody::FindCoordinator {
                    error_code: KafkaCode::GroupAuthorizationFailed,
                    node_id: -1,
                    host: String::new(),
                    port: 0,
                },
                RequestBody::Metadata { .. } => ResponseBody::Metadata {
                    error_code: KafkaCode::None,
                    brokers: vec![],
                    topics: vec![],
                },
                _ => return None,
            })
        });
        let (mut event_loop, queue) = event_loop(test_config(), transport);
        event_loop.state = LoopState::Running;

        let (completer, commit_handle) = completion();
        queue
            .submit(ApplicationEvent::Commit {
                offsets: PartitionOffsets::from([((String::from("purchases"), 0), 1)]),
                completion: Some(completer),
            })
            .unwrap();

        tick(&mut event_loop, 12).await;

        // One lookup, not one per tick, and the loop winds itself down.
        let lookups = event_loop
            .delegate
            .transport()
            .sent
            .iter()
            .filter(|(_, request)| {
                matches!(&request.body, RequestBody::FindCoordinator { .. })
            })
            .count();
        assert_eq!(lookups, 1);
        assert_eq!(event_loop.state, LoopState::Closed);
        event_loop.finish_close();

        // The pending commit resolved with an error instead of hanging, and
        // new work is rejected.
        assert!(commit_handle.wait(Duration::from_millis(100)).is_err());
        let (completer, _handle) = completion();
        let result = queue.submit(ApplicationEvent::FetchNow {
            completion: completer,
        });
        assert_eq!(result, Err(Error::RuntimeClosed));
    }

    #[tokio::test]
    async fn close_budget_bounds_an_unresponsive_shutdown() {
        let config = RuntimeConfig {
            close_budget: Duration::from_millis(20),
            ..test_config()
        };
        let (mut event_loop, queue) = event_loop(config, InMemoryTransport::unresponsive());
        event_loop.state = LoopState::Running;
        tick(&mut event_loop, 3).await;

        let (completer, handle) = completion();
        queue
            .submit(ApplicationEvent::Shutdown {
                completion: Some(completer),
            })
            .unwrap();
        // The broker never answers the leave; the budget ends the phase.
        tick(&mut event_loop, 50).await;
        assert_eq!(event_loop.state, LoopState::Closed);
        event_loop.finish_close();
        assert_eq!(handle.wait(Duration::from_millis(100)), Ok(()));
    }
}
