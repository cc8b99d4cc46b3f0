use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use samovar::prelude::protocol::*;
use samovar::prelude::{
    BrokerAddress, ConsumerRuntime, InMemoryTransport, KafkaCode, OffsetResetStrategy,
    RuntimeBuilder, WireRequest,
};

pub const TOPIC: &str = "purchases";

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A builder preconfigured for fast test iteration against the in-memory
/// cluster.
pub fn runtime_builder() -> RuntimeBuilder {
    ConsumerRuntime::builder()
        .bootstrap(vec![BrokerAddress {
            host: String::from("localhost"),
            port: 9092,
        }])
        .topics(vec![TOPIC.to_string()])
        .request_timeout(Duration::from_secs(2))
        .auto_offset_reset(OffsetResetStrategy::Earliest)
        .auto_commit_interval(None)
        .max_idle_sleep(Duration::from_millis(1))
        .close_budget(Duration::from_secs(2))
}

/// One scripted broker that acts as its own coordinator: members join on
/// their first heartbeat, get partition 0 of [`TOPIC`], and can fetch
/// `record_count` records from offset zero. Offset commits are acknowledged
/// and recorded in the returned log.
#[allow(dead_code)]
pub fn one_broker_cluster(
    record_count: i64,
) -> (InMemoryTransport, Arc<Mutex<Vec<RequestBody>>>) {
    let commits: Arc<Mutex<Vec<RequestBody>>> = Arc::new(Mutex::new(vec![]));
    let commit_log = Arc::clone(&commits);
    let heartbeats = Arc::new(AtomicI64::new(0));

    let transport = InMemoryTransport::new(move |_, request: &WireRequest| {
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
                    let first = heartbeats.fetch_add(1, Ordering::SeqCst) == 0;
                    ResponseBody::Heartbeat {
                        error_code: KafkaCode::None,
                        member_id: String::from("member-1"),
                        member_epoch: 1,
                        heartbeat_interval_ms: 3000,
                        assignment: first
                            .then(|| TopicPartitions::from([(TOPIC.to_string(), vec![0])])),
                    }
                }
            }
            RequestBody::OffsetCommit { .. } => {
                commit_log.lock().unwrap().push(request.body.clone());
                ResponseBody::OffsetCommit {
                    error_code: KafkaCode::None,
                }
            }
            RequestBody::ListOffsets { partitions } => ResponseBody::ListOffsets {
                error_code: KafkaCode::None,
                offsets: partitions
                    .iter()
                    .map(|(topic, partition, timestamp)| {
                        let offset = if *timestamp == EARLIEST_TIMESTAMP {
                            0
                        } else {
                            record_count
                        };
                        (topic.clone(), *partition, offset)
                    })
                    .collect(),
            },
            RequestBody::Metadata { .. } => ResponseBody::Metadata {
                error_code: KafkaCode::None,
                brokers: vec![Broker {
                    node_id: 1,
                    host: String::from("localhost"),
                    port: 9092,
                }],
                topics: vec![Topic {
                    name: TOPIC.to_string(),
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
                        high_watermark: record_count,
                        records: (slot.offset..record_count)
                            .map(|offset| Record {
                                topic: slot.topic.clone(),
                                partition: slot.partition,
                                offset,
                                timestamp: offset,
                                key: bytes::Bytes::new(),
                                value: bytes::Bytes::from(format!("record-{offset}")),
                            })
                            .collect(),
                    })
                    .collect(),
            },
        })
    });

    (transport, commits)
}

/// Fetch repeatedly until `count` records have arrived or the deadline
/// lapses.
#[allow(dead_code)]
pub fn fetch_until(runtime: &ConsumerRuntime, count: usize, timeout: Duration) -> Vec<Record> {
    let deadline = Instant::now() + timeout;
    let mut records = vec![];
    while records.len() < count && Instant::now() < deadline {
        records.extend(runtime.fetch().expect("runtime closed during fetch"));
        std::thread::sleep(Duration::from_millis(5));
    }
    records
}
