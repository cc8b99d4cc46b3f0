//! Offset resolution via ListOffsets.
//!
//! Positions are resolved in jobs: one job per reset request, covering a set
//! of (topic, partition, timestamp) triples. A job fans out one request per
//! partition leader, collects the resolved offsets, and completes when every
//! partition has answered. Resolved offsets are also surfaced as
//! [`Signal::PositionsReset`] so fetch positions move regardless of who asked.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::{Error, KafkaCode};
use crate::events::Completer;
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::ClusterMetadata;
use crate::protocol::{PartitionOffsets, RequestBody, ResponseBody, TopicPartitions};

struct ResetJob {
    /// Triples not yet on the wire, keyed for leader grouping.
    unsent: Vec<(String, i32, i64)>,
    /// Tag of each in-flight request, with the triples it carries.
    outstanding: HashMap<u64, Vec<(String, i32, i64)>>,
    resolved: PartitionOffsets,
    completion: Option<Completer<PartitionOffsets>>,
}

impl ResetJob {
    fn is_done(&self) -> bool {
        self.unsent.is_empty() && self.outstanding.is_empty()
    }
}

pub(crate) struct OffsetsManager {
    request_timeout: Duration,
    retry_backoff: Duration,
    jobs: Vec<ResetJob>,
    next_tag: u64,
}

impl OffsetsManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            jobs: vec![],
            next_tag: 0,
        }
    }

    /// Start resolving offsets for the given triples. The completion, when
    /// present, resolves once every partition in the job has an offset.
    pub fn request_reset(
        &mut self,
        partitions: Vec<(String, i32, i64)>,
        completion: Option<Completer<PartitionOffsets>>,
    ) {
        if partitions.is_empty() {
            if let Some(completion) = completion {
                completion.complete(Ok(PartitionOffsets::new()));
            }
            return;
        }
        tracing::debug!("Resolving offsets for {} partitions", partitions.len());
        self.jobs.push(ResetJob {
            unsent: partitions,
            outstanding: HashMap::new(),
            resolved: PartitionOffsets::new(),
            completion,
        });
    }

    fn job_for_tag(&mut self, tag: u64) -> Option<usize> {
        self.jobs
            .iter()
            .position(|job| job.outstanding.contains_key(&tag))
    }

    fn finish_done_jobs(&mut self) {
        let mut index = 0;
        while index < self.jobs.len() {
            if self.jobs[index].is_done() {
                let job = self.jobs.remove(index);
                if let Some(completion) = job.completion {
                    completion.complete(Ok(job.resolved));
                }
            } else {
                index += 1;
            }
        }
    }
}

impl RequestManager for OffsetsManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Offsets
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        let mut requests = vec![];
        let mut any_leaderless = false;

        for job_index in 0..self.jobs.len() {
            let unsent = std::mem::take(&mut self.jobs[job_index].unsent);
            if unsent.is_empty() {
                continue;
            }

            let mut by_partition: HashMap<(String, i32), i64> = HashMap::new();
            let mut wanted: TopicPartitions = TopicPartitions::new();
            for (topic, partition, timestamp) in unsent {
                wanted.entry(topic.clone()).or_default().push(partition);
                by_partition.insert((topic, partition), timestamp);
            }

            let (by_leader, leaderless) = metadata.group_by_leader(&wanted);
            for (leader, topic_partitions) in by_leader {
                let mut partitions = vec![];
                for (topic, partition_ids) in topic_partitions {
                    for partition in partition_ids {
                        let timestamp = by_partition[&(topic.clone(), partition)];
                        partitions.push((topic.clone(), partition, timestamp));
                    }
                }
                let tag = self.next_tag;
                self.next_tag += 1;
                self.jobs[job_index]
                    .outstanding
                    .insert(tag, partitions.clone());
                requests.push(UnsentRequest {
                    target: NodeTarget::Node(leader),
                    body: RequestBody::ListOffsets { partitions },
                    origin: ManagerKind::Offsets,
                    tag,
                    deadline: now + self.request_timeout,
                });
            }

            // Leaderless partitions wait for fresher metadata.
            if !leaderless.is_empty() {
                any_leaderless = true;
                self.jobs[job_index].unsent = leaderless
                    .into_iter()
                    .map(|(topic, partition)| {
                        let timestamp = by_partition[&(topic.clone(), partition)];
                        (topic, partition, timestamp)
                    })
                    .collect();
            }
        }

        let timeout = if any_leaderless {
            self.retry_backoff
        } else {
            MAX_POLL_DELAY
        };
        PollResult::new(timeout, requests)
    }

    fn handle_response(
        &mut self,
        response: CompletedResponse,
        now: Instant,
        _metadata: &ClusterMetadata,
    ) -> Vec<Signal> {
        let _ = now;
        let job_index = match self.job_for_tag(response.tag) {
            Some(index) => index,
            None => return vec![],
        };
        let sent = self.jobs[job_index]
            .outstanding
            .remove(&response.tag)
            .unwrap_or_default();

        let mut signals = vec![];
        match response.result {
            Ok(ResponseBody::ListOffsets {
                error_code: KafkaCode::None,
                offsets,
            }) => {
                let mut reset = PartitionOffsets::new();
                for (topic, partition, offset) in offsets {
                    reset.insert((topic, partition), offset);
                }
                self.jobs[job_index].resolved.extend(reset.clone());
                signals.push(Signal::PositionsReset(reset));
            }
            Ok(body) => {
                let code = body.error_code();
                if code.is_retriable() {
                    tracing::debug!("Offset resolution failed with {:?}, retrying", code);
                    self.jobs[job_index].unsent.extend(sent);
                    if code == KafkaCode::NotLeaderForPartition {
                        signals.push(Signal::MetadataStale);
                    }
                } else {
                    let job = self.jobs.remove(job_index);
                    if let Some(completion) = job.completion {
                        completion.complete(Err(Error::KafkaError(code)));
                    }
                    return signals;
                }
            }
            Err(error) => {
                tracing::debug!("Offset resolution failed: {}, retrying", error);
                self.jobs[job_index].unsent.extend(sent);
                if matches!(error, Error::NotConnected(_)) {
                    signals.push(Signal::MetadataStale);
                }
            }
        }

        self.finish_done_jobs();
        signals
    }
}
