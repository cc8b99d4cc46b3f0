//! Record fetching with per-partition buffering and backpressure.
//!
//! Each assigned partition is a little state machine: it needs a position
//! before it is fetchable, it has at most one fetch in flight, and while it
//! holds buffered records it is not fetched again. Positions advance only
//! when the application drains the buffer, so an application that stops
//! draining stops the partition's network traffic too.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{OffsetResetStrategy, RuntimeConfig};
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::KafkaCode;
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::ClusterMetadata;
use crate::protocol::{
    FetchPartition, PartitionOffsets, Record, RequestBody, ResponseBody, TopicPartitions,
    EARLIEST_TIMESTAMP, LATEST_TIMESTAMP,
};

#[derive(Debug, Default)]
struct PartitionState {
    /// Next offset to fetch; `None` until resolved or reset.
    position: Option<i64>,
    buffered: Vec<Record>,
    in_flight: bool,
}

impl PartitionState {
    fn fetchable(&self) -> bool {
        self.position.is_some() && !self.in_flight && self.buffered.is_empty()
    }
}

pub(crate) struct FetchManager {
    params: crate::config::FetchParams,
    reset_strategy: OffsetResetStrategy,
    request_timeout: Duration,
    partitions: HashMap<(String, i32), PartitionState>,
    /// Partitions carried by each in-flight fetch, keyed by tag.
    outstanding: HashMap<u64, Vec<(String, i32)>>,
    next_tag: u64,
}

impl FetchManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            params: config.fetch.clone(),
            reset_strategy: config.auto_offset_reset,
            request_timeout: config.request_timeout,
            partitions: HashMap::new(),
            outstanding: HashMap::new(),
            next_tag: 0,
        }
    }

    /// Timestamp sentinel matching the configured reset strategy.
    pub fn reset_timestamp(&self) -> i64 {
        match self.reset_strategy {
            OffsetResetStrategy::Earliest => EARLIEST_TIMESTAMP,
            OffsetResetStrategy::Latest => LATEST_TIMESTAMP,
        }
    }

    /// Replace the owned partition set. Buffered records and positions of
    /// retained partitions survive; revoked partitions are dropped outright.
    /// Returns the newly added partitions, which need positions before they
    /// can fetch.
    pub fn set_assignment(&mut self, assignment: &TopicPartitions) -> Vec<(String, i32)> {
        let mut added = vec![];
        let mut retained: HashMap<(String, i32), PartitionState> = HashMap::new();
        for (topic, partition_ids) in assignment {
            for partition in partition_ids {
                let key = (topic.clone(), *partition);
                match self.partitions.remove(&key) {
                    Some(state) => {
                        retained.insert(key, state);
                    }
                    None => {
                        added.push(key.clone());
                        retained.insert(key, PartitionState::default());
                    }
                }
            }
        }
        let revoked = self.partitions.len();
        if revoked > 0 {
            tracing::debug!("Dropping {} revoked partitions", revoked);
        }
        self.partitions = retained;
        added
    }

    /// Move positions to freshly resolved offsets. Unknown partitions are
    /// ignored (the assignment may have changed while the reset ran).
    pub fn set_positions(&mut self, offsets: &PartitionOffsets) {
        for (key, offset) in offsets {
            if let Some(state) = self.partitions.get_mut(key) {
                state.position = Some(*offset);
                state.buffered.clear();
            }
        }
    }

    /// Partitions that currently have no position.
    pub fn partitions_needing_positions(&self) -> Vec<(String, i32)> {
        self.partitions
            .iter()
            .filter(|(_, state)| state.position.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Hand all buffered records to the application, freeing their
    /// partitions for the next fetch. Also returns the positions consumed up
    /// to, per partition, for commit bookkeeping.
    pub fn drain(&mut self) -> (Vec<Record>, PartitionOffsets) {
        let mut records = vec![];
        let mut positions = PartitionOffsets::new();
        for (key, state) in self.partitions.iter_mut() {
            if let Some(last) = state.buffered.last() {
                let next = last.offset + 1;
                state.position = Some(next);
                positions.insert(key.clone(), next);
                records.append(&mut state.buffered);
            }
        }
        records.sort_by(|a, b| {
            (&a.topic, a.partition, a.offset).cmp(&(&b.topic, b.partition, b.offset))
        });
        (records, positions)
    }
}

impl RequestManager for FetchManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Fetch
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        let mut wanted: TopicPartitions = TopicPartitions::new();
        for ((topic, partition), state) in self.partitions.iter() {
            if state.fetchable() {
                wanted.entry(topic.clone()).or_default().push(*partition);
            }
        }
        if wanted.is_empty() {
            return PollResult::empty(MAX_POLL_DELAY);
        }

        let (by_leader, leaderless) = metadata.group_by_leader(&wanted);
        let mut requests = vec![];
        for (leader, topic_partitions) in by_leader {
            let mut fetch_partitions = vec![];
            let mut keys = vec![];
            for (topic, partition_ids) in topic_partitions {
                for partition in partition_ids {
                    let key = (topic.clone(), partition);
                    let state = match self.partitions.get_mut(&key) {
                        Some(state) => state,
                        None => continue,
                    };
                    state.in_flight = true;
                    fetch_partitions.push(FetchPartition {
                        topic: topic.clone(),
                        partition,
                        offset: state.position.unwrap_or(0),
                        max_partition_bytes: self.params.max_partition_bytes,
                    });
                    keys.push(key);
                }
            }
            let tag = self.next_tag;
            self.next_tag += 1;
            self.outstanding.insert(tag, keys);
            requests.push(UnsentRequest {
                target: NodeTarget::Node(leader),
                body: RequestBody::Fetch {
                    max_wait_ms: self.params.max_wait_ms,
                    min_bytes: self.params.min_bytes,
                    max_bytes: self.params.max_bytes,
                    partitions: fetch_partitions,
                },
                origin: ManagerKind::Fetch,
                tag,
                deadline: now + self.request_timeout,
            });
        }

        if !leaderless.is_empty() {
            // They stay fetchable and go out once metadata knows a leader.
            tracing::debug!("{} partitions have no known leader", leaderless.len());
        }
        let timeout = Duration::from_millis(self.params.max_wait_ms.max(1) as u64);
        PollResult::new(timeout, requests)
    }

    fn handle_response(
        &mut self,
        response: CompletedResponse,
        _now: Instant,
        _metadata: &ClusterMetadata,
    ) -> Vec<Signal> {
        let keys = match self.outstanding.remove(&response.tag) {
            Some(keys) => keys,
            None => return vec![],
        };
        for key in &keys {
            if let Some(state) = self.partitions.get_mut(key) {
                state.in_flight = false;
            }
        }

        let fetched = match response.result {
            Ok(ResponseBody::Fetch {
                error_code: KafkaCode::None,
                partitions,
            }) => partitions,
            Ok(body) => {
                tracing::debug!("Fetch failed with {:?}, retrying", body.error_code());
                return match body.error_code() {
                    KafkaCode::NotLeaderForPartition | KafkaCode::UnknownTopicOrPartition => {
                        vec![Signal::MetadataStale]
                    }
                    _ => vec![],
                };
            }
            Err(error) => {
                tracing::debug!("Fetch failed: {}, retrying", error);
                return vec![];
            }
        };

        let mut signals = vec![];
        let mut need_positions = vec![];
        for partition in fetched {
            let key = (partition.topic.clone(), partition.partition);
            let state = match self.partitions.get_mut(&key) {
                Some(state) => state,
                // Revoked while the fetch was in flight.
                None => continue,
            };
            match partition.error_code {
                KafkaCode::None => {
                    let position = state.position.unwrap_or(0);
                    // Brokers may return whole batches starting before the
                    // requested offset; skip the stale prefix.
                    state.buffered.extend(
                        partition
                            .records
                            .into_iter()
                            .filter(|record| record.offset >= position),
                    );
                }
                KafkaCode::OffsetOutOfRange => {
                    tracing::debug!(
                        "Position {:?} out of range for {}-{}, resetting",
                        state.position,
                        key.0,
                        key.1
                    );
                    state.position = None;
                    need_positions.push(key);
                }
                KafkaCode::NotLeaderForPartition | KafkaCode::UnknownTopicOrPartition => {
                    signals.push(Signal::MetadataStale);
                }
                code => {
                    tracing::warn!("Fetch error {:?} on {}-{}", code, key.0, key.1);
                }
            }
        }
        if !need_positions.is_empty() {
            signals.push(Signal::PositionsNeeded(need_positions));
        }
        signals
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Broker, FetchedPartition, Partition, Topic};
    use bytes::Bytes;

    fn metadata_one_leader() -> ClusterMetadata {
        let mut metadata = ClusterMetadata::new(Duration::from_secs(300));
        metadata.update(
            vec![Broker {
                node_id: 1,
                host: String::from("localhost"),
                port: 9092,
            }],
            vec![Topic {
                name: String::from("purchases"),
                partitions: vec![
                    Partition {
                        partition_index: 0,
                        leader_id: 1,
                    },
                    Partition {
                        partition_index: 1,
                        leader_id: 1,
                    },
                ],
            }],
            Instant::now(),
        );
        metadata
    }

    fn manager_with_positions() -> FetchManager {
        let mut manager = FetchManager::new(&RuntimeConfig::default());
        let assignment = TopicPartitions::from([(String::from("purchases"), vec![0, 1])]);
        let added = manager.set_assignment(&assignment);
        assert_eq!(added.len(), 2);
        manager.set_positions(&PartitionOffsets::from([
            ((String::from("purchases"), 0), 10),
            ((String::from("purchases"), 1), 20),
        ]));
        manager
    }

    fn record(partition: i32, offset: i64) -> Record {
        Record {
            topic: String::from("purchases"),
            partition,
            offset,
            timestamp: 0,
            key: Bytes::new(),
            value: Bytes::from_static(b"v"),
        }
    }

    fn fetch_response(tag: u64, partitions: Vec<FetchedPartition>) -> CompletedResponse {
        CompletedResponse {
            origin: ManagerKind::Fetch,
            tag,
            node: 1,
            result: Ok(ResponseBody::Fetch {
                error_code: KafkaCode::None,
                partitions,
            }),
        }
    }

    fn fetched(partition: i32, error_code: KafkaCode, records: Vec<Record>) -> FetchedPartition {
        FetchedPartition {
            topic: String::from("purchases"),
            partition,
            error_code,
            high_watermark: 100,
            records,
        }
    }

    #[test]
    fn new_assignment_needs_positions_before_fetching() {
        let mut manager = FetchManager::new(&RuntimeConfig::default());
        let metadata = metadata_one_leader();
        let assignment = TopicPartitions::from([(String::from("purchases"), vec![0])]);
        manager.set_assignment(&assignment);

        let result = manager.poll(Instant::now(), &metadata);
        assert!(result.requests.is_empty());
        assert_eq!(
            manager.partitions_needing_positions(),
            vec![(String::from("purchases"), 0)]
        );
    }

    #[test]
    fn fetches_from_the_position_and_buffers() {
        let mut manager = manager_with_positions();
        let metadata = metadata_one_leader();
        let now = Instant::now();

        let result = manager.poll(now, &metadata);
        assert_eq!(result.requests.len(), 1);
        assert_eq!(result.requests[0].target, NodeTarget::Node(1));
        match &result.requests[0].body {
            RequestBody::Fetch { partitions, .. } => {
                let mut offsets: Vec<(i32, i64)> =
                    partitions.iter().map(|p| (p.partition, p.offset)).collect();
                offsets.sort_unstable();
                assert_eq!(offsets, vec![(0, 10), (1, 20)]);
            }
            other => panic!("unexpected request {:?}", other),
        }

        let signals = manager.handle_response(
            fetch_response(
                result.requests[0].tag,
                vec![fetched(
                    0,
                    KafkaCode::None,
                    vec![record(0, 10), record(0, 11)],
                )],
            ),
            now,
            &metadata,
        );
        assert!(signals.is_empty());

        let (records, positions) = manager.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 10);
        assert_eq!(positions.get(&(String::from("purchases"), 0)), Some(&12));
    }

    #[test]
    fn buffered_partition_is_not_fetched_again_until_drained() {
        let mut manager = manager_with_positions();
        let metadata = metadata_one_leader();
        let now = Instant::now();

        let result = manager.poll(now, &metadata);
        manager.handle_response(
            fetch_response(
                result.requests[0].tag,
                vec![
                    fetched(0, KafkaCode::None, vec![record(0, 10)]),
                    fetched(1, KafkaCode::None, vec![]),
                ],
            ),
            now,
            &metadata,
        );

        // Partition 0 holds records; only partition 1 goes out again.
        let result = manager.poll(now, &metadata);
        assert_eq!(result.requests.len(), 1);
        match &result.requests[0].body {
            RequestBody::Fetch { partitions, .. } => {
                assert_eq!(partitions.len(), 1);
                assert_eq!(partitions[0].partition, 1);
            }
            other => panic!("unexpected request {:?}", other),
        }

        // After the drain it is fetchable again, one past the last record.
        manager.handle_response(
            fetch_response(result.requests[0].tag, vec![]),
            now,
            &metadata,
        );
        manager.drain();
        let result = manager.poll(now, &metadata);
        match &result.requests[0].body {
            RequestBody::Fetch { partitions, .. } => {
                let slot = partitions.iter().find(|p| p.partition == 0).unwrap();
                assert_eq!(slot.offset, 11);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn stale_records_below_the_position_are_skipped() {
        let mut manager = manager_with_positions();
        let metadata = metadata_one_leader();
        let now = Instant::now();

        let result = manager.poll(now, &metadata);
        manager.handle_response(
            fetch_response(
                result.requests[0].tag,
                vec![fetched(
                    0,
                    KafkaCode::None,
                    vec![record(0, 8), record(0, 9), record(0, 10)],
                )],
            ),
            now,
            &metadata,
        );

        let (records, _) = manager.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 10);
    }

    #[test]
    fn out_of_range_position_asks_for_a_reset() {
        let mut manager = manager_with_positions();
        let metadata = metadata_one_leader();
        let now = Instant::now();

        let result = manager.poll(now, &metadata);
        let signals = manager.handle_response(
            fetch_response(
                result.requests[0].tag,
                vec![fetched(0, KafkaCode::OffsetOutOfRange, vec![])],
            ),
            now,
            &metadata,
        );
        match &signals[..] {
            [Signal::PositionsNeeded(partitions)] => {
                assert_eq!(partitions, &vec![(String::from("purchases"), 0)]);
            }
            other => panic!("unexpected signals {:?}", other),
        }

        // The partition sits out until a new position arrives.
        let result = manager.poll(now, &metadata);
        match &result.requests[0].body {
            RequestBody::Fetch { partitions, .. } => {
                assert_eq!(partitions.len(), 1);
                assert_eq!(partitions[0].partition, 1);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn revoked_partition_response_is_dropped() {
        let mut manager = manager_with_positions();
        let metadata = metadata_one_leader();
        let now = Instant::now();

        let result = manager.poll(now, &metadata);
        let tag = result.requests[0].tag;

        // Revoke everything while the fetch is in flight.
        manager.set_assignment(&TopicPartitions::new());
        let signals = manager.handle_response(
            fetch_response(tag, vec![fetched(0, KafkaCode::None, vec![record(0, 10)])]),
            now,
            &metadata,
        );
        assert!(signals.is_empty());
        let (records, _) = manager.drain();
        assert!(records.is_empty());
    }
}
