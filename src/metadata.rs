//! Shared cluster metadata view.
//!
//! All managers read this structure; it is only ever mutated by the
//! background loop thread applying signals produced by the topic metadata and
//! coordinator discovery managers. That single-writer discipline is what lets
//! the view live without a lock: the loop owns it, application threads never
//! see it directly (the synchronous facade hands out owned copies).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{Broker, NodeId, Partition, Topic, TopicPartitions};

#[derive(Clone, Debug)]
pub struct ClusterMetadata {
    brokers: Vec<Broker>,
    topics: Vec<Topic>,
    coordinator: Option<NodeId>,
    last_refresh: Option<Instant>,
    refresh_requested: bool,
    ttl: Duration,
}

impl ClusterMetadata {
    pub fn new(ttl: Duration) -> Self {
        Self {
            brokers: vec![],
            topics: vec![],
            coordinator: None,
            last_refresh: None,
            refresh_requested: false,
            ttl,
        }
    }

    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn get_broker_by_id(&self, id: NodeId) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.node_id == id)
    }

    pub fn get_topic_partition_by_id(
        &self,
        topic_name: &str,
        partition_id: i32,
    ) -> Option<&Partition> {
        let topic = self.topics.iter().find(|t| t.name == topic_name)?;
        topic
            .partitions
            .iter()
            .find(|p| p.partition_index == partition_id)
    }

    pub fn get_leader_for_topic_partition(
        &self,
        topic_name: &str,
        partition_id: i32,
    ) -> Option<NodeId> {
        let partition = self.get_topic_partition_by_id(topic_name, partition_id)?;
        let leader = self.get_broker_by_id(partition.leader_id)?;
        Some(leader.node_id)
    }

    /// Group topic partitions by their leader node.
    ///
    /// Partitions with no known leader are returned separately so the caller
    /// can trigger a refresh and retry them later.
    pub fn group_by_leader(
        &self,
        topic_partitions: &TopicPartitions,
    ) -> (HashMap<NodeId, TopicPartitions>, Vec<(String, i32)>) {
        let mut by_leader: HashMap<NodeId, TopicPartitions> = HashMap::new();
        let mut leaderless = vec![];

        for (topic, partitions) in topic_partitions.iter() {
            for partition in partitions.iter() {
                match self.get_leader_for_topic_partition(topic, *partition) {
                    Some(leader) => {
                        let owned = by_leader.entry(leader).or_default();
                        let entries = owned.entry(topic.clone()).or_default();
                        if !entries.contains(partition) {
                            entries.push(*partition);
                        }
                    }
                    None => leaderless.push((topic.clone(), *partition)),
                }
            }
        }

        (by_leader, leaderless)
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.coordinator
    }

    pub fn set_coordinator(&mut self, node: NodeId) {
        tracing::debug!("Coordinator resolved to node {}", node);
        self.coordinator = Some(node);
    }

    pub fn clear_coordinator(&mut self) {
        if self.coordinator.take().is_some() {
            tracing::debug!("Coordinator cache invalidated");
        }
    }

    /// Make sure a broker learned outside a metadata response (the
    /// coordinator) is addressable.
    pub fn upsert_broker(&mut self, broker: Broker) {
        match self.brokers.iter_mut().find(|b| b.node_id == broker.node_id) {
            Some(existing) => *existing = broker,
            None => self.brokers.push(broker),
        }
    }

    pub fn update(&mut self, brokers: Vec<Broker>, topics: Vec<Topic>, now: Instant) {
        tracing::debug!(
            "Metadata updated: {} brokers, {} topics",
            brokers.len(),
            topics.len()
        );
        self.brokers = brokers;
        self.topics = topics;
        self.last_refresh = Some(now);
        self.refresh_requested = false;
    }

    /// Explicit invalidation, e.g. after an unknown-topic fetch error.
    pub fn request_refresh(&mut self) {
        self.refresh_requested = true;
    }

    pub fn needs_refresh(&self, now: Instant) -> bool {
        if self.refresh_requested {
            return true;
        }
        match self.last_refresh {
            Some(at) => now.duration_since(at) >= self.ttl,
            None => true,
        }
    }

    /// Time until the TTL would expire; zero when a refresh is already due.
    pub fn until_refresh(&self, now: Instant) -> Duration {
        if self.needs_refresh(now) {
            return Duration::ZERO;
        }
        match self.last_refresh {
            Some(at) => self.ttl.saturating_sub(now.duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Owned copy of the current view, safe to hand across threads.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            brokers: self.brokers.clone(),
            topics: self.topics.clone(),
        }
    }
}

/// An owned copy of the metadata view.
///
/// Returned through completion handles so that callers can never mutate the
/// runtime-internal state.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSnapshot {
    pub brokers: Vec<Broker>,
    pub topics: Vec<Topic>,
}
