//! Protocol-state request managers.
//!
//! Each manager owns one slice of the client protocol (coordinator
//! discovery, group membership, offset commits, offset resolution, topic
//! metadata, record fetch) and is driven the same way: every loop tick it is
//! polled for the requests it wants on the wire plus the minimum delay until
//! it must be polled again, and completed responses are routed back to it by
//! origin.
//!
//! Managers never mutate each other, and never mutate the shared metadata
//! view directly: anything that must cross a manager boundary travels as a
//! [`Signal`] the loop applies. That keeps every piece of protocol state
//! single-writer on the loop thread.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, PollResult, UnsentRequest};
use crate::error::Error;
use crate::metadata::ClusterMetadata;
use crate::protocol::{Broker, PartitionOffsets, Topic, TopicPartitions};

mod commit;
mod coordinator;
mod fetch;
mod heartbeat;
mod offsets;
mod topic_metadata;

pub(crate) use commit::CommitManager;
pub(crate) use coordinator::CoordinatorManager;
pub(crate) use fetch::FetchManager;
pub(crate) use heartbeat::HeartbeatManager;
pub(crate) use offsets::OffsetsManager;
pub(crate) use topic_metadata::TopicMetadataManager;

/// Advisory delay for "nothing to do until something else changes".
pub(crate) const MAX_POLL_DELAY: Duration = Duration::from_secs(3600);

/// Cross-manager effects, produced by response handling and applied by the
/// loop thread.
#[derive(Debug)]
pub(crate) enum Signal {
    /// Coordinator discovery succeeded.
    CoordinatorFound {
        node_id: i32,
        host: String,
        port: u16,
    },
    /// A coordinator-moved class error was observed; the cached coordinator
    /// must be dropped and rediscovered.
    CoordinatorUnknown,
    /// Fresh metadata arrived.
    MetadataUpdated {
        brokers: Vec<Broker>,
        topics: Vec<Topic>,
    },
    /// Something referenced a topic or leader the cached metadata does not
    /// know; refresh ahead of the TTL.
    MetadataStale,
    /// Membership identity changed; commits must carry the new epoch.
    MembershipUpdated { member_id: String, member_epoch: i32 },
    /// The coordinator assigned a new set of partitions.
    AssignmentChanged(TopicPartitions),
    /// Partitions with no valid fetch position; offsets must be resolved.
    PositionsNeeded(Vec<(String, i32)>),
    /// Offset resolution finished; fetch positions can move there.
    PositionsReset(PartitionOffsets),
    /// A non-recoverable protocol error; the owning manager has stopped
    /// scheduling work.
    Fatal(Error),
}

/// Capability shared by every request manager.
pub(crate) trait RequestManager {
    fn kind(&self) -> ManagerKind;

    /// Produce the requests that should go on the wire now, plus the minimum
    /// delay until this manager needs polling again. Never fails: problems
    /// surface through response handling, not the poll boundary.
    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult;

    /// Restricted poll used while the loop is CLOSING: only close-out work
    /// (commit flush, leave-group) may produce requests.
    fn poll_on_shutdown(&mut self, _now: Instant, _metadata: &ClusterMetadata) -> PollResult {
        PollResult::empty(MAX_POLL_DELAY)
    }

    /// Take delivery of a completed request that this manager originated.
    fn handle_response(
        &mut self,
        response: CompletedResponse,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> Vec<Signal>;
}

/// The full manager set for one runtime instance.
///
/// The group-protocol managers are optional: standalone-assignment mode has
/// no coordinator, no membership, and no group commits. The loop iterates
/// only the present slots, in protocol-criticality order (membership and
/// commit traffic is enqueued ahead of fetch, which decides who wins when a
/// node's in-flight cap is contended).
pub(crate) struct RequestManagers {
    pub coordinator: Option<CoordinatorManager>,
    pub heartbeat: Option<HeartbeatManager>,
    pub commit: Option<CommitManager>,
    pub offsets: OffsetsManager,
    pub topic_metadata: TopicMetadataManager,
    pub fetch: FetchManager,
}

impl RequestManagers {
    pub fn new(config: &RuntimeConfig) -> Self {
        let group = config.group_id.as_ref();
        Self {
            coordinator: group.map(|id| CoordinatorManager::new(id.clone(), config)),
            heartbeat: group.map(|id| HeartbeatManager::new(id.clone(), config)),
            commit: group.map(|id| CommitManager::new(id.clone(), config)),
            offsets: OffsetsManager::new(config),
            topic_metadata: TopicMetadataManager::new(config),
            fetch: FetchManager::new(config),
        }
    }

    /// Present managers in poll-priority order.
    fn entries(&mut self) -> Vec<&mut dyn RequestManager> {
        let mut entries: Vec<&mut dyn RequestManager> = vec![];
        if let Some(coordinator) = self.coordinator.as_mut() {
            entries.push(coordinator);
        }
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            entries.push(heartbeat);
        }
        if let Some(commit) = self.commit.as_mut() {
            entries.push(commit);
        }
        entries.push(&mut self.offsets);
        entries.push(&mut self.topic_metadata);
        entries.push(&mut self.fetch);
        entries
    }

    /// Poll every present manager; aggregate their requests (in priority
    /// order) and the minimum advised delay.
    pub fn poll_all(
        &mut self,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> (Duration, Vec<UnsentRequest>) {
        let mut delay = MAX_POLL_DELAY;
        let mut requests = vec![];
        for manager in self.entries() {
            let mut result = manager.poll(now, metadata);
            delay = delay.min(result.timeout);
            requests.append(&mut result.requests);
        }
        (delay, requests)
    }

    /// Same aggregation, but through the shutdown-restricted poll.
    pub fn poll_all_on_shutdown(
        &mut self,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> (Duration, Vec<UnsentRequest>) {
        let mut delay = MAX_POLL_DELAY;
        let mut requests = vec![];
        for manager in self.entries() {
            let mut result = manager.poll_on_shutdown(now, metadata);
            delay = delay.min(result.timeout);
            requests.append(&mut result.requests);
        }
        (delay, requests)
    }

    /// Route a completed response back to the manager that originated it.
    pub fn route(
        &mut self,
        response: CompletedResponse,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> Vec<Signal> {
        let manager: Option<&mut dyn RequestManager> = match response.origin {
            ManagerKind::Coordinator => self
                .coordinator
                .as_mut()
                .map(|m| m as &mut dyn RequestManager),
            ManagerKind::Heartbeat => self
                .heartbeat
                .as_mut()
                .map(|m| m as &mut dyn RequestManager),
            ManagerKind::Commit => self.commit.as_mut().map(|m| m as &mut dyn RequestManager),
            ManagerKind::Offsets => Some(&mut self.offsets),
            ManagerKind::TopicMetadata => Some(&mut self.topic_metadata),
            ManagerKind::Fetch => Some(&mut self.fetch),
        };
        match manager {
            Some(manager) => manager.handle_response(response, now, metadata),
            None => {
                tracing::error!(
                    "Response for absent {:?} manager dropped",
                    response.origin
                );
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delegate::ManagerKind;

    fn group_config() -> RuntimeConfig {
        RuntimeConfig {
            group_id: Some(String::from("the-data-boyz")),
            topics: vec![String::from("purchases")],
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn group_mode_has_all_slots() {
        let mut managers = RequestManagers::new(&group_config());
        let kinds: Vec<ManagerKind> = managers.entries().iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ManagerKind::Coordinator,
                ManagerKind::Heartbeat,
                ManagerKind::Commit,
                ManagerKind::Offsets,
                ManagerKind::TopicMetadata,
                ManagerKind::Fetch,
            ]
        );
    }

    #[test]
    fn standalone_mode_skips_group_managers() {
        let config = RuntimeConfig {
            topics: vec![String::from("purchases")],
            ..RuntimeConfig::default()
        };
        let mut managers = RequestManagers::new(&config);
        let kinds: Vec<ManagerKind> = managers.entries().iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ManagerKind::Offsets,
                ManagerKind::TopicMetadata,
                ManagerKind::Fetch,
            ]
        );
    }

    #[test]
    fn idle_managers_advise_positive_delay() {
        let mut managers = RequestManagers::new(&group_config());
        let metadata = ClusterMetadata::new(Duration::from_secs(300));
        let now = Instant::now();

        // Coordinator discovery and the metadata TTL both have work on the
        // very first poll; drain those.
        let (_, requests) = managers.poll_all(now, &metadata);
        assert!(!requests.is_empty());

        let (delay, requests) = managers.poll_all(now, &metadata);
        assert!(requests.is_empty());
        assert!(delay > Duration::ZERO);

        // No intervening state change: an equivalent result.
        let (delay_again, requests) = managers.poll_all(now, &metadata);
        assert!(requests.is_empty());
        assert_eq!(delay, delay_again);
    }
}
