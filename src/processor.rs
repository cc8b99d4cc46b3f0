//! Turns application events into manager state changes.
//!
//! Runs on the loop thread, so it can borrow the managers and the delegate
//! mutably without any locking. Each event is consumed exactly once; events
//! that carry a completer either hand it to a manager for later resolution
//! or resolve it on the spot.

use std::time::Instant;

use crate::delegate::NetworkClientDelegate;
use crate::error::Error;
use crate::events::ApplicationEvent;
use crate::managers::RequestManagers;
use crate::metadata::ClusterMetadata;
use crate::transport::Transport;

pub(crate) fn process<T: Transport>(
    event: ApplicationEvent,
    managers: &mut RequestManagers,
    delegate: &mut NetworkClientDelegate<T>,
    metadata: &ClusterMetadata,
    now: Instant,
) {
    tracing::trace!("Processing {} event", event.name());
    match event {
        ApplicationEvent::Commit {
            offsets,
            completion,
        } => match managers.commit.as_mut() {
            Some(commit) => commit.request_commit(offsets, completion),
            None => {
                if let Some(completion) = completion {
                    completion.complete(Err(Error::NotInGroupMode));
                }
            }
        },
        ApplicationEvent::CommitOnClose => {
            if let Some(commit) = managers.commit.as_mut() {
                // Two-phase: the flush requests reach the network layer
                // before the manager is told to stop, so they cannot be lost
                // in between.
                let captured = commit.capture_close_requests(now, metadata);
                for request in captured {
                    delegate.send(request);
                }
                commit.signal_close();
            }
        }
        ApplicationEvent::HeartbeatNow => {
            if let Some(heartbeat) = managers.heartbeat.as_mut() {
                heartbeat.request_heartbeat_now();
            }
        }
        ApplicationEvent::LeaveGroup { completion } => match managers.heartbeat.as_mut() {
            Some(heartbeat) => heartbeat.request_leave(completion),
            // Nothing to leave outside group mode.
            None => {
                if let Some(completion) = completion {
                    completion.complete(Ok(()));
                }
            }
        },
        ApplicationEvent::ResetPositions {
            partitions,
            completion,
        } => managers.offsets.request_reset(partitions, completion),
        ApplicationEvent::FetchNow { completion } => {
            let (records, positions) = managers.fetch.drain();
            if let Some(commit) = managers.commit.as_mut() {
                commit.note_positions(positions);
            }
            completion.complete(Ok(records));
        }
        ApplicationEvent::MetadataRefresh { topics, completion } => {
            managers.topic_metadata.request_refresh(topics, completion);
        }
        ApplicationEvent::Shutdown { completion } => {
            // The loop intercepts shutdown before dispatching to us.
            tracing::error!("Shutdown event reached the processor");
            if let Some(completion) = completion {
                completion.complete(Err(Error::RuntimeClosed));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::events::completion;
    use crate::managers::RequestManager;
    use crate::protocol::{PartitionOffsets, RequestBody, TopicPartitions};
    use crate::transport::mock::InMemoryTransport;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn group_config() -> RuntimeConfig {
        RuntimeConfig {
            group_id: Some(String::from("the-data-boyz")),
            topics: vec![String::from("purchases")],
            ..RuntimeConfig::default()
        }
    }

    fn fixture() -> (
        RequestManagers,
        NetworkClientDelegate<InMemoryTransport>,
        ClusterMetadata,
    ) {
        let managers = RequestManagers::new(&group_config());
        let delegate = NetworkClientDelegate::new(
            InMemoryTransport::unresponsive(),
            Arc::new(Notify::new()),
            5,
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let mut metadata = ClusterMetadata::new(Duration::from_secs(300));
        metadata.set_coordinator(2);
        (managers, delegate, metadata)
    }

    #[test]
    fn commit_without_group_fails_fast() {
        let config = RuntimeConfig::default();
        let mut managers = RequestManagers::new(&config);
        let (_, mut delegate, metadata) = fixture();
        let (completer, handle) = completion();

        process(
            ApplicationEvent::Commit {
                offsets: PartitionOffsets::new(),
                completion: Some(completer),
            },
            &mut managers,
            &mut delegate,
            &metadata,
            Instant::now(),
        );
        assert_eq!(
            handle.wait(Duration::from_millis(10)),
            Err(Error::NotInGroupMode)
        );
    }

    #[test]
    fn leave_group_without_group_is_a_no_op() {
        let config = RuntimeConfig::default();
        let mut managers = RequestManagers::new(&config);
        let (_, mut delegate, metadata) = fixture();
        let (completer, handle) = completion();

        process(
            ApplicationEvent::LeaveGroup {
                completion: Some(completer),
            },
            &mut managers,
            &mut delegate,
            &metadata,
            Instant::now(),
        );
        assert_eq!(handle.wait(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn commit_on_close_hands_flush_to_the_network_before_stopping() {
        let (mut managers, mut delegate, metadata) = fixture();
        let now = Instant::now();

        process(
            ApplicationEvent::Commit {
                offsets: PartitionOffsets::from([((String::from("purchases"), 0), 10)]),
                completion: None,
            },
            &mut managers,
            &mut delegate,
            &metadata,
            now,
        );
        process(
            ApplicationEvent::CommitOnClose,
            &mut managers,
            &mut delegate,
            &metadata,
            now,
        );

        // The flush is queued at the delegate and the manager stopped.
        assert!(delegate.has_pending());
        assert!(managers.commit.as_ref().unwrap().has_outstanding());
        let (completer, handle) = completion();
        managers.commit.as_mut().unwrap().request_commit(
            PartitionOffsets::from([((String::from("purchases"), 0), 20)]),
            Some(completer),
        );
        assert_eq!(
            handle.wait(Duration::from_millis(10)),
            Err(Error::RuntimeClosed)
        );
    }

    #[test]
    fn fetch_now_drains_and_notes_positions_for_auto_commit() {
        let (mut managers, mut delegate, metadata) = fixture();
        let now = Instant::now();

        let assignment = TopicPartitions::from([(String::from("purchases"), vec![0])]);
        managers.fetch.set_assignment(&assignment);
        managers
            .fetch
            .set_positions(&PartitionOffsets::from([((String::from("purchases"), 0), 5)]));

        let (completer, handle) = completion();
        process(
            ApplicationEvent::FetchNow {
                completion: completer,
            },
            &mut managers,
            &mut delegate,
            &metadata,
            now,
        );
        let records = handle.wait(Duration::from_millis(10)).unwrap();
        assert!(records.is_empty());

        // Nothing consumed, so the auto-commit interval produces no request.
        let later = now + Duration::from_secs(6);
        let commit = managers.commit.as_mut().unwrap();
        let result = commit.poll(later, &metadata);
        assert!(result.requests.is_empty());
    }

    #[test]
    fn metadata_refresh_reaches_the_metadata_manager() {
        let (mut managers, mut delegate, metadata) = fixture();
        let now = Instant::now();

        process(
            ApplicationEvent::MetadataRefresh {
                topics: vec![String::from("clicks")],
                completion: None,
            },
            &mut managers,
            &mut delegate,
            &metadata,
            now,
        );
        let result = managers.topic_metadata.poll(now, &metadata);
        assert_eq!(result.requests.len(), 1);
        match &result.requests[0].body {
            RequestBody::Metadata { topics } => {
                assert!(topics.contains(&String::from("clicks")));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
