//! Synchronous cluster-state view for callers that cannot await.
//!
//! The facade owns nothing but an event queue handle and a timeout. Every
//! accessor submits a metadata refresh and blocks for the resulting
//! snapshot, so callers always see a fresh owned view and never touch the
//! runtime's internal state. A runtime that is busy or gone surfaces as an
//! error within the timeout rather than a hang.

use std::time::Duration;

use crate::error::Result;
use crate::events::{completion, ApplicationEvent, EventQueue};
use crate::metadata::ClusterSnapshot;
use crate::protocol::{Broker, Topic};

#[derive(Clone)]
pub struct ClusterStateFacade {
    queue: EventQueue,
    timeout: Duration,
}

impl ClusterStateFacade {
    pub(crate) fn new(queue: EventQueue, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    fn snapshot(&self) -> Result<ClusterSnapshot> {
        let (completer, handle) = completion();
        self.queue.submit(ApplicationEvent::MetadataRefresh {
            topics: vec![],
            completion: Some(completer),
        })?;
        handle.wait(self.timeout)
    }

    /// The brokers of the cluster, as of a fresh metadata round trip.
    pub fn brokers(&self) -> Result<Vec<Broker>> {
        Ok(self.snapshot()?.brokers)
    }

    /// The known topics and their partition leaders.
    pub fn topics(&self) -> Result<Vec<Topic>> {
        Ok(self.snapshot()?.topics)
    }

    /// Partition count for one topic; `None` when the topic is unknown.
    pub fn partition_count(&self, topic: &str) -> Result<Option<usize>> {
        let topics = self.topics()?;
        Ok(topics
            .iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions.len()))
    }
}
