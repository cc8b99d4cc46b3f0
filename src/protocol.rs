//! Typed request/response payloads exchanged with brokers.
//!
//! The on-wire binary encoding is deliberately not defined here. The runtime
//! only needs a request/response pair abstraction with a correlation id, a
//! destination node, and enough structure for the managers to act on broker
//! answers. Serialization plugs in at the [`WireCodec`](crate::transport::WireCodec)
//! seam of the transport layer.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::KafkaCode;

/// Broker node identifier. Bootstrap nodes use negative ids until real ids
/// are learned from a metadata response.
pub type NodeId = i32;

type TopicPartitionKey = (String, i32);

/// Topic-partition assignment, keyed by topic name.
pub type TopicPartitions = HashMap<String, Vec<i32>>;

/// Offsets per topic partition.
pub type PartitionOffsets = HashMap<TopicPartitionKey, i64>;

/// The protocol APIs the runtime drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiKind {
    FindCoordinator,
    Heartbeat,
    OffsetCommit,
    ListOffsets,
    Metadata,
    Fetch,
}

/// Member epoch that signals an intent to join a group.
pub const JOIN_EPOCH: i32 = 0;
/// Member epoch that signals departure from a group.
pub const LEAVE_EPOCH: i32 = -1;

/// Timestamp sentinel asking for the earliest available offset.
pub const EARLIEST_TIMESTAMP: i64 = -2;
/// Timestamp sentinel asking for the latest offset.
pub const LATEST_TIMESTAMP: i64 = -1;

/// One partition slot of a fetch request.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_partition_bytes: i32,
}

/// Request payloads, one variant per driven API.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    FindCoordinator {
        group_id: String,
    },
    /// The epoch-based group protocol drives join, liveness, reconciliation,
    /// and leave through this single request. `member_epoch` of
    /// [`JOIN_EPOCH`] joins; [`LEAVE_EPOCH`] leaves.
    Heartbeat {
        group_id: String,
        member_id: String,
        member_epoch: i32,
        subscriptions: Vec<String>,
    },
    OffsetCommit {
        group_id: String,
        member_id: String,
        member_epoch: i32,
        offsets: PartitionOffsets,
    },
    ListOffsets {
        /// (topic, partition, timestamp) triples; timestamps may be the
        /// earliest/latest sentinels.
        partitions: Vec<(String, i32, i64)>,
    },
    Metadata {
        topics: Vec<String>,
    },
    Fetch {
        max_wait_ms: i32,
        min_bytes: i32,
        max_bytes: i32,
        partitions: Vec<FetchPartition>,
    },
}

impl RequestBody {
    pub fn api_kind(&self) -> ApiKind {
        match self {
            RequestBody::FindCoordinator { .. } => ApiKind::FindCoordinator,
            RequestBody::Heartbeat { .. } => ApiKind::Heartbeat,
            RequestBody::OffsetCommit { .. } => ApiKind::OffsetCommit,
            RequestBody::ListOffsets { .. } => ApiKind::ListOffsets,
            RequestBody::Metadata { .. } => ApiKind::Metadata,
            RequestBody::Fetch { .. } => ApiKind::Fetch,
        }
    }
}

/// A single consumed record.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Bytes,
    pub value: Bytes,
}

/// Per-partition slice of a fetch response.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedPartition {
    pub topic: String,
    pub partition: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub records: Vec<Record>,
}

/// A broker described by a metadata response.
#[derive(Clone, Debug, PartialEq)]
pub struct Broker {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Broker {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A topic and its partition leaders from a metadata response.
#[derive(Clone, Debug, PartialEq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    pub partition_index: i32,
    pub leader_id: NodeId,
}

/// Response payloads, mirroring [`RequestBody`].
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    FindCoordinator {
        error_code: KafkaCode,
        node_id: NodeId,
        host: String,
        port: u16,
    },
    Heartbeat {
        error_code: KafkaCode,
        member_id: String,
        member_epoch: i32,
        heartbeat_interval_ms: i32,
        /// A full target assignment when the coordinator wants the member to
        /// reconcile; `None` means "no change".
        assignment: Option<TopicPartitions>,
    },
    OffsetCommit {
        error_code: KafkaCode,
    },
    ListOffsets {
        error_code: KafkaCode,
        /// (topic, partition, resolved offset) triples.
        offsets: Vec<(String, i32, i64)>,
    },
    Metadata {
        error_code: KafkaCode,
        brokers: Vec<Broker>,
        topics: Vec<Topic>,
    },
    Fetch {
        error_code: KafkaCode,
        partitions: Vec<FetchedPartition>,
    },
}

impl ResponseBody {
    pub fn api_kind(&self) -> ApiKind {
        match self {
            ResponseBody::FindCoordinator { .. } => ApiKind::FindCoordinator,
            ResponseBody::Heartbeat { .. } => ApiKind::Heartbeat,
            ResponseBody::OffsetCommit { .. } => ApiKind::OffsetCommit,
            ResponseBody::ListOffsets { .. } => ApiKind::ListOffsets,
            ResponseBody::Metadata { .. } => ApiKind::Metadata,
            ResponseBody::Fetch { .. } => ApiKind::Fetch,
        }
    }

    /// Top-level error code of the response.
    pub fn error_code(&self) -> KafkaCode {
        match self {
            ResponseBody::FindCoordinator { error_code, .. }
            | ResponseBody::Heartbeat { error_code, .. }
            | ResponseBody::OffsetCommit { error_code }
            | ResponseBody::ListOffsets { error_code, .. }
            | ResponseBody::Metadata { error_code, .. }
            | ResponseBody::Fetch { error_code, .. } => *error_code,
        }
    }
}
