//! Error & result types for the runtime.

use std::fmt;

use num_derive::FromPrimitive;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the runtime.
///
/// Failures are delivered through per-request completion handles; the
/// background loop and the managers never return errors across the poll
/// boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Low level I/O problem on a broker connection.
    IoError(std::io::ErrorKind),
    /// A protocol-level error code returned by a broker.
    KafkaError(KafkaCode),
    /// The request's absolute deadline elapsed before a response arrived.
    RequestTimedOut,
    /// The destination node is in connection backoff; the request was
    /// failed fast instead of queueing indefinitely.
    NodeInBackoff(i32),
    /// No connection could be established to the node.
    NotConnected(i32),
    /// Submitted after shutdown began, or the runtime tore down before the
    /// completion handle was resolved.
    RuntimeClosed,
    /// The operation requires group membership but the runtime was built
    /// without a group id.
    NotInGroupMode,
    /// The wire codec could not encode or decode a payload.
    CodecError(String),
    /// A response arrived that correlates to no in-flight request.
    UnexpectedCorrelationId(i32),
}

impl Error {
    /// Whether a request that failed this way may be retried within its
    /// deadline.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::IoError(_) | Error::NodeInBackoff(_) | Error::NotConnected(_) => true,
            Error::KafkaError(code) => code.is_retriable(),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(kind) => write!(f, "io error: {:?}", kind),
            Error::KafkaError(code) => write!(f, "broker returned error code {:?}", code),
            Error::RequestTimedOut => write!(f, "request deadline elapsed"),
            Error::NodeInBackoff(node) => {
                write!(f, "node {} is in connection backoff", node)
            }
            Error::NotConnected(node) => write!(f, "no connection to node {}", node),
            Error::RuntimeClosed => write!(f, "runtime is shut down"),
            Error::NotInGroupMode => write!(f, "runtime was built without a group id"),
            Error::CodecError(msg) => write!(f, "wire codec error: {}", msg),
            Error::UnexpectedCorrelationId(id) => {
                write!(f, "response correlates to no in-flight request ({})", id)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Protocol error codes advertised by brokers.
///
/// Numeric values follow the Kafka protocol error code table so that a wire
/// codec can map broker responses directly with `FromPrimitive`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum KafkaCode {
    Unknown = -1,
    None = 0,
    OffsetOutOfRange = 1,
    UnknownTopicOrPartition = 3,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    IllegalGeneration = 22,
    UnknownMemberId = 25,
    RebalanceInProgress = 27,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    UnsupportedVersion = 35,
    SaslAuthenticationFailed = 58,
    FencedMemberEpoch = 110,
    UnreleasedInstanceId = 111,
}

impl KafkaCode {
    /// Retriable codes resolve themselves after a refresh, rediscovery, or
    /// rejoin; callers should back off and try again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaCode::OffsetOutOfRange
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::RebalanceInProgress
        )
    }

    /// Fatal codes halt further scheduling until the application intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KafkaCode::TopicAuthorizationFailed
                | KafkaCode::GroupAuthorizationFailed
                | KafkaCode::UnsupportedVersion
                | KafkaCode::SaslAuthenticationFailed
        )
    }
}
