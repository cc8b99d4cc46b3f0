//! Runtime configuration.

use std::time::Duration;

use crate::transport::BrokerAddress;
use crate::DEFAULT_CLIENT_ID;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 1_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 45_000;
const DEFAULT_AUTO_COMMIT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_METADATA_TTL_MS: u64 = 300_000;
const DEFAULT_MAX_IN_FLIGHT_PER_NODE: usize = 5;
const DEFAULT_MAX_WAIT_MS: i32 = 200;
const DEFAULT_MIN_BYTES: i32 = 100;
const DEFAULT_MAX_BYTES: i32 = 30000;
const DEFAULT_MAX_PARTITION_BYTES: i32 = 20000;
const DEFAULT_MAX_IDLE_SLEEP_MS: u64 = 100;
const DEFAULT_CLOSE_BUDGET_MS: u64 = 30_000;

/// Where to move a partition's position when it has none, or when the broker
/// reports the current one out of range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetResetStrategy {
    Earliest,
    Latest,
}

/// Flow-control limits for fetch requests, so brokers can apply bounded-wait
/// batching.
#[derive(Clone, Debug)]
pub struct FetchParams {
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub max_partition_bytes: i32,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            min_bytes: DEFAULT_MIN_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
            max_partition_bytes: DEFAULT_MAX_PARTITION_BYTES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub client_id: String,
    /// Group mode when present; standalone partition assignment when absent.
    pub group_id: Option<String>,
    pub bootstrap: Vec<BrokerAddress>,
    /// Topics to subscribe to / keep metadata fresh for.
    pub topics: Vec<String>,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    /// Used until the coordinator advertises an interval of its own.
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    /// `None` disables periodic auto-commit.
    pub auto_commit_interval: Option<Duration>,
    pub metadata_ttl: Duration,
    pub max_in_flight_per_node: usize,
    pub fetch: FetchParams,
    pub auto_offset_reset: OffsetResetStrategy,
    /// Upper bound on the loop's idle sleep, so external triggers are never
    /// starved for long even without a wakeup.
    pub max_idle_sleep: Duration,
    /// Bound on the CLOSING state of the loop lifecycle.
    pub close_budget: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            group_id: None,
            bootstrap: vec![],
            topics: vec![],
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            retry_backoff_max: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MAX_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            auto_commit_interval: Some(Duration::from_millis(DEFAULT_AUTO_COMMIT_INTERVAL_MS)),
            metadata_ttl: Duration::from_millis(DEFAULT_METADATA_TTL_MS),
            max_in_flight_per_node: DEFAULT_MAX_IN_FLIGHT_PER_NODE,
            fetch: FetchParams::default(),
            auto_offset_reset: OffsetResetStrategy::Latest,
            max_idle_sleep: Duration::from_millis(DEFAULT_MAX_IDLE_SLEEP_MS),
            close_budget: Duration::from_millis(DEFAULT_CLOSE_BUDGET_MS),
        }
    }
}
