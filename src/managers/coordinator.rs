//! Group coordinator discovery.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::{Error, KafkaCode};
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::ClusterMetadata;
use crate::protocol::{RequestBody, ResponseBody};

/// Keeps the coordinator cache populated.
///
/// Whenever the shared view has no coordinator, this manager asks any broker
/// for one (FindCoordinator can be answered by any node). Successes surface
/// as [`Signal::CoordinatorFound`]; the loop applies them to the shared view,
/// which is what stops the next poll from asking again.
pub(crate) struct CoordinatorManager {
    group_id: String,
    request_timeout: Duration,
    retry_backoff: Duration,
    retry_backoff_max: Duration,
    outstanding: Option<u64>,
    retry_at: Option<Instant>,
    failed_attempts: u32,
    /// Set on a fatal error code; no further lookups are scheduled.
    fatal: bool,
    next_tag: u64,
}

impl CoordinatorManager {
    pub fn new(group_id: String, config: &RuntimeConfig) -> Self {
        Self {
            group_id,
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            retry_backoff_max: config.retry_backoff_max,
            outstanding: None,
            retry_at: None,
            failed_attempts: 0,
            fatal: false,
            next_tag: 0,
        }
    }

    /// Exponential backoff between lookup attempts, reset on success.
    fn back_off(&mut self, now: Instant) {
        self.failed_attempts += 1;
        let exponent = self.failed_attempts.saturating_sub(1).min(16);
        let backoff = self
            .retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.retry_backoff_max);
        self.retry_at = Some(now + backoff);
    }
}

impl RequestManager for CoordinatorManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Coordinator
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        if self.fatal || metadata.coordinator().is_some() || self.outstanding.is_some() {
            return PollResult::empty(MAX_POLL_DELAY);
        }
        if let Some(retry_at) = self.retry_at {
            if retry_at > now {
                return PollResult::empty(retry_at - now);
            }
        }
        self.retry_at = None;

        let tag = self.next_tag;
        self.next_tag += 1;
        self.outstanding = Some(tag);
        tracing::debug!("Looking up coordinator for group {}", self.group_id);
        PollResult::new(
            self.request_timeout,
            vec![UnsentRequest {
                target: NodeTarget::LeastLoaded,
                body: RequestBody::FindCoordinator {
                    group_id: self.group_id.clone(),
                },
                origin: ManagerKind::Coordinator,
                tag,
                deadline: now + self.request_timeout,
            }],
        )
    }

    fn handle_response(
        &mut self,
        response: CompletedResponse,
        now: Instant,
        _metadata: &ClusterMetadata,
    ) -> Vec<Signal> {
        if self.outstanding != Some(response.tag) {
            return vec![];
        }
        self.outstanding = None;

        match response.result {
            Ok(ResponseBody::FindCoordinator {
                error_code: KafkaCode::None,
                node_id,
                host,
                port,
            }) => {
                self.failed_attempts = 0;
                self.retry_at = None;
                vec![Signal::CoordinatorFound {
                    node_id,
                    host,
                    port,
                }]
            }
            Ok(body) => {
                let code = body.error_code();
                if code.is_fatal() {
                    self.fatal = true;
                    vec![Signal::Fatal(Error::KafkaError(code))]
                } else {
                    tracing::debug!("Coordinator lookup failed with {:?}, will retry", code);
                    self.back_off(now);
                    vec![]
                }
            }
            Err(error) => {
                tracing::debug!("Coordinator lookup failed: {}, will retry", error);
                self.back_off(now);
                vec![]
            }
        }
    }
}
