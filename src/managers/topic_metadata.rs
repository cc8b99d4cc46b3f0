//! Topic metadata refresh.
//!
//! A refresh goes out whenever the shared view's TTL lapses, a manager flags
//! the view stale, or the application asks for an up-to-date snapshot. Any
//! broker can answer, so requests go least-loaded. The manager never touches
//! the shared view itself; fresh responses are surfaced as
//! [`Signal::MetadataUpdated`] for the loop to apply.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::{Error, KafkaCode};
use crate::events::Completer;
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::{ClusterMetadata, ClusterSnapshot};
use crate::protocol::{RequestBody, ResponseBody};

pub(crate) struct TopicMetadataManager {
    /// Topics to keep fresh; grows as the application asks about new ones.
    topics: Vec<String>,
    request_timeout: Duration,
    retry_backoff: Duration,
    refresh_requested: bool,
    retry_at: Option<Instant>,
    outstanding: Option<u64>,
    /// Set on a fatal error code; no further refreshes are scheduled and
    /// waiters fail immediately.
    fatal: Option<KafkaCode>,
    /// Callers waiting on the next fresh snapshot.
    snapshot_completions: Vec<Completer<ClusterSnapshot>>,
    next_tag: u64,
}

impl TopicMetadataManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            topics: config.topics.clone(),
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            refresh_requested: false,
            retry_at: None,
            outstanding: None,
            fatal: None,
            snapshot_completions: vec![],
            next_tag: 0,
        }
    }

    /// Ask for a refresh ahead of the TTL, optionally widening the topic set
    /// and waiting for the resulting snapshot.
    pub fn request_refresh(
        &mut self,
        topics: Vec<String>,
        completion: Option<Completer<ClusterSnapshot>>,
    ) {
        if let Some(code) = self.fatal {
            if let Some(completion) = completion {
                completion.complete(Err(Error::KafkaError(code)));
            }
            return;
        }
        for topic in topics {
            if !self.topics.contains(&topic) {
                self.topics.push(topic);
            }
        }
        self.refresh_requested = true;
        if let Some(completion) = completion {
            self.snapshot_completions.push(completion);
        }
    }
}

impl RequestManager for TopicMetadataManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::TopicMetadata
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        if self.fatal.is_some() || self.outstanding.is_some() {
            return PollResult::empty(MAX_POLL_DELAY);
        }
        if let Some(retry_at) = self.retry_at {
            if retry_at > now {
                return PollResult::empty(retry_at - now);
            }
            self.retry_at = None;
        }
        if !self.refresh_requested && !metadata.needs_refresh(now) {
            return PollResult::empty(metadata.until_refresh(now));
        }

        let tag = self.next_tag;
        self.next_tag += 1;
        self.outstanding = Some(tag);
        self.refresh_requested = false;
        tracing::debug!("Refreshing metadata for {} topics", self.topics.len());
        PollResult::new(
            self.request_timeout,
            vec![UnsentRequest {
                target: NodeTarget::LeastLoaded,
                body: RequestBody::Metadata {
                    topics: self.topics.clone(),
                },
                origin: ManagerKind::TopicMetadata,
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
            Ok(ResponseBody::Metadata {
                error_code: KafkaCode::None,
                brokers,
                topics,
            }) => {
                // Waiters get their snapshot straight from the response; the
                // shared view catches up when the loop applies the signal.
                for completion in self.snapshot_completions.drain(..) {
                    completion.complete(Ok(ClusterSnapshot {
                        brokers: brokers.clone(),
                        topics: topics.clone(),
                    }));
                }
                vec![Signal::MetadataUpdated { brokers, topics }]
            }
            Ok(body) => {
                let code = body.error_code();
                if code.is_fatal() {
                    self.fatal = Some(code);
                    for completion in self.snapshot_completions.drain(..) {
                        completion.complete(Err(Error::KafkaError(code)));
                    }
                    vec![Signal::Fatal(Error::KafkaError(code))]
                } else {
                    tracing::debug!("Metadata refresh failed with {:?}, retrying", code);
                    self.refresh_requested = true;
                    self.retry_at = Some(now + self.retry_backoff);
                    vec![]
                }
            }
            Err(error) => {
                tracing::debug!("Metadata refresh failed: {}, retrying", error);
                self.refresh_requested = true;
                self.retry_at = Some(now + self.retry_backoff);
                vec![]
            }
        }
    }
}
