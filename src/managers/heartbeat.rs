//! Group membership driven by the epoch-based heartbeat protocol.
//!
//! A single request carries join, liveness, reconciliation acknowledgement,
//! and leave: a heartbeat with member epoch [`JOIN_EPOCH`] joins the group, a
//! heartbeat with [`LEAVE_EPOCH`] leaves it, and everything in between keeps
//! the session alive at the coordinator-advertised interval. The coordinator
//! answers with the member's current epoch and, when it wants the member to
//! move to a new set of partitions, a full target assignment.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::{Error, KafkaCode};
use crate::events::Completer;
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::ClusterMetadata;
use crate::protocol::{RequestBody, ResponseBody, JOIN_EPOCH, LEAVE_EPOCH};

/// Where this member stands in the group protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemberState {
    /// Not in the group; the next heartbeat will carry the join epoch.
    Unjoined,
    /// Join heartbeat sent, no epoch granted yet.
    Joining,
    /// A target assignment arrived and is being acknowledged.
    Reconciling,
    /// Full member with a settled assignment.
    Stable,
    /// Leave requested; the next heartbeat will carry the leave epoch.
    PrepareLeaving,
    /// Leave heartbeat sent, waiting for the coordinator to confirm.
    Leaving,
    /// A non-recoverable protocol error stopped membership for good.
    Fatal,
}

pub(crate) struct HeartbeatManager {
    group_id: String,
    subscriptions: Vec<String>,
    state: MemberState,
    member_id: String,
    member_epoch: i32,
    heartbeat_interval: Duration,
    session_timeout: Duration,
    request_timeout: Duration,
    retry_backoff: Duration,
    next_heartbeat_at: Option<Instant>,
    session_deadline: Option<Instant>,
    heartbeat_requested: bool,
    outstanding: Option<u64>,
    leave_completion: Option<Completer<()>>,
    next_tag: u64,
}

impl HeartbeatManager {
    pub fn new(group_id: String, config: &RuntimeConfig) -> Self {
        Self {
            group_id,
            subscriptions: config.topics.clone(),
            state: MemberState::Unjoined,
            member_id: String::new(),
            member_epoch: JOIN_EPOCH,
            heartbeat_interval: config.heartbeat_interval,
            session_timeout: config.session_timeout,
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            next_heartbeat_at: None,
            session_deadline: None,
            heartbeat_requested: false,
            outstanding: None,
            leave_completion: None,
            next_tag: 0,
        }
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    /// True once there is nothing left for the group to hear from us.
    pub fn has_left(&self) -> bool {
        matches!(self.state, MemberState::Unjoined | MemberState::Fatal)
    }

    /// Ask for a heartbeat on the next poll regardless of the interval.
    pub fn request_heartbeat_now(&mut self) {
        self.heartbeat_requested = true;
    }

    /// Begin leaving the group. Members that never joined have nothing to
    /// say to the coordinator and complete immediately.
    pub fn request_leave(&mut self, completion: Option<Completer<()>>) {
        match self.state {
            MemberState::Unjoined | MemberState::Fatal => {
                if let Some(completion) = completion {
                    completion.complete(Ok(()));
                }
            }
            MemberState::PrepareLeaving | MemberState::Leaving => {
                // A second leave rides along with the one in progress.
                if self.leave_completion.is_none() {
                    self.leave_completion = completion;
                } else if let Some(completion) = completion {
                    completion.complete(Ok(()));
                }
            }
            _ => {
                tracing::debug!("Leaving group {}", self.group_id);
                self.state = MemberState::PrepareLeaving;
                self.leave_completion = completion;
            }
        }
    }

    fn heartbeat_request(&mut self, now: Instant, epoch: i32) -> PollResult {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.outstanding = Some(tag);
        self.heartbeat_requested = false;
        self.next_heartbeat_at = Some(now + self.heartbeat_interval);
        PollResult::new(
            self.heartbeat_interval,
            vec![UnsentRequest {
                // Membership traffic only makes sense at the coordinator; the
                // caller checked that one is known.
                target: NodeTarget::LeastLoaded,
                body: RequestBody::Heartbeat {
                    group_id: self.group_id.clone(),
                    member_id: self.member_id.clone(),
                    member_epoch: epoch,
                    subscriptions: self.subscriptions.clone(),
                },
                origin: ManagerKind::Heartbeat,
                tag,
                deadline: now + self.request_timeout,
            }],
        )
    }

    fn heartbeat_to(&mut self, now: Instant, coordinator: i32, epoch: i32) -> PollResult {
        let mut result = self.heartbeat_request(now, epoch);
        result.requests[0].target = NodeTarget::Node(coordinator);
        result
    }

    fn poll_inner(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        if self.state == MemberState::Fatal || self.outstanding.is_some() {
            return PollResult::empty(MAX_POLL_DELAY);
        }
        let coordinator = match metadata.coordinator() {
            Some(node) => node,
            // Discovery is in progress; check back soon.
            None => return PollResult::empty(self.retry_backoff),
        };

        match self.state {
            MemberState::Unjoined => {
                tracing::debug!("Joining group {}", self.group_id);
                self.state = MemberState::Joining;
                self.member_epoch = JOIN_EPOCH;
                self.session_deadline = Some(now + self.session_timeout);
                self.heartbeat_to(now, coordinator, JOIN_EPOCH)
            }
            MemberState::PrepareLeaving => {
                self.state = MemberState::Leaving;
                self.heartbeat_to(now, coordinator, LEAVE_EPOCH)
            }
            MemberState::Joining | MemberState::Reconciling | MemberState::Stable => {
                if let Some(deadline) = self.session_deadline {
                    if now >= deadline {
                        // The coordinator has expired us by now; start over.
                        tracing::warn!(
                            "Session expired after {:?} without a heartbeat response, rejoining",
                            self.session_timeout
                        );
                        self.state = MemberState::Unjoined;
                        return self.poll_inner(now, metadata);
                    }
                }
                let due = self
                    .next_heartbeat_at
                    .map(|at| at <= now)
                    .unwrap_or(true);
                if self.heartbeat_requested || due {
                    self.heartbeat_to(now, coordinator, self.member_epoch)
                } else {
                    let at = self.next_heartbeat_at.unwrap_or(now);
                    PollResult::empty(at - now)
                }
            }
            MemberState::Leaving | MemberState::Fatal => PollResult::empty(MAX_POLL_DELAY),
        }
    }

    fn handle_success(
        &mut self,
        member_id: String,
        member_epoch: i32,
        heartbeat_interval_ms: i32,
        assignment: Option<crate::protocol::TopicPartitions>,
        now: Instant,
    ) -> Vec<Signal> {
        if self.state == MemberState::Leaving {
            tracing::debug!("Left group {}", self.group_id);
            self.state = MemberState::Unjoined;
            self.member_epoch = JOIN_EPOCH;
            self.session_deadline = None;
            if let Some(completion) = self.leave_completion.take() {
                completion.complete(Ok(()));
            }
            return vec![];
        }

        if self.state == MemberState::PrepareLeaving {
            // A join or liveness response racing a leave request; keep the
            // granted identity for the final commit, stay on course to leave.
            self.member_id = member_id;
            self.member_epoch = member_epoch;
            return vec![Signal::MembershipUpdated {
                member_id: self.member_id.clone(),
                member_epoch: self.member_epoch,
            }];
        }

        self.member_id = member_id;
        self.member_epoch = member_epoch;
        if heartbeat_interval_ms > 0 {
            self.heartbeat_interval = Duration::from_millis(heartbeat_interval_ms as u64);
        }
        self.session_deadline = Some(now + self.session_timeout);
        self.next_heartbeat_at = Some(now + self.heartbeat_interval);

        let mut signals = vec![Signal::MembershipUpdated {
            member_id: self.member_id.clone(),
            member_epoch: self.member_epoch,
        }];
        match assignment {
            Some(assignment) => {
                tracing::debug!(
                    "Target assignment received for epoch {}: {:?}",
                    self.member_epoch,
                    assignment
                );
                self.state = MemberState::Reconciling;
                // Acknowledge the reconciled assignment without waiting a
                // full interval.
                self.heartbeat_requested = true;
                signals.push(Signal::AssignmentChanged(assignment));
            }
            None => {
                self.state = MemberState::Stable;
            }
        }
        signals
    }

    fn handle_protocol_error(&mut self, code: KafkaCode, now: Instant) -> Vec<Signal> {
        let leaving = self.state == MemberState::Leaving;
        match code {
            KafkaCode::NotCoordinator | KafkaCode::CoordinatorNotAvailable => {
                tracing::debug!("Coordinator moved, rediscovering before next heartbeat");
                if leaving {
                    self.state = MemberState::PrepareLeaving;
                } else {
                    self.state = MemberState::Joining;
                    self.heartbeat_requested = true;
                }
                vec![Signal::CoordinatorUnknown]
            }
            KafkaCode::FencedMemberEpoch | KafkaCode::UnknownMemberId => {
                if leaving {
                    // Fenced while leaving means the group already forgot us.
                    self.state = MemberState::Unjoined;
                    if let Some(completion) = self.leave_completion.take() {
                        completion.complete(Ok(()));
                    }
                    return vec![];
                }
                tracing::warn!("Fenced from group {} ({:?}), rejoining", self.group_id, code);
                if code == KafkaCode::UnknownMemberId {
                    self.member_id.clear();
                }
                self.member_epoch = JOIN_EPOCH;
                self.state = MemberState::Unjoined;
                vec![Signal::MembershipUpdated {
                    member_id: self.member_id.clone(),
                    member_epoch: JOIN_EPOCH,
                }]
            }
            code if code.is_retriable() => {
                self.next_heartbeat_at = Some(now + self.retry_backoff);
                if leaving {
                    self.state = MemberState::PrepareLeaving;
                }
                vec![]
            }
            code => {
                tracing::error!("Membership failed for group {}: {:?}", self.group_id, code);
                self.state = MemberState::Fatal;
                if let Some(completion) = self.leave_completion.take() {
                    completion.complete(Err(Error::KafkaError(code)));
                }
                vec![Signal::Fatal(Error::KafkaError(code))]
            }
        }
    }
}

impl RequestManager for HeartbeatManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Heartbeat
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        self.poll_inner(now, metadata)
    }

    /// During shutdown only the leave handshake may go out.
    fn poll_on_shutdown(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        match self.state {
            MemberState::PrepareLeaving => self.poll_inner(now, metadata),
            _ => PollResult::empty(MAX_POLL_DELAY),
        }
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
            Ok(ResponseBody::Heartbeat {
                error_code: KafkaCode::None,
                member_id,
                member_epoch,
                heartbeat_interval_ms,
                assignment,
            }) => self.handle_success(
                member_id,
                member_epoch,
                heartbeat_interval_ms,
                assignment,
                now,
            ),
            Ok(body) => self.handle_protocol_error(body.error_code(), now),
            Err(error) => {
                tracing::debug!("Heartbeat failed: {}, retrying", error);
                if self.state == MemberState::Leaving {
                    // Leave is best effort; the session timeout will do the
                    // rest server side.
                    self.state = MemberState::Unjoined;
                    if let Some(completion) = self.leave_completion.take() {
                        completion.complete(Err(error));
                    }
                    return vec![];
                }
                self.next_heartbeat_at = Some(now + self.retry_backoff);
                vec![]
            }
        }
    }
}
