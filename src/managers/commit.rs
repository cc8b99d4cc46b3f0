//! Offset commits, explicit and periodic.
//!
//! Commits coalesce: while one request is on the wire, newer commits for the
//! same partition overwrite older pending ones (last write wins) and every
//! caller's completion rides on the request that finally carries its offset.
//! Auto-commit folds the positions consumed so far into the same pending set
//! on a timer.
//!
//! Shutdown is two-phase. First the in-progress state is captured as a final
//! flush request; only after those requests have been handed to the network
//! layer is the manager told to stop, so the flush can never be lost between
//! the two steps. After the stop, new commits fail fast.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::delegate::{CompletedResponse, ManagerKind, NodeTarget, PollResult, UnsentRequest};
use crate::error::{Error, KafkaCode};
use crate::events::Completer;
use crate::managers::{RequestManager, Signal, MAX_POLL_DELAY};
use crate::metadata::ClusterMetadata;
use crate::protocol::{PartitionOffsets, RequestBody, ResponseBody, JOIN_EPOCH};

/// Shutdown progress of the commit path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseState {
    /// Normal operation.
    Open,
    /// The final flush has been captured but not yet confirmed handed over.
    RequestsCaptured,
    /// No further commit work will be scheduled.
    Closing,
}

struct Outstanding {
    tag: u64,
    offsets: PartitionOffsets,
    completions: Vec<Completer<()>>,
}

pub(crate) struct CommitManager {
    group_id: String,
    member_id: String,
    member_epoch: i32,
    request_timeout: Duration,
    retry_backoff: Duration,
    auto_commit_interval: Option<Duration>,
    next_auto_commit_at: Option<Instant>,
    /// Positions the application has consumed up to, fed by record drains.
    consumed: PartitionOffsets,
    /// Offsets already folded into a commit, so auto-commit skips unchanged
    /// positions.
    committed: PartitionOffsets,
    pending: PartitionOffsets,
    pending_completions: Vec<Completer<()>>,
    outstanding: Option<Outstanding>,
    close_state: CloseState,
    next_tag: u64,
}

impl CommitManager {
    pub fn new(group_id: String, config: &RuntimeConfig) -> Self {
        Self {
            group_id,
            member_id: String::new(),
            member_epoch: JOIN_EPOCH,
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            auto_commit_interval: config.auto_commit_interval,
            next_auto_commit_at: None,
            consumed: PartitionOffsets::new(),
            committed: PartitionOffsets::new(),
            pending: PartitionOffsets::new(),
            pending_completions: vec![],
            outstanding: None,
            close_state: CloseState::Open,
            next_tag: 0,
        }
    }

    /// Follow the membership identity; commits carry the current epoch.
    pub fn set_membership(&mut self, member_id: String, member_epoch: i32) {
        self.member_id = member_id;
        self.member_epoch = member_epoch;
    }

    /// Record how far the application has consumed, for auto-commit.
    pub fn note_positions(&mut self, positions: PartitionOffsets) {
        if self.close_state != CloseState::Open {
            return;
        }
        self.consumed.extend(positions);
    }

    /// Queue an explicit commit. Coalesces with whatever is already pending.
    pub fn request_commit(
        &mut self,
        offsets: PartitionOffsets,
        completion: Option<Completer<()>>,
    ) {
        if self.close_state != CloseState::Open {
            if let Some(completion) = completion {
                completion.complete(Err(Error::RuntimeClosed));
            }
            return;
        }
        self.pending.extend(offsets);
        if let Some(completion) = completion {
            self.pending_completions.push(completion);
        }
    }

    /// First shutdown phase: capture everything still uncommitted (pending
    /// commits plus a final auto-commit of consumed positions) as requests.
    pub fn capture_close_requests(
        &mut self,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> Vec<UnsentRequest> {
        if self.close_state != CloseState::Open {
            return vec![];
        }
        self.close_state = CloseState::RequestsCaptured;
        self.fold_consumed();
        match self.build_request(now, metadata) {
            Some(request) => vec![request],
            None => vec![],
        }
    }

    /// Second shutdown phase, only valid once the captured requests have
    /// been handed to the network layer.
    pub fn signal_close(&mut self) {
        debug_assert!(
            self.close_state != CloseState::Open,
            "close signalled before the flush was captured"
        );
        self.close_state = CloseState::Closing;
        // Anything that slipped in between the phases can no longer be sent.
        for completion in self.pending_completions.drain(..) {
            completion.complete(Err(Error::RuntimeClosed));
        }
        self.pending.clear();
    }

    /// True while a commit request is still waiting for its response.
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    fn fold_consumed(&mut self) {
        let changed: PartitionOffsets = self
            .consumed
            .iter()
            .filter(|(tp, offset)| self.committed.get(*tp) != Some(*offset))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        self.pending.extend(changed);
    }

    fn build_request(
        &mut self,
        now: Instant,
        metadata: &ClusterMetadata,
    ) -> Option<UnsentRequest> {
        if self.pending.is_empty() || self.outstanding.is_some() {
            return None;
        }
        let coordinator = metadata.coordinator()?;

        let offsets = std::mem::take(&mut self.pending);
        let completions = std::mem::take(&mut self.pending_completions);
        let tag = self.next_tag;
        self.next_tag += 1;
        tracing::debug!(
            "Committing {} partition offsets for group {}",
            offsets.len(),
            self.group_id
        );
        self.outstanding = Some(Outstanding {
            tag,
            offsets: offsets.clone(),
            completions,
        });
        Some(UnsentRequest {
            target: NodeTarget::Node(coordinator),
            body: RequestBody::OffsetCommit {
                group_id: self.group_id.clone(),
                member_id: self.member_id.clone(),
                member_epoch: self.member_epoch,
                offsets,
            },
            origin: ManagerKind::Commit,
            tag,
            deadline: now + self.request_timeout,
        })
    }
}

impl RequestManager for CommitManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Commit
    }

    fn poll(&mut self, now: Instant, metadata: &ClusterMetadata) -> PollResult {
        if self.close_state != CloseState::Open {
            return PollResult::empty(MAX_POLL_DELAY);
        }

        if let Some(interval) = self.auto_commit_interval {
            match self.next_auto_commit_at {
                None => self.next_auto_commit_at = Some(now + interval),
                Some(at) if at <= now => {
                    self.fold_consumed();
                    self.next_auto_commit_at = Some(now + interval);
                }
                Some(_) => {}
            }
        }

        let timeout = self
            .next_auto_commit_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(MAX_POLL_DELAY);
        match self.build_request(now, metadata) {
            Some(request) => PollResult::new(timeout, vec![request]),
            None => PollResult::empty(timeout),
        }
    }

    fn handle_response(
        &mut self,
        response: CompletedResponse,
        now: Instant,
        _metadata: &ClusterMetadata,
    ) -> Vec<Signal> {
        let outstanding = match self.outstanding.take() {
            Some(outstanding) if outstanding.tag == response.tag => outstanding,
            other => {
                self.outstanding = other;
                return vec![];
            }
        };

        let failure = match response.result {
            Ok(ResponseBody::OffsetCommit {
                error_code: KafkaCode::None,
            }) => {
                for (tp, offset) in outstanding.offsets.iter() {
                    self.committed.insert(tp.clone(), *offset);
                }
                for completion in outstanding.completions {
                    completion.complete(Ok(()));
                }
                return vec![];
            }
            Ok(body) => {
                let code = body.error_code();
                if code.is_retriable() && self.close_state == CloseState::Open {
                    // Put the offsets back; newer commits still win.
                    for (tp, offset) in outstanding.offsets {
                        self.pending.entry(tp).or_insert(offset);
                    }
                    self.pending_completions.extend(outstanding.completions);
                    self.next_auto_commit_at = Some(now + self.retry_backoff);
                    let signal = match code {
                        KafkaCode::NotCoordinator | KafkaCode::CoordinatorNotAvailable => {
                            vec![Signal::CoordinatorUnknown]
                        }
                        _ => vec![],
                    };
                    return signal;
                }
                Error::KafkaError(code)
            }
            Err(error) => error,
        };

        tracing::warn!("Offset commit failed: {}", failure);
        for completion in outstanding.completions {
            completion.complete(Err(failure.clone()));
        }
        match &failure {
            Error::KafkaError(KafkaCode::NotCoordinator) => vec![Signal::CoordinatorUnknown],
            _ => vec![],
        }
    }

    /// During shutdown the only commit traffic is the already-captured flush;
    /// nothing new is scheduled here.
    fn poll_on_shutdown(&mut self, _now: Instant, _metadata: &ClusterMetadata) -> PollResult {
        PollResult::empty(MAX_POLL_DELAY)
    }
}
