//! Network client delegate: the single seam between the request managers and
//! the wire.
//!
//! Managers hand over [`UnsentRequest`]s; the delegate owns correlation id
//! assignment, per-node in-flight caps, connection backoff, and the deadline
//! sweep. Its bounded [`poll`](NetworkClientDelegate::poll) is the loop's
//! only suspension point, so a wakeup handle shared with the event queue can
//! cut the wait short when an application event arrives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::{NodeId, RequestBody, ResponseBody};
use crate::transport::{BrokerAddress, ConnectionState, Transport, TransportEvent, WireRequest};

/// Which manager produced a request; responses are routed back by this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    Coordinator,
    Heartbeat,
    Commit,
    Offsets,
    TopicMetadata,
    Fetch,
}

/// Destination of an unsent request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeTarget {
    /// A specific broker (partition leader, coordinator).
    Node(NodeId),
    /// Whichever ready broker has the fewest requests in flight; used for
    /// discovery and metadata where any broker can answer.
    LeastLoaded,
}

/// A request produced by a manager, not yet on the wire.
///
/// The manager-scoped `tag` lets the owning manager match the eventual
/// [`CompletedResponse`] to its own bookkeeping; the wire correlation id is
/// assigned later by the delegate.
#[derive(Debug)]
pub struct UnsentRequest {
    pub target: NodeTarget,
    pub body: RequestBody,
    pub origin: ManagerKind,
    pub tag: u64,
    pub deadline: Instant,
}

/// A manager's per-tick output: pending requests plus how long the loop may
/// wait before polling this manager again. The delay is advisory; response
/// arrival or a state change may poll sooner.
#[derive(Debug)]
pub struct PollResult {
    pub timeout: Duration,
    pub requests: Vec<UnsentRequest>,
}

impl PollResult {
    pub fn new(timeout: Duration, requests: Vec<UnsentRequest>) -> Self {
        Self { timeout, requests }
    }

    /// Nothing to do for at least `timeout`.
    pub fn empty(timeout: Duration) -> Self {
        Self {
            timeout,
            requests: vec![],
        }
    }
}

/// A finished request, successful or not, on its way back to the owning
/// manager. Delivered exactly once per request.
#[derive(Debug)]
pub struct CompletedResponse {
    pub origin: ManagerKind,
    pub tag: u64,
    pub node: NodeId,
    pub result: Result<ResponseBody>,
}

#[derive(Debug)]
struct InFlight {
    origin: ManagerKind,
    tag: u64,
    node: NodeId,
    deadline: Instant,
}

#[derive(Debug)]
struct NodeMeta {
    addr: BrokerAddress,
    in_flight: usize,
    failed_attempts: u32,
    retry_at: Option<Instant>,
}

pub struct NetworkClientDelegate<T: Transport> {
    transport: T,
    wakeup: Arc<Notify>,
    next_correlation_id: i32,
    unsent: VecDeque<UnsentRequest>,
    in_flight: HashMap<i32, InFlight>,
    nodes: HashMap<NodeId, NodeMeta>,
    max_in_flight_per_node: usize,
    retry_backoff: Duration,
    retry_backoff_max: Duration,
}

impl<T: Transport> NetworkClientDelegate<T> {
    pub fn new(
        transport: T,
        wakeup: Arc<Notify>,
        max_in_flight_per_node: usize,
        retry_backoff: Duration,
        retry_backoff_max: Duration,
    ) -> Self {
        Self {
            transport,
            wakeup,
            next_correlation_id: 1,
            unsent: VecDeque::new(),
            in_flight: HashMap::new(),
            nodes: HashMap::new(),
            max_in_flight_per_node,
            retry_backoff,
            retry_backoff_max,
        }
    }

    /// Register or update an addressable node. Never clobbers live counters.
    pub fn register_node(&mut self, node: NodeId, addr: BrokerAddress) {
        match self.nodes.get_mut(&node) {
            Some(meta) => meta.addr = addr,
            None => {
                self.nodes.insert(
                    node,
                    NodeMeta {
                        addr,
                        in_flight: 0,
                        failed_attempts: 0,
                        retry_at: None,
                    },
                );
            }
        }
    }

    /// Enqueue a request without blocking. Dispatch happens on the next
    /// poll; requests to the same node are released in submission order.
    pub fn send(&mut self, request: UnsentRequest) {
        tracing::trace!(
            "Queueing {:?} request from {:?} manager",
            request.body.api_kind(),
            request.origin
        );
        self.unsent.push_back(request);
    }

    pub fn has_pending(&self) -> bool {
        !self.in_flight.is_empty() || !self.unsent.is_empty()
    }

    pub fn in_flight_to(&self, node: NodeId) -> usize {
        self.nodes.get(&node).map(|m| m.in_flight).unwrap_or(0)
    }

    /// One I/O cycle bounded by `timeout`: sweep deadlines, flush sendable
    /// requests, wait for transport events, correlate, and return everything
    /// that completed.
    pub async fn poll(&mut self, timeout: Duration, now: Instant) -> Vec<CompletedResponse> {
        let mut completed = self.expire_deadlines(now);
        self.try_send(now, &mut completed);

        let wakeup = Arc::clone(&self.wakeup);
        // Skip the wait entirely when something already finished; the loop
        // should see it now.
        let wait = if completed.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        let events = tokio::select! {
            events = self.transport.poll(wait) => events,
            _ = wakeup.notified() => self.transport.poll(Duration::ZERO).await,
        };

        for event in events {
            self.handle_transport_event(event, now, &mut completed);
        }
        // Connections established during this cycle can carry queued work
        // right away.
        self.try_send(now, &mut completed);
        completed
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close_all();
        self.unsent.clear();
        self.in_flight.clear();
        for meta in self.nodes.values_mut() {
            meta.in_flight = 0;
        }
    }

    fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        completed: &mut Vec<CompletedResponse>,
    ) {
        match event {
            TransportEvent::Connected(node) => {
                tracing::debug!("Node {} connected", node);
                if let Some(meta) = self.nodes.get_mut(&node) {
                    meta.failed_attempts = 0;
                    meta.retry_at = None;
                }
            }
            TransportEvent::ConnectFailed(node, error)
            | TransportEvent::Disconnected(node, error) => {
                tracing::warn!("Node {} unavailable: {}", node, error);
                self.fail_node(node, error, now, completed);
            }
            TransportEvent::Response {
                node,
                correlation_id,
                result,
            } => match self.in_flight.remove(&correlation_id) {
                Some(in_flight) => {
                    if let Some(meta) = self.nodes.get_mut(&node) {
                        meta.in_flight = meta.in_flight.saturating_sub(1);
                    }
                    completed.push(CompletedResponse {
                        origin: in_flight.origin,
                        tag: in_flight.tag,
                        node,
                        result,
                    });
                }
                None => {
                    // Late arrival for a request that already timed out, or
                    // a broker bug. Either way it was resolved already.
                    tracing::debug!(
                        "Dropping response with unknown correlation id {}",
                        correlation_id
                    );
                }
            },
        }
    }

    /// Resolve every in-flight request whose deadline has elapsed with a
    /// timeout error. A response arriving later is dropped on correlation.
    fn expire_deadlines(&mut self, now: Instant) -> Vec<CompletedResponse> {
        let mut completed = vec![];
        let expired: Vec<i32> = self
            .in_flight
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in expired {
            if let Some(in_flight) = self.in_flight.remove(&correlation_id) {
                if let Some(meta) = self.nodes.get_mut(&in_flight.node) {
                    meta.in_flight = meta.in_flight.saturating_sub(1);
                }
                tracing::debug!(
                    "Request {} to node {} timed out",
                    correlation_id,
                    in_flight.node
                );
                completed.push(CompletedResponse {
                    origin: in_flight.origin,
                    tag: in_flight.tag,
                    node: in_flight.node,
                    result: Err(Error::RequestTimedOut),
                });
            }
        }

        let mut retained = VecDeque::new();
        for request in self.unsent.drain(..) {
            if request.deadline <= now {
                completed.push(CompletedResponse {
                    origin: request.origin,
                    tag: request.tag,
                    node: -1,
                    result: Err(Error::RequestTimedOut),
                });
            } else {
                retained.push_back(request);
            }
        }
        self.unsent = retained;
        completed
    }

    /// Move unsent requests onto the wire, respecting connection state, the
    /// per-node in-flight cap (FIFO release per node), and backoff fail-fast.
    fn try_send(&mut self, now: Instant, completed: &mut Vec<CompletedResponse>) {
        let mut retained = VecDeque::new();
        // Once one request for a node is held back, later requests for the
        // same node must be held back too, to preserve per-node FIFO.
        let mut blocked: HashSet<NodeId> = HashSet::new();

        let queued: Vec<UnsentRequest> = self.unsent.drain(..).collect();
        for request in queued {
            let node = match request.target {
                NodeTarget::Node(node) => node,
                NodeTarget::LeastLoaded => match self.least_loaded_ready_node() {
                    Some(node) => node,
                    None => {
                        self.connect_somewhere(now);
                        retained.push_back(request);
                        continue;
                    }
                },
            };

            if blocked.contains(&node) {
                retained.push_back(request);
                continue;
            }

            let meta = match self.nodes.get_mut(&node) {
                Some(meta) => meta,
                None => {
                    completed.push(CompletedResponse {
                        origin: request.origin,
                        tag: request.tag,
                        node,
                        result: Err(Error::NotConnected(node)),
                    });
                    continue;
                }
            };

            // Backoff window: fail fast instead of queueing indefinitely.
            if let Some(retry_at) = meta.retry_at {
                if retry_at > now {
                    completed.push(CompletedResponse {
                        origin: request.origin,
                        tag: request.tag,
                        node,
                        result: Err(Error::NodeInBackoff(node)),
                    });
                    continue;
                }
            }

            match self.transport.connection_state(node) {
                ConnectionState::Ready => {
                    if meta.in_flight >= self.max_in_flight_per_node {
                        blocked.insert(node);
                        retained.push_back(request);
                        continue;
                    }
                    let correlation_id = self.next_correlation_id();
                    let wire_request = WireRequest {
                        correlation_id,
                        body: request.body.clone(),
                    };
                    match self.transport.send(node, wire_request) {
                        Ok(()) => {
                            if let Some(meta) = self.nodes.get_mut(&node) {
                                meta.in_flight += 1;
                            }
                            self.in_flight.insert(
                                correlation_id,
                                InFlight {
                                    origin: request.origin,
                                    tag: request.tag,
                                    node,
                                    deadline: request.deadline,
                                },
                            );
                        }
                        Err(error) => {
                            self.fail_node(node, error, now, completed);
                            blocked.insert(node);
                        }
                    }
                }
                ConnectionState::Connecting => {
                    blocked.insert(node);
                    retained.push_back(request);
                }
                ConnectionState::Disconnected => {
                    let addr = meta.addr.clone();
                    self.transport.begin_connect(node, addr);
                    blocked.insert(node);
                    retained.push_back(request);
                }
            }
        }
        self.unsent = retained;
    }

    fn next_correlation_id(&mut self) -> i32 {
        // Unique among requests currently in flight to any node.
        loop {
            let id = self.next_correlation_id;
            self.next_correlation_id = self.next_correlation_id.wrapping_add(1).max(1);
            if !self.in_flight.contains_key(&id) {
                return id;
            }
        }
    }

    fn least_loaded_ready_node(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(node, meta)| {
                self.transport.connection_state(**node) == ConnectionState::Ready
                    && meta.in_flight < self.max_in_flight_per_node
            })
            .min_by_key(|(_, meta)| meta.in_flight)
            .map(|(node, _)| *node)
    }

    /// Kick off a connection to some known node that is neither connected
    /// nor in backoff, so least-loaded requests make progress.
    fn connect_somewhere(&mut self, now: Instant) {
        let candidate = self
            .nodes
            .iter()
            .find(|(node, meta)| {
                self.transport.connection_state(**node) == ConnectionState::Disconnected
                    && meta.retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|(node, meta)| (*node, meta.addr.clone()));
        if let Some((node, addr)) = candidate {
            self.transport.begin_connect(node, addr);
        }
    }

    fn fail_node(
        &mut self,
        node: NodeId,
        error: Error,
        now: Instant,
        completed: &mut Vec<CompletedResponse>,
    ) {
        let affected: Vec<i32> = self
            .in_flight
            .iter()
            .filter(|(_, r)| r.node == node)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in affected {
            if let Some(in_flight) = self.in_flight.remove(&correlation_id) {
                completed.push(CompletedResponse {
                    origin: in_flight.origin,
                    tag: in_flight.tag,
                    node,
                    result: Err(error.clone()),
                });
            }
        }
        if let Some(meta) = self.nodes.get_mut(&node) {
            meta.in_flight = 0;
            meta.failed_attempts += 1;
            let exponent = meta.failed_attempts.saturating_sub(1).min(16);
            let backoff = self
                .retry_backoff
                .saturating_mul(1 << exponent)
                .min(self.retry_backoff_max);
            meta.retry_at = Some(now + backoff);
            tracing::debug!(
                "Node {} in backoff for {:?} after {} failures",
                node,
                backoff,
                meta.failed_attempts
            );
        }
        self.transport.close(node);
    }
}
