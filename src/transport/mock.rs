//! In-memory transport for tests and offline experiments.
//!
//! Behaves like a cluster of instantly reachable brokers: `begin_connect`
//! succeeds on the next poll, and every sent request is answered by the
//! scripted handler (or deliberately left unanswered, for deadline and
//! backpressure scenarios).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{NodeId, ResponseBody};
use crate::transport::{
    BrokerAddress, ConnectionState, Transport, TransportEvent, WireRequest,
};

type Handler = Box<dyn FnMut(NodeId, &WireRequest) -> Option<ResponseBody> + Send>;

pub struct InMemoryTransport {
    handler: Handler,
    refuse: HashSet<NodeId>,
    connections: HashMap<NodeId, ConnectionState>,
    pending: VecDeque<TransportEvent>,
    /// Every request handed to `send`, in order.
    pub sent: Vec<(NodeId, WireRequest)>,
}

impl InMemoryTransport {
    pub fn new(
        handler: impl FnMut(NodeId, &WireRequest) -> Option<ResponseBody> + Send + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            refuse: HashSet::new(),
            connections: HashMap::new(),
            pending: VecDeque::new(),
            sent: vec![],
        }
    }

    /// A transport whose brokers accept connections but never answer.
    pub fn unresponsive() -> Self {
        Self::new(|_, _| None)
    }

    /// Make connection attempts to this node fail.
    pub fn refuse_connections_to(&mut self, node: NodeId) {
        self.refuse.insert(node);
        self.connections.remove(&node);
    }

    /// Inject an event (e.g. an unsolicited disconnect or a late response).
    pub fn push_event(&mut self, event: TransportEvent) {
        if let TransportEvent::Disconnected(node, _) = &event {
            self.connections.remove(node);
        }
        self.pending.push_back(event);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn connection_state(&self, node: NodeId) -> ConnectionState {
        self.connections
            .get(&node)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn begin_connect(&mut self, node: NodeId, _addr: BrokerAddress) {
        if self.refuse.contains(&node) {
            self.pending.push_back(TransportEvent::ConnectFailed(
                node,
                Error::IoError(std::io::ErrorKind::ConnectionRefused),
            ));
        } else {
            self.connections.insert(node, ConnectionState::Ready);
            self.pending.push_back(TransportEvent::Connected(node));
        }
    }

    fn send(&mut self, node: NodeId, request: WireRequest) -> Result<()> {
        if self.connection_state(node) != ConnectionState::Ready {
            return Err(Error::NotConnected(node));
        }
        let correlation_id = request.correlation_id;
        if let Some(body) = (self.handler)(node, &request) {
            self.pending.push_back(TransportEvent::Response {
                node,
                correlation_id,
                result: Ok(body),
            });
        }
        self.sent.push((node, request));
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        if self.pending.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        self.pending.drain(..).collect()
    }

    fn close(&mut self, node: NodeId) {
        self.connections.remove(&node);
    }

    fn close_all(&mut self) {
        self.connections.clear();
        self.pending.clear();
    }
}
