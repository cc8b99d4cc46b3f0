//! Connection & communication with brokers.
//!
//! The runtime drives all APIs as request/response message pairs. The wire
//! protocol itself is opaque here: a transport only needs to move framed
//! payloads with a correlation id to a destination node and to distinguish
//! "not yet connected" from "failed" from "succeeded". The concrete binary
//! encoding plugs in through [`WireCodec`].
//!
//! Clients should maintain one persistent connection per broker; requests to
//! the same broker are pipelined and the broker answers them in order, so a
//! correlation id is enough to match responses back to their requests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::protocol::{ApiKind, NodeId, RequestBody, ResponseBody};

pub mod mock;
pub mod tcp;

/// Host and port of a broker.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// A request as handed to the transport: payload plus the correlation id the
/// delegate assigned. The id is unique among requests currently in flight to
/// any node.
#[derive(Clone, Debug, PartialEq)]
pub struct WireRequest {
    pub correlation_id: i32,
    pub body: RequestBody,
}

/// Connection lifecycle of one node, as observable by the delegate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// Everything a bounded I/O cycle can surface.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(NodeId),
    ConnectFailed(NodeId, crate::error::Error),
    Disconnected(NodeId, crate::error::Error),
    Response {
        node: NodeId,
        correlation_id: i32,
        result: Result<ResponseBody>,
    },
}

/// Non-blocking, multiplexing broker transport.
///
/// `send` and `begin_connect` never block; `poll` performs exactly one I/O
/// cycle bounded by the given timeout and returns whatever completed in the
/// meantime.
#[async_trait]
pub trait Transport: Send + 'static {
    fn connection_state(&self, node: NodeId) -> ConnectionState;

    /// Start connecting to a node. Completion (or failure) is reported as a
    /// [`TransportEvent`] from a later `poll`.
    fn begin_connect(&mut self, node: NodeId, addr: BrokerAddress);

    /// Queue a request on an established connection.
    fn send(&mut self, node: NodeId, request: WireRequest) -> Result<()>;

    /// One bounded multiplexing cycle. Returns early if events are already
    /// available; otherwise waits at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    /// Tear down a single connection.
    fn close(&mut self, node: NodeId);

    /// Tear down everything; used when the loop reaches its terminal state.
    fn close_all(&mut self);
}

/// Seam for the externally provided record/protocol serialization.
///
/// `encode` must embed the correlation id in the request header; `decode`
/// receives the response payload with the correlation id already stripped.
pub trait WireCodec: Send + Sync + 'static {
    fn encode(&self, correlation_id: i32, body: &RequestBody) -> Result<Bytes>;
    fn decode(&self, api: ApiKind, payload: Bytes) -> Result<ResponseBody>;
}
