//! TCP transport with one persistent connection per broker.
//!
//! Frames are size delimited: a 4-byte big-endian length followed by the
//! payload. Response payloads lead with the 4-byte correlation id, which is
//! all this layer reads; the rest of the payload goes to the [`WireCodec`].
//!
//! Each connection runs a reader task and a writer task on the loop's
//! runtime. They communicate with the transport through an event channel, so
//! `poll` stays a single bounded wait no matter how many brokers are
//! connected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::protocol::{ApiKind, NodeId};
use crate::transport::{
    BrokerAddress, ConnectionState, Transport, TransportEvent, WireCodec, WireRequest,
};

enum RawEvent {
    Connected {
        node: NodeId,
        writer_tx: UnboundedSender<Bytes>,
    },
    ConnectFailed(NodeId, Error),
    Disconnected(NodeId, Error),
    Frame {
        node: NodeId,
        correlation_id: i32,
        payload: Bytes,
    },
}

struct Connection {
    state: ConnectionState,
    writer_tx: Option<UnboundedSender<Bytes>>,
}

pub struct TcpTransport<C: WireCodec> {
    codec: Arc<C>,
    connections: HashMap<NodeId, Connection>,
    // correlation id -> API of the request, so responses can be decoded.
    pending_api: HashMap<i32, ApiKind>,
    events_tx: UnboundedSender<RawEvent>,
    events_rx: UnboundedReceiver<RawEvent>,
}

impl<C: WireCodec> TcpTransport<C> {
    pub fn new(codec: C) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            codec: Arc::new(codec),
            connections: HashMap::new(),
            pending_api: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    fn translate(&mut self, raw: RawEvent) -> TransportEvent {
        match raw {
            RawEvent::Connected { node, writer_tx } => {
                self.connections.insert(
                    node,
                    Connection {
                        state: ConnectionState::Ready,
                        writer_tx: Some(writer_tx),
                    },
                );
                TransportEvent::Connected(node)
            }
            RawEvent::ConnectFailed(node, error) => {
                self.connections.remove(&node);
                TransportEvent::ConnectFailed(node, error)
            }
            RawEvent::Disconnected(node, error) => {
                self.connections.remove(&node);
                TransportEvent::Disconnected(node, error)
            }
            RawEvent::Frame {
                node,
                correlation_id,
                payload,
            } => {
                let result = match self.pending_api.remove(&correlation_id) {
                    Some(api) => self.codec.decode(api, payload),
                    None => Err(Error::UnexpectedCorrelationId(correlation_id)),
                };
                TransportEvent::Response {
                    node,
                    correlation_id,
                    result,
                }
            }
        }
    }
}

#[async_trait]
impl<C: WireCodec> Transport for TcpTransport<C> {
    fn connection_state(&self, node: NodeId) -> ConnectionState {
        self.connections
            .get(&node)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn begin_connect(&mut self, node: NodeId, addr: BrokerAddress) {
        if let Some(connection) = self.connections.get(&node) {
            if connection.state != ConnectionState::Disconnected {
                return;
            }
        }
        self.connections.insert(
            node,
            Connection {
                state: ConnectionState::Connecting,
                writer_tx: None,
            },
        );
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tracing::debug!("Connecting to node {} at {}:{}", node, addr.host, addr.port);
            match TcpStream::connect((addr.host.as_str(), addr.port)).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    let (writer_tx, writer_rx) = unbounded_channel();
                    tokio::spawn(run_reader(node, read_half, events_tx.clone()));
                    tokio::spawn(run_writer(node, write_half, writer_rx, events_tx.clone()));
                    let _ = events_tx.send(RawEvent::Connected { node, writer_tx });
                }
                Err(e) => {
                    tracing::error!("ERROR: Connecting to node {} {:?}", node, e);
                    let _ = events_tx.send(RawEvent::ConnectFailed(node, Error::IoError(e.kind())));
                }
            }
        });
    }

    fn send(&mut self, node: NodeId, request: WireRequest) -> Result<()> {
        let connection = self
            .connections
            .get(&node)
            .filter(|c| c.state == ConnectionState::Ready)
            .ok_or(Error::NotConnected(node))?;

        let payload = self
            .codec
            .encode(request.correlation_id, &request.body)?;
        let mut buffer = BytesMut::with_capacity(4 + payload.len());
        buffer.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        buffer.extend_from_slice(&payload);

        self.pending_api
            .insert(request.correlation_id, request.body.api_kind());

        let writer_tx = connection.writer_tx.as_ref().ok_or(Error::NotConnected(node))?;
        writer_tx
            .send(buffer.freeze())
            .map_err(|_| Error::NotConnected(node))
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut events = vec![];

        // Drain anything already queued without waiting.
        while let Ok(raw) = self.events_rx.try_recv() {
            let event = self.translate(raw);
            events.push(event);
        }
        if !events.is_empty() {
            return events;
        }

        // Nothing ready; this bounded wait is the loop's sleep point.
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            raw = self.events_rx.recv() => {
                if let Some(raw) = raw {
                    let event = self.translate(raw);
                    events.push(event);
                    while let Ok(raw) = self.events_rx.try_recv() {
                        let event = self.translate(raw);
                        events.push(event);
                    }
                }
            }
        }

        events
    }

    fn close(&mut self, node: NodeId) {
        // Dropping the writer sender ends the writer task; the reader ends
        // when the peer closes the socket.
        self.connections.remove(&node);
    }

    fn close_all(&mut self) {
        self.connections.clear();
        self.pending_api.clear();
    }
}

#[instrument(name = "network-read", level = "trace", skip(read_half, events_tx))]
async fn run_reader(
    node: NodeId,
    mut read_half: OwnedReadHalf,
    events_tx: UnboundedSender<RawEvent>,
) {
    loop {
        let mut size = [0u8; 4];
        if let Err(e) = read_half.read_exact(&mut size).await {
            let _ = events_tx.send(RawEvent::Disconnected(node, Error::IoError(e.kind())));
            return;
        }
        let length = u32::from_be_bytes(size) as usize;
        tracing::trace!("Reading {} bytes from node {}", length, node);
        if length < 4 {
            let _ = events_tx.send(RawEvent::Disconnected(
                node,
                Error::IoError(std::io::ErrorKind::InvalidData),
            ));
            return;
        }
        let mut frame = BytesMut::zeroed(length);
        if let Err(e) = read_half.read_exact(&mut frame).await {
            tracing::error!("ERROR: Reading on Socket {:?}", e);
            let _ = events_tx.send(RawEvent::Disconnected(node, Error::IoError(e.kind())));
            return;
        }
        let mut frame = frame.freeze();
        let correlation_id = frame.get_i32();
        let _ = events_tx.send(RawEvent::Frame {
            node,
            correlation_id,
            payload: frame,
        });
    }
}

#[instrument(name = "network-write", level = "trace", skip(write_half, writer_rx, events_tx))]
async fn run_writer(
    node: NodeId,
    mut write_half: OwnedWriteHalf,
    mut writer_rx: UnboundedReceiver<Bytes>,
    events_tx: UnboundedSender<RawEvent>,
) {
    while let Some(buffer) = writer_rx.recv().await {
        tracing::trace!("Sending {} bytes to node {}", buffer.len(), node);
        if let Err(e) = write_half.write_all(&buffer).await {
            tracing::error!("ERROR: Writing to Socket {:?}", e);
            let _ = events_tx.send(RawEvent::Disconnected(node, Error::IoError(e.kind())));
            return;
        }
    }
}
