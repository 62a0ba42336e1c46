//! Transport seam between an upgraded duplex channel and the connection pumps.
//!
//! Whatever accepted the client (the axum upgrade handler, or an embedder
//! with its own framing) hands over something implementing [`Transport`].
//! The pumps only ever see [`Frame`]s.

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use thiserror::Error;

/// Transport-neutral frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data frame.
    Text(String),
    /// Binary data frame.
    Binary(Bytes),
    /// Transport-level ping.
    Ping(Bytes),
    /// Transport-level pong.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl Frame {
    /// Length of the data carried by a text or binary frame.
    pub fn data_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Ping(_) | Self::Pong(_) | Self::Close => 0,
        }
    }
}

/// Failure reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The other side is gone.
    #[error("transport closed")]
    Closed,
    /// Protocol or I/O failure, with the underlying message.
    #[error("transport error: {0}")]
    Protocol(String),
}

impl From<axum::Error> for TransportError {
    fn from(err: axum::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Inbound half of a split transport.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Outbound half of a split transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// An upgraded duplex channel.
pub trait Transport: Send + 'static {
    /// Split into independently owned write and read halves.
    fn split(self) -> (FrameSink, FrameStream);
}

// ── axum WebSocket ──────────────────────────────────────────────────────────

/// [`Transport`] over an upgraded axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Self::Text(text.as_str().to_owned()),
            Message::Binary(data) => Self::Binary(data),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(_) => Self::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close => Self::Close(None),
        }
    }
}

impl Transport for WsTransport {
    fn split(self) -> (FrameSink, FrameStream) {
        let (sink, stream) = self.socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = stream.map(|item| item.map(Frame::from).map_err(TransportError::from));
        (Box::pin(sink), stream.boxed())
    }
}

// ── In-process pair ─────────────────────────────────────────────────────────

/// Server side of an in-process transport.
pub struct MemoryTransport {
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
    outbound: mpsc::Sender<Frame>,
}

/// Client side of an in-process transport.
pub struct MemoryPeer {
    to_server: mpsc::Sender<Result<Frame, TransportError>>,
    from_server: mpsc::Receiver<Frame>,
}

/// Create a connected in-process pair with room for 64 frames each way.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    memory_pair_with_capacity(64)
}

/// Create a connected in-process pair with the given per-direction buffer.
///
/// A small buffer on an unread peer makes server writes block, which is how
/// write deadlines are exercised without a socket.
pub fn memory_pair_with_capacity(capacity: usize) -> (MemoryTransport, MemoryPeer) {
    let (to_server, inbound) = mpsc::channel(capacity);
    let (outbound, from_server) = mpsc::channel(capacity);
    (
        MemoryTransport { inbound, outbound },
        MemoryPeer {
            to_server,
            from_server,
        },
    )
}

impl Transport for MemoryTransport {
    fn split(self) -> (FrameSink, FrameStream) {
        let sink = self.outbound.sink_map_err(|_| TransportError::Closed);
        (Box::pin(sink), self.inbound.boxed())
    }
}

impl MemoryPeer {
    /// Deliver a frame to the server.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.to_server
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver a text frame to the server.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Make the server's next read fail with `err`.
    pub async fn inject_error(&mut self, err: TransportError) -> Result<(), TransportError> {
        self.to_server
            .send(Err(err))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next frame written by the server; `None` once the server side is dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_server.next().await
    }

    /// Stop sending; the server's read stream ends.
    pub fn hang_up(&mut self) {
        self.to_server.close_channel();
    }
}
