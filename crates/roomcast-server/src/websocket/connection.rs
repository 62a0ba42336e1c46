//! A single client connection: its hub-facing handle and its two pumps.
//!
//! [`Connection::new`] yields the pump side and a [`ConnectionHandle`] for
//! the hub. The hub enqueues onto the handle without ever blocking; the
//! write pump drains the queue onto the transport, and the read pump feeds
//! inbound frames to the dispatcher. Either pump exiting tears down both.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use roomcast_core::ids::{ConnectionId, RoomId, UserId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::hub::Hub;
use crate::websocket::handler::{InboundContext, handle_inbound};
use crate::websocket::keepalive::{KeepaliveConfig, ReadDeadline};
use crate::websocket::transport::{Frame, FrameSink, FrameStream, Transport, TransportError};

/// A serialized text frame waiting in a connection's outbound queue.
pub type Outbound = Arc<String>;

/// Identity a connection was accepted with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionAttrs {
    /// Owning user, if the endpoint carried one.
    pub user_id: Option<UserId>,
    /// Room joined at accept time, if any.
    pub room_id: Option<RoomId>,
}

impl ConnectionAttrs {
    /// A connection with no user and no room.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A connection with the given user and room.
    pub fn new(user_id: Option<UserId>, room_id: Option<RoomId>) -> Self {
        Self { user_id, room_id }
    }
}

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Created, pumps not yet running.
    Connecting,
    /// Pumps running.
    Active,
    /// A pump has exited; teardown in progress.
    Closing,
    /// Unregistered and both pumps stopped.
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: Mutex<ConnectionState>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if it is later than the current state.
    fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Why a non-blocking enqueue failed. Either way the hub evicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity.
    #[error("outbound queue full")]
    Full,
    /// The queue has been closed.
    #[error("outbound queue closed")]
    Closed,
}

/// The hub's view of a connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    attrs: ConnectionAttrs,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionHandle {
    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning user, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        self.attrs.user_id.as_ref()
    }

    /// Joined room, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.attrs.room_id.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.get()
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, message: Outbound) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue. The write pump sends whatever is already
    /// queued, then a close frame. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    /// Whether the outbound queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages currently waiting in the outbound queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// The peer sent a close frame or its stream ended.
    #[error("peer closed the connection")]
    PeerClosed,
    /// The hub closed the outbound queue.
    #[error("outbound queue closed")]
    QueueClosed,
    /// Torn down because the other pump exited.
    #[error("cancelled")]
    Cancelled,
    /// No pong within the read deadline.
    #[error("no pong within {0:?}")]
    ReadTimeout(Duration),
    /// Inbound data frame over the size limit.
    #[error("inbound frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Received size in bytes.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Reading from the transport failed.
    #[error("read failed: {0}")]
    ReadFailed(TransportError),
    /// Writing to the transport failed.
    #[error("write failed: {0}")]
    WriteFailed(TransportError),
    /// A write did not complete within the write deadline.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    /// The hub stopped while dispatching an inbound message.
    #[error("hub unavailable")]
    HubUnavailable,
    /// A pump task panicked or was aborted.
    #[error("pump task failed: {0}")]
    TaskFailed(String),
}

impl DisconnectReason {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::QueueClosed => "queue_closed",
            Self::Cancelled => "cancelled",
            Self::ReadTimeout(_) => "read_timeout",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::ReadFailed(_) => "read_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::WriteTimeout(_) => "write_timeout",
            Self::HubUnavailable => "hub_unavailable",
            Self::TaskFailed(_) => "task_failed",
        }
    }

    /// Whether this is an orderly close rather than a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::QueueClosed | Self::Cancelled)
    }
}

/// The pump side of a connection.
pub struct Connection {
    id: ConnectionId,
    attrs: ConnectionAttrs,
    rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    lifecycle: Arc<Lifecycle>,
}

impl Connection {
    /// Create a connection with a fresh id and an outbound queue of
    /// `capacity` messages.
    pub fn new(attrs: ConnectionAttrs, capacity: usize) -> (Self, ConnectionHandle) {
        Self::with_id(ConnectionId::new(), attrs, capacity)
    }

    /// Like [`Connection::new`] with a caller-chosen id.
    pub fn with_id(
        id: ConnectionId,
        attrs: ConnectionAttrs,
        capacity: usize,
    ) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let lifecycle = Arc::new(Lifecycle::new());
        let handle = ConnectionHandle {
            id: id.clone(),
            attrs: attrs.clone(),
            tx,
            closed: closed.clone(),
            lifecycle: Arc::clone(&lifecycle),
        };
        let conn = Self {
            id,
            attrs,
            rx,
            closed,
            lifecycle,
        };
        (conn, handle)
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[cfg(test)]
    pub(crate) fn into_receiver(self) -> mpsc::Receiver<Outbound> {
        self.rx
    }

    /// Run both pumps over `transport` until either exits, then unregister.
    ///
    /// Returns the reason reported by whichever pump exited first. By the
    /// time this returns, the connection is out of the hub and both halves
    /// of the transport have been dropped.
    pub async fn run<T: Transport>(
        self,
        transport: T,
        hub: Hub,
        keepalive: KeepaliveConfig,
    ) -> DisconnectReason {
        let Self {
            id,
            attrs,
            rx,
            closed,
            lifecycle,
        } = self;
        let _ = lifecycle.advance(ConnectionState::Active);

        let (sink, stream) = transport.split();
        let cancel = CancellationToken::new();
        let span = info_span!("connection", conn_id = %id);

        let mut writer: JoinHandle<DisconnectReason> = tokio::spawn(
            write_pump(sink, rx, closed, cancel.clone(), keepalive.clone())
                .instrument(span.clone()),
        );
        let ctx = InboundContext {
            id: id.clone(),
            attrs,
        };
        let mut reader: JoinHandle<DisconnectReason> = tokio::spawn(
            read_pump(stream, ctx, hub.clone(), cancel.clone(), keepalive).instrument(span),
        );

        let (reason, writer_exited) = tokio::select! {
            res = &mut writer => (joined(res), true),
            res = &mut reader => (joined(res), false),
        };
        let survivor = if writer_exited { reader } else { writer };
        let _ = lifecycle.advance(ConnectionState::Closing);
        cancel.cancel();
        let other = joined(survivor.await);
        debug!(conn_id = %id, %reason, %other, "pumps stopped");

        if let Err(error) = hub.unregister(&id).await {
            warn!(conn_id = %id, %error, "unregister failed");
        }
        let _ = lifecycle.advance(ConnectionState::Closed);
        reason
    }
}

fn joined(res: Result<DisconnectReason, tokio::task::JoinError>) -> DisconnectReason {
    res.unwrap_or_else(|e| DisconnectReason::TaskFailed(e.to_string()))
}

// ── Write pump ──────────────────────────────────────────────────────────────

async fn write_pump(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    cancel: CancellationToken,
    keepalive: KeepaliveConfig,
) -> DisconnectReason {
    let period = keepalive.ping_period;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return DisconnectReason::Cancelled,
            msg = rx.recv() => match msg {
                Some(text) => {
                    if let Err(reason) = write(&mut sink, text_frame(&text), keepalive.write_wait).await {
                        return reason;
                    }
                }
                None => return close_out(&mut sink, keepalive.write_wait).await,
            },
            () = closed.cancelled() => {
                while let Ok(text) = rx.try_recv() {
                    if let Err(reason) = write(&mut sink, text_frame(&text), keepalive.write_wait).await {
                        return reason;
                    }
                }
                return close_out(&mut sink, keepalive.write_wait).await;
            }
            _ = ticker.tick() => {
                if let Err(reason) = write(&mut sink, Frame::Ping(bytes::Bytes::new()), keepalive.write_wait).await {
                    return reason;
                }
            }
        }
    }
}

fn text_frame(text: &Outbound) -> Frame {
    Frame::Text(String::clone(text))
}

async fn write(sink: &mut FrameSink, frame: Frame, wait: Duration) -> Result<(), DisconnectReason> {
    match time::timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DisconnectReason::WriteFailed(e)),
        Err(_) => Err(DisconnectReason::WriteTimeout(wait)),
    }
}

async fn close_out(sink: &mut FrameSink, wait: Duration) -> DisconnectReason {
    if let Err(reason) = write(sink, Frame::Close, wait).await {
        debug!(%reason, "close frame not delivered");
    }
    DisconnectReason::QueueClosed
}

// ── Read pump ───────────────────────────────────────────────────────────────

async fn read_pump(
    mut stream: FrameStream,
    ctx: InboundContext,
    hub: Hub,
    cancel: CancellationToken,
    keepalive: KeepaliveConfig,
) -> DisconnectReason {
    let mut deadline = ReadDeadline::new(keepalive.pong_wait);
    let limit = keepalive.max_message_size;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return DisconnectReason::Cancelled,
            next = time::timeout_at(deadline.at(), stream.next()) => next,
        };
        let frame = match next {
            Err(_) => return DisconnectReason::ReadTimeout(deadline.wait()),
            Ok(None) => return DisconnectReason::PeerClosed,
            Ok(Some(Err(e))) => return DisconnectReason::ReadFailed(e),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Pong(_) => deadline.refresh(),
            // Transports answer pings themselves.
            Frame::Ping(_) => {}
            Frame::Close => return DisconnectReason::PeerClosed,
            Frame::Text(_) | Frame::Binary(_) => {
                let size = frame.data_len();
                if size > limit {
                    return DisconnectReason::FrameTooLarge { size, limit };
                }
                let raw: &[u8] = match &frame {
                    Frame::Text(text) => text.as_bytes(),
                    Frame::Binary(data) => data.as_ref(),
                    _ => &[],
                };
                if let Err(error) = handle_inbound(raw, &ctx, &hub).await {
                    warn!(%error, "dispatch failed");
                    return DisconnectReason::HubUnavailable;
                }
            }
        }
    }
}
