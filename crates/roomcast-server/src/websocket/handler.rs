//! Inbound message dispatch: decodes one frame and routes it by type.

use metrics::counter;
use roomcast_core::ids::ConnectionId;
use roomcast_core::{Envelope, MessageKind};
use tracing::{debug, info, instrument, warn};

use crate::hub::{BroadcastReport, Hub, HubError};
use crate::metrics::WS_MESSAGES_ROUTED_TOTAL;
use crate::websocket::connection::ConnectionAttrs;

/// Who sent the frame being dispatched.
#[derive(Clone, Debug)]
pub struct InboundContext {
    /// Sending connection.
    pub id: ConnectionId,
    /// Its accept-time identity.
    pub attrs: ConnectionAttrs,
}

/// What a dispatched frame turned into.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// A chat message fanned out to the sender's room.
    Broadcast(BroadcastReport),
    /// A chat message from a connection with no room; dropped.
    NoRoom,
    /// A notification; logged, not routed.
    NotificationLogged,
    /// A ping; pong queued back to the sender.
    PongQueued,
    /// Any other type; logged and discarded.
    Ignored(String),
    /// Not a valid envelope; logged, connection kept.
    Malformed,
}

/// Decode and dispatch one inbound frame.
///
/// Only a stopped hub is an error. Bad input never is.
#[instrument(skip_all, fields(conn_id = %ctx.id))]
pub async fn handle_inbound(
    raw: &[u8],
    ctx: &InboundContext,
    hub: &Hub,
) -> Result<Dispatch, HubError> {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(%error, len = raw.len(), "malformed inbound frame");
            return Ok(Dispatch::Malformed);
        }
    };

    match envelope.kind {
        MessageKind::Chat(payload) => {
            let Some(room) = ctx.attrs.room_id.clone() else {
                debug!("chat from connection without a room, dropping");
                return Ok(Dispatch::NoRoom);
            };
            // Sender and room come from the connection, never the frame.
            let outbound = Envelope::chat(payload)
                .with_user(ctx.attrs.user_id.clone())
                .with_room(Some(room.clone()));
            let report = hub.broadcast_room(&room, &outbound).await?;
            counter!(WS_MESSAGES_ROUTED_TOTAL, "type" => "chat").increment(1);
            debug!(room_id = %room, delivered = report.delivered, "chat routed");
            Ok(Dispatch::Broadcast(report))
        }
        MessageKind::Notification(payload) => {
            info!(
                user_id = ?envelope.user_id.as_ref().map(|u| u.as_str()),
                %payload,
                "notification received"
            );
            Ok(Dispatch::NotificationLogged)
        }
        MessageKind::Ping(_) => {
            let _ = hub.send_to(&ctx.id, &Envelope::pong()).await?;
            counter!(WS_MESSAGES_ROUTED_TOTAL, "type" => "pong").increment(1);
            Ok(Dispatch::PongQueued)
        }
        other => {
            let kind = other.type_name().to_owned();
            info!(kind = %kind, "unknown message type, ignoring");
            Ok(Dispatch::Ignored(kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Connection, ConnectionHandle};
    use roomcast_core::ids::{RoomId, UserId};

    struct Peer {
        handle: ConnectionHandle,
        // Keeps the queue receiver alive.
        _conn: Connection,
    }

    fn peer(user: Option<&str>, room: Option<&str>) -> Peer {
        let attrs = ConnectionAttrs::new(
            user.and_then(UserId::new),
            room.and_then(RoomId::new),
        );
        let (conn, handle) = Connection::new(attrs, 16);
        Peer {
            handle,
            _conn: conn,
        }
    }

    fn ctx(p: &Peer) -> InboundContext {
        InboundContext {
            id: p.handle.id().clone(),
            attrs: ConnectionAttrs::new(p.handle.user_id().cloned(), p.handle.room_id().cloned()),
        }
    }

    #[tokio::test]
    async fn malformed_is_tolerated() {
        let (hub, _task) = Hub::spawn();
        let a = peer(Some("u1"), Some("general"));
        let out = handle_inbound(b"not json", &ctx(&a), &hub).await.unwrap();
        assert_eq!(out, Dispatch::Malformed);
    }

    #[tokio::test]
    async fn chat_without_room_is_dropped() {
        let (hub, _task) = Hub::spawn();
        let a = peer(Some("u1"), None);
        let out = handle_inbound(br#"{"type":"chat","payload":"hi"}"#, &ctx(&a), &hub)
            .await
            .unwrap();
        assert_eq!(out, Dispatch::NoRoom);
    }

    #[tokio::test]
    async fn chat_reaches_room_including_sender() {
        let (hub, _task) = Hub::spawn();
        let a = peer(Some("u1"), Some("general"));
        let b = peer(Some("u2"), Some("general"));
        let c = peer(Some("u3"), Some("other"));
        for p in [&a, &b, &c] {
            assert!(hub.register(p.handle.clone()).await.unwrap());
        }

        let out = handle_inbound(br#"{"type":"chat","payload":"hi"}"#, &ctx(&a), &hub)
            .await
            .unwrap();
        match out {
            Dispatch::Broadcast(report) => {
                assert_eq!(report.delivered, 2);
                assert!(report.evicted.is_empty());
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
        // greeting + chat for room members, greeting only for the outsider
        assert_eq!(a.handle.pending(), 2);
        assert_eq!(b.handle.pending(), 2);
        assert_eq!(c.handle.pending(), 1);
    }

    #[tokio::test]
    async fn chat_sender_identity_cannot_be_spoofed() {
        let (hub, _task) = Hub::spawn();
        let (conn, handle) = Connection::new(
            ConnectionAttrs::new(UserId::new("u1"), RoomId::new("general")),
            16,
        );
        let mut rx = conn.into_receiver();
        assert!(hub.register(handle.clone()).await.unwrap());
        let _greeting = rx.recv().await.unwrap();

        let ctx = InboundContext {
            id: handle.id().clone(),
            attrs: ConnectionAttrs::new(UserId::new("u1"), RoomId::new("general")),
        };
        let _ = handle_inbound(
            br#"{"type":"chat","payload":"hi","user_id":"mallory","room_id":"elsewhere"}"#,
            &ctx,
            &hub,
        )
        .await
        .unwrap();

        let msg = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type":"chat","payload":"hi","user_id":"u1","room_id":"general"})
        );
    }

    #[tokio::test]
    async fn ping_queues_pong_to_sender_only() {
        let (hub, _task) = Hub::spawn();
        let a = peer(Some("u1"), Some("general"));
        let b = peer(Some("u2"), Some("general"));
        assert!(hub.register(a.handle.clone()).await.unwrap());
        assert!(hub.register(b.handle.clone()).await.unwrap());

        let out = handle_inbound(br#"{"type":"ping","payload":null}"#, &ctx(&a), &hub)
            .await
            .unwrap();
        assert_eq!(out, Dispatch::PongQueued);
        assert_eq!(a.handle.pending(), 2);
        assert_eq!(b.handle.pending(), 1);
    }

    #[tokio::test]
    async fn notification_is_not_routed() {
        let (hub, _task) = Hub::spawn();
        let a = peer(Some("u1"), Some("notifications"));
        let b = peer(Some("u2"), Some("notifications"));
        assert!(hub.register(a.handle.clone()).await.unwrap());
        assert!(hub.register(b.handle.clone()).await.unwrap());

        let out = handle_inbound(
            br#"{"type":"notification","payload":{"text":"x"}}"#,
            &ctx(&a),
            &hub,
        )
        .await
        .unwrap();
        assert_eq!(out, Dispatch::NotificationLogged);
        assert_eq!(b.handle.pending(), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let (hub, _task) = Hub::spawn();
        let a = peer(None, None);
        let out = handle_inbound(br#"{"type":"typing","payload":true}"#, &ctx(&a), &hub)
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Ignored("typing".into()));
    }

    #[tokio::test]
    async fn stopped_hub_is_an_error() {
        let (hub, task) = Hub::spawn();
        task.abort();
        let _ = task.await;
        let a = peer(Some("u1"), Some("general"));
        let err = handle_inbound(br#"{"type":"ping"}"#, &ctx(&a), &hub)
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Unavailable);
    }
}
