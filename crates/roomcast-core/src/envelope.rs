//! The message envelope exchanged over every connection.
//!
//! On the wire an envelope is one UTF-8 JSON object per frame:
//!
//! ```json
//! {"type": "chat", "payload": "hi", "user_id": "u1", "room_id": "general"}
//! ```
//!
//! In memory the `type` tag selects a [`MessageKind`] variant. Unrecognised
//! tags are kept as [`MessageKind::Unknown`] instead of failing to decode.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::ids::{RoomId, UserId};

/// Payload of the greeting sent to every freshly registered connection.
pub const CONNECTED_GREETING: &str = "Successfully connected to WebSocket";

/// Payload of the reply to an application-level `ping`.
pub const PONG_REPLY: &str = "pong";

/// Typed body of an envelope, selected by the wire `type` field.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageKind {
    /// Server → client greeting after registration.
    Connected(String),
    /// Room-scoped chat message.
    Chat(Value),
    /// Informational message; logged by the server, never routed.
    Notification(Value),
    /// Application-level liveness probe from a client.
    Ping(Value),
    /// Reply to [`MessageKind::Ping`].
    Pong(String),
    /// Any other `type`, preserved for forward compatibility.
    Unknown {
        /// The raw `type` tag.
        kind: String,
        /// The raw payload.
        payload: Value,
    },
}

impl MessageKind {
    /// The wire `type` tag for this variant.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Connected(_) => "connected",
            Self::Chat(_) => "chat",
            Self::Notification(_) => "notification",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// A decoded frame: typed body plus optional sender/room attribution.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "WireEnvelope")]
pub struct Envelope {
    /// Typed body.
    pub kind: MessageKind,
    /// Originating or addressed user, omitted on the wire when absent.
    pub user_id: Option<UserId>,
    /// Room the message belongs to, omitted on the wire when absent.
    pub room_id: Option<RoomId>,
}

impl Envelope {
    /// Envelope with no attribution.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            user_id: None,
            room_id: None,
        }
    }

    /// Greeting for a newly registered connection.
    pub fn connected(user_id: Option<UserId>) -> Self {
        Self {
            user_id,
            ..Self::new(MessageKind::Connected(CONNECTED_GREETING.to_owned()))
        }
    }

    /// Reply to a client `ping`.
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong(PONG_REPLY.to_owned()))
    }

    /// Chat message with the given payload.
    pub fn chat(payload: Value) -> Self {
        Self::new(MessageKind::Chat(payload))
    }

    /// Notification with the given payload.
    pub fn notification(payload: Value) -> Self {
        Self::new(MessageKind::Notification(payload))
    }

    /// Set the user attribution.
    #[must_use]
    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Set the room attribution.
    #[must_use]
    pub fn with_room(mut self, room_id: Option<RoomId>) -> Self {
        self.room_id = room_id;
        self
    }

    /// Decode one inbound frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wire shape used for decoding.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let kind = match (wire.kind.as_str(), wire.payload) {
            ("connected", Value::String(s)) => MessageKind::Connected(s),
            ("pong", Value::String(s)) => MessageKind::Pong(s),
            ("chat", payload) => MessageKind::Chat(payload),
            ("notification", payload) => MessageKind::Notification(payload),
            ("ping", payload) => MessageKind::Ping(payload),
            (other, payload) => MessageKind::Unknown {
                kind: other.to_owned(),
                payload,
            },
        };
        Self {
            kind,
            user_id: UserId::from_optional(wire.user_id),
            room_id: RoomId::from_optional(wire.room_id),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum PayloadRef<'a> {
    Text(&'a str),
    Json(&'a Value),
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: PayloadRef<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_id: Option<&'a RoomId>,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match &self.kind {
            MessageKind::Connected(s) | MessageKind::Pong(s) => PayloadRef::Text(s),
            MessageKind::Chat(v)
            | MessageKind::Notification(v)
            | MessageKind::Ping(v)
            | MessageKind::Unknown { payload: v, .. } => PayloadRef::Json(v),
        };
        WireEnvelopeRef {
            kind: self.kind.type_name(),
            payload,
            user_id: self.user_id.as_ref(),
            room_id: self.room_id.as_ref(),
        }
        .serialize(serializer)
    }
}
