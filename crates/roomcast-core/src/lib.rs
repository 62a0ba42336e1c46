//! # roomcast-core
//!
//! Types shared by every roomcast crate:
//!
//! - [`ids`]: connection, room and user identifiers
//! - [`envelope`]: the JSON message envelope exchanged with clients

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;

pub use envelope::{Envelope, MessageKind};
pub use ids::{ConnectionId, RoomId, UserId};
