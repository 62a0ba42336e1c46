//! # roomcast-server
//!
//! Room-scoped WebSocket fan-out.
//!
//! - [`hub`]: single actor owning every connection and the room/user indices
//! - [`websocket`]: transport seam, read/write pumps, keepalive, dispatch
//! - [`server`]: axum routes, upgrade validation, health, metrics, shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod upgrade;
pub mod websocket;

pub use config::ServerConfig;
pub use hub::{BroadcastReport, Hub, HubError, HubSnapshot};
pub use server::RoomcastServer;
pub use websocket::connection::{Connection, ConnectionAttrs, ConnectionHandle, DisconnectReason};
pub use websocket::keepalive::KeepaliveConfig;
pub use websocket::transport::{Frame, MemoryPeer, MemoryTransport, Transport, WsTransport, memory_pair};
