//! Settings types.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomcastSettings {
    /// Listener and lifecycle settings.
    pub server: ServerSettings,
    /// Per-connection keepalive, framing and queue settings.
    pub websocket: WebsocketSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl RoomcastSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.websocket;
        if ws.pong_wait_ms == 0 || ws.ping_period_ms == 0 || ws.write_wait_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket timings must be non-zero".into(),
            ));
        }
        if ws.ping_period_ms >= ws.pong_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "websocket.ping_period_ms ({}) must be less than websocket.pong_wait_ms ({})",
                ws.ping_period_ms, ws.pong_wait_ms
            )));
        }
        if ws.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket.send_queue_capacity must be at least 1".into(),
            ));
        }
        if ws.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket.max_message_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent connections (`0` = unlimited).
    pub max_connections: usize,
    /// How long graceful shutdown waits for connections to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_connections: 10_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Keepalive, framing and backpressure settings applied to every connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketSettings {
    /// Time allowed to read the next pong from the peer.
    pub pong_wait_ms: u64,
    /// Ping interval. Must be less than `pong_wait_ms`.
    pub ping_period_ms: u64,
    /// Time allowed for a single write to the peer.
    pub write_wait_ms: u64,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
}

impl Default for WebsocketSettings {
    fn default() -> Self {
        Self {
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            write_wait_ms: 10_000,
            max_message_size: 512,
            send_queue_capacity: 256,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
