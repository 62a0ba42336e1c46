//! Server configuration.

use std::time::Duration;

use crate::websocket::keepalive::{KeepaliveConfig, KeepaliveError};

/// Configuration for a [`RoomcastServer`](crate::server::RoomcastServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent connections; `0` = unlimited.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// How long graceful shutdown waits for connections to drain.
    pub shutdown_grace: Duration,
    /// Keepalive timings and inbound size limit.
    pub keepalive: KeepaliveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 0,
            send_queue_capacity: 256,
            shutdown_grace: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether one more connection fits under `max_connections`.
    pub fn admits(&self, current: usize) -> bool {
        self.max_connections == 0 || current < self.max_connections
    }

    /// Check the keepalive settings.
    pub fn validate(&self) -> Result<(), KeepaliveError> {
        self.keepalive.validate()
    }
}
