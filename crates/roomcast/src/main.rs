//! # roomcast
//!
//! Server binary: loads settings, installs logging and metrics, serves the
//! hub until ctrl-c, then shuts down gracefully.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_logging::LogFormat;
use roomcast_server::{KeepaliveConfig, RoomcastServer, ServerConfig};
use roomcast_settings::RoomcastSettings;

/// Roomcast WebSocket hub.
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Room-scoped WebSocket hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.roomcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut RoomcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

/// Map loaded settings onto the server's runtime configuration.
fn server_config(settings: &RoomcastSettings) -> ServerConfig {
    let ws = &settings.websocket;
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_connections: settings.server.max_connections,
        send_queue_capacity: ws.send_queue_capacity,
        shutdown_grace: Duration::from_millis(settings.server.shutdown_grace_ms),
        keepalive: KeepaliveConfig::from_millis(
            ws.pong_wait_ms,
            ws.ping_period_ms,
            ws.write_wait_ms,
            ws.max_message_size,
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(roomcast_settings::settings_path);
    let mut settings = roomcast_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);

    roomcast_logging::init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    )
    .context("Failed to initialize logging")?;

    let config = server_config(&settings);
    config.validate().context("Invalid keepalive settings")?;

    let metrics = roomcast_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = RoomcastServer::new(config).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!(%addr, "roomcast started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.graceful_shutdown().await {
        tracing::warn!("some connections did not close within the grace period");
    }
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["roomcast"]);
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8081);
        assert!(!settings.logging.json);
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "roomcast",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--json-logs",
            "--config",
            "/etc/roomcast.json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/roomcast.json")));
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["roomcast", "--port", "70000"]).is_err());
    }

    #[test]
    fn settings_map_to_server_config() {
        let mut settings = RoomcastSettings::default();
        settings.server.max_connections = 7;
        settings.websocket.send_queue_capacity = 32;
        let config = server_config(&settings);
        assert_eq!(config.port, 8081);
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.send_queue_capacity, 32);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.keepalive, KeepaliveConfig::default());
        assert!(config.validate().is_ok());
    }
}
