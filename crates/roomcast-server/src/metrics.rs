//! Prometheus recorder installation and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle that renders the `/metrics` body. Fails if a global
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections ended (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connections evicted for a full or closed queue (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Inbound messages routed (counter, labels: type).
pub const WS_MESSAGES_ROUTED_TOTAL: &str = "ws_messages_routed_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
