//! `/health` endpoint body.

use serde::Serialize;
use std::time::Instant;

use crate::hub::HubSnapshot;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, `"shutting_down"` or `"unavailable"`.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections.
    pub connections: usize,
    /// Non-empty rooms.
    pub rooms: usize,
    /// Users with at least one connection.
    pub users: usize,
}

impl HealthResponse {
    /// Whether the server is serving normally.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Build a health response. `snapshot` is `None` when the hub did not answer.
pub fn health_check(
    start_time: Instant,
    snapshot: Option<HubSnapshot>,
    shutting_down: bool,
) -> HealthResponse {
    let status = match (snapshot, shutting_down) {
        (_, true) => "shutting_down",
        (None, false) => "unavailable",
        (Some(_), false) => "ok",
    };
    let snapshot = snapshot.unwrap_or_default();
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        connections: snapshot.connections,
        rooms: snapshot.rooms,
        users: snapshot.users,
    }
}
