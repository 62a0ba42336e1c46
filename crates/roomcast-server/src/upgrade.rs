//! Upgrade-time parameter validation and rejection responses.
//!
//! Every check here runs before the protocol switch, so a rejected client
//! gets a plain HTTP error and no connection is ever built.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use roomcast_core::ids::{RoomId, UserId};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::websocket::connection::ConnectionAttrs;

/// Why an upgrade was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UpgradeError {
    /// `/ws/chat` without both ids.
    #[error("room_id and user_id are required")]
    MissingRoomOrUser,
    /// `/ws/notifications` without a user.
    #[error("user_id is required")]
    MissingUser,
    /// Shutdown has begun.
    #[error("server is shutting down")]
    ShuttingDown,
    /// `max_connections` reached.
    #[error("connection limit reached")]
    AtCapacity,
    /// The hub is not running.
    #[error("hub unavailable")]
    HubUnavailable,
}

impl UpgradeError {
    /// HTTP status for this rejection.
    pub fn status(self) -> StatusCode {
        match self {
            Self::MissingRoomOrUser | Self::MissingUser => StatusCode::BAD_REQUEST,
            Self::ShuttingDown | Self::AtCapacity | Self::HubUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Query of `/ws/chat`.
#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    /// Room to join.
    pub room_id: Option<String>,
    /// Connecting user.
    pub user_id: Option<String>,
}

impl ChatQuery {
    /// Both ids, non-empty.
    pub fn into_attrs(self) -> Result<ConnectionAttrs, UpgradeError> {
        match (
            RoomId::from_optional(self.room_id),
            UserId::from_optional(self.user_id),
        ) {
            (Some(room), Some(user)) => Ok(ConnectionAttrs::new(Some(user), Some(room))),
            _ => Err(UpgradeError::MissingRoomOrUser),
        }
    }
}

/// Query of `/ws/notifications`.
#[derive(Debug, Default, Deserialize)]
pub struct NotificationQuery {
    /// Connecting user.
    pub user_id: Option<String>,
}

impl NotificationQuery {
    /// The user, joined to the `notifications` room.
    pub fn into_attrs(self) -> Result<ConnectionAttrs, UpgradeError> {
        let user = UserId::from_optional(self.user_id).ok_or(UpgradeError::MissingUser)?;
        Ok(ConnectionAttrs::new(
            Some(user),
            Some(RoomId::notifications()),
        ))
    }
}
