//! Identifiers for connections, rooms and users.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, process-unique connection identifier (`conn_<uuid v7>`).
///
/// v7 UUIDs are time-ordered, so ids minted by one process sort by creation.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// Wrap an existing id verbatim.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! named_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build from a non-empty string. Empty input yields `None`.
            pub fn new(s: impl Into<String>) -> Option<Self> {
                let s = s.into();
                if s.is_empty() { None } else { Some(Self(s)) }
            }

            /// Build from an optional query value, treating `""` as absent.
            pub fn from_optional(s: Option<String>) -> Option<Self> {
                s.and_then(Self::new)
            }

            /// Borrow the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

named_id!(
    /// Name of a room. Never empty.
    RoomId
);
named_id!(
    /// Identifier of an end user. Never empty; anonymous connections carry no `UserId`.
    UserId
);

impl RoomId {
    /// The room every `/ws/notifications` connection joins.
    pub fn notifications() -> Self {
        Self("notifications".to_owned())
    }
}
