//! The hub: sole owner of the connection set and the room and user indices.
//!
//! One actor task owns a [`HubState`]. Everything else talks to it through
//! a cloneable [`Hub`] handle; every command is acknowledged, so a caller
//! that gets a reply knows the mutation (and any eviction it caused) has
//! already happened. Commands are applied in the order they were sent.

pub mod index;
pub mod state;

use roomcast_core::Envelope;
use roomcast_core::ids::{ConnectionId, RoomId, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

pub use state::{BroadcastReport, HubSnapshot, HubState, Registration};

use crate::websocket::connection::{ConnectionHandle, Outbound};

/// Commands buffered ahead of the actor before senders wait.
const COMMAND_BUFFER: usize = 1024;

/// Hub request failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HubError {
    /// The actor task has stopped.
    #[error("hub is not running")]
    Unavailable,
    /// The hub has been closed for shutdown.
    #[error("hub is shutting down")]
    ShuttingDown,
}

enum HubCommand {
    Register(ConnectionHandle, oneshot::Sender<Registration>),
    Unregister(ConnectionId, oneshot::Sender<bool>),
    BroadcastAll(Outbound, oneshot::Sender<BroadcastReport>),
    BroadcastRoom(RoomId, Outbound, oneshot::Sender<BroadcastReport>),
    BroadcastUser(UserId, Outbound, oneshot::Sender<BroadcastReport>),
    SendTo(ConnectionId, Outbound, oneshot::Sender<BroadcastReport>),
    Snapshot(oneshot::Sender<HubSnapshot>),
    RoomMembers(RoomId, oneshot::Sender<Vec<ConnectionId>>),
    UserConnections(UserId, oneshot::Sender<Vec<ConnectionId>>),
    Contains(ConnectionId, oneshot::Sender<bool>),
    CloseAll(oneshot::Sender<usize>),
}

/// Handle to the hub actor.
#[derive(Clone, Debug)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register(..) => "Register",
            Self::Unregister(..) => "Unregister",
            Self::BroadcastAll(..) => "BroadcastAll",
            Self::BroadcastRoom(..) => "BroadcastRoom",
            Self::BroadcastUser(..) => "BroadcastUser",
            Self::SendTo(..) => "SendTo",
            Self::Snapshot(..) => "Snapshot",
            Self::RoomMembers(..) => "RoomMembers",
            Self::UserConnections(..) => "UserConnections",
            Self::Contains(..) => "Contains",
            Self::CloseAll(..) => "CloseAll",
        };
        f.write_str(name)
    }
}

impl Hub {
    /// Start the actor on the current runtime. It stops once every handle
    /// is dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run(rx, HubState::new()));
        (Self { tx }, task)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> HubCommand,
    ) -> Result<R, HubError> {
        let (ack, reply) = oneshot::channel();
        self.tx
            .send(make(ack))
            .await
            .map_err(|_| HubError::Unavailable)?;
        reply.await.map_err(|_| HubError::Unavailable)
    }

    /// Add a connection. `Ok(false)` if its id is already live.
    ///
    /// When this returns the connection is a target of every later
    /// broadcast, and its `connected` greeting is queued.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<bool, HubError> {
        match self.request(|ack| HubCommand::Register(handle, ack)).await? {
            Registration::Added => Ok(true),
            Registration::Duplicate => Ok(false),
            Registration::Rejected => Err(HubError::ShuttingDown),
        }
    }

    /// Remove a connection and close its queue. `Ok(false)` if unknown.
    pub async fn unregister(&self, id: &ConnectionId) -> Result<bool, HubError> {
        self.request(|ack| HubCommand::Unregister(id.clone(), ack))
            .await
    }

    /// Enqueue pre-serialized text to every live connection.
    pub async fn broadcast_all(&self, text: impl Into<String>) -> Result<BroadcastReport, HubError> {
        let message = Outbound::new(text.into());
        self.request(|ack| HubCommand::BroadcastAll(message, ack))
            .await
    }

    /// Enqueue `envelope` to every member of `room`.
    pub async fn broadcast_room(
        &self,
        room: &RoomId,
        envelope: &Envelope,
    ) -> Result<BroadcastReport, HubError> {
        let Some(message) = state::encode(envelope) else {
            return Ok(BroadcastReport::default());
        };
        self.request(|ack| HubCommand::BroadcastRoom(room.clone(), message, ack))
            .await
    }

    /// Enqueue `envelope` to every connection of `user`.
    pub async fn broadcast_user(
        &self,
        user: &UserId,
        envelope: &Envelope,
    ) -> Result<BroadcastReport, HubError> {
        let Some(message) = state::encode(envelope) else {
            return Ok(BroadcastReport::default());
        };
        self.request(|ack| HubCommand::BroadcastUser(user.clone(), message, ack))
            .await
    }

    /// Enqueue `envelope` to one connection.
    pub async fn send_to(
        &self,
        id: &ConnectionId,
        envelope: &Envelope,
    ) -> Result<BroadcastReport, HubError> {
        let Some(message) = state::encode(envelope) else {
            return Ok(BroadcastReport::default());
        };
        self.request(|ack| HubCommand::SendTo(id.clone(), message, ack))
            .await
    }

    /// Current connection, room and user counts.
    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        self.request(HubCommand::Snapshot).await
    }

    /// Members of `room`.
    pub async fn room_members(&self, room: &RoomId) -> Result<Vec<ConnectionId>, HubError> {
        self.request(|ack| HubCommand::RoomMembers(room.clone(), ack))
            .await
    }

    /// Connections of `user`.
    pub async fn user_connections(&self, user: &UserId) -> Result<Vec<ConnectionId>, HubError> {
        self.request(|ack| HubCommand::UserConnections(user.clone(), ack))
            .await
    }

    /// Whether `id` is live.
    pub async fn contains(&self, id: &ConnectionId) -> Result<bool, HubError> {
        self.request(|ack| HubCommand::Contains(id.clone(), ack))
            .await
    }

    /// Stop accepting registrations and close every connection's queue.
    /// Returns how many were closed.
    pub async fn close_all(&self) -> Result<usize, HubError> {
        self.request(HubCommand::CloseAll).await
    }
}

async fn run(mut rx: mpsc::Receiver<HubCommand>, mut state: HubState) {
    while let Some(command) = rx.recv().await {
        apply(&mut state, command);
    }
    debug!("hub stopped");
}

// A dropped reply receiver only means the caller stopped waiting.
fn apply(state: &mut HubState, command: HubCommand) {
    match command {
        HubCommand::Register(handle, ack) => {
            let _ = ack.send(state.register(handle));
        }
        HubCommand::Unregister(id, ack) => {
            let _ = ack.send(state.unregister(&id));
        }
        HubCommand::BroadcastAll(message, ack) => {
            let _ = ack.send(state.broadcast_all(&message));
        }
        HubCommand::BroadcastRoom(room, message, ack) => {
            let _ = ack.send(state.broadcast_room(&room, &message));
        }
        HubCommand::BroadcastUser(user, message, ack) => {
            let _ = ack.send(state.broadcast_user(&user, &message));
        }
        HubCommand::SendTo(id, message, ack) => {
            let _ = ack.send(state.send_to(&id, &message));
        }
        HubCommand::Snapshot(ack) => {
            let _ = ack.send(state.snapshot());
        }
        HubCommand::RoomMembers(room, ack) => {
            let _ = ack.send(state.room_members(&room));
        }
        HubCommand::UserConnections(user, ack) => {
            let _ = ack.send(state.user_connections(&user));
        }
        HubCommand::Contains(id, ack) => {
            let _ = ack.send(state.contains(&id));
        }
        HubCommand::CloseAll(ack) => {
            let _ = ack.send(state.close_all());
        }
    }
}
