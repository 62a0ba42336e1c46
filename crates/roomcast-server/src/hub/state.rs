//! The hub's owned state. Only the actor task touches it.

use std::collections::HashMap;

use metrics::{counter, gauge};
use roomcast_core::Envelope;
use roomcast_core::ids::{ConnectionId, RoomId, UserId};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::hub::index::MemberIndex;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_EVICTIONS_TOTAL};
use crate::websocket::connection::{ConnectionHandle, EnqueueError, Outbound};

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was enqueued to.
    pub delivered: usize,
    /// Connections dropped because their queue was full or closed.
    pub evicted: Vec<ConnectionId>,
}

/// Point-in-time counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubSnapshot {
    /// Live connections.
    pub connections: usize,
    /// Non-empty rooms.
    pub rooms: usize,
    /// Users with at least one connection.
    pub users: usize,
}

/// Result of offering a connection to the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Newly added.
    Added,
    /// Id already live; nothing changed.
    Duplicate,
    /// Hub is closed; the handle's queue was closed.
    Rejected,
}

/// All connections plus the room and user indices over them.
#[derive(Debug)]
pub struct HubState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    rooms: MemberIndex<RoomId>,
    users: MemberIndex<UserId>,
    accepting: bool,
}

impl HubState {
    /// Empty, accepting registrations.
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            rooms: MemberIndex::new(),
            users: MemberIndex::new(),
            accepting: true,
        }
    }

    /// Add a connection to every applicable index and greet it.
    pub fn register(&mut self, handle: ConnectionHandle) -> Registration {
        if !self.accepting {
            let _ = handle.close();
            return Registration::Rejected;
        }
        let id = handle.id().clone();
        if self.connections.contains_key(&id) {
            debug!(conn_id = %id, "duplicate registration ignored");
            return Registration::Duplicate;
        }

        if let Some(room) = handle.room_id() {
            let _ = self.rooms.add(room, id.clone());
        }
        if let Some(user) = handle.user_id() {
            let _ = self.users.add(user, id.clone());
        }
        let greeting = Envelope::connected(handle.user_id().cloned());
        let _ = self.connections.insert(id.clone(), handle);
        self.record_active();

        if let Some(message) = encode(&greeting) {
            let _ = self.send_to(&id, &message);
        }
        Registration::Added
    }

    /// Remove a connection from every index and close its queue.
    /// Returns `false` for unknown ids.
    pub fn unregister(&mut self, id: &ConnectionId) -> bool {
        let Some(handle) = self.connections.remove(id) else {
            return false;
        };
        if let Some(room) = handle.room_id() {
            let _ = self.rooms.remove(room, id);
        }
        if let Some(user) = handle.user_id() {
            let _ = self.users.remove(user, id);
        }
        let _ = handle.close();
        self.record_active();
        true
    }

    /// Enqueue to every live connection.
    pub fn broadcast_all(&mut self, message: &Outbound) -> BroadcastReport {
        let targets: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        self.deliver(targets, message)
    }

    /// Enqueue to every member of `room`. Unknown rooms are a no-op.
    pub fn broadcast_room(&mut self, room: &RoomId, message: &Outbound) -> BroadcastReport {
        let targets = self.rooms.members(room);
        self.deliver(targets, message)
    }

    /// Enqueue to every connection of `user`.
    pub fn broadcast_user(&mut self, user: &UserId, message: &Outbound) -> BroadcastReport {
        let targets = self.users.members(user);
        self.deliver(targets, message)
    }

    /// Enqueue to a single connection.
    pub fn send_to(&mut self, id: &ConnectionId, message: &Outbound) -> BroadcastReport {
        self.deliver(vec![id.clone()], message)
    }

    /// Stop accepting, close every queue and empty all indices.
    pub fn close_all(&mut self) -> usize {
        self.accepting = false;
        let closed = self.connections.len();
        for handle in self.connections.values() {
            let _ = handle.close();
        }
        self.connections.clear();
        self.rooms.clear();
        self.users.clear();
        self.record_active();
        closed
    }

    /// Current counts.
    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
            users: self.users.len(),
        }
    }

    /// Members of `room`.
    pub fn room_members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms.members(room)
    }

    /// Connections of `user`.
    pub fn user_connections(&self, user: &UserId) -> Vec<ConnectionId> {
        self.users.members(user)
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Whether registrations are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    // Every target is attempted before any eviction, so evicting one
    // member never changes who else the message reaches.
    fn deliver(&mut self, targets: Vec<ConnectionId>, message: &Outbound) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for id in targets {
            let Some(handle) = self.connections.get(&id) else {
                continue;
            };
            match handle.try_enqueue(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    self.evict(&id, reason);
                    report.evicted.push(id);
                }
            }
        }
        report
    }

    fn evict(&mut self, id: &ConnectionId, reason: EnqueueError) {
        if self.unregister(id) {
            counter!(WS_EVICTIONS_TOTAL).increment(1);
            warn!(conn_id = %id, %reason, "evicting slow consumer");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
    }

    /// Panics unless every index entry points at a live connection with a
    /// matching attribute, and vice versa.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (room, members) in self.rooms.iter() {
            assert!(!members.is_empty(), "empty room {room} kept");
            for id in members {
                let handle = self.connections.get(id).expect("room member not live");
                assert_eq!(handle.room_id(), Some(room));
            }
        }
        for (user, members) in self.users.iter() {
            assert!(!members.is_empty(), "empty user {user} kept");
            for id in members {
                let handle = self.connections.get(id).expect("user member not live");
                assert_eq!(handle.user_id(), Some(user));
            }
        }
        for (id, handle) in &self.connections {
            if let Some(room) = handle.room_id() {
                assert!(self.rooms.contains(room, id));
            }
            if let Some(user) = handle.user_id() {
                assert!(self.users.contains(user, id));
            }
        }
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize once for fan-out. Failures are logged and the message dropped.
pub fn encode(envelope: &Envelope) -> Option<Outbound> {
    match envelope.encode() {
        Ok(text) => Some(Outbound::new(text)),
        Err(e) => {
            error!(error = %e, kind = envelope.kind.type_name(), "failed to serialize envelope");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Connection, ConnectionAttrs};
    use proptest::prelude::*;

    fn conn(id: &str, user: Option<&str>, room: Option<&str>, cap: usize) -> (Connection, ConnectionHandle) {
        Connection::with_id(
            ConnectionId::from_raw(id),
            ConnectionAttrs::new(user.and_then(UserId::new), room.and_then(RoomId::new)),
            cap,
        )
    }

    fn text(s: &str) -> Outbound {
        Outbound::new(s.to_owned())
    }

    fn room(s: &str) -> RoomId {
        RoomId::new(s).unwrap()
    }

    fn user(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[test]
    fn register_indexes_room_and_user() {
        let mut state = HubState::new();
        let (_c, h) = conn("a", Some("u1"), Some("general"), 8);
        assert_eq!(state.register(h), Registration::Added);
        assert_eq!(state.snapshot(), HubSnapshot { connections: 1, rooms: 1, users: 1 });
        assert_eq!(state.room_members(&room("general")), vec![ConnectionId::from_raw("a")]);
        assert_eq!(state.user_connections(&user("u1")), vec![ConnectionId::from_raw("a")]);
        state.assert_consistent();
    }

    #[test]
    fn register_greets_new_connection_only() {
        let mut state = HubState::new();
        let (_ca, a) = conn("a", Some("u1"), None, 8);
        let (_cb, b) = conn("b", Some("u2"), None, 8);
        let _ = state.register(a.clone());
        let _ = state.register(b.clone());
        assert_eq!(a.pending(), 1);
        assert_eq!(b.pending(), 1);
    }

    #[test]
    fn greeting_carries_user_id() {
        let mut state = HubState::new();
        let (c, h) = conn("a", Some("u1"), None, 8);
        let _ = state.register(h);
        let mut rx = c.into_receiver();
        let msg = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "connected",
                "payload": "Successfully connected to WebSocket",
                "user_id": "u1"
            })
        );
    }

    #[test]
    fn anonymous_connection_is_not_indexed() {
        let mut state = HubState::new();
        let (_c, h) = conn("a", None, None, 8);
        let _ = state.register(h);
        assert_eq!(state.snapshot(), HubSnapshot { connections: 1, rooms: 0, users: 0 });
    }

    #[test]
    fn duplicate_registration_is_noop() {
        let mut state = HubState::new();
        let (_c, h) = conn("a", Some("u1"), Some("general"), 8);
        assert_eq!(state.register(h.clone()), Registration::Added);
        assert_eq!(state.register(h.clone()), Registration::Duplicate);
        assert_eq!(state.snapshot().connections, 1);
        assert_eq!(state.room_members(&room("general")).len(), 1);
        // only the first registration greets
        assert_eq!(h.pending(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let mut state = HubState::new();
        let (_c, h) = conn("a", Some("u1"), Some("general"), 8);
        let _ = state.register(h);
        assert!(!state.unregister(&ConnectionId::from_raw("ghost")));
        assert_eq!(state.snapshot(), HubSnapshot { connections: 1, rooms: 1, users: 1 });
    }

    #[test]
    fn unregister_twice_closes_once() {
        let mut state = HubState::new();
        let (_c, h) = conn("a", Some("u1"), Some("general"), 8);
        let _ = state.register(h.clone());
        assert!(state.unregister(h.id()));
        assert!(h.is_closed());
        assert!(!state.unregister(h.id()));
        assert_eq!(state.snapshot(), HubSnapshot::default());
    }

    #[test]
    fn last_member_leaving_drops_room() {
        let mut state = HubState::new();
        let (_ca, a) = conn("a", Some("u1"), Some("general"), 8);
        let (_cb, b) = conn("b", Some("u2"), Some("general"), 8);
        let _ = state.register(a.clone());
        let _ = state.register(b.clone());
        let _ = state.unregister(a.id());
        assert_eq!(state.snapshot().rooms, 1);
        let _ = state.unregister(b.id());
        assert_eq!(state.snapshot().rooms, 0);
        state.assert_consistent();
    }

    #[test]
    fn room_broadcast_skips_departed_members() {
        let mut state = HubState::new();
        let (_ca, a) = conn("a", Some("u1"), Some("general"), 8);
        let (_cb, b) = conn("b", Some("u2"), Some("general"), 8);
        let _ = state.register(a.clone());
        let _ = state.register(b.clone());
        let _ = state.unregister(a.id());

        let report = state.broadcast_room(&room("general"), &text("hi"));
        assert_eq!(report, BroadcastReport { delivered: 1, evicted: vec![] });
        assert_eq!(b.pending(), 2);
    }

    #[test]
    fn unknown_room_is_noop() {
        let mut state = HubState::new();
        let report = state.broadcast_room(&room("nowhere"), &text("hi"));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn full_queue_is_evicted_during_broadcast() {
        let mut state = HubState::new();
        // capacity 1, already holding the greeting
        let (_cs, slow) = conn("slow", Some("u1"), Some("general"), 1);
        let (_cf, fast) = conn("fast", Some("u2"), Some("general"), 8);
        let _ = state.register(slow.clone());
        let _ = state.register(fast.clone());

        let report = state.broadcast_room(&room("general"), &text("hi"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![ConnectionId::from_raw("slow")]);
        assert!(!state.contains(slow.id()));
        assert!(slow.is_closed());
        assert_eq!(state.room_members(&room("general")), vec![fast.id().clone()]);
        assert!(state.user_connections(&user("u1")).is_empty());
        state.assert_consistent();
    }

    #[test]
    fn closed_queue_is_evicted() {
        let mut state = HubState::new();
        let (c, h) = conn("a", None, None, 8);
        let _ = state.register(h.clone());
        drop(c);
        let report = state.broadcast_all(&text("x"));
        assert_eq!(report.evicted, vec![h.id().clone()]);
        assert_eq!(state.snapshot().connections, 0);
    }

    #[test]
    fn user_broadcast_reaches_every_connection_of_user() {
        let mut state = HubState::new();
        let (_c1, a) = conn("a", Some("u1"), Some("r1"), 8);
        let (_c2, b) = conn("b", Some("u1"), Some("r2"), 8);
        let (_c3, c) = conn("c", Some("u2"), Some("r1"), 8);
        for h in [&a, &b, &c] {
            let _ = state.register(h.clone());
        }
        let report = state.broadcast_user(&user("u1"), &text("dm"));
        assert_eq!(report.delivered, 2);
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn send_to_unknown_id_delivers_nothing() {
        let mut state = HubState::new();
        let report = state.send_to(&ConnectionId::from_raw("ghost"), &text("x"));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn close_all_rejects_later_registrations() {
        let mut state = HubState::new();
        let (_ca, a) = conn("a", Some("u1"), Some("general"), 8);
        let _ = state.register(a.clone());
        assert_eq!(state.close_all(), 1);
        assert!(a.is_closed());
        assert!(!state.is_accepting());
        assert_eq!(state.snapshot(), HubSnapshot::default());

        let (_cb, b) = conn("b", None, None, 8);
        assert_eq!(state.register(b.clone()), Registration::Rejected);
        assert!(b.is_closed());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Register { id: u8, user: Option<u8>, room: Option<u8> },
        Unregister(u8),
        BroadcastRoom(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, proptest::option::of(0u8..3), proptest::option::of(0u8..3))
                .prop_map(|(id, user, room)| Op::Register { id, user, room }),
            (0u8..8).prop_map(Op::Unregister),
            (0u8..3).prop_map(Op::BroadcastRoom),
        ]
    }

    proptest! {
        #[test]
        fn indices_track_live_connections(ops in proptest::collection::vec(op(), 0..64)) {
            let mut state = HubState::new();
            let mut receivers = Vec::new();
            for op in ops {
                match op {
                    Op::Register { id, user, room } => {
                        let user = user.map(|u| format!("u{u}"));
                        let room = room.map(|r| format!("r{r}"));
                        let (c, h) = conn(&format!("c{id}"), user.as_deref(), room.as_deref(), 4);
                        receivers.push(c);
                        let _ = state.register(h);
                    }
                    Op::Unregister(id) => {
                        let _ = state.unregister(&ConnectionId::from_raw(format!("c{id}")));
                    }
                    Op::BroadcastRoom(r) => {
                        let _ = state.broadcast_room(&room(&format!("r{r}")), &text("m"));
                    }
                }
                state.assert_consistent();
            }
        }
    }
}
