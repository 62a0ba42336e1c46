//! Secondary membership indices (room → connections, user → connections).

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use roomcast_core::ids::ConnectionId;

/// Maps a key to the set of connections that belong to it.
///
/// Keys exist only while their set is non-empty: the set is created by the
/// first `add` and dropped by the `remove` that empties it.
#[derive(Debug)]
pub struct MemberIndex<K> {
    members: HashMap<K, HashSet<ConnectionId>>,
}

impl<K: Eq + Hash + Clone> MemberIndex<K> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Add `id` under `key`. Returns `false` if it was already present.
    pub fn add(&mut self, key: &K, id: ConnectionId) -> bool {
        self.members.entry(key.clone()).or_default().insert(id)
    }

    /// Remove `id` from `key`, dropping the key once its set is empty.
    /// Returns `false` if `id` was not a member.
    pub fn remove(&mut self, key: &K, id: &ConnectionId) -> bool {
        let Some(set) = self.members.get_mut(key) else {
            return false;
        };
        let removed = set.remove(id);
        if set.is_empty() {
            let _ = self.members.remove(key);
        }
        removed
    }

    /// Current members of `key` (empty if the key is absent).
    pub fn members(&self, key: &K) -> Vec<ConnectionId> {
        self.members
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` is indexed under `key`.
    pub fn contains(&self, key: &K, id: &ConnectionId) -> bool {
        self.members.get(key).is_some_and(|set| set.contains(id))
    }

    /// Whether `key` has any members.
    pub fn contains_key(&self, key: &K) -> bool {
        self.members.contains_key(key)
    }

    /// Number of non-empty keys.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no key has members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over `(key, members)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &HashSet<ConnectionId>)> {
        self.members.iter()
    }

    /// Drop every key.
    pub fn clear(&mut self) {
        self.members.clear();
    }
}

impl<K: Eq + Hash + Clone> Default for MemberIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    #[test]
    fn add_creates_key() {
        let mut idx = MemberIndex::new();
        assert!(idx.add(&"general", id("a")));
        assert!(idx.contains_key(&"general"));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn add_twice_is_noop() {
        let mut idx = MemberIndex::new();
        assert!(idx.add(&"general", id("a")));
        assert!(!idx.add(&"general", id("a")));
        assert_eq!(idx.members(&"general").len(), 1);
    }

    #[test]
    fn removing_last_member_drops_key() {
        let mut idx = MemberIndex::new();
        let _ = idx.add(&"general", id("a"));
        let _ = idx.add(&"general", id("b"));
        assert!(idx.remove(&"general", &id("a")));
        assert!(idx.contains_key(&"general"));
        assert!(idx.remove(&"general", &id("b")));
        assert!(!idx.contains_key(&"general"));
        assert!(idx.is_empty());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut idx: MemberIndex<&str> = MemberIndex::new();
        assert!(!idx.remove(&"nowhere", &id("a")));
        let _ = idx.add(&"general", id("a"));
        assert!(!idx.remove(&"general", &id("zzz")));
        assert_eq!(idx.members(&"general"), vec![id("a")]);
    }

    #[test]
    fn members_of_absent_key_is_empty() {
        let idx: MemberIndex<&str> = MemberIndex::new();
        assert!(idx.members(&"ghost").is_empty());
        assert!(!idx.contains(&"ghost", &id("a")));
    }

    #[test]
    fn keys_are_independent() {
        let mut idx = MemberIndex::new();
        let _ = idx.add(&"r1", id("a"));
        let _ = idx.add(&"r2", id("a"));
        let _ = idx.remove(&"r1", &id("a"));
        assert!(!idx.contains_key(&"r1"));
        assert!(idx.contains(&"r2", &id("a")));
    }
}
