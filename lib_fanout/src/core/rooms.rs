//! # Room Directory
//!
//! Room membership for every live connection, together with the outbox used to
//! reach it. The broker control loop is the only writer; dispatcher tasks take
//! short read locks to look up recipients, so concurrent deliveries never
//! mutate shared state.
//!
//! Empty rooms are removed eagerly, which makes "does this channel have any
//! subscriber" a scan over live room keys only.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::core::channel::{Channel, RoomKey};
use crate::core::events::OutboundEvent;

/// Broker-assigned connection identifier.
pub type ConnectionId = u64;

/// Default number of frames a connection may have queued before new frames
/// for it are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Sending half of a connection's bounded event queue.
pub type Outbox = mpsc::Sender<Arc<OutboundEvent>>;

struct Member {
    rooms: HashSet<RoomKey>,
    outbox: Outbox,
}

#[derive(Default)]
struct Directory {
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
    members: HashMap<ConnectionId, Member>,
}

/// Result of replacing a connection's room set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomDelta {
    pub joined: Vec<RoomKey>,
    pub left: Vec<RoomKey>,
}

#[derive(Default)]
pub struct RoomDirectory {
    inner: RwLock<Directory>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Directory> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Directory> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: ConnectionId, outbox: Outbox) {
        self.write().members.insert(id, Member { rooms: HashSet::new(), outbox });
    }

    /// Replaces the room set of `id` with `target`.
    ///
    /// Only the symmetric difference is applied: rooms in `target` but not in
    /// the current set are joined, rooms in the current set but not in `target`
    /// are left. Returns `None` for an unknown connection.
    pub(crate) fn set_rooms(&self, id: ConnectionId, target: HashSet<RoomKey>) -> Option<RoomDelta> {
        let mut guard = self.write();
        let dir = &mut *guard;
        let member = dir.members.get_mut(&id)?;

        let mut delta = RoomDelta::default();
        for key in target.difference(&member.rooms) {
            dir.rooms.entry(key.clone()).or_default().insert(id);
            delta.joined.push(key.clone());
        }
        for key in member.rooms.difference(&target) {
            leave(&mut dir.rooms, key, id);
            delta.left.push(key.clone());
        }
        member.rooms = target;

        delta.joined.sort();
        delta.left.sort();
        Some(delta)
    }

    /// Unregisters `id`, leaving all of its rooms and dropping its outbox.
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Vec<RoomKey>> {
        let mut guard = self.write();
        let dir = &mut *guard;
        let member = dir.members.remove(&id)?;
        let mut left: Vec<RoomKey> = member.rooms.into_iter().collect();
        for key in &left {
            leave(&mut dir.rooms, key, id);
        }
        left.sort();
        Some(left)
    }

    /// Unregisters every connection. Dropping the outboxes ends each
    /// connection's event stream, which closes the socket on the other side.
    pub(crate) fn drain(&self) -> usize {
        let mut dir = self.write();
        dir.rooms.clear();
        let count = dir.members.len();
        dir.members.clear();
        count
    }

    pub fn has_subscribers(&self, channel: Channel) -> bool {
        self.read().rooms.keys().any(|key| key.channel() == channel)
    }

    /// Number of distinct connections present in any room of `channel`.
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        let dir = self.read();
        let mut distinct = HashSet::new();
        for (key, ids) in dir.rooms.iter() {
            if key.channel() == channel {
                distinct.extend(ids.iter().copied());
            }
        }
        distinct.len()
    }

    #[cfg(test)]
    fn room_size(&self, key: &RoomKey) -> usize {
        self.read().rooms.get(key).map_or(0, HashSet::len)
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Option<Vec<RoomKey>> {
        let dir = self.read();
        let member = dir.members.get(&id)?;
        let mut rooms: Vec<RoomKey> = member.rooms.iter().cloned().collect();
        rooms.sort();
        Some(rooms)
    }

    pub fn connection_count(&self) -> usize {
        self.read().members.len()
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }

    /// Outboxes of every connection in at least one of `targets`.
    ///
    /// A connection present in several target rooms is returned once.
    pub fn recipients(&self, targets: &[RoomKey]) -> Vec<Outbox> {
        let dir = self.read();
        let mut ids = BTreeSet::new();
        for key in targets {
            if let Some(members) = dir.rooms.get(key) {
                ids.extend(members.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| dir.members.get(&id).map(|m| m.outbox.clone()))
            .collect()
    }
}

fn leave(rooms: &mut HashMap<RoomKey, HashSet<ConnectionId>>, key: &RoomKey, id: ConnectionId) {
    if let Some(members) = rooms.get_mut(key) {
        members.remove(&id);
        if members.is_empty() {
            rooms.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> RoomKey {
        raw.parse().unwrap()
    }

    fn set(raw: &[&str]) -> HashSet<RoomKey> {
        raw.iter().map(|r| key(r)).collect()
    }

    fn connect(dir: &RoomDirectory, id: ConnectionId) -> mpsc::Receiver<Arc<OutboundEvent>> {
        let (tx, rx) = mpsc::channel(8);
        dir.register(id, tx);
        rx
    }

    #[test]
    fn set_rooms_applies_only_the_difference() {
        let dir = RoomDirectory::new();
        let _rx = connect(&dir, 1);

        let delta = dir.set_rooms(1, set(&["price_a", "price_c"])).unwrap();
        assert_eq!(delta.joined, vec![key("price_a"), key("price_c")]);
        assert!(delta.left.is_empty());

        let delta = dir.set_rooms(1, set(&["price_b", "price_c"])).unwrap();
        assert_eq!(delta.joined, vec![key("price_b")]);
        assert_eq!(delta.left, vec![key("price_a")]);
        assert_eq!(dir.rooms_of(1).unwrap(), vec![key("price_b"), key("price_c")]);
        assert_eq!(dir.room_size(&key("price_a")), 0);
    }

    #[test]
    fn subscriber_count_counts_distinct_connections_per_channel() {
        let dir = RoomDirectory::new();
        let _a = connect(&dir, 1);
        let _b = connect(&dir, 2);

        dir.set_rooms(1, set(&["price_a", "price_b", "status"])).unwrap();
        dir.set_rooms(2, set(&["price_a"])).unwrap();
        assert_eq!(dir.subscriber_count(Channel::Price), 2);
        assert_eq!(dir.subscriber_count(Channel::Status), 1);
        assert_eq!(dir.subscriber_count(Channel::Trade), 0);
        assert!(!dir.has_subscribers(Channel::Trade));

        dir.remove(1).unwrap();
        assert_eq!(dir.subscriber_count(Channel::Price), 1);
        assert!(!dir.has_subscribers(Channel::Status));

        dir.set_rooms(2, HashSet::new()).unwrap();
        assert!(!dir.has_subscribers(Channel::Price));
        assert_eq!(dir.room_count(), 0);
    }

    #[test]
    fn recipients_deduplicate_and_skip_empty_rooms() {
        let dir = RoomDirectory::new();
        let _a = connect(&dir, 1);
        let _b = connect(&dir, 2);
        dir.set_rooms(1, set(&["price_a", "price_all"])).unwrap();
        dir.set_rooms(2, set(&["price_b"])).unwrap();

        assert_eq!(dir.recipients(&[key("price_a"), key("price_all")]).len(), 1);
        assert_eq!(dir.recipients(&[key("price_z")]).len(), 0);
        assert_eq!(dir.recipients(&[key("price_a"), key("price_b")]).len(), 2);
    }

    #[test]
    fn unknown_connections_are_reported() {
        let dir = RoomDirectory::new();
        assert!(dir.set_rooms(9, set(&["price_a"])).is_none());
        assert!(dir.remove(9).is_none());
    }

    #[test]
    fn drain_closes_every_event_stream() {
        let dir = RoomDirectory::new();
        let mut rx = connect(&dir, 1);
        dir.set_rooms(1, set(&["status"])).unwrap();

        assert_eq!(dir.drain(), 1);
        assert_eq!(dir.connection_count(), 0);
        assert!(rx.try_recv().is_err());
        assert!(!dir.has_subscribers(Channel::Status));
    }
}
