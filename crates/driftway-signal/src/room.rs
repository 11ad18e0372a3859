//! Room membership sets

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use driftway_core::{share_group, RoomKind};

use crate::messages::PeerInfo;
use crate::peer::Peer;

/// Identifies a room across the three membership models
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomKey {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn address(ip: &str) -> Self {
        Self::new(RoomKind::Address, ip)
    }

    pub fn secret(secret: &str) -> Self {
        Self::new(RoomKind::Secret, secret)
    }

    pub fn public(code: &str) -> Self {
        Self::new(RoomKind::Public, code)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            // Secrets never end up in logs
            RoomKind::Secret => write!(f, "secret:{}…", self.id.get(..6).unwrap_or("")),
            _ => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

/// A set of peers that can discover each other
pub struct Room {
    pub key: RoomKey,

    /// Members by peer id
    members: HashMap<String, Arc<Peer>>,

    created_at: Instant,
}

impl Room {
    pub fn new(key: RoomKey) -> Self {
        Self {
            key,
            members: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Add a member, returning a previous member registered under the same id
    pub fn add_member(&mut self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.members.insert(peer.id().to_owned(), peer)
    }

    /// Remove `peer` if it is the member registered under its id
    ///
    /// A peer that reconnected with the same id replaces the stale record, so
    /// the stale record's teardown must not evict the new connection.
    pub fn remove_member(&mut self, peer: &Arc<Peer>) -> bool {
        match self.members.get(peer.id()) {
            Some(member) if Arc::ptr_eq(member, peer) => {
                self.members.remove(peer.id());
                true
            }
            _ => false,
        }
    }

    /// Remove whichever member is registered under `peer_id`
    pub fn take(&mut self, peer_id: &str) -> Option<Arc<Peer>> {
        self.members.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Arc<Peer>> {
        self.members.get(peer_id)
    }

    pub fn contains(&self, peer: &Arc<Peer>) -> bool {
        self.members
            .get(peer.id())
            .is_some_and(|member| Arc::ptr_eq(member, peer))
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.members.values()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Whether `a` and `b` may see each other in this room
    pub fn mutually_visible(&self, a: &Peer, b: &Peer) -> bool {
        !self.key.kind.is_group_filtered() || share_group(a.group_ids(), b.group_ids())
    }

    /// Members other than `peer` that `peer` may see
    pub fn visible_to<'a>(&'a self, peer: &'a Peer) -> impl Iterator<Item = &'a Arc<Peer>> + 'a {
        self.members
            .values()
            .filter(move |m| m.id() != peer.id() && self.mutually_visible(peer, m))
    }

    /// Descriptors of the members `peer` may see
    pub fn visible_peers(&self, peer: &Peer) -> Vec<PeerInfo> {
        self.visible_to(peer).map(|m| m.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::peer;

    #[test]
    fn test_add_remove_member() {
        let mut room = Room::new(RoomKey::secret("s".repeat(64).as_str()));
        let (a, _ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);

        assert!(room.add_member(a.clone()).is_none());
        room.add_member(b.clone());
        assert_eq!(room.len(), 2);
        assert!(room.contains(&a));

        assert!(room.remove_member(&a));
        assert!(!room.remove_member(&a));
        assert!(room.remove_member(&b));
        assert!(room.is_empty());
    }

    #[test]
    fn test_stale_record_cannot_evict_reconnect() {
        let mut room = Room::new(RoomKey::address("10.0.0.1"));
        let (old, _r1) = peer("same", "10.0.0.1", &[1]);
        let (new, _r2) = peer("same", "10.0.0.1", &[1]);

        room.add_member(old.clone());
        let replaced = room.add_member(new.clone());
        assert!(Arc::ptr_eq(&replaced.unwrap(), &old));

        assert!(!room.remove_member(&old));
        assert!(room.contains(&new));
    }

    #[test]
    fn test_address_room_visibility() {
        let mut room = Room::new(RoomKey::address("10.0.0.1"));
        let (a, _ra) = peer("a", "10.0.0.1", &[1, 2]);
        let (b, _rb) = peer("b", "10.0.0.1", &[2]);
        let (c, _rc) = peer("c", "10.0.0.1", &[3]);
        let (d, _rd) = peer("d", "10.0.0.1", &[]);
        for p in [&a, &b, &c, &d] {
            room.add_member(p.clone());
        }

        let ids = |p: &Peer| {
            let mut ids: Vec<_> = room.visible_peers(p).into_iter().map(|i| i.id).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(&a), vec!["b"]);
        assert_eq!(ids(&b), vec!["a"]);
        assert!(ids(&c).is_empty());
        assert!(ids(&d).is_empty());
    }

    #[test]
    fn test_secret_and_public_rooms_are_unfiltered() {
        for key in [RoomKey::secret(&"s".repeat(64)), RoomKey::public("abcde")] {
            let mut room = Room::new(key);
            let (a, _ra) = peer("a", "10.0.0.1", &[1]);
            let (b, _rb) = peer("b", "10.0.0.1", &[9]);
            let (c, _rc) = peer("c", "10.0.0.2", &[]);
            for p in [&a, &b, &c] {
                room.add_member(p.clone());
            }

            assert_eq!(room.visible_peers(&a).len(), 2);
            assert_eq!(room.visible_peers(&b).len(), 2);
            assert_eq!(room.visible_peers(&c).len(), 2);
            assert_eq!(room.visible_to(&a).count(), 2);
        }
    }

    #[test]
    fn test_secret_key_display_is_truncated() {
        let key = RoomKey::secret("abcdefghijklmnop");
        assert_eq!(key.to_string(), "secret:abcdef…");
        assert_eq!(RoomKey::public("xyz12").to_string(), "public-id:xyz12");
    }
}
