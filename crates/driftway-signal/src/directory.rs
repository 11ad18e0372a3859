//! Room directory
//!
//! Owns every live room across the three membership models. A room is created
//! by its first join and removed as soon as its last member leaves.
//!
//! Membership notifications are queued while the room entry is locked, so
//! every member sees `peer-left` and `peer-joined` in the order the changes
//! were applied. Queueing never blocks; the socket write happens on the
//! recipient's writer task.
//!
//! A peer's own record of its secret and public rooms is updated under the
//! same entry lock, after the peer state lock (room entry, then peer). A peer
//! whose teardown has begun is never admitted.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use driftway_core::crypto::{generate_public_room_id, generate_room_secret};
use driftway_core::SignalError;

use crate::audit::{AuditEvent, AuditSink};
use crate::messages::ServerMessage;
use crate::peer::Peer;
use crate::room::{Room, RoomKey};

/// All live rooms, keyed by kind and id
pub struct RoomDirectory {
    rooms: DashMap<RoomKey, Room>,
    audit: Arc<dyn AuditSink>,
}

impl RoomDirectory {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            rooms: DashMap::new(),
            audit,
        }
    }

    /// Add `peer` to a room, creating it if needed
    ///
    /// A peer already registered under the same id is removed first, so the
    /// other members see its `peer-left` before the new `peer-joined`.
    /// Returns false, leaving the directory untouched, once `peer` is being
    /// torn down.
    pub fn join(&self, peer: &Arc<Peer>, key: RoomKey) -> bool {
        let admitted = match self.rooms.entry(key.clone()) {
            Entry::Occupied(mut room) => Self::admit(room.get_mut(), peer),
            Entry::Vacant(vacant) => {
                let mut room = Room::new(key.clone());
                let admitted = Self::admit(&mut room, peer);
                if admitted {
                    vacant.insert(room);
                }
                admitted
            }
        };

        if !admitted {
            debug!("{} is closing, not joining room {}", peer, key);
            return false;
        }
        debug!("{} joined room {}", peer, key);

        if let Some(event) = AuditEvent::room_join(peer, &key) {
            self.audit.record(event);
        }
        true
    }

    /// Register `peer` in a locked room and queue the notifications
    fn admit(room: &mut Room, peer: &Arc<Peer>) -> bool {
        if !peer.enter_room(&room.key) {
            return false;
        }

        if let Some(previous) = room.take(peer.id()) {
            debug!("{} rejoined room {}, replacing {}", peer, room.key, previous);
            Self::notify_left(room, peer.id(), false);
        }

        let joined = ServerMessage::PeerJoined {
            peer: peer.info(),
            room_type: room.key.kind,
            room_id: room.key.id.clone(),
        };
        for member in room.visible_to(peer) {
            member.send(&joined);
        }

        let snapshot = ServerMessage::Peers {
            peers: room.visible_peers(peer),
            room_type: room.key.kind,
            room_id: room.key.id.clone(),
        };

        room.add_member(peer.clone());
        peer.send(&snapshot);
        true
    }

    fn notify_left(room: &Room, peer_id: &str, disconnect: bool) {
        let left = ServerMessage::PeerLeft {
            peer_id: peer_id.to_owned(),
            room_type: room.key.kind,
            room_id: room.key.id.clone(),
            disconnect,
        };
        for member in room.members() {
            member.send(&left);
        }
    }

    /// Remove `peer` from a room
    ///
    /// Returns false if `peer` was not a member. The room is deleted when it
    /// becomes empty; otherwise every remaining member gets `peer-left`.
    pub fn leave(&self, peer: &Arc<Peer>, key: &RoomKey, disconnect: bool) -> bool {
        let left = match self.rooms.entry(key.clone()) {
            Entry::Occupied(mut room) => {
                let removed = room.get_mut().remove_member(peer);
                if removed && room.get().is_empty() {
                    let (key, room) = room.remove_entry();
                    debug!("Room {} removed (empty) after {:?}", key, room.age());
                } else if removed {
                    Self::notify_left(room.get(), peer.id(), disconnect);
                }
                peer.exit_room(key);
                removed
            }
            Entry::Vacant(_) => {
                peer.exit_room(key);
                false
            }
        };

        if left {
            debug!("{} left room {} (disconnect={})", peer, key, disconnect);
        }
        left
    }

    // Address rooms

    pub fn join_ip_room(&self, peer: &Arc<Peer>) -> bool {
        self.join(peer, RoomKey::address(peer.ip()))
    }

    pub fn leave_ip_room(&self, peer: &Arc<Peer>, disconnect: bool) -> bool {
        self.leave(peer, &RoomKey::address(peer.ip()), disconnect)
    }

    // Secret rooms

    pub fn join_secret_room(&self, peer: &Arc<Peer>, secret: &str) -> bool {
        self.join(peer, RoomKey::secret(secret))
    }

    pub fn leave_secret_room(&self, peer: &Arc<Peer>, secret: &str, disconnect: bool) -> bool {
        self.leave(peer, &RoomKey::secret(secret), disconnect)
    }

    pub fn leave_all_secret_rooms(&self, peer: &Arc<Peer>, disconnect: bool) {
        for secret in peer.room_secrets() {
            self.leave_secret_room(peer, &secret, disconnect);
        }
    }

    /// Replace a room secret
    ///
    /// Every member is told the new secret and forgets the old one. The old
    /// room is dropped whether or not anyone was in it.
    pub fn regenerate_secret(&self, old_secret: &str) -> Result<String, SignalError> {
        let new_secret = generate_room_secret()?;

        if let Entry::Occupied(room) = self.rooms.entry(RoomKey::secret(old_secret)) {
            let regenerated = ServerMessage::RoomSecretRegenerated {
                old_room_secret: old_secret.to_owned(),
                new_room_secret: new_secret.clone(),
            };
            for member in room.get().members() {
                member.send(&regenerated);
                member.exit_room(room.key());
            }
            let (key, room) = room.remove_entry();
            info!("Room {} regenerated for {} members", key, room.len());
        }

        Ok(new_secret)
    }

    /// Remove every member from a secret room and tell them it is gone
    pub fn delete_secret_room(&self, secret: &str) -> usize {
        let key = RoomKey::secret(secret);
        let members: Vec<Arc<Peer>> = match self.rooms.get(&key) {
            Some(room) => room.members().cloned().collect(),
            None => return 0,
        };

        let deleted = ServerMessage::SecretRoomDeleted {
            room_secret: secret.to_owned(),
        };
        for member in &members {
            self.leave_secret_room(member, secret, true);
            member.send(&deleted);
        }

        info!("Room {} deleted, {} members removed", key, members.len());
        members.len()
    }

    // Public rooms

    /// Join a public room, leaving the current one first
    pub fn join_public_room(&self, peer: &Arc<Peer>, room_id: &str) -> bool {
        self.leave_public_room(peer, false);
        self.join(peer, RoomKey::public(room_id))
    }

    pub fn leave_public_room(&self, peer: &Arc<Peer>, disconnect: bool) -> bool {
        match peer.public_room_id() {
            Some(room_id) => self.leave(peer, &RoomKey::public(&room_id), disconnect),
            None => false,
        }
    }

    /// Open a public room under a fresh code and put `creator` in it
    ///
    /// The code is claimed atomically, so it never collides with an occupied
    /// public room.
    pub fn create_public_room(&self, creator: &Arc<Peer>) -> Result<String, SignalError> {
        self.leave_public_room(creator, false);

        let key = loop {
            let key = RoomKey::public(&generate_public_room_id()?);
            match self.rooms.entry(key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let mut room = Room::new(key.clone());
                    creator.send(&ServerMessage::PublicRoomCreated {
                        room_id: key.id.clone(),
                    });
                    if !Self::admit(&mut room, creator) {
                        return Err(SignalError::ConnectionClosed);
                    }
                    vacant.insert(room);
                    break key;
                }
            }
        };

        info!("{} created public room {}", creator, key.id);

        if let Some(event) = AuditEvent::room_join(creator, &key) {
            self.audit.record(event);
        }

        Ok(key.id)
    }

    /// Join a public room by code on behalf of a client
    ///
    /// Rate limited. Unless `create_if_invalid` is set, the room must exist.
    pub fn try_join_public_room(
        &self,
        peer: &Arc<Peer>,
        room_id: &str,
        create_if_invalid: bool,
    ) -> Result<(), SignalError> {
        if peer.rate_limit_reached() {
            return Err(SignalError::RateLimited);
        }

        let exists = self.room_exists(&RoomKey::public(room_id));
        if room_id.is_empty() || (!exists && !create_if_invalid) {
            return Err(SignalError::InvalidRoom(room_id.to_owned()));
        }

        if !self.join_public_room(peer, room_id) {
            return Err(SignalError::ConnectionClosed);
        }
        Ok(())
    }

    // Lookups

    /// Queue a frame for the member `peer_id` of a room
    pub fn send_to_member(&self, key: &RoomKey, peer_id: &str, frame: &Value) -> bool {
        match self.rooms.get(key) {
            Some(room) => match room.get(peer_id) {
                Some(member) => {
                    member.send_value(frame);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn room_exists(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    pub fn member_ids(&self, key: &RoomKey) -> Vec<String> {
        self.rooms
            .get(key)
            .map(|room| room.member_ids())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
