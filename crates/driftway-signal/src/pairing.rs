//! Device pairing
//!
//! A pairing is a short numeric key shown on one device and typed on another.
//! The key maps to a freshly generated room secret; once the second device
//! joins with the key, both devices share the secret room and the key is gone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use driftway_core::crypto::{generate_pair_key, generate_room_secret};
use driftway_core::SignalError;

use crate::directory::RoomDirectory;
use crate::messages::ServerMessage;
use crate::peer::Peer;

/// An outstanding pair key
struct PairingEntry {
    room_secret: String,
    creator: Arc<Peer>,
}

/// Outstanding pair keys
///
/// A creator's own pair key is only changed while the table is locked, so the
/// table and the peers' keys never disagree. Lock order is table, then peer.
#[derive(Default)]
pub struct PairingRegistry {
    entries: Mutex<HashMap<String, PairingEntry>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a pair key for `creator` and put it in the new secret room
    ///
    /// Any key `creator` issued earlier stops working. The key and secret
    /// reach the creator as `pair-device-initiated`.
    pub fn initiate(&self, creator: &Arc<Peer>, rooms: &RoomDirectory) -> Result<(), SignalError> {
        let room_secret = generate_room_secret()?;

        let pair_key = {
            let mut entries = self.entries.lock();
            // Teardown releases keys under this lock after raising the flag
            if creator.is_torn_down() {
                return Err(SignalError::ConnectionClosed);
            }

            let pair_key = loop {
                let candidate = generate_pair_key()?;
                if !entries.contains_key(&candidate) {
                    break candidate;
                }
            };
            entries.insert(
                pair_key.clone(),
                PairingEntry {
                    room_secret: room_secret.clone(),
                    creator: creator.clone(),
                },
            );
            if let Some(previous) = creator
                .replace_pair_key(&pair_key)
                .filter(|previous| *previous != pair_key)
            {
                remove_owned(&mut entries, &previous, creator);
                debug!("{} replaced pair key {}", creator, previous);
            }
            pair_key
        };

        creator.send(&ServerMessage::PairDeviceInitiated {
            room_secret: room_secret.clone(),
            pair_key,
        });
        rooms.join_secret_room(creator, &room_secret);

        info!("{} initiated pairing", creator);
        Ok(())
    }

    /// Redeem a pair key
    ///
    /// Only the joiner is rate limited. Unknown keys and keys issued by the
    /// joiner itself are rejected. On success both sides learn each other's
    /// id, the joiner enters the secret room and the key is consumed.
    pub fn join(
        &self,
        joiner: &Arc<Peer>,
        pair_key: &str,
        rooms: &RoomDirectory,
    ) -> Result<(), SignalError> {
        if joiner.rate_limit_reached() {
            return Err(SignalError::RateLimited);
        }

        let entry = {
            let mut entries = self.entries.lock();
            if joiner.is_torn_down() {
                return Err(SignalError::ConnectionClosed);
            }
            match entries.get(pair_key) {
                Some(entry) if entry.creator.id() != joiner.id() => {
                    let entry = entries.remove(pair_key);
                    if let Some(entry) = &entry {
                        entry.creator.clear_pair_key_if(pair_key);
                    }
                    entry
                }
                _ => None,
            }
        };
        let Some(PairingEntry {
            room_secret,
            creator,
        }) = entry
        else {
            return Err(SignalError::InvalidKey);
        };

        joiner.send(&ServerMessage::PairDeviceJoined {
            room_secret: room_secret.clone(),
            peer_id: creator.id().to_owned(),
        });
        creator.send(&ServerMessage::PairDeviceJoined {
            room_secret: room_secret.clone(),
            peer_id: joiner.id().to_owned(),
        });

        rooms.join_secret_room(joiner, &room_secret);
        self.release(joiner);

        info!("{} paired with {}", joiner, creator);
        Ok(())
    }

    /// Withdraw the creator's outstanding key and confirm it
    pub fn cancel(&self, creator: &Arc<Peer>) -> Option<String> {
        let pair_key = self.withdraw(creator)?;

        creator.send(&ServerMessage::PairDeviceCanceled {
            pair_key: pair_key.clone(),
        });
        debug!("{} canceled pair key {}", creator, pair_key);
        Some(pair_key)
    }

    /// Drop the peer's outstanding key without notifying anyone
    pub fn release(&self, peer: &Arc<Peer>) -> Option<String> {
        self.withdraw(peer)
    }

    /// Forget the peer's key; the entry goes only if `peer` created it
    fn withdraw(&self, peer: &Arc<Peer>) -> Option<String> {
        let mut entries = self.entries.lock();
        let pair_key = peer.take_pair_key()?;
        remove_owned(&mut entries, &pair_key, peer);
        Some(pair_key)
    }

    /// Whether `pair_key` is outstanding
    pub fn contains(&self, pair_key: &str) -> bool {
        self.entries.lock().contains_key(pair_key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn remove_owned(
    entries: &mut HashMap<String, PairingEntry>,
    pair_key: &str,
    creator: &Arc<Peer>,
) {
    let owned = entries
        .get(pair_key)
        .is_some_and(|entry| Arc::ptr_eq(&entry.creator, creator));
    if owned {
        entries.remove(pair_key);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::peer::test_support::{drain, peer};
    use crate::peer::Outbound;
    use crate::room::RoomKey;

    fn rooms() -> RoomDirectory {
        RoomDirectory::new(Arc::new(TracingAuditSink))
    }

    /// Start a pairing and read back (pair key, room secret)
    fn initiate(
        registry: &PairingRegistry,
        creator: &Arc<Peer>,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        rooms: &RoomDirectory,
    ) -> (String, String) {
        registry.initiate(creator, rooms).unwrap();
        drain(rx)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::PairDeviceInitiated {
                    pair_key,
                    room_secret,
                } => Some((pair_key, room_secret)),
                _ => None,
            })
            .expect("pair-device-initiated")
    }

    #[test]
    fn test_pairing_scenario() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, mut rb) = peer("b", "10.0.0.2", &[]);

        registry.initiate(&a, &rooms).unwrap();
        let (pair_key, room_secret) = match &drain(&mut ra)[..] {
            [ServerMessage::PairDeviceInitiated {
                pair_key,
                room_secret,
            }, ServerMessage::Peers { peers, .. }] if peers.is_empty() => {
                (pair_key.clone(), room_secret.clone())
            }
            other => panic!("unexpected messages {:?}", other),
        };
        assert_eq!(pair_key.len(), 5);
        assert!(pair_key.bytes().all(|c| c.is_ascii_digit()));
        assert_eq!(room_secret.len(), 256);
        assert!(a.has_secret(&room_secret));

        registry.join(&b, &pair_key, &rooms).unwrap();

        let to_a = drain(&mut ra);
        assert_eq!(
            to_a[0],
            ServerMessage::PairDeviceJoined {
                room_secret: room_secret.clone(),
                peer_id: "b".into(),
            }
        );
        assert!(matches!(&to_a[1], ServerMessage::PeerJoined { peer, .. } if peer.id == "b"));

        let to_b = drain(&mut rb);
        assert_eq!(
            to_b[0],
            ServerMessage::PairDeviceJoined {
                room_secret: room_secret.clone(),
                peer_id: "a".into(),
            }
        );
        assert!(matches!(&to_b[1], ServerMessage::Peers { peers, .. } if peers[0].id == "a"));

        let mut members = rooms.member_ids(&RoomKey::secret(&room_secret));
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        assert!(registry.is_empty());
        assert_eq!(a.pair_key(), None);
    }

    #[test]
    fn test_key_is_single_use() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);
        let (c, _rc) = peer("c", "10.0.0.3", &[]);

        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);
        registry.join(&b, &pair_key, &rooms).unwrap();
        assert_eq!(
            registry.join(&c, &pair_key, &rooms),
            Err(SignalError::InvalidKey)
        );
    }

    #[test]
    fn test_self_join_is_rejected() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);

        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);
        assert_eq!(
            registry.join(&a, &pair_key, &rooms),
            Err(SignalError::InvalidKey)
        );
        // The key survives a rejected self-join
        assert!(registry.contains(&pair_key));
    }

    #[test]
    fn test_new_initiate_invalidates_old_key() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);

        let (first, _) = initiate(&registry, &a, &mut ra, &rooms);
        let (second, _) = initiate(&registry, &a, &mut ra, &rooms);

        assert_ne!(first, second);
        assert!(!registry.contains(&first));
        assert!(registry.contains(&second));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.pair_key(), Some(second));
    }

    #[test]
    fn test_joiner_key_is_dropped() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, mut rb) = peer("b", "10.0.0.2", &[]);

        let (from_a, _) = initiate(&registry, &a, &mut ra, &rooms);
        let (from_b, _) = initiate(&registry, &b, &mut rb, &rooms);
        registry.join(&b, &from_a, &rooms).unwrap();

        assert!(!registry.contains(&from_b));
        assert_eq!(b.pair_key(), None);
    }

    #[test]
    fn test_cancel() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);

        assert_eq!(registry.cancel(&a), None);

        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);
        assert_eq!(registry.cancel(&a), Some(pair_key.clone()));
        assert_eq!(
            drain(&mut ra),
            vec![ServerMessage::PairDeviceCanceled {
                pair_key: pair_key.clone()
            }]
        );
        assert_eq!(
            registry.join(&b, &pair_key, &rooms),
            Err(SignalError::InvalidKey)
        );
    }

    #[test]
    fn test_joiner_rate_limit() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);
        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);

        let wrong = if pair_key == "00000" { "00001" } else { "00000" };
        for _ in 0..5 {
            assert_eq!(registry.join(&b, wrong, &rooms), Err(SignalError::InvalidKey));
        }
        // Even the right key is refused once the limit trips
        assert_eq!(
            registry.join(&b, &pair_key, &rooms),
            Err(SignalError::RateLimited)
        );
        assert!(registry.contains(&pair_key));

        // The creator is never limited by initiating
        for _ in 0..10 {
            registry.initiate(&a, &rooms).unwrap();
        }
    }

    #[test]
    fn test_release_on_disconnect() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);

        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);
        assert_eq!(registry.release(&a), Some(pair_key));
        assert!(registry.is_empty());
        assert!(drain(&mut ra).is_empty());
    }

    #[test]
    fn test_release_keeps_entries_of_other_creators() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);

        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);
        // b holds a stale copy of a key it did not issue
        b.replace_pair_key(&pair_key);

        assert_eq!(registry.release(&b), Some(pair_key.clone()));
        assert!(registry.contains(&pair_key));
        assert_eq!(a.pair_key(), Some(pair_key.clone()));

        assert_eq!(registry.cancel(&a), Some(pair_key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_torn_down_peer_cannot_pair() {
        let rooms = rooms();
        let registry = PairingRegistry::new();
        let (a, mut ra) = peer("a", "10.0.0.1", &[]);
        let (b, _rb) = peer("b", "10.0.0.2", &[]);
        let (pair_key, _) = initiate(&registry, &a, &mut ra, &rooms);

        b.begin_teardown();
        assert_eq!(registry.initiate(&b, &rooms), Err(SignalError::ConnectionClosed));
        assert_eq!(b.pair_key(), None);
        assert_eq!(
            registry.join(&b, &pair_key, &rooms),
            Err(SignalError::ConnectionClosed)
        );

        // a's key is still redeemable
        assert!(registry.contains(&pair_key));
        assert_eq!(registry.len(), 1);
        assert_eq!(rooms.room_count(), 1);
    }
}
