//! Message dispatch for connected peers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use driftway_core::crypto::{is_valid_room_secret, salted_hash, PEER_ID_SALT};
use driftway_core::{RoomKind, SignalConfig, SignalError};

use crate::audit::AuditSink;
use crate::directory::RoomDirectory;
use crate::keepalive::KeepAliveSupervisor;
use crate::messages::{ClientMessage, Inbound, RelayEnvelope, ServerMessage, WsConfig};
use crate::pairing::PairingRegistry;
use crate::peer::Peer;
use crate::room::RoomKey;

/// WebSocket close code for an orderly shutdown
pub const CLOSE_NORMAL: u16 = 1000;

struct RouterInner {
    rooms: RoomDirectory,
    pairing: PairingRegistry,
    keepalive: KeepAliveSupervisor,
    config: SignalConfig,
    connected: AtomicUsize,
}

/// Routes inbound messages to the room directory, the pairing registry or
/// the relay path. Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct SignalingRouter {
    inner: Arc<RouterInner>,
}

impl SignalingRouter {
    pub fn new(config: &SignalConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                rooms: RoomDirectory::new(audit),
                pairing: PairingRegistry::new(),
                keepalive: KeepAliveSupervisor::new(config),
                config: config.clone(),
                connected: AtomicUsize::new(0),
            }),
        }
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.inner.rooms
    }

    pub fn pairing(&self) -> &PairingRegistry {
        &self.inner.pairing
    }

    /// Connected peers
    pub fn peer_count(&self) -> usize {
        self.inner.connected.load(Ordering::Relaxed)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.room_count()
    }

    /// Greet a freshly authenticated peer and start supervising it
    pub fn connect(&self, peer: &Arc<Peer>) {
        self.inner.connected.fetch_add(1, Ordering::Relaxed);

        peer.send(&ServerMessage::WsConfig {
            ws_config: WsConfig {
                rtc_config: self.inner.config.rtc_config.clone(),
                ws_fallback: self.inner.config.ws_fallback,
            },
        });

        let name = peer.name();
        peer.send(&ServerMessage::DisplayName {
            display_name: name.display_name.clone(),
            device_name: name.device_name.clone(),
            peer_id: peer.id().to_owned(),
            peer_id_hash: salted_hash(peer.id(), PEER_ID_SALT),
        });

        let router: Weak<RouterInner> = Arc::downgrade(&self.inner);
        self.inner.keepalive.start(peer, move |peer, reason| {
            if let Some(inner) = router.upgrade() {
                SignalingRouter { inner }.disconnect(&peer, &reason.to_string());
            }
        });

        info!("{} connected as {}", peer, peer.user().username);
    }

    /// Handle one text frame
    pub fn handle_text(&self, peer: &Arc<Peer>, text: &str) {
        match Inbound::parse(text) {
            Ok(inbound) => self.dispatch(peer, inbound),
            Err(e) => warn!("Dropping message from {}: {}", peer, e),
        }
    }

    pub fn dispatch(&self, peer: &Arc<Peer>, inbound: Inbound) {
        if peer.is_torn_down() {
            debug!("Ignoring message from closing connection {}", peer);
            return;
        }

        let result = match inbound {
            Inbound::Control(message) => self.handle_control(peer, message),
            Inbound::Relay(envelope) => self.relay(peer, envelope),
        };

        let Err(e) = result else {
            return;
        };
        match ServerMessage::rejection(&e) {
            Some(reply) => {
                debug!("Rejected request from {}: {}", peer, e);
                peer.send(&reply);
            }
            None => match e {
                SignalError::Entropy(_) => error!("Request from {} failed: {}", peer, e),
                SignalError::RelayUnavailable => {
                    info!("Websocket fallback is not activated on this instance")
                }
                _ => debug!("Dropped request from {}: {}", peer, e),
            },
        }
    }

    fn handle_control(&self, peer: &Arc<Peer>, message: ClientMessage) -> Result<(), SignalError> {
        let rooms = &self.inner.rooms;
        let pairing = &self.inner.pairing;

        match message {
            ClientMessage::Disconnect => {
                self.disconnect(peer, "client disconnect");
            }
            ClientMessage::Pong => peer.touch_heartbeat(),
            ClientMessage::JoinIpRoom => {
                rooms.join_ip_room(peer);
            }
            ClientMessage::RoomSecrets { room_secrets } => {
                let (valid, invalid): (Vec<_>, Vec<_>) = room_secrets
                    .into_iter()
                    .partition(|secret| is_valid_room_secret(secret));
                if !invalid.is_empty() {
                    debug!("{} sent {} invalid room secrets", peer, invalid.len());
                }
                for secret in &valid {
                    rooms.join_secret_room(peer, secret);
                }
            }
            ClientMessage::RoomSecretsDeleted { room_secrets } => {
                for secret in &room_secrets {
                    rooms.delete_secret_room(secret);
                }
            }
            ClientMessage::PairDeviceInitiate => {
                pairing.initiate(peer, rooms)?;
            }
            ClientMessage::PairDeviceJoin { pair_key } => {
                pairing.join(peer, &pair_key, rooms)?;
            }
            ClientMessage::PairDeviceCancel => {
                pairing.cancel(peer);
            }
            ClientMessage::RegenerateRoomSecret { room_secret } => {
                rooms.regenerate_secret(&room_secret)?;
            }
            ClientMessage::CreatePublicRoom => {
                rooms.create_public_room(peer)?;
            }
            ClientMessage::JoinPublicRoom {
                public_room_id,
                create_if_invalid,
            } => {
                rooms.try_join_public_room(peer, &public_room_id, create_if_invalid)?;
            }
            ClientMessage::LeavePublicRoom => {
                rooms.leave_public_room(peer, true);
                peer.send(&ServerMessage::PublicRoomLeft);
            }
            ClientMessage::Unknown => debug!("Ignoring unknown message type from {}", peer),
        }

        Ok(())
    }

    /// Forward a message to a peer sharing a room with the sender
    fn relay(&self, sender: &Arc<Peer>, envelope: RelayEnvelope) -> Result<(), SignalError> {
        if envelope.kind.is_fallback() && !self.inner.config.ws_fallback {
            return Err(SignalError::RelayUnavailable);
        }

        let Some(to) = envelope
            .to
            .clone()
            .filter(|to| Uuid::parse_str(to).is_ok())
        else {
            return Err(SignalError::MalformedMessage(
                "relay without a valid recipient".into(),
            ));
        };

        let candidates = match (envelope.room_type(), envelope.room_id()) {
            (Some("ip"), _) => vec![RoomKey::address(sender.ip())],
            (room_type, Some(room_id)) => match room_type.and_then(RoomKind::from_wire) {
                Some(kind) => vec![RoomKey::new(kind, room_id)],
                None => vec![RoomKey::secret(room_id), RoomKey::public(room_id)],
            },
            (_, None) => Vec::new(),
        };

        let forwarded = envelope.into_forwarded(sender.sender_info());
        let delivered = candidates
            .iter()
            .any(|key| self.inner.rooms.send_to_member(key, &to, &forwarded));

        if !delivered {
            debug!("Relay from {} to {} found no recipient", sender, to);
        }
        Ok(())
    }

    /// Tear a peer down
    ///
    /// Safe to race from client close, keep-alive expiry and room deletion;
    /// only the first call does anything.
    pub fn disconnect(&self, peer: &Arc<Peer>, reason: &str) -> bool {
        if !peer.begin_teardown() {
            return false;
        }

        self.inner.pairing.release(peer);
        self.inner.keepalive.cancel(peer);

        let rooms = &self.inner.rooms;
        rooms.leave_ip_room(peer, true);
        rooms.leave_all_secret_rooms(peer, true);
        rooms.leave_public_room(peer, true);

        peer.close(CLOSE_NORMAL, reason);
        self.inner.connected.fetch_sub(1, Ordering::Relaxed);

        info!("{} disconnected: {}", peer, reason);
        true
    }
}
