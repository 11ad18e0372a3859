//! Audit trail for room membership events

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use driftway_core::crypto::salted_hash;
use driftway_core::{RoomKind, UserId};

use crate::peer::Peer;
use crate::room::RoomKey;

/// Action recorded when a peer joins a secret or public room
pub const ACTION_JOIN_ROOM: &str = "join-room";

const SECRET_HASH_SALT: &str = "driftway-audit";

/// One audit record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub user_id: UserId,
    pub username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub detail: Option<String>,
    pub address: String,
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Record of `peer` joining `room`
    ///
    /// Address rooms are not audited. Secret rooms are identified by a salted
    /// hash so the secret itself never reaches the audit trail.
    pub fn room_join(peer: &Peer, room: &RoomKey) -> Option<Self> {
        let (resource_type, resource_id, detail) = match room.kind {
            RoomKind::Address => return None,
            RoomKind::Secret => (
                "secret-room",
                salted_hash(&room.id, SECRET_HASH_SALT),
                Some("Paired device room".to_string()),
            ),
            RoomKind::Public => (
                "public-room",
                room.id.clone(),
                Some(format!("Public room: {}", room.id)),
            ),
        };

        let user = peer.user();
        Some(Self {
            user_id: user.user_id,
            username: user.username.clone(),
            action: ACTION_JOIN_ROOM.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            detail,
            address: peer.ip().to_string(),
            agent: peer.user_agent().map(str::to_owned),
            timestamp: Utc::now(),
        })
    }
}

/// Destination for audit records
///
/// `record` is called from signaling paths and must neither block nor fail.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit records to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "driftway::audit",
            user_id = event.user_id,
            username = %event.username,
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            address = %event.address,
            "{}",
            event.detail.as_deref().unwrap_or_default()
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::peer;

    #[test]
    fn test_address_rooms_are_not_audited() {
        let (a, _rx) = peer("a", "10.0.0.1", &[1]);
        assert!(AuditEvent::room_join(&a, &RoomKey::address("10.0.0.1")).is_none());
    }

    #[test]
    fn test_secret_is_never_recorded() {
        let (a, _rx) = peer("a", "10.0.0.1", &[]);
        let secret = "s".repeat(64);
        let event = AuditEvent::room_join(&a, &RoomKey::secret(&secret)).unwrap();

        assert_eq!(event.resource_type, "secret-room");
        assert_ne!(event.resource_id, secret);
        assert!(!event.detail.unwrap().contains(&secret));
        assert_eq!(event.address, "10.0.0.1");
    }

    #[test]
    fn test_public_room_event() {
        let (a, _rx) = peer("a", "10.0.0.1", &[]);
        let event = AuditEvent::room_join(&a, &RoomKey::public("ab12c")).unwrap();

        assert_eq!(event.action, ACTION_JOIN_ROOM);
        assert_eq!(event.resource_type, "public-room");
        assert_eq!(event.resource_id, "ab12c");
        assert_eq!(event.detail.as_deref(), Some("Public room: ab12c"));
        assert_eq!(event.username, "user-a");
    }
}
