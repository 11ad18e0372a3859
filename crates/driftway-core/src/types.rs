//! Core types for Driftway

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an authenticated user
pub type UserId = i64;

/// Identifier of an authorization group
pub type GroupId = i64;

/// Identity resolved from a bearer token at connect time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: UserId,
    pub username: String,
    pub is_admin: bool,
    pub is_super_admin: bool,
}

/// The three room membership models
///
/// Serialized with the wire names clients already use (`ip`, `secret`,
/// `public-id`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKind {
    /// Peers sharing a network address
    #[serde(rename = "ip")]
    Address,
    /// Peers holding the same long-lived secret
    #[serde(rename = "secret")]
    Secret,
    /// Peers that typed the same public code
    #[serde(rename = "public-id")]
    Public,
}

impl RoomKind {
    /// Wire name of this room kind
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Address => "ip",
            RoomKind::Secret => "secret",
            RoomKind::Public => "public-id",
        }
    }

    /// Parse a wire name
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(RoomKind::Address),
            "secret" => Some(RoomKind::Secret),
            "public-id" => Some(RoomKind::Public),
            _ => None,
        }
    }

    /// Whether membership visibility in this kind of room is restricted to
    /// peers sharing an authorization group
    pub fn is_group_filtered(self) -> bool {
        matches!(self, RoomKind::Address)
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check whether two group sets share at least one group
///
/// An empty set shares nothing, not even with another empty set.
pub fn share_group(a: &HashSet<GroupId>, b: &HashSet<GroupId>) -> bool {
    if a.len() <= b.len() {
        a.iter().any(|g| b.contains(g))
    } else {
        b.iter().any(|g| a.contains(g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_kind_wire_names() {
        for kind in [RoomKind::Address, RoomKind::Secret, RoomKind::Public] {
            assert_eq!(RoomKind::from_wire(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
        assert_eq!(RoomKind::from_wire("lobby"), None);
    }

    #[test]
    fn test_group_filtering_only_for_address_rooms() {
        assert!(RoomKind::Address.is_group_filtered());
        assert!(!RoomKind::Secret.is_group_filtered());
        assert!(!RoomKind::Public.is_group_filtered());
    }

    #[test]
    fn test_share_group() {
        let a: HashSet<GroupId> = [1, 2, 3].into_iter().collect();
        let b: HashSet<GroupId> = [3, 4].into_iter().collect();
        let c: HashSet<GroupId> = [5].into_iter().collect();
        let empty = HashSet::new();

        assert!(share_group(&a, &b));
        assert!(share_group(&b, &a));
        assert!(!share_group(&a, &c));
        assert!(!share_group(&empty, &empty));
        assert!(!share_group(&a, &empty));
    }

    #[test]
    fn test_identity_serialization() {
        let identity = UserIdentity {
            user_id: 7,
            username: "alice".into(),
            is_admin: false,
            is_super_admin: false,
        };
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"userId\":7"));
        assert!(json.contains("isSuperAdmin"));
    }
}
