//! Signal protocol messages
//!
//! Every frame is a JSON object with a `type` discriminator. Control messages
//! are parsed into [`ClientMessage`]; relay messages are kept as raw JSON so
//! they can be forwarded to their recipient untouched apart from the `to` and
//! `sender` fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use driftway_core::{RoomKind, SignalError};

/// Control messages a client sends to the server
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Client is going away
    Disconnect,

    /// Answer to a keep-alive `ping`
    Pong,

    /// Join the room of everyone behind the same address
    JoinIpRoom,

    /// Join the secret rooms the client has stored
    RoomSecrets {
        #[serde(default)]
        room_secrets: Vec<String>,
    },

    /// Delete secret rooms for every member
    RoomSecretsDeleted {
        #[serde(default)]
        room_secrets: Vec<String>,
    },

    /// Start pairing: ask for a pair key
    PairDeviceInitiate,

    /// Finish pairing with a pair key shown on another device
    PairDeviceJoin { pair_key: String },

    /// Withdraw the outstanding pair key
    PairDeviceCancel,

    /// Replace a room secret with a fresh one
    RegenerateRoomSecret { room_secret: String },

    /// Create a public room with a fresh code
    CreatePublicRoom,

    /// Join a public room by code
    JoinPublicRoom {
        public_room_id: String,
        #[serde(default)]
        create_if_invalid: bool,
    },

    /// Leave the current public room
    LeavePublicRoom,

    /// Any type this server does not know
    #[serde(other)]
    Unknown,
}

/// Message types forwarded peer to peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayKind {
    /// WebRTC negotiation (SDP / ICE)
    Signal,
    Request,
    Header,
    Partition,
    PartitionReceived,
    Progress,
    FilesTransferResponse,
    FileTransferComplete,
    MessageTransferComplete,
    Text,
    DisplayNameChanged,
    WsChunk,
}

impl RelayKind {
    pub fn from_type(s: &str) -> Option<Self> {
        Some(match s {
            "signal" => RelayKind::Signal,
            "request" => RelayKind::Request,
            "header" => RelayKind::Header,
            "partition" => RelayKind::Partition,
            "partition-received" => RelayKind::PartitionReceived,
            "progress" => RelayKind::Progress,
            "files-transfer-response" => RelayKind::FilesTransferResponse,
            "file-transfer-complete" => RelayKind::FileTransferComplete,
            "message-transfer-complete" => RelayKind::MessageTransferComplete,
            "text" => RelayKind::Text,
            "display-name-changed" => RelayKind::DisplayNameChanged,
            "ws-chunk" => RelayKind::WsChunk,
            _ => return None,
        })
    }

    /// Whether this type carries transfer payload and is only relayed when
    /// the websocket fallback is enabled
    pub fn is_fallback(self) -> bool {
        !matches!(self, RelayKind::Signal)
    }
}

/// A message to be forwarded to another peer
#[derive(Clone, Debug, PartialEq)]
pub struct RelayEnvelope {
    pub kind: RelayKind,
    /// Recipient peer id, removed from the forwarded body
    pub to: Option<String>,
    /// Everything else, forwarded verbatim
    pub body: Map<String, Value>,
}

impl RelayEnvelope {
    /// The `roomType` named by the message, if any
    pub fn room_type(&self) -> Option<&str> {
        self.body.get("roomType").and_then(Value::as_str)
    }

    /// The `roomId` named by the message, if any
    pub fn room_id(&self) -> Option<&str> {
        self.body.get("roomId").and_then(Value::as_str)
    }

    /// Build the forwarded frame with the sender descriptor injected
    pub fn into_forwarded(mut self, sender: SenderInfo) -> Value {
        let sender = serde_json::to_value(sender).unwrap_or(Value::Null);
        self.body.insert("sender".into(), sender);
        Value::Object(self.body)
    }
}

/// Parsed inbound frame
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Control(ClientMessage),
    Relay(RelayEnvelope),
}

impl Inbound {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, SignalError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SignalError::MalformedMessage(e.to_string()))?;

        let Value::Object(mut body) = value else {
            return Err(SignalError::MalformedMessage("not a JSON object".into()));
        };

        let relay = body
            .get("type")
            .and_then(Value::as_str)
            .and_then(RelayKind::from_type);

        if let Some(kind) = relay {
            let to = body
                .remove("to")
                .and_then(|v| v.as_str().map(str::to_owned));
            return Ok(Inbound::Relay(RelayEnvelope { kind, to, body }));
        }

        serde_json::from_value(Value::Object(body))
            .map(Inbound::Control)
            .map_err(|e| SignalError::MalformedMessage(e.to_string()))
    }
}

/// Name shown for a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerName {
    pub display_name: String,
    pub device_name: String,
}

/// Peer descriptor shared with other room members
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: PeerName,
    pub rtc_supported: bool,
}

/// Sender descriptor injected into relayed messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: String,
    pub rtc_supported: bool,
}

/// Transport settings handed to the client on connect
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConfig {
    pub rtc_config: Value,
    pub ws_fallback: bool,
}

/// Messages the server sends to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    WsConfig {
        ws_config: WsConfig,
    },

    DisplayName {
        display_name: String,
        device_name: String,
        peer_id: String,
        peer_id_hash: String,
    },

    /// Keep-alive probe
    Ping,

    PeerJoined {
        peer: PeerInfo,
        room_type: RoomKind,
        room_id: String,
    },

    PeerLeft {
        peer_id: String,
        room_type: RoomKind,
        room_id: String,
        disconnect: bool,
    },

    /// Snapshot of the members a joining peer may see
    Peers {
        peers: Vec<PeerInfo>,
        room_type: RoomKind,
        room_id: String,
    },

    PairDeviceInitiated {
        room_secret: String,
        pair_key: String,
    },

    PairDeviceJoined {
        room_secret: String,
        peer_id: String,
    },

    PairDeviceJoinKeyInvalid,

    PairDeviceCanceled {
        pair_key: String,
    },

    JoinKeyRateLimit,

    PublicRoomCreated {
        room_id: String,
    },

    PublicRoomIdInvalid {
        public_room_id: String,
    },

    PublicRoomLeft,

    RoomSecretRegenerated {
        old_room_secret: String,
        new_room_secret: String,
    },

    SecretRoomDeleted {
        room_secret: String,
    },
}

impl ServerMessage {
    /// The reply a peer gets when its request failed
    ///
    /// Errors that are only logged have no reply.
    pub fn rejection(error: &SignalError) -> Option<Self> {
        match error {
            SignalError::RateLimited => Some(ServerMessage::JoinKeyRateLimit),
            SignalError::InvalidKey => Some(ServerMessage::PairDeviceJoinKeyInvalid),
            SignalError::InvalidRoom(id) => Some(ServerMessage::PublicRoomIdInvalid {
                public_room_id: id.clone(),
            }),
            _ => None,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_messages() {
        let msg = Inbound::parse(r#"{"type":"pair-device-join","pairKey":"01234"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Control(ClientMessage::PairDeviceJoin {
                pair_key: "01234".into()
            })
        );

        let msg = Inbound::parse(r#"{"type":"join-public-room","publicRoomId":"abcde"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Control(ClientMessage::JoinPublicRoom {
                public_room_id: "abcde".into(),
                create_if_invalid: false,
            })
        );

        // Extra fields on unit variants are ignored
        let msg = Inbound::parse(r#"{"type":"pong","ts":1}"#).unwrap();
        assert_eq!(msg, Inbound::Control(ClientMessage::Pong));
    }

    #[test]
    fn test_unknown_type_is_not_malformed() {
        let msg = Inbound::parse(r#"{"type":"hologram","x":1}"#).unwrap();
        assert_eq!(msg, Inbound::Control(ClientMessage::Unknown));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            Inbound::parse("{not json"),
            Err(SignalError::MalformedMessage(_))
        ));
        assert!(matches!(
            Inbound::parse("[1,2,3]"),
            Err(SignalError::MalformedMessage(_))
        ));
        assert!(matches!(
            Inbound::parse(r#"{"type":"pair-device-join"}"#),
            Err(SignalError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_relay_envelope_forwarding() {
        let text = r#"{"type":"signal","to":"abc","roomType":"secret","roomId":"r","sdp":{"x":1}}"#;
        let Inbound::Relay(envelope) = Inbound::parse(text).unwrap() else {
            panic!("expected relay");
        };

        assert_eq!(envelope.kind, RelayKind::Signal);
        assert_eq!(envelope.to.as_deref(), Some("abc"));
        assert_eq!(envelope.room_type(), Some("secret"));
        assert_eq!(envelope.room_id(), Some("r"));

        let forwarded = envelope.into_forwarded(SenderInfo {
            id: "me".into(),
            rtc_supported: true,
        });
        assert!(forwarded.get("to").is_none());
        assert_eq!(forwarded["type"], "signal");
        assert_eq!(forwarded["sdp"]["x"], 1);
        assert_eq!(forwarded["sender"]["id"], "me");
        assert_eq!(forwarded["sender"]["rtcSupported"], true);
    }

    #[test]
    fn test_fallback_kinds() {
        assert!(!RelayKind::Signal.is_fallback());
        for ty in ["request", "partition", "ws-chunk", "display-name-changed"] {
            assert!(RelayKind::from_type(ty).unwrap().is_fallback());
        }
        assert_eq!(RelayKind::from_type("pong"), None);
    }

    #[test]
    fn test_server_message_wire_format() {
        let msg = ServerMessage::PeerLeft {
            peer_id: "p1".into(),
            room_type: RoomKind::Public,
            room_id: "abcde".into(),
            disconnect: true,
        };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "peer-left");
        assert_eq!(json["peerId"], "p1");
        assert_eq!(json["roomType"], "public-id");
        assert_eq!(json["disconnect"], true);

        let json = ServerMessage::JoinKeyRateLimit.to_json().unwrap();
        assert_eq!(json, r#"{"type":"join-key-rate-limit"}"#);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            ServerMessage::rejection(&SignalError::RateLimited),
            Some(ServerMessage::JoinKeyRateLimit)
        );
        assert_eq!(
            ServerMessage::rejection(&SignalError::InvalidRoom("zzzzz".into())),
            Some(ServerMessage::PublicRoomIdInvalid {
                public_room_id: "zzzzz".into()
            })
        );
        assert_eq!(ServerMessage::rejection(&SignalError::RelayUnavailable), None);
    }
}
