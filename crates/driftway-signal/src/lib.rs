//! Driftway Signal Server
//!
//! Rendezvous and signaling server for peer-to-peer file transfer. Clients
//! connect via WebSocket, find each other in rooms and exchange the messages
//! needed to open a direct WebRTC connection.
//!
//! # Protocol
//!
//! 1. Client connects with a bearer token and receives `ws-config` and
//!    `display-name`
//! 2. Client joins rooms: its address room, the secret rooms of paired
//!    devices, or a public room by short code
//! 3. Room members learn about each other through `peers`, `peer-joined` and
//!    `peer-left`
//! 4. Server relays `signal` messages (and, with the websocket fallback
//!    enabled, transfer payloads) between members of a shared room
//! 5. Peers that stop answering `ping` are disconnected

pub mod audit;
pub mod auth;
pub mod device;
pub mod directory;
pub mod handshake;
pub mod keepalive;
pub mod messages;
pub mod pairing;
pub mod peer;
pub mod rate_limit;
pub mod room;
pub mod router;
pub mod server;
pub mod storage;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use auth::{AuthError, GroupResolver, IdentityResolver, JwtIdentityResolver, StaticGroupResolver};
pub use directory::RoomDirectory;
pub use messages::{ClientMessage, PeerInfo, ServerMessage};
pub use pairing::PairingRegistry;
pub use peer::{Peer, PeerProfile};
pub use room::{Room, RoomKey};
pub use router::SignalingRouter;
pub use server::SignalServer;
pub use storage::{AuditStore, SqliteAuditSink, StorageError};

pub use driftway_core::DEFAULT_PORT;
