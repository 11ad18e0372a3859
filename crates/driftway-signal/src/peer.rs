//! Per-connection peer state

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use driftway_core::{GroupId, RateLimitConfig, RoomKind, UserIdentity};

use crate::messages::{PeerInfo, PeerName, SenderInfo, ServerMessage};
use crate::rate_limit::JoinRateLimiter;
use crate::room::RoomKey;

/// Frames queued for a connection's writer task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Everything known about a connection once it is authenticated
#[derive(Clone, Debug)]
pub struct PeerProfile {
    pub id: String,
    pub rtc_supported: bool,
    pub name: PeerName,
    /// Normalized client address, also the address room id
    pub ip: String,
    pub user: UserIdentity,
    /// Group snapshot taken at connect time
    pub group_ids: HashSet<GroupId>,
    pub user_agent: Option<String>,
}

/// Room and pairing references held by a peer
#[derive(Debug, Default)]
struct PeerState {
    room_secrets: HashSet<String>,
    public_room_id: Option<String>,
    pair_key: Option<String>,
}

/// A connected, authenticated client
pub struct Peer {
    profile: PeerProfile,
    state: Mutex<PeerState>,
    limiter: Mutex<JoinRateLimiter>,
    last_heartbeat: Mutex<Instant>,
    outbound: mpsc::UnboundedSender<Outbound>,
    torn_down: AtomicBool,
    shutdown: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Create a peer and the receiving end of its outbound queue
    pub fn new(
        profile: PeerProfile,
        rate_limit: &RateLimitConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let peer = Arc::new(Self {
            profile,
            state: Mutex::new(PeerState::default()),
            limiter: Mutex::new(JoinRateLimiter::new(rate_limit)),
            last_heartbeat: Mutex::new(Instant::now()),
            outbound,
            torn_down: AtomicBool::new(false),
            shutdown,
            keepalive: Mutex::new(None),
        });

        (peer, rx)
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn ip(&self) -> &str {
        &self.profile.ip
    }

    pub fn rtc_supported(&self) -> bool {
        self.profile.rtc_supported
    }

    pub fn name(&self) -> &PeerName {
        &self.profile.name
    }

    pub fn user(&self) -> &UserIdentity {
        &self.profile.user
    }

    pub fn group_ids(&self) -> &HashSet<GroupId> {
        &self.profile.group_ids
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.profile.user_agent.as_deref()
    }

    /// Descriptor shown to other room members
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.profile.id.clone(),
            name: self.profile.name.clone(),
            rtc_supported: self.profile.rtc_supported,
        }
    }

    /// Descriptor injected into messages relayed from this peer
    pub fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            id: self.profile.id.clone(),
            rtc_supported: self.profile.rtc_supported,
        }
    }

    // Room membership

    /// Record membership of a room, refused once teardown has begun
    ///
    /// Called with the room entry locked. A teardown starting later reads the
    /// recorded membership; one that started earlier makes this return false.
    pub(crate) fn enter_room(&self, key: &RoomKey) -> bool {
        let mut state = self.state.lock();
        if self.is_torn_down() {
            return false;
        }
        match key.kind {
            RoomKind::Secret => {
                state.room_secrets.insert(key.id.clone());
            }
            RoomKind::Public => state.public_room_id = Some(key.id.clone()),
            RoomKind::Address => {}
        }
        true
    }

    /// Forget membership of a room; also called with the room entry locked
    pub(crate) fn exit_room(&self, key: &RoomKey) {
        let mut state = self.state.lock();
        match key.kind {
            RoomKind::Secret => {
                state.room_secrets.remove(&key.id);
            }
            RoomKind::Public => {
                if state.public_room_id.as_deref() == Some(key.id.as_str()) {
                    state.public_room_id = None;
                }
            }
            RoomKind::Address => {}
        }
    }

    pub fn has_secret(&self, secret: &str) -> bool {
        self.state.lock().room_secrets.contains(secret)
    }

    pub fn room_secrets(&self) -> Vec<String> {
        self.state.lock().room_secrets.iter().cloned().collect()
    }

    // Public room

    pub fn public_room_id(&self) -> Option<String> {
        self.state.lock().public_room_id.clone()
    }

    // Pairing

    pub fn pair_key(&self) -> Option<String> {
        self.state.lock().pair_key.clone()
    }

    /// Set the outstanding pair key, returning the one it replaces
    pub fn replace_pair_key(&self, pair_key: &str) -> Option<String> {
        self.state.lock().pair_key.replace(pair_key.to_owned())
    }

    pub fn take_pair_key(&self) -> Option<String> {
        self.state.lock().pair_key.take()
    }

    /// Forget the outstanding pair key if it is still `pair_key`
    pub fn clear_pair_key_if(&self, pair_key: &str) {
        let mut state = self.state.lock();
        if state.pair_key.as_deref() == Some(pair_key) {
            state.pair_key = None;
        }
    }

    /// Record a join attempt with a guessable code
    pub fn rate_limit_reached(&self) -> bool {
        self.limiter.lock().limit_reached()
    }

    // Keep-alive

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub(crate) fn set_keepalive(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.keepalive.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_keepalive(&self) -> bool {
        match self.keepalive.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    // Outbound

    /// Queue a message; dropped silently once the connection is closing
    pub fn send(&self, message: &ServerMessage) {
        match message.to_json() {
            Ok(json) => self.send_text(json),
            Err(e) => warn!("Failed to serialize message for {}: {}", self, e),
        }
    }

    /// Queue a raw JSON frame (relayed messages)
    pub fn send_value(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    fn send_text(&self, text: String) {
        if self.is_torn_down() {
            return;
        }
        if self.outbound.send(Outbound::Text(text)).is_err() {
            debug!("Dropping message for closed connection {}", self);
        }
    }

    // Teardown

    /// Claim the teardown; only the first caller gets `true`
    pub fn begin_teardown(&self) -> bool {
        self.torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Ask the writer to close the socket and wake the reader
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_owned(),
        });
        self.shutdown.send_replace(true);
    }

    /// Resolves once [`Peer::close`] has been called
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Peer id={} ip={} rtcSupported={}>",
            self.profile.id, self.profile.ip, self.profile.rtc_supported
        )
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
