//! Connection metadata captured from the WebSocket upgrade request

use std::net::{IpAddr, SocketAddr};

use tokio_tungstenite::tungstenite::handshake::server::Request;
use uuid::Uuid;

/// Cookie carrying a client's persistent peer id
pub const PEER_ID_COOKIE: &str = "uuid";

/// Query parameter carrying a bearer token
pub const TOKEN_QUERY_PARAM: &str = "token";

/// What the signaling server needs from the upgrade request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Request target (path and query)
    pub uri: String,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub cf_connecting_ip: Option<String>,
    pub forwarded_for: Option<String>,
}

impl ConnectionInfo {
    pub fn from_request(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            uri: request.uri().to_string(),
            authorization: header("authorization"),
            cookie: header("cookie"),
            user_agent: header("user-agent"),
            cf_connecting_ip: header("cf-connecting-ip"),
            forwarded_for: header("x-forwarded-for"),
        }
    }

    /// Bearer token, looked up in the `Authorization` header, then the token
    /// cookie, then the `token` query parameter
    pub fn bearer_token(&self, cookie_name: &str) -> Option<String> {
        let from_header = self
            .authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());

        from_header
            .or_else(|| self.cookie_value(cookie_name))
            .or_else(|| self.query_param(TOKEN_QUERY_PARAM))
            .map(str::to_owned)
    }

    /// Value of a cookie from the `Cookie` header
    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookie.as_deref()?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name && !value.is_empty()).then_some(value)
        })
    }

    /// Value of a query parameter from the request target
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.uri.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name && !value.is_empty()).then_some(value)
        })
    }

    /// Peer id from the `uuid` cookie if valid, otherwise a fresh one
    pub fn peer_id(&self) -> String {
        self.cookie_value(PEER_ID_COOKIE)
            .and_then(|v| Uuid::parse_str(v).ok())
            .unwrap_or_else(Uuid::new_v4)
            .hyphenated()
            .to_string()
    }

    /// Whether the client advertises WebRTC support
    pub fn rtc_supported(&self) -> bool {
        self.uri.contains("webrtc")
    }

    /// Normalized client address, preferring proxy headers over the socket
    pub fn client_ip(&self, socket: SocketAddr, ipv6_localize: bool) -> String {
        let first = |list: &Option<String>| {
            list.as_deref()
                .and_then(|l| l.split(',').next())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        let raw = first(&self.cf_connecting_ip)
            .or_else(|| first(&self.forwarded_for))
            .unwrap_or_else(|| socket.ip().to_string());

        normalize_ip(&raw, ipv6_localize)
    }
}

/// Canonicalize a client address
///
/// Loopback addresses become `127.0.0.1`, IPv4-mapped IPv6 addresses are
/// unwrapped, and with `ipv6_localize` IPv6 addresses are cut to their /64
/// prefix so every device on one IPv6 network lands in the same room.
pub fn normalize_ip(raw: &str, ipv6_localize: bool) -> String {
    match raw.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.is_loopback() => "127.0.0.1".into(),
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Ok(IpAddr::V6(v6)) if v6.is_loopback() => "127.0.0.1".into(),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) if v4.is_loopback() => "127.0.0.1".into(),
            Some(v4) => v4.to_string(),
            None if ipv6_localize => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3])
            }
            None => v6.to_string(),
        },
        Err(_) => raw.trim().to_string(),
    }
}
