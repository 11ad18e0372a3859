//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use driftway_core::{Config, SignalError, CLOSE_POLICY_VIOLATION};

use crate::audit::AuditSink;
use crate::auth::{AuthError, GroupResolver, IdentityResolver};
use crate::device::peer_name;
use crate::handshake::ConnectionInfo;
use crate::peer::{Outbound, Peer, PeerProfile};
use crate::router::SignalingRouter;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Bytes needed to tell a monitoring request from an upgrade
const PEEK_LEN: usize = 12;

/// Pause between peeks while a request line trickles in
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// Peeks before giving up on a short request line
const PEEK_ATTEMPTS: usize = 50;

/// Signal server: accepts connections, authenticates them and hands their
/// messages to the [`SignalingRouter`]
#[derive(Clone)]
pub struct SignalServer {
    router: SignalingRouter,
    identities: Arc<dyn IdentityResolver>,
    groups: Arc<dyn GroupResolver>,
    config: Arc<Config>,
}

impl SignalServer {
    pub fn new(
        config: Config,
        identities: Arc<dyn IdentityResolver>,
        groups: Arc<dyn GroupResolver>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            router: SignalingRouter::new(&config.signal, audit),
            identities,
            groups,
            config: Arc::new(config),
        }
    }

    pub fn router(&self) -> &SignalingRouter {
        &self.router
    }

    /// Bind the configured address and serve forever
    pub async fn serve(&self) -> Result<(), std::io::Error> {
        let addr = SocketAddr::new(self.config.signal.bind, self.config.signal.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Signal server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Number of rooms (for monitoring)
    pub fn room_count(&self) -> usize {
        self.router.room_count()
    }

    /// Number of connected peers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.router.peer_count()
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Monitoring requests are answered before any upgrade
        let head = peek_request_head(&stream).await?;
        if is_monitoring_request(&head) {
            return self.handle_http_request(&mut stream).await;
        }

        let mut info = ConnectionInfo::default();
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            info = ConnectionInfo::from_request(request);
            Ok(response)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (peer, outbound) = match self.authenticate(&info, peer_addr).await {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!("Refusing connection from {}: {}", peer_addr, e);
                let frame = CloseFrame {
                    code: CloseCode::from(e.close_code().unwrap_or(CLOSE_POLICY_VIOLATION)),
                    reason: e.close_reason().into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let writer = tokio::spawn(write_frames(ws_sender, outbound));
        self.router.connect(&peer);

        loop {
            tokio::select! {
                _ = peer.closed() => break,
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.router.handle_text(&peer, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {:?}", peer, e);
                        break;
                    }
                },
            }
        }

        self.router.disconnect(&peer, "connection closed");
        drop(peer);
        let _ = writer.await;

        debug!("Connection closed: {}", peer_addr);
        Ok(())
    }

    /// Turn an upgrade request into a peer, or refuse it
    async fn authenticate(
        &self,
        info: &ConnectionInfo,
        peer_addr: SocketAddr,
    ) -> Result<(Arc<Peer>, mpsc::UnboundedReceiver<Outbound>), SignalError> {
        let token = info
            .bearer_token(&self.config.auth.token_cookie)
            .ok_or(AuthError::MissingToken)?;
        let user = self.identities.resolve(&token).await?;
        let group_ids = self.groups.groups_for(&user).await?;

        let profile = PeerProfile {
            id: info.peer_id(),
            rtc_supported: info.rtc_supported(),
            name: peer_name(info.user_agent.as_deref()),
            ip: info.client_ip(peer_addr, self.config.signal.ipv6_localize),
            user,
            group_ids,
            user_agent: info.user_agent.clone(),
        };

        Ok(Peer::new(profile, &self.config.rate_limit))
    }

    /// Handle an HTTP request (for health checks)
    async fn handle_http_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");

        let (status, body) = match path {
            "/health" => (
                "200 OK",
                format!(
                    r#"{{"status":"healthy","rooms":{},"peers":{}}}"#,
                    self.room_count(),
                    self.peer_count()
                ),
            ),
            "/stats" => (
                "200 OK",
                format!(
                    r#"{{"rooms":{},"peers":{}}}"#,
                    self.room_count(),
                    self.peer_count()
                ),
            ),
            _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
        };

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

const MONITORING_PATHS: [&[u8]; 2] = [b"GET /health", b"GET /stats"];

/// Whether the first bytes of a connection are a health or stats request
fn is_monitoring_request(head: &[u8]) -> bool {
    MONITORING_PATHS.iter().any(|path| head.starts_with(path))
}

/// Whether more bytes could still turn `head` into a monitoring request
fn may_be_monitoring_request(head: &[u8]) -> bool {
    MONITORING_PATHS.iter().any(|path| path.starts_with(head))
}

/// Peek at the start of a connection without consuming it
///
/// A request line split across segments is peeked again until it can be
/// classified, the peer closes, or the attempts run out.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; PEEK_LEN];
    let mut n = stream.peek(&mut buf).await?;

    for _ in 0..PEEK_ATTEMPTS {
        if n == 0 || n >= PEEK_LEN || !may_be_monitoring_request(&buf[..n]) {
            break;
        }
        tokio::time::sleep(PEEK_RETRY).await;
        n = stream.peek(&mut buf).await?;
    }

    Ok(buf[..n].to_vec())
}

/// Drain a peer's outbound queue into its socket
async fn write_frames(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
