//! Keep-alive supervision
//!
//! Each peer gets a task that sends `ping` every interval. A `pong` refreshes
//! the peer's heartbeat. When a ping is due and the peer has been silent for
//! more than `max_missed` intervals, the stale callback tears the peer down.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info};

use driftway_core::{SignalConfig, SignalError};

use crate::messages::ServerMessage;
use crate::peer::Peer;

#[derive(Clone, Copy, Debug)]
pub struct KeepAliveSupervisor {
    interval: Duration,
    max_missed: u32,
}

impl KeepAliveSupervisor {
    pub fn new(config: &SignalConfig) -> Self {
        Self::with_interval(config.keepalive_interval(), config.keepalive_max_missed)
    }

    pub fn with_interval(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed,
        }
    }

    /// Silence after which a peer is considered gone
    pub fn stale_after(&self) -> Duration {
        self.interval * self.max_missed
    }

    /// Start pinging `peer`
    ///
    /// `on_stale` runs at most once, from the keep-alive task. A previous
    /// task for the same peer is aborted.
    pub fn start<F>(&self, peer: &Arc<Peer>, on_stale: F)
    where
        F: FnOnce(Arc<Peer>, SignalError) + Send + 'static,
    {
        let weak: Weak<Peer> = Arc::downgrade(peer);
        let interval = self.interval;
        let stale_after = self.stale_after();

        let handle = tokio::spawn(async move {
            loop {
                let Some(peer) = weak.upgrade() else {
                    return;
                };
                if peer.is_torn_down() {
                    return;
                }

                let silent = peer.since_heartbeat();
                if silent > stale_after {
                    info!("{} missed keep-alive for {:?}, disconnecting", peer, silent);
                    on_stale(peer, SignalError::StaleConnection(silent.as_millis() as u64));
                    return;
                }

                peer.send(&ServerMessage::Ping);
                drop(peer);

                tokio::time::sleep(interval).await;
            }
        });

        peer.set_keepalive(handle);
        debug!("Keep-alive started for {}", peer);
    }

    /// Stop pinging `peer`; false if nothing was running
    pub fn cancel(&self, peer: &Peer) -> bool {
        peer.cancel_keepalive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::peer;
    use crate::peer::Outbound;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    fn supervisor() -> KeepAliveSupervisor {
        KeepAliveSupervisor::with_interval(Duration::from_secs(1), 5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_evicted() {
        let (p, mut rx) = peer("a", "10.0.0.1", &[]);
        let (tx, stale) = oneshot::channel();
        let started = Instant::now();

        supervisor().start(&p, move |peer, error| {
            let _ = tx.send((peer.id().to_string(), error));
        });

        let (id, error) = stale.await.unwrap();
        assert_eq!(id, "a");
        assert!(matches!(error, SignalError::StaleConnection(ms) if ms > 5000));

        // Probes at 0..=5 s, eviction when the 6 s probe is due
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        let mut pings = 0;
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            assert_eq!(text, r#"{"type":"ping"}"#);
            pings += 1;
        }
        assert_eq!(pings, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_peer_alive() {
        let (p, _rx) = peer("a", "10.0.0.1", &[]);
        let (tx, mut stale) = oneshot::channel::<()>();

        supervisor().start(&p, move |_, _| {
            let _ = tx.send(());
        });

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            p.touch_heartbeat();
        }
        assert!(stale.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let (p, mut rx) = peer("a", "10.0.0.1", &[]);
        let keepalive = supervisor();

        keepalive.start(&p, |_, _| panic!("cancelled task fired"));
        tokio::task::yield_now().await;
        assert!(keepalive.cancel(&p));
        assert!(!keepalive.cancel(&p));

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_down_peer_stops_task() {
        let (p, _rx) = peer("a", "10.0.0.1", &[]);
        let (tx, mut stale) = oneshot::channel::<()>();

        supervisor().start(&p, move |_, _| {
            let _ = tx.send(());
        });
        p.begin_teardown();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(stale.try_recv().is_err());
    }
}
