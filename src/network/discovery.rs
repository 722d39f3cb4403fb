//! Peer discovery
//!
//! A discovery mechanism reports peers it has seen through a sink callback.
//! [`BootstrapDiscovery`] announces the configured bootstrap peers when it
//! starts and again on every interval, so peers that were unreachable at
//! first are retried once they come up.

use crate::network::error::P2pError;
use crate::network::multiaddr::{Multiaddr, PeerInfo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callback receiving every discovered peer
pub type DiscoverySink = Arc<dyn Fn(PeerInfo) + Send + Sync>;

/// Source of candidate peers
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Report peers to `sink` until `cancel` fires
    async fn run(&self, sink: DiscoverySink, cancel: CancellationToken);
}

/// Discovery over a fixed list of bootstrap peers
pub struct BootstrapDiscovery {
    peers: Vec<PeerInfo>,
    interval: Duration,
}

impl BootstrapDiscovery {
    /// Parse bootstrap addresses; each must carry a `/p2p/<id>` component
    pub fn new(addrs: &[String], interval: Duration) -> Result<Self, P2pError> {
        let mut peers: Vec<PeerInfo> = Vec::new();

        for raw in addrs {
            let addr: Multiaddr = raw.parse()?;
            let info = PeerInfo::from_p2p_addr(&addr)?;

            // Merge addresses of the same peer
            match peers.iter_mut().find(|p| p.id == info.id) {
                Some(existing) => existing.addrs.extend(info.addrs),
                None => peers.push(info),
            }
        }

        Ok(Self { peers, interval })
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }
}

#[async_trait]
impl Discovery for BootstrapDiscovery {
    async fn run(&self, sink: DiscoverySink, cancel: CancellationToken) {
        if self.peers.is_empty() {
            log::info!("No bootstrap peers configured");
            return;
        }

        log::info!("Bootstrapping from {} peers", self.peers.len());
        loop {
            for info in &self.peers {
                sink(info.clone());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Discovery stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use std::sync::Mutex;

    #[test]
    fn test_parse_bootstrap_peers() {
        let id = KeyPair::generate().peer_id();
        let addrs = vec![
            format!("/ip4/127.0.0.1/tcp/30333/p2p/{}", id),
            format!("/ip4/10.0.0.1/tcp/30333/p2p/{}", id),
        ];

        let discovery = BootstrapDiscovery::new(&addrs, Duration::from_secs(60)).unwrap();
        assert_eq!(discovery.peers().len(), 1);
        assert_eq!(discovery.peers()[0].id, id);
        assert_eq!(discovery.peers()[0].addrs.len(), 2);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let interval = Duration::from_secs(60);
        assert!(BootstrapDiscovery::new(&["not-an-addr".to_string()], interval).is_err());
        // Missing /p2p component
        assert!(
            BootstrapDiscovery::new(&["/ip4/127.0.0.1/tcp/1".to_string()], interval).is_err()
        );
    }

    #[tokio::test]
    async fn test_announces_until_cancelled() {
        let id = KeyPair::generate().peer_id();
        let addrs = vec![format!("/ip4/127.0.0.1/tcp/30333/p2p/{}", id)];
        let discovery = BootstrapDiscovery::new(&addrs, Duration::from_millis(10)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: DiscoverySink = Arc::new(move |info: PeerInfo| {
            sink_seen.lock().unwrap().push(info.id);
        });

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), discovery.run(sink, cancel))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2);
        assert!(seen.iter().all(|p| p == &id));
    }
}
