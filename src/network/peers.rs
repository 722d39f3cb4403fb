//! Peer tracking
//!
//! [`Peers`] is the store of every peer the node has heard of, keyed by
//! identity. Each entry is a [`Peer`] handle that owns the peer's attached
//! connection and dial bookkeeping.

use crate::config::P2pConfig;
use crate::crypto::PeerId;
use crate::network::error::P2pError;
use crate::network::host::Connection;
use crate::network::message::{Message, StatusMessage};
use crate::network::multiaddr::PeerInfo;
use crate::network::wire::MessageCodec;
use async_trait::async_trait;
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::codec::FramedWrite;

/// Cached connection config of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub peer: PeerInfo,
}

/// Handle on a single remote peer
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Stable identity string
    fn get_id(&self) -> String;

    /// Identity and addresses the handle was created with
    fn cfg(&self) -> &PeerConfig;

    /// Whether an attached connection can carry outbound messages
    async fn is_writable(&self) -> Result<bool, P2pError>;

    /// Whether a dial is in flight or a live connection is attached
    async fn is_active(&self) -> Result<bool, P2pError>;

    /// Mark the start/end of a dial attempt. Attempts may overlap; the
    /// peer stays active until every started attempt has ended.
    async fn set_dialing(&self, dialing: bool);

    /// Attach a live connection; the peer is writable afterwards
    async fn add_connection(&self, conn: Connection, outbound: bool) -> Result<(), P2pError>;

    /// Send one message over a fresh protocol stream
    async fn send(&self, msg: Message) -> Result<(), P2pError>;

    /// Record the peer's last announced status
    async fn set_status(&self, status: StatusMessage);

    async fn status(&self) -> Option<StatusMessage>;
}

#[derive(Default)]
struct PeerState {
    conn: Option<Connection>,
    outbound: bool,
    /// Dial attempts in flight
    dialing: usize,
    last_connected: Option<Instant>,
    status: Option<StatusMessage>,
}

/// Default [`PeerHandle`] implementation
pub struct Peer {
    id: PeerId,
    cfg: PeerConfig,
    protocol_id: String,
    state: RwLock<PeerState>,
}

impl Peer {
    pub fn new(info: PeerInfo, protocol_id: impl Into<String>) -> Self {
        Self {
            id: info.id.clone(),
            cfg: PeerConfig { peer: info },
            protocol_id: protocol_id.into(),
            state: RwLock::new(PeerState::default()),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Whether the attached connection was dialed by us
    pub async fn is_outbound(&self) -> bool {
        self.state.read().await.outbound
    }

    /// When a connection was last attached
    pub async fn last_connected(&self) -> Option<Instant> {
        self.state.read().await.last_connected
    }

    async fn live_conn(&self) -> Option<Connection> {
        let state = self.state.read().await;
        state.conn.as_ref().filter(|c| !c.is_closed()).cloned()
    }
}

#[async_trait]
impl PeerHandle for Peer {
    fn get_id(&self) -> String {
        self.id.to_string()
    }

    fn cfg(&self) -> &PeerConfig {
        &self.cfg
    }

    async fn is_writable(&self) -> Result<bool, P2pError> {
        Ok(self.live_conn().await.is_some())
    }

    async fn is_active(&self) -> Result<bool, P2pError> {
        let state = self.state.read().await;
        let connected = state.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false);
        Ok(state.dialing > 0 || connected)
    }

    async fn set_dialing(&self, dialing: bool) {
        let mut state = self.state.write().await;
        if dialing {
            state.dialing += 1;
        } else {
            state.dialing = state.dialing.saturating_sub(1);
        }
    }

    async fn add_connection(&self, conn: Connection, outbound: bool) -> Result<(), P2pError> {
        if conn.remote_peer() != &self.id {
            return Err(P2pError::PeerIdMismatch {
                expected: self.id.to_string(),
                actual: conn.remote_peer().to_string(),
            });
        }
        if conn.is_closed() {
            return Err(P2pError::Disconnected);
        }

        let mut state = self.state.write().await;
        state.conn = Some(conn);
        state.outbound = outbound;
        state.last_connected = Some(Instant::now());
        log::debug!(
            "Attached {} connection to peer {}",
            if outbound { "outbound" } else { "inbound" },
            self.id.short()
        );
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<(), P2pError> {
        let conn = self
            .live_conn()
            .await
            .ok_or_else(|| P2pError::NotWritable(self.id.to_string()))?;

        let kind = msg.kind();
        let stream = conn.new_stream(&self.protocol_id).await?;
        let mut writer = FramedWrite::new(stream, MessageCodec);
        writer.send(msg).await?;
        writer.close().await?;

        log::debug!("Sent {:?} to {}", kind, self.id.short());
        Ok(())
    }

    async fn set_status(&self, status: StatusMessage) {
        self.state.write().await.status = Some(status);
    }

    async fn status(&self) -> Option<StatusMessage> {
        self.state.read().await.status.clone()
    }
}

/// A peer the store knows about
#[derive(Clone)]
pub struct KnownPeer {
    pub peer: Arc<dyn PeerHandle>,
    pub first_seen: Instant,
}

/// Registry of known peers
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Number of known peers
    async fn count(&self) -> Result<usize, P2pError>;

    /// Register `info`, or return the existing handle for its identity
    async fn add(&self, info: PeerInfo) -> Result<KnownPeer, P2pError>;

    async fn known_peers(&self) -> Result<Vec<KnownPeer>, P2pError>;

    async fn get(&self, id: &PeerId) -> Option<KnownPeer>;
}

/// Default [`PeerStore`] implementation
pub struct Peers {
    local_id: Option<PeerId>,
    protocol_id: String,
    peers: RwLock<HashMap<PeerId, KnownPeer>>,
}

impl Peers {
    pub fn new(cfg: &P2pConfig) -> Result<Self, P2pError> {
        let local_id = if cfg.private_key.is_empty() {
            None
        } else {
            Some(crate::crypto::KeyPair::from_private_key_hex(&cfg.private_key)?.peer_id())
        };

        Ok(Self {
            local_id,
            protocol_id: cfg.protocol_id.clone(),
            peers: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PeerStore for Peers {
    async fn count(&self) -> Result<usize, P2pError> {
        Ok(self.peers.read().await.len())
    }

    async fn add(&self, info: PeerInfo) -> Result<KnownPeer, P2pError> {
        if self.local_id.as_ref() == Some(&info.id) {
            return Err(P2pError::SelfPeer);
        }

        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(&info.id) {
            return Ok(existing.clone());
        }

        let id = info.id.clone();
        let known = KnownPeer {
            peer: Arc::new(Peer::new(info, self.protocol_id.clone())),
            first_seen: Instant::now(),
        };
        peers.insert(id.clone(), known.clone());
        log::info!("Added peer {}", id);

        Ok(known)
    }

    async fn known_peers(&self) -> Result<Vec<KnownPeer>, P2pError> {
        Ok(self.peers.read().await.values().cloned().collect())
    }

    async fn get(&self, id: &PeerId) -> Option<KnownPeer> {
        self.peers.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::host::Host;
    use crate::network::multiaddr::Multiaddr;
    use std::sync::Weak;

    fn info() -> PeerInfo {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/30333".parse().unwrap();
        PeerInfo::new(KeyPair::generate().peer_id(), vec![addr])
    }

    fn conn_to(info: &PeerInfo) -> Connection {
        let host: Weak<dyn Host> = Weak::<crate::network::tcp::TcpHost>::new();
        Connection::new(info.id.clone(), info.addrs[0].clone(), true, host)
    }

    #[tokio::test]
    async fn test_add_dedupes_by_identity() {
        let store = Peers::new(&P2pConfig::default()).unwrap();
        let info = info();

        let first = store.add(info.clone()).await.unwrap();
        let second = store.add(info.clone()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(Arc::ptr_eq(&first.peer, &second.peer));
        assert_eq!(first.peer.get_id(), info.id.to_string());
        assert_eq!(first.peer.cfg().peer, info);
    }

    #[tokio::test]
    async fn test_refuses_local_peer() {
        let cfg = P2pConfig::generate();
        let local = KeyPair::from_private_key_hex(&cfg.private_key)
            .unwrap()
            .peer_id();
        let store = Peers::new(&cfg).unwrap();

        assert!(matches!(
            store.add(PeerInfo::new(local, vec![])).await,
            Err(P2pError::SelfPeer)
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_known_peers() {
        let store = Peers::new(&P2pConfig::default()).unwrap();
        for _ in 0..3 {
            store.add(info()).await.unwrap();
        }
        assert_eq!(store.known_peers().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_writable_after_connection() {
        let info = info();
        let peer = Peer::new(info.clone(), "/chain/p2p/1.0.0");
        assert!(!peer.is_writable().await.unwrap());
        assert!(!peer.is_active().await.unwrap());

        let conn = conn_to(&info);
        peer.add_connection(conn.clone(), true).await.unwrap();
        assert!(peer.is_writable().await.unwrap());
        assert!(peer.is_active().await.unwrap());
        assert!(peer.last_connected().await.is_some());

        conn.close();
        assert!(!peer.is_writable().await.unwrap());
        assert!(!peer.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_dialing_is_active() {
        let peer = Peer::new(info(), "/chain/p2p/1.0.0");
        peer.set_dialing(true).await;
        assert!(peer.is_active().await.unwrap());
        assert!(!peer.is_writable().await.unwrap());
        peer.set_dialing(false).await;
        assert!(!peer.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_dials_stay_active() {
        let peer = Peer::new(info(), "/chain/p2p/1.0.0");
        peer.set_dialing(true).await;
        peer.set_dialing(true).await;

        peer.set_dialing(false).await;
        assert!(peer.is_active().await.unwrap());

        peer.set_dialing(false).await;
        assert!(!peer.is_active().await.unwrap());

        // An unmatched end does not underflow
        peer.set_dialing(false).await;
        peer.set_dialing(true).await;
        assert!(peer.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_foreign_connection() {
        let peer = Peer::new(info(), "/chain/p2p/1.0.0");
        let other = info();
        assert!(peer.add_connection(conn_to(&other), true).await.is_err());

        let own = peer.cfg().peer.clone();
        let closed = conn_to(&own);
        closed.close();
        assert!(peer.add_connection(closed, true).await.is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let peer = Peer::new(info(), "/chain/p2p/1.0.0");
        assert!(matches!(
            peer.send(Message::Transactions(vec![])).await,
            Err(P2pError::NotWritable(_))
        ));
    }
}
