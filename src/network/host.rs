//! Network host capability
//!
//! The node talks to the transport through the [`Host`] trait: listen
//! addresses, identity, protocol stream handlers, outbound streams, dialing,
//! connection notifications, and the address book. [`TcpHost`] is the
//! production implementation.
//!
//! [`TcpHost`]: crate::network::tcp::TcpHost

use crate::crypto::PeerId;
use crate::network::error::P2pError;
use crate::network::multiaddr::Multiaddr;
use async_trait::async_trait;
use futures::future::BoxFuture;
use secp256k1::{PublicKey, SecretKey};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Byte transport underneath a [`Stream`]
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Callback invoked for every inbound stream on a protocol
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked on connection events
pub type ConnCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// A protocol-tagged bidirectional byte stream to a remote peer.
///
/// Dropping the stream closes it.
pub struct Stream {
    io: Box<dyn RawStream>,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    protocol: String,
}

impl Stream {
    pub fn new(
        io: Box<dyn RawStream>,
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            io,
            remote_peer,
            remote_addr,
            protocol: protocol.into(),
        }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// Remote address including its `/p2p/` component
    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Flush and shut down the write half
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_shutdown(cx)
    }
}

/// A live connection to a remote peer
#[derive(Clone)]
pub struct Connection {
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    outbound: bool,
    closed: CancellationToken,
    host: Weak<dyn Host>,
}

impl Connection {
    pub fn new(
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        outbound: bool,
        host: Weak<dyn Host>,
    ) -> Self {
        Self {
            remote_peer,
            remote_addr,
            outbound,
            closed: CancellationToken::new(),
            host,
        }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// Remote listen address (no `/p2p/` component)
    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Open a protocol stream to the remote peer of this connection
    pub async fn new_stream(&self, protocol: &str) -> Result<Stream, P2pError> {
        if self.is_closed() {
            return Err(P2pError::Disconnected);
        }
        let host = self.host.upgrade().ok_or(P2pError::NoHost)?;
        host.new_stream(&self.remote_peer, protocol).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connection event callbacks
#[derive(Clone, Default)]
pub struct NotifyBundle {
    pub connected: Option<ConnCallback>,
    pub disconnected: Option<ConnCallback>,
}

impl NotifyBundle {
    pub fn on_connected(&self, conn: &Connection) {
        if let Some(cb) = &self.connected {
            cb(conn);
        }
    }

    pub fn on_disconnected(&self, conn: &Connection) {
        if let Some(cb) = &self.disconnected {
            cb(conn);
        }
    }
}

/// The transport-level network host
#[async_trait]
pub trait Host: Send + Sync {
    /// Local peer identity
    fn id(&self) -> &PeerId;

    /// Addresses the host is listening on
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Identity → address/key store
    fn peerstore(&self) -> &AddrBook;

    /// Route inbound streams for `protocol` to `handler`
    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Open an outbound stream to `peer` speaking `protocol`
    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, P2pError>;

    /// Connect to `peer`, reusing a live connection when there is one
    async fn dial_peer(&self, peer: &PeerId) -> Result<Connection, P2pError>;

    /// Live connections to `peer`
    async fn conns_to_peer(&self, peer: &PeerId) -> Vec<Connection>;

    /// Register connection callbacks
    async fn notify(&self, bundle: NotifyBundle);
}

/// Address time-to-live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Permanent,
    For(Duration),
}

/// TTL for addresses learned from live connections
pub const PERMANENT_ADDR_TTL: Ttl = Ttl::Permanent;

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: Multiaddr,
    expires: Option<Instant>,
}

impl AddrEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct PeerRecord {
    addrs: Vec<AddrEntry>,
    public_key: Option<PublicKey>,
    secret_key: Option<SecretKey>,
}

/// Peer identity → addresses and keys
#[derive(Default)]
pub struct AddrBook {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl AddrBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address for `peer`; a repeated address keeps the longer TTL
    pub async fn add_addr(&self, peer: &PeerId, addr: &Multiaddr, ttl: Ttl) {
        self.add_addrs(peer, std::slice::from_ref(addr), ttl).await
    }

    pub async fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Ttl) {
        let expires = match ttl {
            Ttl::Permanent => None,
            Ttl::For(d) => Some(Instant::now() + d),
        };

        let mut records = self.records.write().await;
        let record = records.entry(peer.clone()).or_default();

        for addr in addrs {
            let addr = addr.without_peer();
            match record.addrs.iter_mut().find(|e| e.addr == addr) {
                Some(entry) => {
                    entry.expires = match (entry.expires, expires) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => record.addrs.push(AddrEntry { addr, expires }),
            }
        }
    }

    /// Unexpired addresses of `peer`
    pub async fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let records = self.records.read().await;
        records
            .get(peer)
            .map(|r| {
                r.addrs
                    .iter()
                    .filter(|e| !e.is_expired(now))
                    .map(|e| e.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every peer with a record, the local peer included
    pub async fn peers(&self) -> Vec<PeerId> {
        self.records.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.records.read().await.contains_key(peer)
    }

    /// Store a public key; it must hash to `peer`
    pub async fn add_pub_key(&self, peer: &PeerId, key: PublicKey) -> Result<(), P2pError> {
        if &PeerId::from_public_key(&key) != peer {
            return Err(P2pError::PeerIdMismatch {
                expected: peer.to_string(),
                actual: PeerId::from_public_key(&key).to_string(),
            });
        }
        let mut records = self.records.write().await;
        records.entry(peer.clone()).or_default().public_key = Some(key);
        Ok(())
    }

    /// Store a private key; it must belong to `peer`
    pub async fn add_priv_key(&self, peer: &PeerId, key: SecretKey) -> Result<(), P2pError> {
        let public = PublicKey::from_secret_key(&secp256k1::Secp256k1::signing_only(), &key);
        if &PeerId::from_public_key(&public) != peer {
            return Err(P2pError::PeerIdMismatch {
                expected: peer.to_string(),
                actual: PeerId::from_public_key(&public).to_string(),
            });
        }
        let mut records = self.records.write().await;
        records.entry(peer.clone()).or_default().secret_key = Some(key);
        Ok(())
    }

    pub async fn pub_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.records.read().await.get(peer).and_then(|r| r.public_key)
    }

    pub async fn priv_key(&self, peer: &PeerId) -> Option<SecretKey> {
        self.records.read().await.get(peer).and_then(|r| r.secret_key)
    }

    /// When an address of `peer` expires; `Some(None)` for a permanent one
    #[cfg(test)]
    pub(crate) async fn expiry(&self, peer: &PeerId, addr: &Multiaddr) -> Option<Option<Instant>> {
        let records = self.records.read().await;
        records
            .get(peer)?
            .addrs
            .iter()
            .find(|e| &e.addr == addr)
            .map(|e| e.expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_addr_book_dedupes() {
        let book = AddrBook::new();
        let peer = KeyPair::generate().peer_id();

        book.add_addr(&peer, &addr(1), PERMANENT_ADDR_TTL).await;
        book.add_addr(&peer, &addr(1).with_peer(peer.clone()), PERMANENT_ADDR_TTL)
            .await;
        book.add_addr(&peer, &addr(2), PERMANENT_ADDR_TTL).await;

        assert_eq!(book.addrs(&peer).await, vec![addr(1), addr(2)]);
        assert_eq!(book.peers().await, vec![peer]);
    }

    #[tokio::test]
    async fn test_addr_book_ttl() {
        let book = AddrBook::new();
        let peer = KeyPair::generate().peer_id();

        book.add_addr(&peer, &addr(1), Ttl::For(Duration::ZERO)).await;
        assert!(book.addrs(&peer).await.is_empty());
        assert!(book.contains(&peer).await);

        // A permanent re-add wins over the expired entry
        book.add_addr(&peer, &addr(1), PERMANENT_ADDR_TTL).await;
        assert_eq!(book.addrs(&peer).await, vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_addr_book_keys() {
        let book = AddrBook::new();
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let id = kp.peer_id();

        book.add_pub_key(&id, kp.public_key).await.unwrap();
        book.add_priv_key(&id, kp.secret_key).await.unwrap();
        assert_eq!(book.pub_key(&id).await, Some(kp.public_key));
        assert_eq!(book.priv_key(&id).await, Some(kp.secret_key));

        assert!(book.add_pub_key(&id, other.public_key).await.is_err());
        assert!(book.add_priv_key(&id, other.secret_key).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_delegates_io() {
        use tokio::io::AsyncReadExt;

        let (a, mut b) = tokio::io::duplex(64);
        let peer = KeyPair::generate().peer_id();
        let mut stream = Stream::new(Box::new(a), peer.clone(), addr(9), "/test");

        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(stream.remote_peer(), &peer);
        assert_eq!(stream.protocol(), "/test");

        stream.close().await.unwrap();
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_connection_close() {
        let peer = KeyPair::generate().peer_id();
        let host: Weak<dyn Host> = Weak::<crate::network::tcp::TcpHost>::new();
        let conn = Connection::new(peer, addr(1), true, host);
        assert!(!conn.is_closed());
        conn.clone().close();
        assert!(conn.is_closed());
    }
}
