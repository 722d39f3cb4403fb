//! P2P node
//!
//! Ties the network host, the peer store, the dial queue and the sync
//! component together. Background work runs on tasks that all select on one
//! cancellation token:
//! - a single dial sweep over the dial queue
//! - one ping loop per connected peer
//! - the periodic block request loop
//! - discovery

use crate::chain::ChainService;
use crate::config::{ClientConfig, P2pConfig};
use crate::crypto::{KeyPair, PeerId};
use crate::network::dial_queue::DialQueue;
use crate::network::discovery::{BootstrapDiscovery, Discovery, DiscoverySink};
use crate::network::error::P2pError;
use crate::network::handler::{default_registry, HandlerRegistry, OnMessage};
use crate::network::host::{
    AddrBook, Connection, Host, NotifyBundle, Stream, StreamHandler, Ttl, PERMANENT_ADDR_TTL,
};
use crate::network::message::{Message, StatusMessage, PROTOCOL_VERSION};
use crate::network::multiaddr::{Multiaddr, PeerInfo};
use crate::network::peers::{PeerHandle, PeerStore, Peers};
use crate::network::ping;
use crate::network::sync::{BlockSync, ChainSync};
use crate::network::tcp::TcpHost;
use crate::network::wire::MessageCodec;
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// TTL for addresses reported by discovery
const DISCOVERED_ADDR_TTL: Ttl = Ttl::For(Duration::from_secs(10 * 60));

/// Idle time after which an inbound message stream is dropped
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Events surfaced to the owner of the node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer became writable
    PeerConnected { peer: String },
    /// A message with no built-in handling
    Message { peer: String, message: Message },
}

/// Node status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub listen_addrs: Vec<Multiaddr>,
    pub peers: usize,
    pub connected: usize,
    pub queued_dials: usize,
}

struct NodeInner {
    cfg: ClientConfig,
    settings: P2pConfig,
    host: OnceLock<Arc<dyn Host>>,
    peers: Arc<dyn PeerStore>,
    sync: Arc<dyn BlockSync>,
    chain: Arc<dyn ChainService>,
    events: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dial_queue: DialQueue,
    registry: HandlerRegistry,
    pinging: Mutex<HashSet<String>>,
}

/// The P2P service
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node. Nothing touches the network until [`Node::start`].
    ///
    /// `cancel` is the node's stop signal; [`Node::stop`] cancels it.
    pub fn new(
        cancel: CancellationToken,
        events: mpsc::Sender<NodeEvent>,
        cfg: Option<ClientConfig>,
        chain: Option<Arc<dyn ChainService>>,
    ) -> Result<Self, P2pError> {
        let cfg = cfg.ok_or(P2pError::NoConfig)?;
        let p2p = cfg.p2p.clone().ok_or(P2pError::NoP2pConfig)?;
        let chain = chain.ok_or(P2pError::NoChainService)?;
        p2p.validate()?;

        let peers: Arc<dyn PeerStore> = Arc::new(Peers::new(&p2p)?);
        let sync: Arc<dyn BlockSync> = Arc::new(ChainSync::new(chain.clone(), p2p.sync_batch_size));

        Ok(Self::assemble(cfg, peers, sync, chain, events, cancel))
    }

    fn assemble(
        cfg: ClientConfig,
        peers: Arc<dyn PeerStore>,
        sync: Arc<dyn BlockSync>,
        chain: Arc<dyn ChainService>,
        events: mpsc::Sender<NodeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = cfg.p2p.clone().unwrap_or_default();
        let dial_queue = DialQueue::new(settings.dial_backoff());

        Self {
            inner: Arc::new(NodeInner {
                cfg,
                settings,
                host: OnceLock::new(),
                peers,
                sync,
                chain,
                events,
                cancel,
                tracker: TaskTracker::new(),
                dial_queue,
                registry: default_registry(),
                pinging: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn upgrade(weak: &Weak<NodeInner>) -> Option<Node> {
        weak.upgrade().map(|inner| Node { inner })
    }

    /// Build the host and start every background task
    pub async fn start(&self) -> Result<(), P2pError> {
        let p2p = self
            .inner
            .cfg
            .p2p
            .as_ref()
            .ok_or(P2pError::NoP2pConfig)?;
        if self.inner.host.get().is_some() {
            return Err(P2pError::AlreadyStarted);
        }

        let key = KeyPair::from_private_key_hex(&p2p.private_key)?;
        let id = key.peer_id();
        let listen: Multiaddr = p2p.listen_address.parse()?;

        let addr_book = AddrBook::new();
        addr_book.add_pub_key(&id, key.public_key).await?;
        addr_book.add_priv_key(&id, key.secret_key).await?;

        let discovery = BootstrapDiscovery::new(&p2p.bootstrap_peers, p2p.discovery_interval())?;

        let host_cancel = self.inner.cancel.child_token();
        let host: Arc<dyn Host> = TcpHost::listen(
            id,
            &listen,
            addr_book,
            p2p.dial_timeout(),
            host_cancel.clone(),
        )
        .await?;

        if let Err(e) = self.attach_host(host, Arc::new(discovery)).await {
            host_cancel.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Wire callbacks into `host`, publish it and spawn the background loops
    async fn attach_host(
        &self,
        host: Arc<dyn Host>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<(), P2pError> {
        let settings = &self.inner.settings;
        host.set_stream_handler(&settings.protocol_id, self.protocol_stream_handler())
            .await;
        host.set_stream_handler(&settings.ping_protocol_id, self.ping_stream_handler())
            .await;
        host.notify(self.conn_notifiee()).await;

        self.inner
            .host
            .set(host.clone())
            .map_err(|_| P2pError::AlreadyStarted)?;

        let tracker = &self.inner.tracker;
        tracker.spawn(self.clone().run_dial_sweep());
        tracker.spawn(self.clone().request_any());

        let sink = self.discovery_sink();
        let cancel = self.inner.cancel.clone();
        tracker.spawn(async move { discovery.run(sink, cancel).await });

        for addr in host.addrs() {
            log::info!("P2P node started on {}/p2p/{}", addr, host.id());
        }
        Ok(())
    }

    /// True once a host is running and bound to an address.
    ///
    /// Reports false again after [`Node::stop`].
    pub fn is_started(&self) -> bool {
        !self.inner.cancel.is_cancelled()
            && self
                .inner
                .host
                .get()
                .map(|h| !h.addrs().is_empty())
                .unwrap_or(false)
    }

    fn started_host(&self) -> Result<Arc<dyn Host>, P2pError> {
        if !self.is_started() {
            return Err(P2pError::NotStarted);
        }
        self.inner.host.get().cloned().ok_or(P2pError::NotStarted)
    }

    /// Signal every background loop to exit.
    ///
    /// The host stays allocated; its accept loop exits with the others.
    pub fn stop(&self) -> Result<(), P2pError> {
        if self.inner.host.get().is_none() {
            return Err(P2pError::NoHost);
        }

        log::info!("Stopping P2P node");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        Ok(())
    }

    /// Wait until every background task has exited
    pub async fn wait_stopped(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    pub async fn get_num_peers(&self) -> Result<usize, P2pError> {
        self.inner.peers.count().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.cfg
    }

    pub fn peer_store(&self) -> &Arc<dyn PeerStore> {
        &self.inner.peers
    }

    pub(crate) fn chain(&self) -> &Arc<dyn ChainService> {
        &self.inner.chain
    }

    pub async fn status(&self) -> Result<NodeStatus, P2pError> {
        let host = self.inner.host.get().ok_or(P2pError::NoHost)?;

        let known = self.inner.peers.known_peers().await?;
        let mut connected = 0;
        for kp in &known {
            if kp.peer.is_writable().await.unwrap_or(false) {
                connected += 1;
            }
        }

        Ok(NodeStatus {
            peer_id: host.id().clone(),
            listen_addrs: host
                .addrs()
                .iter()
                .map(|a| a.with_peer(host.id().clone()))
                .collect(),
            peers: known.len(),
            connected,
            queued_dials: self.inner.dial_queue.len().await,
        })
    }

    /// Push an event to the owner; dropped when the channel is full
    pub(crate) fn emit(&self, event: NodeEvent) {
        match self.inner.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::warn!("Event channel full, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => log::debug!("Event channel closed"),
        }
    }

    fn protocol_stream_handler(&self) -> StreamHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |stream: Stream| {
            let weak = weak.clone();
            async move {
                if let Some(node) = Node::upgrade(&weak) {
                    node.protocol_handler(stream).await;
                }
            }
            .boxed()
        })
    }

    fn ping_stream_handler(&self) -> StreamHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |stream: Stream| {
            let weak = weak.clone();
            async move {
                if let Some(node) = Node::upgrade(&weak) {
                    node.ping_handler(stream).await;
                }
            }
            .boxed()
        })
    }

    fn conn_notifiee(&self) -> NotifyBundle {
        let on_connect = Arc::downgrade(&self.inner);
        let on_disconnect = Arc::downgrade(&self.inner);

        NotifyBundle {
            connected: Some(Arc::new(move |conn: &Connection| {
                let Some(node) = Node::upgrade(&on_connect) else {
                    return;
                };
                let conn = conn.clone();
                let tracker = node.inner.tracker.clone();
                tracker.spawn(async move { node.on_conn(conn).await });
            })),
            disconnected: Some(Arc::new(move |conn: &Connection| {
                let Some(node) = Node::upgrade(&on_disconnect) else {
                    return;
                };
                let conn = conn.clone();
                let tracker = node.inner.tracker.clone();
                tracker.spawn(async move { node.on_disconnect(conn).await });
            })),
        }
    }

    fn discovery_sink(&self) -> DiscoverySink {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |info: PeerInfo| {
            let Some(node) = Node::upgrade(&weak) else {
                return;
            };
            let tracker = node.inner.tracker.clone();
            tracker.spawn(async move { node.handle_discovered(info).await });
        })
    }

    /// Register the remote side of a new connection and dial it back
    async fn on_conn(&self, conn: Connection) {
        let Some(host) = self.inner.host.get().cloned() else {
            log::warn!(
                "Connection from {} before host start, ignoring",
                conn.remote_peer()
            );
            return;
        };

        let remote = conn.remote_peer().clone();
        if host.peerstore().contains(&remote).await {
            return;
        }
        host.peerstore()
            .add_addr(&remote, conn.remote_multiaddr(), PERMANENT_ADDR_TTL)
            .await;

        let info = PeerInfo::new(remote.clone(), vec![conn.remote_multiaddr().clone()]);
        let known = match self.inner.peers.add(info).await {
            Ok(known) => known,
            Err(e) => {
                log::warn!("Failed to register peer {}: {}", remote, e);
                return;
            }
        };

        if let Err(e) = self.dial_peer(&known.peer).await {
            log::warn!("Dial back to {} failed: {}", remote, e);
        }
    }

    /// Queue a dropped peer for redial
    async fn on_disconnect(&self, conn: Connection) {
        if !self.is_started() {
            return;
        }
        if let Some(known) = self.inner.peers.get(conn.remote_peer()).await {
            log::info!("Peer {} disconnected", conn.remote_peer());
            self.dial_peers(known.peer).await;
        }
    }

    async fn handle_discovered(&self, info: PeerInfo) {
        let Some(host) = self.inner.host.get().cloned() else {
            return;
        };
        if &info.id == host.id() {
            return;
        }

        host.peerstore()
            .add_addrs(&info.id, &info.addrs, DISCOVERED_ADDR_TTL)
            .await;

        let id = info.id.clone();
        let known = match self.inner.peers.add(info).await {
            Ok(known) => known,
            Err(e) => {
                log::warn!("Failed to register discovered peer {}: {}", id, e);
                return;
            }
        };

        match known.peer.is_writable().await {
            Ok(true) => {}
            Ok(false) => self.dial_peers(known.peer).await,
            Err(e) => log::warn!("Writability check for {} failed: {}", id, e),
        }
    }

    /// Inbound stream on the message protocol.
    ///
    /// Registers the remote peer, queues a dial when we cannot write to it
    /// yet, then dispatches every frame until the stream ends. The stream is
    /// dropped, and so closed, on every return path.
    pub async fn protocol_handler(&self, stream: Stream) {
        let info = match PeerInfo::from_p2p_addr(stream.remote_multiaddr()) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Bad remote address on inbound stream: {}", e);
                return;
            }
        };

        let id = info.id.clone();
        let known = match self.inner.peers.add(info).await {
            Ok(known) => known,
            Err(e) => {
                log::warn!("Failed to register peer {}: {}", id, e);
                return;
            }
        };

        match known.peer.is_writable().await {
            Ok(true) => {}
            Ok(false) => {
                let node = self.clone();
                let peer = known.peer.clone();
                self.inner
                    .tracker
                    .spawn(async move { node.dial_peers(peer).await });
            }
            Err(e) => log::warn!("Writability check for {} failed: {}", id, e),
        }

        let mut frames = FramedRead::new(stream, MessageCodec);
        loop {
            let next = match timeout(STREAM_READ_TIMEOUT, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    log::debug!("Stream from {} idle, closing", id);
                    break;
                }
            };

            match next {
                Some(Ok(message)) => {
                    let kind = message.kind();
                    let envelope = OnMessage {
                        peer: known.peer.clone(),
                        message,
                    };
                    if let Err(e) = self.handle_peer_message(&envelope).await {
                        log::warn!("Failed to handle {:?} from {}: {}", kind, id, e);
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Bad frame from {}: {}", id, e);
                    break;
                }
                None => break,
            }
        }
    }

    /// Inbound stream on the ping protocol
    pub async fn ping_handler(&self, stream: Stream) {
        let remote = stream.remote_peer().clone();
        match ping::echo(stream).await {
            Ok(n) => log::debug!("Echoed {} ping bytes to {}", n, remote),
            Err(e) => log::debug!("Ping echo to {} failed: {}", remote, e),
        }
    }

    /// Dispatch an inbound message to its registered handler
    pub async fn handle_peer_message(&self, msg: &OnMessage) -> Result<(), P2pError> {
        self.inner
            .registry
            .dispatch(self, &msg.peer, &msg.message)
            .await
    }

    /// Queue `peer` for dialing and wake the sweeper
    pub async fn dial_peers(&self, peer: Arc<dyn PeerHandle>) {
        if !self.is_started() {
            log::warn!("Not dialing {}: {}", peer.get_id(), P2pError::NotStarted);
            return;
        }

        let id = peer.get_id();
        if self.inner.dial_queue.insert(peer, Instant::now()).await {
            log::debug!("Queued {} for dialing", id);
        }
    }

    async fn run_dial_sweep(self) {
        let interval = self.inner.settings.dial_interval();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    log::info!("Dial loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.dial_queue.woken() => {}
            }

            self.sweep_dial_queue(Instant::now()).await;
        }
    }

    /// Dial every due, inactive peer in the queue; returns the attempt count
    async fn sweep_dial_queue(&self, now: Instant) -> usize {
        let dialable = self.inner.dial_queue.take_dialable(now).await;

        join_all(dialable.iter().map(|peer| async move {
            if let Err(e) = self.dial_peer(peer).await {
                log::warn!("Dial to {} failed: {}", peer.get_id(), e);
            }
        }))
        .await;

        dialable.len()
    }

    /// Connect to `peer`, reusing a live connection when there is one
    pub async fn dial_peer(&self, peer: &Arc<dyn PeerHandle>) -> Result<(), P2pError> {
        let host = self.started_host()?;
        let info = &peer.cfg().peer;

        if !info.addrs.is_empty() {
            host.peerstore()
                .add_addrs(&info.id, &info.addrs, DISCOVERED_ADDR_TTL)
                .await;
        }

        peer.set_dialing(true).await;
        let dialed = match host.conns_to_peer(&info.id).await.into_iter().next() {
            Some(conn) => Ok(conn),
            None => host.dial_peer(&info.id).await,
        };
        peer.set_dialing(false).await;

        let conn = dialed?;
        let outbound = conn.is_outbound();
        peer.add_connection(conn, outbound).await?;
        log::info!("Connected to peer {}", info.id);

        self.on_peer_writable(peer).await;
        Ok(())
    }

    async fn on_peer_writable(&self, peer: &Arc<dyn PeerHandle>) {
        self.emit(NodeEvent::PeerConnected {
            peer: peer.get_id(),
        });

        let status = self.local_status().await;
        if let Err(e) = peer.send(Message::Status(status)).await {
            log::warn!("Failed to send status to {}: {}", peer.get_id(), e);
        }

        if self.inner.pinging.lock().await.insert(peer.get_id()) {
            let node = self.clone();
            let peer = peer.clone();
            self.inner
                .tracker
                .spawn(async move { node.ping_peer(peer).await });
        }
    }

    async fn local_status(&self) -> StatusMessage {
        let chain = &self.inner.chain;
        StatusMessage {
            version: PROTOCOL_VERSION,
            best_number: chain.best_number().await,
            best_hash: chain.best_hash().await,
            genesis_hash: chain.genesis_hash().await,
        }
    }

    /// Ping `peer` on every ping interval until the node stops
    pub async fn ping_peer(&self, peer: Arc<dyn PeerHandle>) {
        let interval = self.inner.settings.ping_interval();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.send_ping_to_peer(&peer).await {
                Ok(rtt) => log::debug!("Ping to {} took {:?}", peer.get_id(), rtt),
                Err(e) => log::warn!("Ping to {} failed: {}", peer.get_id(), e),
            }
        }

        self.inner.pinging.lock().await.remove(&peer.get_id());
        log::debug!("Ping loop for {} stopped", peer.get_id());
    }

    /// One ping round trip over a fresh ping stream
    pub async fn send_ping_to_peer(&self, peer: &Arc<dyn PeerHandle>) -> Result<Duration, P2pError> {
        let host = self.started_host()?;
        let settings = &self.inner.settings;

        let mut stream = host
            .new_stream(&peer.cfg().peer.id, &settings.ping_protocol_id)
            .await?;
        let result = timeout(settings.ping_timeout(), ping::send_ping(&mut stream)).await;

        if let Err(e) = stream.close().await {
            log::debug!("Closing ping stream to {}: {}", peer.get_id(), e);
        }

        result.map_err(|_| P2pError::PingTimeout)?
    }

    /// Ask every known peer for blocks on each request interval
    async fn request_any(self) {
        let interval = self.inner.settings.request_interval();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    log::info!("Request loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let known = match self.inner.peers.known_peers().await {
                Ok(known) => known,
                Err(e) => {
                    log::warn!("Failed to list known peers: {}", e);
                    continue;
                }
            };

            let sync = &self.inner.sync;
            join_all(known.iter().map(|kp| async move {
                match sync.request_blocks(&kp.peer).await {
                    Ok(()) => {}
                    Err(P2pError::NotWritable(id)) => {
                        log::debug!("Skipping block request to {}: not writable", id)
                    }
                    Err(e) => log::warn!("Block request to {} failed: {}", kp.peer.get_id(), e),
                }
            }))
            .await;
        }
    }
}
