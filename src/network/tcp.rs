//! TCP network host
//!
//! Every TCP connection starts with a [`Hello`] preamble in each direction,
//! followed by a [`HelloProof`] from each side showing it holds the key its
//! peer id is derived from. A preamble without a protocol establishes a
//! plain connection that is tracked until EOF; a preamble naming a protocol
//! turns the socket into a protocol stream handed to the registered handler.

use crate::crypto::{KeyPair, PeerId};
use crate::network::error::P2pError;
use crate::network::host::{
    AddrBook, Connection, Host, NotifyBundle, Stream, StreamHandler,
};
use crate::network::multiaddr::Multiaddr;
use crate::network::wire::{read_hello, read_proof, write_hello, write_proof, Hello, HelloProof};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Time allowed for the preamble exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP implementation of [`Host`]
pub struct TcpHost {
    id: PeerId,
    key: KeyPair,
    listen_addrs: Vec<Multiaddr>,
    addr_book: AddrBook,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    conns: RwLock<HashMap<PeerId, Vec<Connection>>>,
    notifiees: RwLock<Vec<NotifyBundle>>,
    dial_timeout: Duration,
    cancel: CancellationToken,
    me: Weak<TcpHost>,
}

impl TcpHost {
    /// Bind to `listen` and start accepting connections.
    ///
    /// The private key of `id` must already be in `addr_book`. The accept
    /// loop exits when `cancel` fires.
    pub async fn listen(
        id: PeerId,
        listen: &Multiaddr,
        addr_book: AddrBook,
        dial_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, P2pError> {
        let secret = addr_book
            .priv_key(&id)
            .await
            .ok_or_else(|| P2pError::NoPrivateKey(id.to_string()))?;
        let key = KeyPair::from_secret_key(secret);

        let listener = TcpListener::bind(listen.socket_addr()).await?;
        let bound = Multiaddr::new(listener.local_addr()?);
        log::info!("Host listening on {}/p2p/{}", bound, id);

        let host = Arc::new_cyclic(|me| TcpHost {
            id,
            key,
            listen_addrs: vec![bound],
            addr_book,
            handlers: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
            notifiees: RwLock::new(Vec::new()),
            dial_timeout,
            cancel,
            me: me.clone(),
        });

        let accept_host = host.clone();
        tokio::spawn(async move { accept_host.accept_loop(listener).await });

        Ok(host)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("Host accept loop stopped");
                    return;
                }
                res = listener.accept() => match res {
                    Ok((socket, addr)) => {
                        let host = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = host.handle_inbound(socket, addr).await {
                                log::debug!("Inbound connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    fn hello(&self, protocol: Option<&str>) -> Hello {
        Hello::new(
            &self.key,
            self.listen_addrs[0].to_string(),
            protocol.map(str::to_string),
        )
    }

    fn weak_host(&self) -> Weak<dyn Host> {
        self.me.clone()
    }

    async fn handle_inbound(
        self: Arc<Self>,
        mut socket: TcpStream,
        observed: SocketAddr,
    ) -> Result<(), P2pError> {
        let hello = timeout(HANDSHAKE_TIMEOUT, read_hello(&mut socket)).await??;
        let announced: Multiaddr = hello.listen_addr.parse()?;

        let route = match &hello.protocol {
            None => None,
            Some(protocol) => {
                let handler = self.handlers.read().await.get(protocol).cloned();
                let Some(handler) = handler else {
                    return Err(P2pError::ProtocolNotSupported(protocol.clone()));
                };
                Some((protocol.clone(), handler))
            }
        };

        let remote_peer = timeout(HANDSHAKE_TIMEOUT, self.answer(&mut socket, &hello)).await??;
        let remote_addr = dialable_addr(&announced, observed);

        match route {
            None => {
                let conn = Connection::new(remote_peer, remote_addr, false, self.weak_host());
                self.register_conn(socket, conn).await;
            }
            Some((protocol, handler)) => {
                let stream = Stream::new(
                    Box::new(socket),
                    remote_peer.clone(),
                    remote_addr.with_peer(remote_peer),
                    protocol,
                );
                handler(stream).await;
            }
        }

        Ok(())
    }

    /// Reply to a dialer's preamble and check its proof of identity
    async fn answer(&self, socket: &mut TcpStream, hello: &Hello) -> Result<PeerId, P2pError> {
        let (remote, remote_key) = hello.verified_peer()?;

        let reply = self.hello(hello.protocol.as_deref());
        write_hello(socket, &reply).await?;
        write_proof(socket, &HelloProof::sign(&self.key, &hello.nonce)?).await?;

        let proof = read_proof(socket).await?;
        proof.verify(&remote, &remote_key, &reply.nonce)?;

        self.addr_book.add_pub_key(&remote, remote_key).await?;
        Ok(remote)
    }

    /// Connect to `addr` and run the handshake, checking the remote identity
    async fn open(
        &self,
        peer: &PeerId,
        addr: &Multiaddr,
        protocol: Option<&str>,
    ) -> Result<TcpStream, P2pError> {
        let mut socket = TcpStream::connect(addr.socket_addr())
            .await
            .map_err(|e| P2pError::Dial(format!("{}: {}", addr, e)))?;

        let ours = self.hello(protocol);
        write_hello(&mut socket, &ours).await?;

        let reply = match timeout(HANDSHAKE_TIMEOUT, read_hello(&mut socket)).await? {
            Ok(reply) => reply,
            Err(P2pError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(match protocol {
                    Some(p) => P2pError::ProtocolNotSupported(p.to_string()),
                    None => P2pError::Disconnected,
                });
            }
            Err(e) => return Err(e),
        };

        if reply.peer_id != peer.as_str() {
            return Err(P2pError::PeerIdMismatch {
                expected: peer.to_string(),
                actual: reply.peer_id,
            });
        }
        let (_, remote_key) = reply.verified_peer()?;

        let proof = timeout(HANDSHAKE_TIMEOUT, read_proof(&mut socket)).await??;
        proof.verify(peer, &remote_key, &ours.nonce)?;
        write_proof(&mut socket, &HelloProof::sign(&self.key, &reply.nonce)?).await?;

        self.addr_book.add_pub_key(peer, remote_key).await?;
        Ok(socket)
    }

    /// Try every known address of `peer` until one answers
    async fn open_any(
        &self,
        peer: &PeerId,
        protocol: Option<&str>,
    ) -> Result<(TcpStream, Multiaddr), P2pError> {
        if peer == &self.id {
            return Err(P2pError::Dial("cannot dial self".to_string()));
        }

        let addrs = self.addr_book.addrs(peer).await;
        if addrs.is_empty() {
            return Err(P2pError::Dial(format!("no addresses for peer {}", peer)));
        }

        let mut last_err = None;
        for addr in addrs {
            match timeout(self.dial_timeout, self.open(peer, &addr, protocol)).await {
                Ok(Ok(socket)) => return Ok((socket, addr)),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(P2pError::Timeout),
            }
        }

        Err(last_err.unwrap_or(P2pError::Timeout))
    }

    /// Track `conn` until its socket reaches EOF
    async fn register_conn(&self, mut socket: TcpStream, conn: Connection) {
        {
            let mut conns = self.conns.write().await;
            conns
                .entry(conn.remote_peer().clone())
                .or_default()
                .push(conn.clone());
        }
        log::debug!(
            "Connection {} peer {} ({})",
            if conn.is_outbound() { "to" } else { "from" },
            conn.remote_peer().short(),
            conn.remote_multiaddr()
        );

        for bundle in self.notifiees.read().await.iter() {
            bundle.on_connected(&conn);
        }

        let Some(host) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    _ = conn.closed() => break,
                    _ = host.cancel.cancelled() => break,
                    res = socket.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    },
                }
            }
            host.unregister_conn(&conn).await;
        });
    }

    async fn unregister_conn(&self, conn: &Connection) {
        conn.close();
        {
            let mut conns = self.conns.write().await;
            if let Some(list) = conns.get_mut(conn.remote_peer()) {
                list.retain(|c| !c.is_closed());
                if list.is_empty() {
                    conns.remove(conn.remote_peer());
                }
            }
        }
        log::debug!("Connection to {} closed", conn.remote_peer().short());

        for bundle in self.notifiees.read().await.iter() {
            bundle.on_disconnected(conn);
        }
    }
}

/// The announced listen address, with an unspecified IP replaced by the
/// address the connection was observed from
fn dialable_addr(announced: &Multiaddr, observed: SocketAddr) -> Multiaddr {
    let socket = announced.socket_addr();
    if socket.ip().is_unspecified() {
        Multiaddr::new(SocketAddr::new(observed.ip(), socket.port()))
    } else {
        announced.without_peer()
    }
}

#[async_trait]
impl Host for TcpHost {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.clone()
    }

    fn peerstore(&self) -> &AddrBook {
        &self.addr_book
    }

    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers
            .write()
            .await
            .insert(protocol.to_string(), handler);
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, P2pError> {
        let (socket, addr) = self.open_any(peer, Some(protocol)).await?;
        Ok(Stream::new(
            Box::new(socket),
            peer.clone(),
            addr.with_peer(peer.clone()),
            protocol,
        ))
    }

    async fn dial_peer(&self, peer: &PeerId) -> Result<Connection, P2pError> {
        if let Some(conn) = self.conns_to_peer(peer).await.into_iter().next() {
            return Ok(conn);
        }

        let (socket, addr) = self.open_any(peer, None).await?;
        let conn = Connection::new(peer.clone(), addr, true, self.weak_host());
        self.register_conn(socket, conn.clone()).await;
        Ok(conn)
    }

    async fn conns_to_peer(&self, peer: &PeerId) -> Vec<Connection> {
        self.conns
            .read()
            .await
            .get(peer)
            .map(|list| list.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    async fn notify(&self, bundle: NotifyBundle) {
        self.notifiees.write().await.push(bundle);
    }
}
