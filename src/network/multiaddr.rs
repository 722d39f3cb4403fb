//! Multiaddress parsing
//!
//! Supports the subset the node needs:
//! `/ip4/<addr>/tcp/<port>`, `/ip6/<addr>/tcp/<port>`, optionally followed by
//! `/p2p/<peer-id>` (or the legacy `/ipfs/<peer-id>`).

use crate::crypto::PeerId;
use crate::network::error::P2pError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A transport address plus an optional peer identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr {
    socket: SocketAddr,
    peer: Option<PeerId>,
}

impl Multiaddr {
    pub fn new(socket: SocketAddr) -> Self {
        Self { socket, peer: None }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// Same address with the `/p2p/` component attached
    pub fn with_peer(&self, peer: PeerId) -> Self {
        Self {
            socket: self.socket,
            peer: Some(peer),
        }
    }

    /// Same address with the `/p2p/` component removed
    pub fn without_peer(&self) -> Self {
        Self::new(self.socket)
    }
}

impl FromStr for Multiaddr {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || P2pError::InvalidAddress(s.to_string());

        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < 5 || !parts[0].is_empty() {
            return Err(invalid());
        }

        let ip: IpAddr = match parts[1] {
            "ip4" => parts[2]
                .parse::<std::net::Ipv4Addr>()
                .map_err(|_| invalid())?
                .into(),
            "ip6" => parts[2]
                .parse::<std::net::Ipv6Addr>()
                .map_err(|_| invalid())?
                .into(),
            _ => return Err(invalid()),
        };

        if parts[3] != "tcp" {
            return Err(invalid());
        }
        let port: u16 = parts[4].parse().map_err(|_| invalid())?;

        let peer = match &parts[5..] {
            [] => None,
            ["p2p" | "ipfs", id] => Some(id.parse::<PeerId>()?),
            _ => return Err(invalid()),
        };

        Ok(Self {
            socket: SocketAddr::new(ip, port),
            peer,
        })
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = P2pError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket.ip() {
            IpAddr::V4(ip) => write!(f, "/ip4/{}/tcp/{}", ip, self.socket.port())?,
            IpAddr::V6(ip) => write!(f, "/ip6/{}/tcp/{}", ip, self.socket.port())?,
        }
        if let Some(peer) = &self.peer {
            write!(f, "/p2p/{}", peer)?;
        }
        Ok(())
    }
}

/// Identity and dialable addresses of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// Extract peer info from an address carrying a `/p2p/` component
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, P2pError> {
        let id = addr
            .peer_id()
            .cloned()
            .ok_or_else(|| P2pError::InvalidAddress(format!("{} has no peer id", addr)))?;

        Ok(Self {
            id,
            addrs: vec![addr.without_peer()],
        })
    }
}
