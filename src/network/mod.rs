//! P2P networking module
//!
//! Provides the peer-to-peer layer of the node.
//!
//! # Features
//! - TCP host with protocol-tagged streams
//! - Peer tracking and dial queue with backoff
//! - Message dispatch by kind
//! - Ping-based liveness checks
//! - Periodic block requests to known peers

pub mod dial_queue;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod host;
pub mod message;
pub mod multiaddr;
pub mod node;
pub mod peers;
pub mod ping;
pub mod sync;
pub mod tcp;
pub mod wire;

pub use dial_queue::{DialQueue, QueuedPeer};
pub use discovery::{BootstrapDiscovery, Discovery, DiscoverySink};
pub use error::P2pError;
pub use handler::{default_registry, Handler, HandlerFunc, HandlerRegistry, OnMessage};
pub use host::{AddrBook, Connection, Host, NotifyBundle, Stream, StreamHandler, Ttl};
pub use message::{
    BlockAnnounce, BlockData, BlockRequest, BlockResponse, Header, Message, MessageKind,
    StatusMessage, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use multiaddr::{Multiaddr, PeerInfo};
pub use node::{Node, NodeEvent, NodeStatus};
pub use peers::{KnownPeer, Peer, PeerConfig, PeerHandle, PeerStore, Peers};
pub use sync::{BlockSync, ChainSync};
pub use tcp::TcpHost;
pub use wire::{Hello, MessageCodec};
