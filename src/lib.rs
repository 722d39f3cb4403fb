//! Chain-P2P: the peer-to-peer networking layer of a blockchain node
//!
//! This crate provides:
//! - Node identity from secp256k1 keys
//! - Peer discovery, registration and redial with backoff
//! - Protocol stream dispatch to typed message handlers
//! - Ping/pong liveness checks
//! - Periodic block requests to known peers
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_p2p::chain::{ChainService, MemoryChain};
//! use chain_p2p::config::{ClientConfig, P2pConfig};
//! use chain_p2p::network::Node;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), chain_p2p::network::P2pError> {
//! let (events, _rx) = mpsc::channel(64);
//! let chain: Arc<dyn ChainService> = Arc::new(MemoryChain::new());
//! let cfg = ClientConfig::with_p2p(P2pConfig::generate());
//!
//! let node = Node::new(CancellationToken::new(), events, Some(cfg), Some(chain))?;
//! node.start().await?;
//! println!("Peers: {}", node.get_num_peers().await?);
//! node.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use chain::{ChainService, MemoryChain};
pub use config::{ClientConfig, P2pConfig};
pub use crypto::{KeyPair, PeerId};
pub use network::{Node, NodeEvent, NodeStatus, P2pError};
