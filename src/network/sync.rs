//! Chain synchronization with peers
//!
//! The node asks the sync component to request blocks from every known peer
//! on a fixed interval. Responses come back through the message handlers.

use crate::chain::ChainService;
use crate::network::error::P2pError;
use crate::network::message::{BlockRequest, Message};
use crate::network::peers::PeerHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Block synchronization collaborator
#[async_trait]
pub trait BlockSync: Send + Sync {
    /// Ask `peer` for the blocks following our best block
    async fn request_blocks(&self, peer: &Arc<dyn PeerHandle>) -> Result<(), P2pError>;
}

/// Requests batches of blocks past the local best block
pub struct ChainSync {
    chain: Arc<dyn ChainService>,
    batch_size: u32,
    next_id: AtomicU64,
}

impl ChainSync {
    pub fn new(chain: Arc<dyn ChainService>, batch_size: u32) -> Self {
        Self {
            chain,
            batch_size: batch_size.max(1),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl BlockSync for ChainSync {
    async fn request_blocks(&self, peer: &Arc<dyn PeerHandle>) -> Result<(), P2pError> {
        if !peer.is_writable().await? {
            return Err(P2pError::NotWritable(peer.get_id()));
        }

        let our_best = self.chain.best_number().await;

        // Skip peers that told us they are not ahead
        if let Some(status) = peer.status().await {
            if status.best_number <= our_best {
                log::debug!(
                    "Peer {} not ahead ({} vs {}), skipping",
                    peer.get_id(),
                    status.best_number,
                    our_best
                );
                return Ok(());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Requesting {} blocks from #{} from {}",
            self.batch_size,
            our_best + 1,
            peer.get_id()
        );

        peer.send(Message::BlockRequest(BlockRequest {
            id,
            from: our_best + 1,
            max: self.batch_size,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::network::dial_queue::tests::StubPeer;
    use crate::network::message::{StatusMessage, PROTOCOL_VERSION};
    use std::sync::atomic::Ordering;

    fn sync() -> ChainSync {
        ChainSync::new(Arc::new(MemoryChain::new()), 16)
    }

    #[tokio::test]
    async fn test_requires_writable_peer() {
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        assert!(matches!(
            sync().request_blocks(&peer).await,
            Err(P2pError::NotWritable(_))
        ));
    }

    #[tokio::test]
    async fn test_sends_request() {
        let stub = StubPeer::new();
        stub.writable.store(true, Ordering::SeqCst);
        let peer: Arc<dyn PeerHandle> = stub.clone();

        sync().request_blocks(&peer).await.unwrap();
        assert_eq!(stub.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skips_peer_behind() {
        let stub = StubPeer::new();
        stub.writable.store(true, Ordering::SeqCst);
        let peer: Arc<dyn PeerHandle> = stub.clone();
        peer.set_status(StatusMessage {
            version: PROTOCOL_VERSION,
            best_number: 0,
            best_hash: String::new(),
            genesis_hash: String::new(),
        })
        .await;

        sync().request_blocks(&peer).await.unwrap();
        assert_eq!(stub.sent.load(Ordering::SeqCst), 0);
    }
}
