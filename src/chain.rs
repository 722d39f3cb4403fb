//! Chain collaborator
//!
//! The networking layer only needs a narrow view of the chain: the genesis
//! and best block for status exchange, and a range of blocks to answer block
//! requests. Import and validation live elsewhere.

use crate::crypto::sha256_hex;
use crate::network::message::{BlockData, Header};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Read access to the local chain
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn genesis_hash(&self) -> String;

    async fn best_number(&self) -> u64;

    async fn best_hash(&self) -> String;

    /// Up to `max` consecutive blocks starting at `from`
    async fn blocks(&self, from: u64, max: u32) -> Vec<BlockData>;
}

/// Hash of a header (hex sha256 of its JSON form)
pub fn header_hash(header: &Header) -> String {
    let data = serde_json::to_vec(header).unwrap_or_default();
    sha256_hex(&data)
}

/// In-memory chain holding headers and bodies
pub struct MemoryChain {
    blocks: RwLock<Vec<BlockData>>,
}

impl MemoryChain {
    /// Chain containing only the genesis block
    pub fn new() -> Self {
        let header = Header {
            parent_hash: "0".repeat(64),
            number: 0,
            state_root: "0".repeat(64),
            extrinsics_root: "0".repeat(64),
        };
        let genesis = BlockData {
            hash: header_hash(&header),
            header: Some(header),
            body: Some(Vec::new()),
        };

        Self {
            blocks: RwLock::new(vec![genesis]),
        }
    }

    /// Build a block on top of the best block and append it
    pub async fn append(&self, body: Vec<Vec<u8>>) -> BlockData {
        let mut blocks = self.blocks.write().await;
        let parent = &blocks[blocks.len() - 1];

        let header = Header {
            parent_hash: parent.hash.clone(),
            number: blocks.len() as u64,
            state_root: "0".repeat(64),
            extrinsics_root: sha256_hex(&body.concat()),
        };
        let block = BlockData {
            hash: header_hash(&header),
            header: Some(header),
            body: Some(body),
        };
        blocks.push(block.clone());
        block
    }

    pub async fn height(&self) -> u64 {
        self.blocks.read().await.len() as u64 - 1
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainService for MemoryChain {
    async fn genesis_hash(&self) -> String {
        self.blocks.read().await[0].hash.clone()
    }

    async fn best_number(&self) -> u64 {
        self.height().await
    }

    async fn best_hash(&self) -> String {
        let blocks = self.blocks.read().await;
        blocks[blocks.len() - 1].hash.clone()
    }

    async fn blocks(&self, from: u64, max: u32) -> Vec<BlockData> {
        let blocks = self.blocks.read().await;
        blocks
            .iter()
            .skip(from as usize)
            .take(max as usize)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_genesis_only() {
        let chain = MemoryChain::new();
        assert_eq!(chain.best_number().await, 0);
        assert_eq!(chain.best_hash().await, chain.genesis_hash().await);
    }

    #[tokio::test]
    async fn test_append_links_parent() {
        let chain = MemoryChain::new();
        let genesis = chain.genesis_hash().await;

        let block = chain.append(vec![b"tx".to_vec()]).await;
        let header = block.header.unwrap();
        assert_eq!(header.number, 1);
        assert_eq!(header.parent_hash, genesis);
        assert_eq!(chain.best_hash().await, block.hash);
    }

    #[tokio::test]
    async fn test_block_range() {
        let chain = MemoryChain::new();
        for i in 0..5u8 {
            chain.append(vec![vec![i]]).await;
        }

        let range = chain.blocks(2, 2).await;
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].header.as_ref().unwrap().number, 2);

        assert!(chain.blocks(10, 5).await.is_empty());
        assert_eq!(chain.blocks(4, 100).await.len(), 2);
    }
}
