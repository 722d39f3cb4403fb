//! Network message types for the domain protocol
//!
//! Messages form a closed set. Each variant reports its [`MessageKind`],
//! which is the key the handler registry dispatches on.

use serde::{Deserialize, Serialize};

/// Protocol version announced in status messages
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x50, 0x32, 0x50]; // "CP2P"

/// Largest frame body accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Discriminant of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Status,
    BlockRequest,
    BlockResponse,
    BlockAnnounce,
    Transactions,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Status,
        MessageKind::BlockRequest,
        MessageKind::BlockResponse,
        MessageKind::BlockAnnounce,
        MessageKind::Transactions,
    ];
}

/// Domain protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Chain status, sent right after a connection becomes writable
    Status(StatusMessage),

    /// Request a range of blocks
    BlockRequest(BlockRequest),

    /// Blocks answering a request
    BlockResponse(BlockResponse),

    /// Announce a newly imported block
    BlockAnnounce(BlockAnnounce),

    /// Opaque encoded transactions
    Transactions(Vec<Vec<u8>>),
}

/// Best block and genesis of the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub version: u32,
    pub best_number: u64,
    pub best_hash: String,
    pub genesis_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    /// Request id echoed in the response
    pub id: u64,
    /// First block number wanted
    pub from: u64,
    /// Maximum number of blocks to return
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub id: u64,
    pub blocks: Vec<BlockData>,
}

impl BlockResponse {
    /// Header of the first block, if any
    pub fn header(&self) -> Option<&Header> {
        self.blocks.first().and_then(|b| b.header.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnounce {
    pub header: Header,
}

/// Block header as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: String,
    pub number: u64,
    pub state_root: String,
    pub extrinsics_root: String,
}

/// A block in a response; header and body may be omitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: String,
    pub header: Option<Header>,
    pub body: Option<Vec<Vec<u8>>>,
}

impl Message {
    /// Kind used for handler lookup
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Status(_) => MessageKind::Status,
            Message::BlockRequest(_) => MessageKind::BlockRequest,
            Message::BlockResponse(_) => MessageKind::BlockResponse,
            Message::BlockAnnounce(_) => MessageKind::BlockAnnounce,
            Message::Transactions(_) => MessageKind::Transactions,
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let header = Header {
            parent_hash: "00".into(),
            number: 3,
            state_root: "11".into(),
            extrinsics_root: "22".into(),
        };
        let cases = [
            (
                Message::Status(StatusMessage {
                    version: PROTOCOL_VERSION,
                    best_number: 0,
                    best_hash: String::new(),
                    genesis_hash: String::new(),
                }),
                MessageKind::Status,
            ),
            (
                Message::BlockRequest(BlockRequest {
                    id: 1,
                    from: 1,
                    max: 8,
                }),
                MessageKind::BlockRequest,
            ),
            (
                Message::BlockResponse(BlockResponse {
                    id: 1,
                    blocks: vec![],
                }),
                MessageKind::BlockResponse,
            ),
            (
                Message::BlockAnnounce(BlockAnnounce { header }),
                MessageKind::BlockAnnounce,
            ),
            (Message::Transactions(vec![]), MessageKind::Transactions),
        ];

        for (msg, kind) in cases {
            assert_eq!(msg.kind(), kind);
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::BlockRequest(BlockRequest {
            id: 7,
            from: 100,
            max: 64,
        });
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_response_header() {
        let empty = BlockResponse {
            id: 1,
            blocks: vec![],
        };
        assert!(empty.header().is_none());

        let header = Header {
            parent_hash: "aa".into(),
            number: 9,
            state_root: "bb".into(),
            extrinsics_root: "cc".into(),
        };
        let resp = BlockResponse {
            id: 1,
            blocks: vec![BlockData {
                hash: "dd".into(),
                header: Some(header.clone()),
                body: None,
            }],
        };
        assert_eq!(resp.header(), Some(&header));
    }
}
