//! Networking error taxonomy

use crate::config::ConfigError;
use crate::crypto::KeyError;
use crate::network::message::MessageKind;
use thiserror::Error;

/// Errors raised by the p2p layer
#[derive(Error, Debug)]
pub enum P2pError {
    #[error("No config provided")]
    NoConfig,
    #[error("Nil p2p config")]
    NoP2pConfig,
    #[error("No chain service provided")]
    NoChainService,
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("P2P service uninitialized: no host")]
    NoHost,
    #[error("P2P host not started")]
    NotStarted,
    #[error("P2P host already started")]
    AlreadyStarted,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Dial failed: {0}")]
    Dial(String),
    #[error("Peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: String, actual: String },
    #[error("Handshake with {0} failed: bad signature")]
    BadHandshake(String),
    #[error("No private key for {0}")]
    NoPrivateKey(String),
    #[error("Refusing to track the local peer")]
    SelfPeer,
    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),
    #[error("Peer {0} is not writable")]
    NotWritable(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Timed out")]
    Timeout,
    #[error("Ping timed out")]
    PingTimeout,
    #[error("Pong does not match ping")]
    PongMismatch,
    #[error("No handler registered for {0:?}")]
    NoHandler(MessageKind),
    #[error("Wrong handler: registered {registered:?}, message {message:?}")]
    WrongHandler {
        registered: MessageKind,
        message: MessageKind,
    },
}

impl From<tokio::time::error::Elapsed> for P2pError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        P2pError::Timeout
    }
}
