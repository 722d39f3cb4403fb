//! Client configuration
//!
//! Loaded from a JSON file and/or command line flags. Durations are kept as
//! millisecond counts so the file stays readable.

use crate::crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Domain message protocol identifier
pub const DEFAULT_PROTOCOL_ID: &str = "/chain/p2p/1.0.0";

/// Ping protocol identifier
pub const DEFAULT_PING_PROTOCOL_ID: &str = "/chain/ping/1.0.0";

/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "/ip4/0.0.0.0/tcp/30333";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0} must be greater than zero")]
    Invalid(&'static str),
}

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Networking section. Required by the p2p node.
    pub p2p: Option<P2pConfig>,
}

impl ClientConfig {
    /// Configuration with a default p2p section
    pub fn with_p2p(p2p: P2pConfig) -> Self {
        Self { p2p: Some(p2p) }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

/// P2P networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Hex-encoded secp256k1 secret key
    pub private_key: String,
    /// Listen multiaddress, e.g. `/ip4/0.0.0.0/tcp/30333`
    pub listen_address: String,
    /// Peers announced to the node at start (`/ip4/../tcp/../p2p/<id>`)
    pub bootstrap_peers: Vec<String>,
    pub protocol_id: String,
    pub ping_protocol_id: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub dial_interval_ms: u64,
    pub dial_backoff_ms: u64,
    pub dial_timeout_ms: u64,
    pub request_interval_ms: u64,
    pub discovery_interval_ms: u64,
    /// Blocks asked for per sync request
    pub sync_batch_size: u32,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            bootstrap_peers: Vec::new(),
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            ping_protocol_id: DEFAULT_PING_PROTOCOL_ID.to_string(),
            ping_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            dial_interval_ms: 5_000,
            dial_backoff_ms: 30_000,
            dial_timeout_ms: 10_000,
            request_interval_ms: 15_000,
            discovery_interval_ms: 60_000,
            sync_batch_size: 64,
        }
    }
}

impl P2pConfig {
    /// Default configuration with a freshly generated key
    pub fn generate() -> Self {
        Self {
            private_key: KeyPair::generate().private_key_hex(),
            ..Default::default()
        }
    }

    /// Reject settings the background loops cannot run with.
    ///
    /// A zero interval would make its loop spin without pausing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("dial_interval_ms", self.dial_interval_ms),
            ("dial_backoff_ms", self.dial_backoff_ms),
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("request_interval_ms", self.request_interval_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("sync_batch_size", u64::from(self.sync_batch_size)),
        ];

        match required.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(*name)),
            None => Ok(()),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn dial_interval(&self) -> Duration {
        Duration::from_millis(self.dial_interval_ms)
    }

    pub fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = P2pConfig::default();
        assert_eq!(cfg.protocol_id, DEFAULT_PROTOCOL_ID);
        assert_eq!(cfg.ping_protocol_id, DEFAULT_PING_PROTOCOL_ID);
        assert_ne!(cfg.protocol_id, cfg.ping_protocol_id);
        assert_eq!(cfg.dial_backoff(), Duration::from_secs(30));
        assert!(cfg.private_key.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"p2p":{"listen_address":"/ip4/127.0.0.1/tcp/4001"}}"#)
                .unwrap();
        let p2p = cfg.p2p.unwrap();
        assert_eq!(p2p.listen_address, "/ip4/127.0.0.1/tcp/4001");
        assert_eq!(p2p.ping_interval_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        assert!(P2pConfig::default().validate().is_ok());

        let cfg: ClientConfig =
            serde_json::from_str(r#"{"p2p":{"dial_interval_ms":0}}"#).unwrap();
        assert!(matches!(
            cfg.p2p.unwrap().validate(),
            Err(ConfigError::Invalid("dial_interval_ms"))
        ));

        let cfg = P2pConfig {
            request_interval_ms: 0,
            ..P2pConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid("request_interval_ms"))
        ));
    }

    #[test]
    fn test_missing_p2p_section() {
        let cfg: ClientConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.p2p.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let cfg = ClientConfig::with_p2p(P2pConfig::generate());
        cfg.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(
            loaded.p2p.unwrap().private_key,
            cfg.p2p.unwrap().private_key
        );
    }
}
