//! Cryptographic utilities for the node
//!
//! This module provides:
//! - SHA-256 hashing
//! - Node key management (secp256k1) and peer identities
//! - Signing used by the connection handshake

pub mod hash;
pub mod keys;

pub use hash::{sha256, sha256_hex};
pub use keys::{
    public_key_from_hex, sign_message, verify_signature, KeyError, KeyPair, PeerId,
};
