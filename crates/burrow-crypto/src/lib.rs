//! Cryptographic primitives for burrow pipe connections
//!
//! Covers the three collaborator roles the control plane needs: an
//! ephemeral key exchange run during the control handshake, derivation of
//! a per-pipe session key, and an encrypted wrapper around a pipe
//! transport.

pub mod kdf;
pub mod keys;
pub mod stream;

pub use kdf::derive_session_key;
pub use keys::KeyPair;
pub use stream::{CipherStream, Role};

use thiserror::Error;

/// Session key length (ChaCha20-Poly1305)
pub const KEY_LEN: usize = 32;

/// AEAD nonce length
pub const NONCE_LEN: usize = 12;

/// AEAD tag length
pub const TAG_LEN: usize = 16;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGeneration,

    #[error("key exchange failed")]
    KeyExchange,

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,
}
