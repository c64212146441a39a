//! Ephemeral key exchange
//!
//! X25519 agreement between the client hello and server hello. Each side
//! generates a fresh keypair per control session; the agreed secret is the
//! pre-master every pipe key is derived from.

use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;

use crate::CryptoError;

/// Ephemeral X25519 keypair
pub struct KeyPair {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private =
            EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| CryptoError::KeyGeneration)?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::KeyGeneration)?
            .as_ref()
            .to_vec();

        Ok(Self { private, public })
    }

    /// Public half, sent to the peer in the hello
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Agree with the peer's public key, producing the pre-master secret.
    /// Consumes the keypair; the private half is single-use.
    pub fn agree(self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private, &peer, |secret| secret.to_vec())
            .map_err(|_| CryptoError::KeyExchange)
    }
}

/// Fill a buffer with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::SecureRandom;
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::KeyGeneration)
}
