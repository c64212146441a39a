//! Session-key derivation
//!
//! HKDF-SHA256 keyed by the pre-master secret, salted with the client id
//! and bound to the per-pipe nonce. Both ends derive the same key from the
//! values exchanged in the hellos.

use ring::hkdf::{self, Salt, HKDF_SHA256};

use crate::{CryptoError, KEY_LEN};

/// Helper carrying the requested HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the session key for one pipe from `(pre_master, client_id, nonce)`
pub fn derive_session_key(
    pre_master: &[u8],
    client_id: &[u8],
    nonce: &[u8],
) -> Result<[u8; KEY_LEN], CryptoError> {
    let salt = Salt::new(HKDF_SHA256, client_id);
    let prk = salt.extract(pre_master);

    let info = [nonce];
    let okm = prk
        .expand(&info, HkdfLen(KEY_LEN))
        .map_err(|_| CryptoError::KeyGeneration)?;

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key).map_err(|_| CryptoError::KeyGeneration)?;
    Ok(key)
}
