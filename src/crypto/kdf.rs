//! Key Derivation Functions.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256. Every
//! symmetric key in the protocol (ticket key, per-direction record keys,
//! ratcheted record keys) comes out of [`derive_key`].

use hkdf::Hkdf as HkdfImpl;
use sha2::Sha256;

use crate::crypto::{AeadKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Info prefix for the client-to-server record key.
pub const CLIENT_TO_SERVER: &[u8] = b"c2s";

/// Info prefix for the server-to-client record key.
pub const SERVER_TO_CLIENT: &[u8] = b"s2c";

/// HKDF key derivation using SHA-256.
pub struct Hkdf {
    prk: HkdfImpl<Sha256>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt
    /// * `ikm` - Input keying material (e.g., the combined KEM secret)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }

    /// Derive an AEAD key.
    pub fn derive_aead_key(&self, info: &[u8]) -> Result<AeadKey> {
        let key_bytes = self.expand_fixed::<KEY_SIZE>(info)?;
        Ok(AeadKey::from_bytes(key_bytes))
    }
}

/// Derive a 32-byte symmetric key from `secret`, with `salt` and `info` as
/// domain separators.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8]) -> Result<AeadKey> {
    Hkdf::new(Some(salt), secret).derive_aead_key(info)
}

/// Derive the initial record key for one direction.
pub fn record_key(secret: &[u8], random: &[u8], direction: &[u8], ticket: &[u8]) -> Result<AeadKey> {
    let info = [direction, ticket].concat();
    derive_key(secret, random, &info)
}

/// One ratchet step: the next key for a direction whose nonce space is used
/// up, bound to the last record (ciphertext and header) sent under the
/// current key.
pub fn ratchet_key(current: &AeadKey, ciphertext: &[u8], header: &[u8]) -> Result<AeadKey> {
    derive_key(current.as_bytes(), ciphertext, header)
}
