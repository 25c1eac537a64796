//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Two record ciphers are supported and selected per connection by a
//! one-byte selector carried in the client hello:
//! - `0`: ChaCha20-Poly1305, fast in software
//! - `1`: AES-256-GCM, preferred when the CPU has AES and carry-less multiply

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Record cipher negotiated for a connection.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 0,
    /// AES-256-GCM
    Aes256Gcm = 1,
}

impl CipherKind {
    /// Pick the cipher for this machine: AES-GCM with hardware support,
    /// ChaCha20-Poly1305 otherwise.
    pub fn preferred() -> Self {
        if has_aes_gcm_hardware() {
            CipherKind::Aes256Gcm
        } else {
            CipherKind::ChaCha20Poly1305
        }
    }

    /// Wire selector byte.
    pub fn selector(self) -> u8 {
        self as u8
    }

    /// Parse a wire selector byte.
    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            0 => Some(CipherKind::ChaCha20Poly1305),
            1 => Some(CipherKind::Aes256Gcm),
            _ => None,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn has_aes_gcm_hardware() -> bool {
    std::arch::is_x86_feature_detected!("aes")
        && std::arch::is_x86_feature_detected!("pclmulqdq")
        && std::arch::is_x86_feature_detected!("sse4.1")
        && std::arch::is_x86_feature_detected!("ssse3")
}

#[cfg(target_arch = "aarch64")]
fn has_aes_gcm_hardware() -> bool {
    std::arch::is_aarch64_feature_detected!("aes") && std::arch::is_aarch64_feature_detected!("pmull")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn has_aes_gcm_hardware() -> bool {
    false
}

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 96-bit big-endian nonce counter.
///
/// Incremented after every seal/open. Reaching all-0xFF signals that the
/// direction must ratchet to a fresh key before the counter wraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// The last usable nonce under one key.
    pub const MAX: Nonce = Nonce([0xff; NONCE_SIZE]);

    /// Starting nonce for a cipher: the selector byte followed by zeros.
    pub fn initial(kind: CipherKind) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = kind.selector();
        Self(nonce)
    }

    /// Create a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// True once the counter is all-0xFF.
    pub fn is_exhausted(&self) -> bool {
        *self == Self::MAX
    }

    /// Increment as a big-endian integer, wrapping to zero after `MAX`.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

enum CipherImpl {
    ChaCha(ChaCha20Poly1305),
    Aes(Box<Aes256Gcm>),
}

/// AEAD cipher instance bound to one key.
pub struct Aead {
    kind: CipherKind,
    cipher: CipherImpl,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(kind: CipherKind, key: &AeadKey) -> Self {
        let cipher = match kind {
            CipherKind::ChaCha20Poly1305 => {
                CipherImpl::ChaCha(ChaCha20Poly1305::new(key.as_bytes().into()))
            }
            CipherKind::Aes256Gcm => CipherImpl::Aes(Box::new(Aes256Gcm::new(key.as_bytes().into()))),
        };
        Self { kind, cipher }
    }

    /// Which cipher this instance runs.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let nonce = chacha20poly1305::Nonce::from_slice(nonce.as_bytes());

        match &self.cipher {
            CipherImpl::ChaCha(c) => c.encrypt(nonce, payload),
            CipherImpl::Aes(c) => c.encrypt(nonce, payload),
        }
        .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the tag does not verify (wrong key,
    /// tampered data, wrong nonce or AAD).
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let payload = Payload { msg: ciphertext, aad };
        let nonce = chacha20poly1305::Nonce::from_slice(nonce.as_bytes());

        match &self.cipher {
            CipherImpl::ChaCha(c) => c.decrypt(nonce, payload),
            CipherImpl::Aes(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| Error::authentication("record decryption failed"))
    }
}

/// Calculate the ciphertext length for a given plaintext length.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}

/// Calculate the maximum plaintext length for a given ciphertext length.
pub const fn plaintext_len(ciphertext_len: usize) -> usize {
    ciphertext_len.saturating_sub(TAG_SIZE)
}
