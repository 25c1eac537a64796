//! Cryptographic primitives for veil.
//!
//! This module provides:
//! - ML-KEM-768 and X25519 key exchange
//! - ChaCha20-Poly1305 and AES-256-GCM AEAD encryption
//! - HKDF key derivation and the record-key ratchet
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod keys;
mod random;

pub use aead::{ciphertext_len, plaintext_len, Aead, AeadKey, CipherKind, Nonce};
pub use kdf::{derive_key, ratchet_key, record_key, Hkdf, CLIENT_TO_SERVER, SERVER_TO_CLIENT};
pub use keys::{
    mlkem_encapsulate, EphemeralKeyPair, KemSecret, KeyKind, ServerPrivateKey, ServerPublicKey,
    SharedSecret, KEM_SECRET_SIZE, MLKEM768_CIPHERTEXT_SIZE, MLKEM768_PUBLIC_KEY_SIZE,
    MLKEM768_SEED_SIZE, X25519_KEY_SIZE,
};
pub use random::{random_padding, SecureRandom};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the per-direction record random
pub const RANDOM_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_exchange_and_encryption() {
        // Server long-term key (provisioned once)
        let server_key = ServerPrivateKey::generate(KeyKind::MlKem768).unwrap();
        let server_public = server_key.public_key();

        // Client: ephemeral pair + encapsulation to the long-term key
        let ephemeral = EphemeralKeyPair::generate().unwrap();
        let (client_nfs, nfs_ct) = server_public.encapsulate().unwrap();

        // Server: decapsulate and encapsulate back to the ephemeral key
        let server_nfs = server_key.decapsulate(&nfs_ct).unwrap();
        let (server_pfs, pfs_ct) = mlkem_encapsulate(ephemeral.public_bytes()).unwrap();
        let client_pfs = ephemeral.decapsulate(&pfs_ct).unwrap();

        let client_secret = SharedSecret::combine(client_pfs.as_slice(), client_nfs.as_slice());
        let server_secret = SharedSecret::combine(server_pfs.as_slice(), server_nfs.as_slice());
        assert_eq!(client_secret, server_secret);

        // Both sides derive the same record key and can talk
        let random: [u8; RANDOM_SIZE] = SecureRandom::bytes();
        let ticket = [0u8; 21];
        let client_key =
            record_key(client_secret.as_bytes(), &random, CLIENT_TO_SERVER, &ticket).unwrap();
        let server_key =
            record_key(server_secret.as_bytes(), &random, CLIENT_TO_SERVER, &ticket).unwrap();

        let kind = CipherKind::preferred();
        let nonce = Nonce::initial(kind);
        let aad = [0x17, 0x03, 0x03, 0x00, 0x24];

        let ciphertext = Aead::new(kind, &client_key)
            .encrypt(&nonce, b"Hello, secure world!", &aad)
            .unwrap();
        let decrypted = Aead::new(kind, &server_key).decrypt(&nonce, &ciphertext, &aad).unwrap();

        assert_eq!(decrypted, b"Hello, secure world!");
    }
}
