//! Key exchange primitives.
//!
//! Two families of key material take part in a handshake:
//!
//! - an [`EphemeralKeyPair`] (ML-KEM-768), generated fresh for every full
//!   handshake; the server encapsulates to it, which yields the forward-secret
//!   half of the [`SharedSecret`];
//! - one or more long-term server keys ([`ServerPublicKey`] on the client,
//!   [`ServerPrivateKey`] on the server), either ML-KEM-768 or X25519, which
//!   yield the non-forward-secret half.
//!
//! Secret material is zeroized on drop.

use std::fmt;

use fips203::ml_kem_768::{self, CipherText, DecapsKey, EncapsKey};
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// ML-KEM-768 encapsulation key size.
pub const MLKEM768_PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 ciphertext size.
pub const MLKEM768_CIPHERTEXT_SIZE: usize = 1088;

/// ML-KEM-768 private seed (`d || z`) size.
pub const MLKEM768_SEED_SIZE: usize = 64;

/// X25519 public and private key size.
pub const X25519_KEY_SIZE: usize = 32;

/// Size of the secret produced by one encapsulation (either family).
pub const KEM_SECRET_SIZE: usize = 32;

/// A 32-byte secret produced by a single key exchange.
pub type KemSecret = Zeroizing<[u8; KEM_SECRET_SIZE]>;

/// Long-term key algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// ML-KEM-768 (FIPS 203)
    MlKem768,
    /// X25519 Diffie-Hellman
    X25519,
}

impl KeyKind {
    /// Size of the value sent on the wire for one exchange with this key.
    pub fn ciphertext_len(self) -> usize {
        match self {
            KeyKind::MlKem768 => MLKEM768_CIPHERTEXT_SIZE,
            KeyKind::X25519 => X25519_KEY_SIZE,
        }
    }
}

fn kem_error(context: &'static str) -> impl Fn(&'static str) -> Error {
    move |e| Error::key_exchange(format!("{context}: {e}"))
}

/// Encapsulate to a raw ML-KEM-768 encapsulation key.
///
/// Returns the shared secret and the 1088-byte ciphertext.
pub fn mlkem_encapsulate(public: &[u8]) -> Result<(KemSecret, Vec<u8>)> {
    let bytes: [u8; MLKEM768_PUBLIC_KEY_SIZE] = public.try_into().map_err(|_| Error::Buffer {
        expected: MLKEM768_PUBLIC_KEY_SIZE,
        actual: public.len(),
    })?;
    let ek = EncapsKey::try_from_bytes(bytes).map_err(kem_error("invalid encapsulation key"))?;
    let (ssk, ct) = ek.try_encaps().map_err(kem_error("encapsulation failed"))?;
    Ok((Zeroizing::new(ssk.into_bytes()), ct.into_bytes().to_vec()))
}

fn mlkem_decapsulate(dk: &DecapsKey, ciphertext: &[u8]) -> Result<KemSecret> {
    let bytes: [u8; MLKEM768_CIPHERTEXT_SIZE] =
        ciphertext.try_into().map_err(|_| Error::Buffer {
            expected: MLKEM768_CIPHERTEXT_SIZE,
            actual: ciphertext.len(),
        })?;
    let ct = CipherText::try_from_bytes(bytes).map_err(kem_error("invalid ciphertext"))?;
    let ssk = dk.try_decaps(&ct).map_err(kem_error("decapsulation failed"))?;
    Ok(Zeroizing::new(ssk.into_bytes()))
}

fn contributory(shared: x25519_dalek::SharedSecret) -> Result<KemSecret> {
    if !shared.was_contributory() {
        return Err(Error::key_exchange("non-contributory X25519 exchange"));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// A per-handshake ML-KEM-768 key pair.
///
/// Owned by exactly one handshake attempt and dropped when it ends.
pub struct EphemeralKeyPair {
    public: Box<[u8; MLKEM768_PUBLIC_KEY_SIZE]>,
    decaps: DecapsKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Result<Self> {
        let (ek, dk) = ml_kem_768::KG::try_keygen().map_err(kem_error("key generation failed"))?;
        Ok(Self {
            public: Box::new(ek.into_bytes()),
            decaps: dk,
        })
    }

    /// The encapsulation key sent in the client hello.
    pub fn public_bytes(&self) -> &[u8; MLKEM768_PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Recover the forward-secret component from the server's ciphertext.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<KemSecret> {
        mlkem_decapsulate(&self.decaps, ciphertext)
    }
}

/// A server long-term public key as held by a client.
#[derive(Clone)]
pub enum ServerPublicKey {
    /// Validated ML-KEM-768 encapsulation key
    MlKem768(Box<[u8; MLKEM768_PUBLIC_KEY_SIZE]>),
    /// X25519 public key
    X25519(X25519Public),
}

impl ServerPublicKey {
    /// Parse a raw public key; the algorithm is chosen by length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            MLKEM768_PUBLIC_KEY_SIZE => {
                let mut raw = Box::new([0u8; MLKEM768_PUBLIC_KEY_SIZE]);
                raw.copy_from_slice(bytes);
                EncapsKey::try_from_bytes(*raw)
                    .map_err(|e| Error::config(format!("invalid ML-KEM-768 public key: {e}")))?;
                Ok(ServerPublicKey::MlKem768(raw))
            }
            X25519_KEY_SIZE => {
                let mut raw = [0u8; X25519_KEY_SIZE];
                raw.copy_from_slice(bytes);
                Ok(ServerPublicKey::X25519(X25519Public::from(raw)))
            }
            n => Err(Error::config(format!(
                "public key must be {MLKEM768_PUBLIC_KEY_SIZE} (ML-KEM-768) or {X25519_KEY_SIZE} (X25519) bytes, got {n}"
            ))),
        }
    }

    /// Algorithm of this key.
    pub fn kind(&self) -> KeyKind {
        match self {
            ServerPublicKey::MlKem768(_) => KeyKind::MlKem768,
            ServerPublicKey::X25519(_) => KeyKind::X25519,
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ServerPublicKey::MlKem768(raw) => raw.as_slice(),
            ServerPublicKey::X25519(pk) => pk.as_bytes(),
        }
    }

    /// Run one exchange against this key.
    ///
    /// For X25519 the "ciphertext" is a fresh ephemeral public value.
    pub fn encapsulate(&self) -> Result<(KemSecret, Vec<u8>)> {
        match self {
            ServerPublicKey::MlKem768(raw) => mlkem_encapsulate(raw.as_slice()),
            ServerPublicKey::X25519(their) => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let ours = X25519Public::from(&secret);
                let shared = contributory(secret.diffie_hellman(their))?;
                Ok((shared, ours.as_bytes().to_vec()))
            }
        }
    }
}

impl fmt::Debug for ServerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.as_bytes()[..8];
        write!(f, "{:?}({}..)", self.kind(), hex::encode(prefix))
    }
}

/// A server long-term private key.
pub enum ServerPrivateKey {
    /// ML-KEM-768 decapsulation key, kept together with the seed it came from
    MlKem768 {
        /// `d || z` seed
        seed: Zeroizing<[u8; MLKEM768_SEED_SIZE]>,
        /// Expanded decapsulation key
        decaps: Box<DecapsKey>,
        /// Matching encapsulation key
        public: Box<[u8; MLKEM768_PUBLIC_KEY_SIZE]>,
    },
    /// X25519 static secret
    X25519(StaticSecret),
}

impl ServerPrivateKey {
    /// Rebuild a private key from its seed; 64 bytes is ML-KEM-768, 32 is X25519.
    pub fn from_seed(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            MLKEM768_SEED_SIZE => {
                let mut seed = Zeroizing::new([0u8; MLKEM768_SEED_SIZE]);
                seed.copy_from_slice(bytes);
                let mut d = [0u8; 32];
                let mut z = [0u8; 32];
                d.copy_from_slice(&seed[..32]);
                z.copy_from_slice(&seed[32..]);
                let (ek, dk) = ml_kem_768::KG::keygen_from_seed(d, z);
                d.zeroize();
                z.zeroize();
                Ok(ServerPrivateKey::MlKem768 {
                    seed,
                    decaps: Box::new(dk),
                    public: Box::new(ek.into_bytes()),
                })
            }
            X25519_KEY_SIZE => {
                let mut raw = [0u8; X25519_KEY_SIZE];
                raw.copy_from_slice(bytes);
                let secret = StaticSecret::from(raw);
                raw.zeroize();
                Ok(ServerPrivateKey::X25519(secret))
            }
            n => Err(Error::config(format!(
                "private seed must be {MLKEM768_SEED_SIZE} (ML-KEM-768) or {X25519_KEY_SIZE} (X25519) bytes, got {n}"
            ))),
        }
    }

    /// Generate a new random private key.
    pub fn generate(kind: KeyKind) -> Result<Self> {
        match kind {
            KeyKind::MlKem768 => {
                let seed = Zeroizing::new(crate::crypto::SecureRandom::bytes::<MLKEM768_SEED_SIZE>());
                Self::from_seed(seed.as_slice())
            }
            KeyKind::X25519 => Ok(ServerPrivateKey::X25519(StaticSecret::random_from_rng(OsRng))),
        }
    }

    /// Algorithm of this key.
    pub fn kind(&self) -> KeyKind {
        match self {
            ServerPrivateKey::MlKem768 { .. } => KeyKind::MlKem768,
            ServerPrivateKey::X25519(_) => KeyKind::X25519,
        }
    }

    /// Export the seed this key can be rebuilt from.
    ///
    /// # Security
    ///
    /// Secret key material.
    pub fn seed_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            ServerPrivateKey::MlKem768 { seed, .. } => Zeroizing::new(seed.to_vec()),
            ServerPrivateKey::X25519(secret) => Zeroizing::new(secret.to_bytes().to_vec()),
        }
    }

    /// The public key clients are provisioned with.
    pub fn public_key(&self) -> ServerPublicKey {
        match self {
            ServerPrivateKey::MlKem768 { public, .. } => ServerPublicKey::MlKem768(public.clone()),
            ServerPrivateKey::X25519(secret) => ServerPublicKey::X25519(X25519Public::from(secret)),
        }
    }

    /// Wire size of the client's exchange value for this key.
    pub fn ciphertext_len(&self) -> usize {
        self.kind().ciphertext_len()
    }

    /// Recover the secret a client derived with [`ServerPublicKey::encapsulate`].
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<KemSecret> {
        match self {
            ServerPrivateKey::MlKem768 { decaps, .. } => mlkem_decapsulate(decaps, ciphertext),
            ServerPrivateKey::X25519(secret) => {
                let raw: [u8; X25519_KEY_SIZE] =
                    ciphertext.try_into().map_err(|_| Error::Buffer {
                        expected: X25519_KEY_SIZE,
                        actual: ciphertext.len(),
                    })?;
                contributory(secret.diffie_hellman(&X25519Public::from(raw)))
            }
        }
    }
}

impl fmt::Debug for ServerPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(<redacted>)", self.kind())
    }
}

/// The connection's base key: `pfs || nfs`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Concatenate the forward-secret component with the long-term components.
    pub fn combine(pfs: &[u8], nfs: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(pfs.len() + nfs.len());
        bytes.extend_from_slice(pfs);
        bytes.extend_from_slice(nfs);
        Self(bytes)
    }

    /// Raw secret bytes; only ever fed into the KDF.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_roundtrip() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let (secret, ct) = mlkem_encapsulate(pair.public_bytes()).unwrap();

        assert_eq!(ct.len(), MLKEM768_CIPHERTEXT_SIZE);
        assert_eq!(*pair.decapsulate(&ct).unwrap(), *secret);
    }

    #[test]
    fn test_long_term_mlkem_exchange() {
        let private = ServerPrivateKey::generate(KeyKind::MlKem768).unwrap();
        let public = private.public_key();
        assert_eq!(public.as_bytes().len(), MLKEM768_PUBLIC_KEY_SIZE);

        let (client_secret, ct) = public.encapsulate().unwrap();
        assert_eq!(ct.len(), private.ciphertext_len());
        assert_eq!(*private.decapsulate(&ct).unwrap(), *client_secret);
    }

    #[test]
    fn test_long_term_x25519_exchange() {
        let private = ServerPrivateKey::generate(KeyKind::X25519).unwrap();
        let public = private.public_key();

        let (client_secret, ct) = public.encapsulate().unwrap();
        assert_eq!(ct.len(), X25519_KEY_SIZE);
        assert_eq!(*private.decapsulate(&ct).unwrap(), *client_secret);
    }

    #[test]
    fn test_x25519_rejects_low_order_point() {
        let private = ServerPrivateKey::generate(KeyKind::X25519).unwrap();
        let result = private.decapsulate(&[0u8; X25519_KEY_SIZE]);
        assert!(matches!(result, Err(Error::KeyExchange(_))));
    }

    #[test]
    fn test_seed_roundtrip_restores_same_key() {
        for kind in [KeyKind::MlKem768, KeyKind::X25519] {
            let original = ServerPrivateKey::generate(kind).unwrap();
            let restored = ServerPrivateKey::from_seed(&original.seed_bytes()).unwrap();

            assert_eq!(restored.kind(), kind);
            assert_eq!(restored.public_key().as_bytes(), original.public_key().as_bytes());
        }
    }

    #[test]
    fn test_public_key_length_dispatch() {
        assert!(matches!(ServerPublicKey::from_bytes(&[9u8; 32]), Ok(ServerPublicKey::X25519(_))));
        assert!(matches!(ServerPublicKey::from_bytes(&[0u8; 100]), Err(Error::Config(_))));
        assert!(matches!(ServerPrivateKey::from_seed(&[0u8; 48]), Err(Error::Config(_))));
    }

    #[test]
    fn test_wrong_ciphertext_length() {
        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(pair.decapsulate(&[0u8; 10]), Err(Error::Buffer { .. })));
    }

    #[test]
    fn test_shared_secret_layout() {
        let secret = SharedSecret::combine(&[1u8; 32], &[2u8; 64]);
        assert_eq!(secret.as_bytes().len(), 96);
        assert_eq!(secret.as_bytes()[31], 1);
        assert_eq!(secret.as_bytes()[32], 2);
        assert_eq!(format!("{secret:?}"), "SharedSecret(<96 bytes>)");
    }
}
