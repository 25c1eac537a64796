//! Handshake parameters.
//!
//! Both sides are configured from an encryption string:
//!
//! ```text
//! mlkem768.<native|xorpub|random>.<ttl>.<key>[.<key>...]
//! ```
//!
//! `ttl` is `<n>s` (`0s` disables resumption); `0rtt` and `1rtt` are accepted
//! as shorthands for `600s` and `0s`. Keys are base64. A client lists server
//! public keys (1184-byte ML-KEM-768 or 32-byte X25519); a server lists the
//! matching private seeds (64 or 32 bytes) in the same order.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::crypto::{CipherKind, ServerPrivateKey, ServerPublicKey};
use crate::error::{Error, Result};
use crate::obfuscation::ObfuscationMode;

/// The only key-exchange family on the wire.
pub const FAMILY: &str = "mlkem768";

/// Resumption lifetime selected by `0rtt`.
pub const DEFAULT_RESUMPTION_TTL: Duration = Duration::from_secs(600);

struct EncryptionString {
    obfuscation: ObfuscationMode,
    resumption_ttl: Duration,
    keys: Vec<Vec<u8>>,
}

fn parse_ttl(field: &str) -> Result<Duration> {
    match field {
        "0rtt" => Ok(DEFAULT_RESUMPTION_TTL),
        "1rtt" => Ok(Duration::ZERO),
        other => other
            .strip_suffix('s')
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .ok_or_else(|| Error::config(format!("invalid resumption ttl: {other}"))),
    }
}

fn decode_key(field: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(field)
        .or_else(|_| STANDARD.decode(field))
        .map_err(|e| Error::config(format!("invalid base64 key: {e}")))
}

fn encode_key(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

impl EncryptionString {
    fn parse(s: &str) -> Result<Self> {
        let mut fields = s.trim().split('.');

        match fields.next() {
            Some(FAMILY) => {}
            Some(other) => return Err(Error::config(format!("unsupported key exchange: {other}"))),
            None => return Err(Error::config("empty encryption string")),
        }

        let obfuscation = fields
            .next()
            .ok_or_else(|| Error::config("missing obfuscation mode"))?
            .parse::<ObfuscationMode>()?;
        let resumption_ttl =
            parse_ttl(fields.next().ok_or_else(|| Error::config("missing resumption ttl"))?)?;

        let keys = fields.map(decode_key).collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(Error::config("at least one key is required"));
        }

        Ok(Self {
            obfuscation,
            resumption_ttl,
            keys,
        })
    }

    fn format(obfuscation: ObfuscationMode, ttl: Duration, keys: &[Vec<u8>]) -> String {
        let mut out = format!("{FAMILY}.{obfuscation}.{}s", ttl.as_secs());
        for key in keys {
            out.push('.');
            out.push_str(&encode_key(key));
        }
        out
    }
}

/// Client-side handshake parameters.
///
/// Immutable once built and shared by every connection of a client.
#[derive(Clone, Debug)]
pub struct ClientParams {
    server_keys: Vec<ServerPublicKey>,
    cipher: CipherKind,
    resumption_ttl: Duration,
    obfuscation: ObfuscationMode,
}

impl ClientParams {
    /// Build parameters from already-parsed keys.
    ///
    /// The cipher defaults to [`CipherKind::preferred`].
    pub fn new(
        server_keys: Vec<ServerPublicKey>,
        resumption_ttl: Duration,
        obfuscation: ObfuscationMode,
    ) -> Result<Self> {
        if server_keys.is_empty() {
            return Err(Error::config("at least one server public key is required"));
        }
        Ok(Self {
            server_keys,
            cipher: CipherKind::preferred(),
            resumption_ttl,
            obfuscation,
        })
    }

    /// Parse a client encryption string.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = EncryptionString::parse(s)?;
        let keys = parsed
            .keys
            .iter()
            .map(|k| ServerPublicKey::from_bytes(k))
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys, parsed.resumption_ttl, parsed.obfuscation)
    }

    /// Override the record cipher.
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    /// Server long-term public keys, in wire order.
    pub fn server_keys(&self) -> &[ServerPublicKey] {
        &self.server_keys
    }

    /// Record cipher the client asks for.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// Resumption lifetime; zero disables resumption.
    pub fn resumption_ttl(&self) -> Duration {
        self.resumption_ttl
    }

    /// Obfuscation mode.
    pub fn obfuscation(&self) -> ObfuscationMode {
        self.obfuscation
    }

    /// Key bytes the obfuscation keystream is derived from.
    pub fn obfuscation_key(&self) -> &[u8] {
        self.server_keys[0].as_bytes()
    }

    /// Total size of the non-forward-secret ciphertexts in a client hello.
    pub fn nfs_ciphertext_len(&self) -> usize {
        self.server_keys.iter().map(|k| k.kind().ciphertext_len()).sum()
    }

    /// Render back to an encryption string.
    pub fn to_encryption_string(&self) -> String {
        let keys: Vec<Vec<u8>> = self.server_keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        EncryptionString::format(self.obfuscation, self.resumption_ttl, &keys)
    }
}

/// Server-side handshake parameters.
#[derive(Debug)]
pub struct ServerParams {
    keys: Vec<ServerPrivateKey>,
    resumption_ttl: Duration,
    obfuscation: ObfuscationMode,
    obfuscation_key: Vec<u8>,
}

impl ServerParams {
    /// Build parameters from private keys.
    pub fn new(
        keys: Vec<ServerPrivateKey>,
        resumption_ttl: Duration,
        obfuscation: ObfuscationMode,
    ) -> Result<Self> {
        let obfuscation_key = keys
            .first()
            .ok_or_else(|| Error::config("at least one server private key is required"))?
            .public_key()
            .as_bytes()
            .to_vec();
        Ok(Self {
            keys,
            resumption_ttl,
            obfuscation,
            obfuscation_key,
        })
    }

    /// Parse a server encryption string.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = EncryptionString::parse(s)?;
        let keys = parsed
            .keys
            .iter()
            .map(|k| ServerPrivateKey::from_seed(k))
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys, parsed.resumption_ttl, parsed.obfuscation)
    }

    /// Long-term private keys, in wire order.
    pub fn keys(&self) -> &[ServerPrivateKey] {
        &self.keys
    }

    /// Resumption lifetime; zero disables resumption.
    pub fn resumption_ttl(&self) -> Duration {
        self.resumption_ttl
    }

    /// Obfuscation mode.
    pub fn obfuscation(&self) -> ObfuscationMode {
        self.obfuscation
    }

    /// Key bytes the obfuscation keystream is derived from.
    pub fn obfuscation_key(&self) -> &[u8] {
        &self.obfuscation_key
    }

    /// Total size of the non-forward-secret ciphertexts in a client hello.
    pub fn nfs_ciphertext_len(&self) -> usize {
        self.keys.iter().map(ServerPrivateKey::ciphertext_len).sum()
    }

    /// Render back to an encryption string (contains private seeds).
    pub fn to_encryption_string(&self) -> String {
        let keys: Vec<Vec<u8>> = self.keys.iter().map(|k| k.seed_bytes().to_vec()).collect();
        EncryptionString::format(self.obfuscation, self.resumption_ttl, &keys)
    }

    /// The encryption string clients of this server should use.
    pub fn client_encryption_string(&self) -> String {
        let keys: Vec<Vec<u8>> = self
            .keys
            .iter()
            .map(|k| k.public_key().as_bytes().to_vec())
            .collect();
        EncryptionString::format(self.obfuscation, self.resumption_ttl, &keys)
    }

    /// Client parameters matching this server.
    pub fn client_params(&self) -> Result<ClientParams> {
        ClientParams::new(
            self.keys.iter().map(ServerPrivateKey::public_key).collect(),
            self.resumption_ttl,
            self.obfuscation,
        )
    }
}
