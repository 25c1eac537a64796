//! # veil
//!
//! An obfuscated, post-quantum handshake and record layer for proxy
//! transports.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Record Layer (pseudo-TLS records, self-ratcheting AEAD)│
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake (ML-KEM-768 hybrid, 0-RTT ticket resumption) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Obfuscation (XOR keystream over the raw connection)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (ML-KEM, X25519, AES-GCM/ChaCha, HKDF)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::AsyncWriteExt;
//! use veil::crypto::{KeyKind, ServerPrivateKey};
//! use veil::{ClientInstance, ObfuscationMode, ServerInstance, ServerParams};
//!
//! # async fn demo() -> veil::Result<()> {
//! let key = ServerPrivateKey::generate(KeyKind::MlKem768)?;
//! let params = ServerParams::new(vec![key], Duration::from_secs(600), ObfuscationMode::PublicKey)?;
//! let client = ClientInstance::new(params.client_params()?);
//! let server = ServerInstance::new(params)?;
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let (c, s) = tokio::join!(client.handshake(a), server.accept(b));
//! let (mut c, _s) = (c?, s?);
//! c.write_all(b"ping").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: no plaintext type bytes; every opening looks like
//!    random bytes or a TLS application-data record
//! 2. **Post-quantum secrecy**: ML-KEM-768 for the ephemeral exchange
//! 3. **Zero round trips on reconnect**: cached tickets with replay rejection

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod obfuscation;
pub mod record;

#[cfg(feature = "server")]
pub mod server;

pub use crypto::CipherKind;
pub use error::{Error, Result};
pub use handshake::{ClientInstance, ClientParams, ServerInstance, ServerParams};
pub use obfuscation::ObfuscationMode;
pub use record::{Role, SecureStream};
