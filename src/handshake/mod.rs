//! Obfuscated hybrid handshake.
//!
//! ## Protocol Overview
//!
//! 1. **Full handshake** (one round trip):
//!    - Client sends its cipher selector, an ephemeral ML-KEM-768 public key
//!      and one ciphertext per long-term server key, followed by padding
//!    - Server decapsulates (non-forward-secret half), encapsulates back to
//!      the ephemeral key (forward-secret half) and returns that ciphertext
//!      with a sealed ticket
//!    - Client opens the ticket; success proves the server holds the keys
//!
//! 2. **Resumption** (zero round trips):
//!    - Client sends `ticket || random` and starts writing records at once
//!    - Server looks the ticket up; a fresh random resumes, a repeated one is
//!      a replay
//!
//! The server cannot tell the two openings apart by a type byte. It reads
//! 53 bytes, tries the ticket cache, then decodes the next 5 bytes as a
//! pseudo-header: a valid header means "resumption with a ticket I don't
//! know" and is answered with random noise.

pub mod client;
pub mod config;
pub mod messages;
pub mod metrics;
pub mod server;
pub mod session;

pub use client::ClientInstance;
pub use config::{ClientParams, ServerParams};
pub use metrics::{HandshakeMetrics, MetricsSnapshot};
pub use server::ServerInstance;
pub use session::{ClientSessionCache, Resumption, SessionCache};

use crate::crypto::{
    derive_key, Aead, AeadKey, CipherKind, Nonce, SharedSecret, RANDOM_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};

/// Literal sealed into every ticket.
pub const TICKET_TAG: [u8; 5] = *b"VEIL1";

/// Ticket size on the wire.
pub const TICKET_SIZE: usize = TICKET_TAG.len() + TAG_SIZE;

/// Resumption hello size: `ticket || random`.
pub const RESUME_HELLO_LEN: usize = TICKET_SIZE + RANDOM_SIZE;

/// An issued ticket.
pub type Ticket = [u8; TICKET_SIZE];

fn ticket_key(secret: &SharedSecret, nfs_ciphertexts: &[u8], ephemeral_public: &[u8]) -> Result<AeadKey> {
    derive_key(secret.as_bytes(), nfs_ciphertexts, ephemeral_public)
}

/// Seal the ticket literal, bound to this exchange.
pub(crate) fn seal_ticket(
    secret: &SharedSecret,
    cipher: CipherKind,
    nfs_ciphertexts: &[u8],
    ephemeral_public: &[u8],
    pfs_ciphertext: &[u8],
) -> Result<Ticket> {
    let key = ticket_key(secret, nfs_ciphertexts, ephemeral_public)?;
    let sealed = Aead::new(cipher, &key).encrypt(&Nonce::initial(cipher), &TICKET_TAG, pfs_ciphertext)?;
    sealed
        .try_into()
        .map_err(|_| Error::crypto("sealed ticket has the wrong size"))
}

/// Open a ticket and check it carries the literal.
pub(crate) fn verify_ticket(
    ticket: &Ticket,
    secret: &SharedSecret,
    cipher: CipherKind,
    nfs_ciphertexts: &[u8],
    ephemeral_public: &[u8],
    pfs_ciphertext: &[u8],
) -> Result<()> {
    let key = ticket_key(secret, nfs_ciphertexts, ephemeral_public)?;
    let opened = Aead::new(cipher, &key)
        .decrypt(&Nonce::initial(cipher), ticket, pfs_ciphertext)
        .map_err(|_| Error::authentication("ticket verification failed"))?;
    if opened != TICKET_TAG {
        return Err(Error::authentication("ticket carries an unexpected tag"));
    }
    Ok(())
}
