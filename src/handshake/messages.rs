//! Handshake message layouts.
//!
//! ```text
//! client hello:  selector(1) | ephemeral pk(1184) | nfs ciphertexts | header | padding
//! server hello:  pfs ciphertext(1088) | ticket(21) | header | padding
//! resume hello:  ticket(21) | random(32)
//! ```
//!
//! Padding is 100 to 1000 random bytes framed by a pseudo-record header.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::{random_padding, SecureRandom, MLKEM768_CIPHERTEXT_SIZE, MLKEM768_PUBLIC_KEY_SIZE};
use crate::error::Result;
use crate::framing::{decode_header, encode_header, looks_like_header, HEADER_SIZE};
use crate::handshake::{Ticket, RESUME_HELLO_LEN, TICKET_SIZE};

/// Smallest handshake padding.
pub const MIN_PADDING: usize = 100;

/// Largest handshake padding.
pub const MAX_PADDING: usize = 1000;

/// Size of the fixed part of a client hello (before its padding header).
pub const fn client_hello_fixed_len(nfs_ciphertext_len: usize) -> usize {
    1 + MLKEM768_PUBLIC_KEY_SIZE + nfs_ciphertext_len
}

/// Size of the fixed part of a server hello.
pub const SERVER_HELLO_FIXED_LEN: usize = MLKEM768_CIPHERTEXT_SIZE + TICKET_SIZE;

fn push_padding(out: &mut Vec<u8>) {
    let len = SecureRandom::between(MIN_PADDING, MAX_PADDING + 1);
    out.extend_from_slice(&encode_header(len));
    out.extend_from_slice(&random_padding(len));
}

/// Build a full client hello.
pub fn encode_client_hello(selector: u8, ephemeral_public: &[u8], nfs_ciphertexts: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(client_hello_fixed_len(nfs_ciphertexts.len()) + HEADER_SIZE + MAX_PADDING);
    out.push(selector);
    out.extend_from_slice(ephemeral_public);
    out.extend_from_slice(nfs_ciphertexts);
    push_padding(&mut out);
    out
}

/// Build a server hello.
pub fn encode_server_hello(pfs_ciphertext: &[u8], ticket: &Ticket) -> Vec<u8> {
    let mut out = Vec::with_capacity(SERVER_HELLO_FIXED_LEN + HEADER_SIZE + MAX_PADDING);
    out.extend_from_slice(pfs_ciphertext);
    out.extend_from_slice(ticket);
    push_padding(&mut out);
    out
}

/// A parsed client hello (fixed part).
pub struct ClientHello<'a> {
    /// Cipher selector byte
    pub selector: u8,
    /// Client ephemeral ML-KEM-768 public key
    pub ephemeral_public: &'a [u8],
    /// Concatenated per-key non-forward-secret ciphertexts
    pub nfs_ciphertexts: &'a [u8],
}

impl<'a> ClientHello<'a> {
    /// Split the fixed part of a client hello.
    ///
    /// `fixed` must be exactly [`client_hello_fixed_len`] bytes.
    pub fn parse(fixed: &'a [u8]) -> Self {
        let (selector, rest) = (fixed[0], &fixed[1..]);
        let (ephemeral_public, nfs_ciphertexts) = rest.split_at(MLKEM768_PUBLIC_KEY_SIZE);
        Self {
            selector,
            ephemeral_public,
            nfs_ciphertexts,
        }
    }
}

/// Read and discard one header-framed padding block.
pub async fn skip_padding<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = decode_header(&header)?;

    let mut padding = vec![0u8; len];
    reader.read_exact(&mut padding).await?;
    Ok(())
}

/// True if the bytes a server inspects after a resume-sized prefix would
/// decode as a pseudo-header, i.e. the server would read this full hello as
/// an explicit resumption attempt.
pub fn is_ambiguous(client_hello: &[u8]) -> bool {
    client_hello
        .get(RESUME_HELLO_LEN..)
        .map_or(false, looks_like_header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{MAX_RECORD_LEN, MIN_RECORD_LEN, RECORD_MAGIC};

    #[test]
    fn test_client_hello_layout() {
        let public = [0x11u8; MLKEM768_PUBLIC_KEY_SIZE];
        let nfs = [0x22u8; MLKEM768_CIPHERTEXT_SIZE];
        let hello = encode_client_hello(1, &public, &nfs);

        let fixed = client_hello_fixed_len(nfs.len());
        assert_eq!(fixed, 2273);
        let pad_len = decode_header(hello[fixed..fixed + HEADER_SIZE].try_into().unwrap()).unwrap();
        assert!((MIN_PADDING..=MAX_PADDING).contains(&pad_len));
        assert_eq!(hello.len(), fixed + HEADER_SIZE + pad_len);

        let parsed = ClientHello::parse(&hello[..fixed]);
        assert_eq!(parsed.selector, 1);
        assert_eq!(parsed.ephemeral_public, &public[..]);
        assert_eq!(parsed.nfs_ciphertexts, &nfs[..]);
    }

    #[test]
    fn test_server_hello_layout() {
        let pfs = [0x33u8; MLKEM768_CIPHERTEXT_SIZE];
        let ticket = [0x44u8; TICKET_SIZE];
        let hello = encode_server_hello(&pfs, &ticket);

        assert_eq!(&hello[..MLKEM768_CIPHERTEXT_SIZE], &pfs[..]);
        assert_eq!(&hello[MLKEM768_CIPHERTEXT_SIZE..SERVER_HELLO_FIXED_LEN], &ticket[..]);
        assert!(looks_like_header(&hello[SERVER_HELLO_FIXED_LEN..]));
    }

    #[tokio::test]
    async fn test_skip_padding_consumes_exactly_one_block() {
        let mut wire = Vec::new();
        push_padding(&mut wire);
        wire.extend_from_slice(b"next");

        let mut reader = &wire[..];
        skip_padding(&mut reader).await.unwrap();
        assert_eq!(reader, b"next");
    }

    #[test]
    fn test_ambiguous_window_detection() {
        let mut hello = vec![0u8; 2273];
        assert!(!is_ambiguous(&hello));

        hello[RESUME_HELLO_LEN..RESUME_HELLO_LEN + 3].copy_from_slice(&RECORD_MAGIC);
        hello[RESUME_HELLO_LEN + 3..RESUME_HELLO_LEN + 5].copy_from_slice(&100u16.to_be_bytes());
        assert!(is_ambiguous(&hello));
    }

    /// A uniformly random window decodes with probability
    /// 2^-24 * (17000 - 17 + 1) / 2^16, roughly 1.6e-8 per full handshake.
    /// Clients regenerate their ephemeral key in that case, so the server's
    /// demultiplexing rule never sees a collision from a conforming client.
    #[test]
    fn test_collision_probability_is_small() {
        let valid_lengths = (MAX_RECORD_LEN - MIN_RECORD_LEN + 1) as f64;
        let p = (1.0 / (1u64 << 24) as f64) * (valid_lengths / 65536.0);
        assert!(p < 2e-8);

        let mut hits = 0;
        for _ in 0..10_000 {
            let window: [u8; HEADER_SIZE] = SecureRandom::bytes();
            if looks_like_header(&window) {
                hits += 1;
            }
        }
        assert_eq!(hits, 0);
    }
}
