//! Pseudo-record framing.
//!
//! Every length on the wire (handshake padding and data records) is carried
//! in a 5-byte header shaped like a TLS 1.2 application-data record:
//!
//! ```text
//! ┌──────┬──────┬──────┬──────────┬──────────┐
//! │ 0x17 │ 0x03 │ 0x03 │ len (hi) │ len (lo) │
//! └──────┴──────┴──────┴──────────┴──────────┘
//! ```

use crate::error::{Error, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 5;

/// Fixed header prefix: application data, version 3.3
pub const RECORD_MAGIC: [u8; 3] = [0x17, 0x03, 0x03];

/// Smallest accepted length (one byte of payload plus a 16-byte tag)
pub const MIN_RECORD_LEN: usize = 17;

/// Largest accepted length
pub const MAX_RECORD_LEN: usize = 17000;

/// Encode a header announcing `len` bytes.
///
/// The length is written as-is; callers keep it inside
/// `[MIN_RECORD_LEN, MAX_RECORD_LEN]`.
pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
    debug_assert!(len <= u16::MAX as usize);
    let len = (len as u16).to_be_bytes();
    [RECORD_MAGIC[0], RECORD_MAGIC[1], RECORD_MAGIC[2], len[0], len[1]]
}

/// Decode a header and return the announced length.
///
/// # Errors
///
/// [`Error::InvalidHeader`] if the magic bytes differ or the length falls
/// outside `[MIN_RECORD_LEN, MAX_RECORD_LEN]`.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<usize> {
    if header[..3] != RECORD_MAGIC {
        return Err(Error::InvalidHeader(*header));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&len) {
        return Err(Error::InvalidHeader(*header));
    }
    Ok(len)
}

/// True if `bytes` start with something [`decode_header`] accepts.
pub fn looks_like_header(bytes: &[u8]) -> bool {
    bytes
        .get(..HEADER_SIZE)
        .and_then(|b| <&[u8; HEADER_SIZE]>::try_from(b).ok())
        .map_or(false, |h| decode_header(h).is_ok())
}
