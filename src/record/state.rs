//! Per-direction record state: key, cipher, nonce counter and the ratchet.

use bytes::{BufMut, BytesMut};

use crate::crypto::{ciphertext_len, ratchet_key, Aead, AeadKey, CipherKind, Nonce};
use crate::error::Result;
use crate::framing::{encode_header, HEADER_SIZE};

/// Key and nonce counter for one direction of one connection.
///
/// Sealing (or opening) under the all-0xFF nonce moves to the next key,
/// derived from the current key, that record's ciphertext and its header.
/// The counter then wraps to zero under the new key.
pub(crate) struct DirectionState {
    key: AeadKey,
    aead: Aead,
    nonce: Nonce,
    ratchets: u64,
}

impl DirectionState {
    pub(crate) fn new(kind: CipherKind, key: AeadKey) -> Self {
        Self {
            aead: Aead::new(kind, &key),
            key,
            nonce: Nonce::initial(kind),
            ratchets: 0,
        }
    }

    /// Seal `payload` as one record and append `header || ciphertext` to `out`.
    pub(crate) fn seal_record(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        let header = encode_header(ciphertext_len(payload.len()));
        let ciphertext = self.aead.encrypt(&self.nonce, payload, &header)?;
        self.advance(&ciphertext, &header)?;

        out.reserve(HEADER_SIZE + ciphertext.len());
        out.put_slice(&header);
        out.put_slice(&ciphertext);
        Ok(())
    }

    /// Open one record whose header was already validated.
    pub(crate) fn open_record(&mut self, header: &[u8; HEADER_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.aead.decrypt(&self.nonce, ciphertext, header)?;
        self.advance(ciphertext, header)?;
        Ok(plaintext)
    }

    fn advance(&mut self, ciphertext: &[u8], header: &[u8; HEADER_SIZE]) -> Result<()> {
        let exhausted = self.nonce.is_exhausted();
        self.nonce.increment();
        if exhausted {
            self.key = ratchet_key(&self.key, ciphertext, header)?;
            self.aead = Aead::new(self.aead.kind(), &self.key);
            self.ratchets += 1;
            tracing::trace!("Record key ratcheted to generation {}", self.ratchets);
        }
        Ok(())
    }

    /// How many times this direction has rekeyed.
    pub(crate) fn ratchets(&self) -> u64 {
        self.ratchets
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: Nonce) {
        self.nonce = nonce;
    }
}
