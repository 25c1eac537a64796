//! XOR obfuscation transport.
//!
//! A byte-wise reversible transform applied under the handshake and record
//! layer. It carries no integrity guarantee; its only job is to change the
//! static signature of the opening bytes of a connection.
//!
//! Modes:
//! - `native`: bytes pass through untouched
//! - `xorpub`: XOR with a 32-byte keystream derived from the first server
//!   public key
//! - `random`: the client opens with a 32-byte IV in clear and both sides
//!   XOR with a keystream derived from the public key and that IV

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Size of the clear-text IV opening a `random` mode connection
pub const IV_SIZE: usize = 32;

const KEYSTREAM_SIZE: usize = 32;
const KEYSTREAM_LABEL: &[u8] = b"veil obfuscation keystream";

/// How the raw stream is disguised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ObfuscationMode {
    /// No transform
    #[default]
    Native,
    /// Keystream from the server public key
    PublicKey,
    /// Keystream from the server public key and a per-connection IV
    Random,
}

impl ObfuscationMode {
    /// Name used in the encryption string.
    pub fn as_str(self) -> &'static str {
        match self {
            ObfuscationMode::Native => "native",
            ObfuscationMode::PublicKey => "xorpub",
            ObfuscationMode::Random => "random",
        }
    }
}

impl FromStr for ObfuscationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(ObfuscationMode::Native),
            "xorpub" => Ok(ObfuscationMode::PublicKey),
            "random" => Ok(ObfuscationMode::Random),
            other => Err(Error::config(format!("unknown obfuscation mode: {other}"))),
        }
    }
}

impl fmt::Display for ObfuscationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn keystream(public_key: &[u8], iv: Option<&[u8]>) -> [u8; KEYSTREAM_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(KEYSTREAM_LABEL);
    hasher.update(public_key);
    if let Some(iv) = iv {
        hasher.update(iv);
    }
    hasher.finalize().into()
}

fn apply(keystream: &[u8; KEYSTREAM_SIZE], pos: &mut usize, data: &mut [u8]) {
    for byte in data {
        *byte ^= keystream[*pos];
        *pos = (*pos + 1) % KEYSTREAM_SIZE;
    }
}

/// A stream that XORs everything it reads and writes.
///
/// Read and write directions keep independent keystream positions.
pub struct ObfuscatedStream<S> {
    inner: S,
    keystream: Option<[u8; KEYSTREAM_SIZE]>,
    read_pos: usize,
    write_pos: usize,
    /// Raw bytes to emit ahead of anything else (the client's IV)
    prefix: Vec<u8>,
    scratch: Vec<u8>,
}

impl<S> ObfuscatedStream<S> {
    /// Wrap a stream without any transform.
    pub fn plain(inner: S) -> Self {
        Self::with_keystream(inner, None)
    }

    fn with_keystream(inner: S, keystream: Option<[u8; KEYSTREAM_SIZE]>) -> Self {
        Self {
            inner,
            keystream,
            read_pos: 0,
            write_pos: 0,
            prefix: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// True unless the stream is a passthrough.
    pub fn is_obfuscated(&self) -> bool {
        self.keystream.is_some()
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ObfuscatedStream<S> {
    /// Client side. In `random` mode the IV is queued and goes out in front
    /// of the first write.
    pub fn connect(inner: S, mode: ObfuscationMode, public_key: &[u8]) -> Self {
        match mode {
            ObfuscationMode::Native => Self::plain(inner),
            ObfuscationMode::PublicKey => Self::with_keystream(inner, Some(keystream(public_key, None))),
            ObfuscationMode::Random => {
                let iv: [u8; IV_SIZE] = SecureRandom::bytes();
                let mut stream = Self::with_keystream(inner, Some(keystream(public_key, Some(&iv))));
                stream.prefix = iv.to_vec();
                stream
            }
        }
    }

    /// Server side. In `random` mode this reads the client's IV first.
    pub async fn accept(mut inner: S, mode: ObfuscationMode, public_key: &[u8]) -> Result<Self> {
        Ok(match mode {
            ObfuscationMode::Native => Self::plain(inner),
            ObfuscationMode::PublicKey => Self::with_keystream(inner, Some(keystream(public_key, None))),
            ObfuscationMode::Random => {
                let mut iv = [0u8; IV_SIZE];
                inner.read_exact(&mut iv).await?;
                Self::with_keystream(inner, Some(keystream(public_key, Some(&iv))))
            }
        })
    }
}

impl<S: AsyncWrite + Unpin> ObfuscatedStream<S> {
    fn poll_write_prefix(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.prefix.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.prefix))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.prefix.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        if let Some(ks) = &this.keystream {
            apply(ks, &mut this.read_pos, &mut buf.filled_mut()[start..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_write_prefix(cx))?;

        let Some(ks) = this.keystream else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };

        // Encode from the current position; only what the inner stream
        // accepted moves the position forward.
        this.scratch.clear();
        this.scratch.extend_from_slice(buf);
        let mut pos = this.write_pos;
        apply(&ks, &mut pos, &mut this.scratch);

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.scratch))?;
        this.write_pos = (this.write_pos + n) % KEYSTREAM_SIZE;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_prefix(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_prefix(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const PUBLIC_KEY: [u8; 32] = [0x5a; 32];

    #[test]
    fn test_mode_names() {
        for mode in [ObfuscationMode::Native, ObfuscationMode::PublicKey, ObfuscationMode::Random] {
            assert_eq!(mode.as_str().parse::<ObfuscationMode>().unwrap(), mode);
        }
        assert!(matches!("rot13".parse::<ObfuscationMode>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_apply_is_involution() {
        let ks = keystream(&PUBLIC_KEY, None);
        let mut data = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut pos = 0;
        apply(&ks, &mut pos, &mut data);
        assert_ne!(&data[..], b"the quick brown fox jumps over the lazy dog");

        let mut pos = 0;
        apply(&ks, &mut pos, &mut data);
        assert_eq!(&data[..], b"the quick brown fox jumps over the lazy dog");
    }

    #[tokio::test]
    async fn test_native_is_passthrough() {
        let (a, mut b) = duplex(1024);
        let mut client = ObfuscatedStream::connect(a, ObfuscationMode::Native, &PUBLIC_KEY);
        assert!(!client.is_obfuscated());

        client.write_all(b"\x17\x03\x03hello").await.unwrap();
        let mut buf = [0u8; 8];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x17\x03\x03hello");
    }

    #[tokio::test]
    async fn test_xorpub_hides_and_restores_bytes() {
        let (a, b) = duplex(4096);
        let mut client = ObfuscatedStream::connect(a, ObfuscationMode::PublicKey, &PUBLIC_KEY);
        let mut server = ObfuscatedStream::accept(b, ObfuscationMode::PublicKey, &PUBLIC_KEY)
            .await
            .unwrap();

        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        // Odd chunk sizes so positions cross the keystream boundary mid-chunk
        for chunk in payload.chunks(7) {
            client.write_all(chunk).await.unwrap();
        }
        client.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        server.write_all(b"pong").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");
    }

    #[tokio::test]
    async fn test_random_mode_sends_iv_first() {
        let (a, mut raw) = duplex(4096);
        let mut client = ObfuscatedStream::connect(a, ObfuscationMode::Random, &PUBLIC_KEY);
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = [0u8; IV_SIZE + 5];
        raw.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire[IV_SIZE..], b"hello");

        let ks = keystream(&PUBLIC_KEY, Some(&wire[..IV_SIZE]));
        let mut pos = 0;
        apply(&ks, &mut pos, &mut wire[IV_SIZE..]);
        assert_eq!(&wire[IV_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_random_mode_roundtrip() {
        let (a, b) = duplex(4096);
        let mut client = ObfuscatedStream::connect(a, ObfuscationMode::Random, &PUBLIC_KEY);
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        let mut server = ObfuscatedStream::accept(b, ObfuscationMode::Random, &PUBLIC_KEY)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_mismatched_key_garbles() {
        let (a, b) = duplex(1024);
        let mut client = ObfuscatedStream::connect(a, ObfuscationMode::PublicKey, &PUBLIC_KEY);
        let mut server = ObfuscatedStream::accept(b, ObfuscationMode::PublicKey, &[0x11; 32])
            .await
            .unwrap();

        client.write_all(b"secret").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"secret");
    }
}
