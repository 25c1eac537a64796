//! Authenticated record layer.
//!
//! After the handshake, every byte travels in records:
//!
//! ```text
//! ┌──────────────────────────┬───────────────────────────────┐
//! │ 0x17 0x03 0x03 len(2)    │ AEAD(payload, aad = header)   │
//! └──────────────────────────┴───────────────────────────────┘
//! ```
//!
//! Each direction is keyed by a 32-byte random its sender transmits once,
//! ahead of its first record. On a resumed connection the client's random
//! travels in the resumption hello instead.
//!
//! [`SecureStream`] implements [`AsyncRead`] and [`AsyncWrite`], so it can be
//! split, wrapped in buffered readers or handed to `copy_bidirectional`.
//! Any protocol or authentication failure is fatal: the stream refuses
//! further I/O and should be dropped, which closes the connection.

mod state;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{
    record_key, CipherKind, SecureRandom, SharedSecret, CLIENT_TO_SERVER, RANDOM_SIZE,
    SERVER_TO_CLIENT, TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::framing::{decode_header, HEADER_SIZE, MAX_RECORD_LEN};
use crate::handshake::session::ResumeHandle;
use crate::handshake::Ticket;

pub(crate) use state::DirectionState;

/// Largest payload sealed into one record.
pub const MAX_PLAINTEXT: usize = 8192;

/// Sealed bytes buffered before `poll_write` waits for the peer.
const MAX_PENDING: usize = 4 * (HEADER_SIZE + MAX_PLAINTEXT + TAG_SIZE);

/// Which end of the connection a stream is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiator
    Client,
    /// Responder
    Server,
}

impl Role {
    fn send_label(self) -> &'static [u8] {
        match self {
            Role::Client => CLIENT_TO_SERVER,
            Role::Server => SERVER_TO_CLIENT,
        }
    }

    fn recv_label(self) -> &'static [u8] {
        match self {
            Role::Client => SERVER_TO_CLIENT,
            Role::Server => CLIENT_TO_SERVER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadPhase {
    PeerRandom,
    Header,
    Body(usize),
}

/// An established connection.
pub struct SecureStream<S> {
    inner: S,
    role: Role,
    cipher: CipherKind,
    secret: SharedSecret,
    ticket: Ticket,
    resumed: bool,

    send: DirectionState,
    /// Sealed bytes not yet accepted by `inner`
    out: BytesMut,

    recv: Option<DirectionState>,
    phase: ReadPhase,
    header: [u8; HEADER_SIZE],
    rbuf: Vec<u8>,
    rfilled: usize,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    records_received: u64,

    /// Resumed clients only: drops the cached ticket when the server refuses it
    resumption: Option<ResumeHandle>,
    failed: bool,
}

impl<S> SecureStream<S> {
    fn build(
        inner: S,
        role: Role,
        secret: SharedSecret,
        cipher: CipherKind,
        ticket: Ticket,
        hello_prefix: &[u8],
        send_random: [u8; RANDOM_SIZE],
        peer_random: Option<&[u8; RANDOM_SIZE]>,
    ) -> Result<Self> {
        let send_key = record_key(secret.as_bytes(), &send_random, role.send_label(), &ticket)?;

        let mut out = BytesMut::with_capacity(hello_prefix.len() + RANDOM_SIZE + MAX_PENDING);
        out.extend_from_slice(hello_prefix);
        out.extend_from_slice(&send_random);

        let mut stream = Self {
            inner,
            role,
            cipher,
            secret,
            ticket,
            resumed: peer_random.is_some() || !hello_prefix.is_empty(),
            send: DirectionState::new(cipher, send_key),
            out,
            recv: None,
            phase: ReadPhase::PeerRandom,
            header: [0u8; HEADER_SIZE],
            rbuf: Vec::new(),
            rfilled: 0,
            plaintext: Vec::new(),
            plaintext_pos: 0,
            records_received: 0,
            resumption: None,
            failed: false,
        };
        if let Some(random) = peer_random {
            stream.set_peer_random(random)?;
        }
        Ok(stream)
    }

    /// Stream after a full handshake; both directions key from fresh randoms.
    pub(crate) fn new(
        inner: S,
        role: Role,
        secret: SharedSecret,
        cipher: CipherKind,
        ticket: Ticket,
    ) -> Result<Self> {
        Self::build(inner, role, secret, cipher, ticket, &[], SecureRandom::bytes(), None)
    }

    /// Client stream resuming `ticket`. The first bytes it sends are
    /// `ticket || random`, queued until the first write, flush or read.
    pub(crate) fn resumed_client(
        inner: S,
        secret: SharedSecret,
        cipher: CipherKind,
        ticket: Ticket,
        handle: ResumeHandle,
    ) -> Result<Self> {
        let mut stream = Self::build(
            inner,
            Role::Client,
            secret,
            cipher,
            ticket,
            &ticket,
            SecureRandom::bytes(),
            None,
        )?;
        stream.resumption = Some(handle);
        Ok(stream)
    }

    /// Server stream for an accepted resumption; the client's random was
    /// already read as part of the resumption hello.
    pub(crate) fn resumed_server(
        inner: S,
        secret: SharedSecret,
        cipher: CipherKind,
        ticket: Ticket,
        client_random: &[u8; RANDOM_SIZE],
    ) -> Result<Self> {
        Self::build(
            inner,
            Role::Server,
            secret,
            cipher,
            ticket,
            &[],
            SecureRandom::bytes(),
            Some(client_random),
        )
    }

    fn set_peer_random(&mut self, random: &[u8; RANDOM_SIZE]) -> Result<()> {
        let key = record_key(self.secret.as_bytes(), random, self.role.recv_label(), &self.ticket)?;
        self.recv = Some(DirectionState::new(self.cipher, key));
        self.phase = ReadPhase::Header;
        Ok(())
    }

    /// Which end this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated record cipher.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// True if the connection skipped the key exchange.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// True once a fatal error has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Key generations used so far as `(send, receive)`; each ratchet adds one.
    pub fn key_generations(&self) -> (u64, u64) {
        let recv = self.recv.as_ref().map_or(0, DirectionState::ratchets);
        (self.send.ratchets(), recv)
    }

    /// The ticket this connection's keys are bound to.
    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream.
    ///
    /// Reading or writing through it desynchronizes the record layer.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn fail(&mut self, err: Error) -> io::Error {
        self.failed = true;
        err.into()
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.failed {
            return Err(Error::ConnectionFailed.into());
        }
        Ok(())
    }
}

impl<S> fmt::Debug for SecureStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("role", &self.role)
            .field("cipher", &self.cipher)
            .field("resumed", &self.resumed)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncWrite + Unpin> SecureStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureStream<S> {
    /// Fill `rbuf[..need]`; `Ok(false)` is a clean EOF before the first byte.
    fn poll_fill(&mut self, cx: &mut Context<'_>, need: usize) -> Poll<io::Result<bool>> {
        if self.rbuf.len() < need {
            self.rbuf.resize(need, 0);
        }
        while self.rfilled < need {
            let mut buf = ReadBuf::new(&mut self.rbuf[self.rfilled..need]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                if self.rfilled == 0 {
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            self.rfilled += n;
        }
        self.rfilled = 0;
        Poll::Ready(Ok(true))
    }

    /// Read and open the next record into `self.plaintext`.
    /// `Ok(false)` is a clean EOF at a record boundary.
    fn poll_next_record(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            match self.phase {
                ReadPhase::PeerRandom => {
                    if !ready!(self.poll_fill(cx, RANDOM_SIZE))? {
                        return Poll::Ready(Ok(false));
                    }
                    let mut random = [0u8; RANDOM_SIZE];
                    random.copy_from_slice(&self.rbuf[..RANDOM_SIZE]);
                    if let Err(e) = self.set_peer_random(&random) {
                        return Poll::Ready(Err(self.fail(e)));
                    }
                }
                ReadPhase::Header => {
                    if !ready!(self.poll_fill(cx, HEADER_SIZE))? {
                        return Poll::Ready(Ok(false));
                    }
                    self.header.copy_from_slice(&self.rbuf[..HEADER_SIZE]);
                    match decode_header(&self.header) {
                        Ok(len) => self.phase = ReadPhase::Body(len),
                        Err(e) => {
                            let err = match &self.resumption {
                                Some(handle) if self.records_received == 0 => {
                                    handle.invalidate();
                                    Error::ResumptionRejected
                                }
                                _ => e,
                            };
                            return Poll::Ready(Err(self.fail(err)));
                        }
                    }
                }
                ReadPhase::Body(len) => {
                    if !ready!(self.poll_fill(cx, len))? {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let Some(recv) = self.recv.as_mut() else {
                        return Poll::Ready(Err(self.fail(Error::protocol("receive key missing"))));
                    };
                    match recv.open_record(&self.header, &self.rbuf[..len]) {
                        Ok(plaintext) => {
                            self.plaintext = plaintext;
                            self.plaintext_pos = 0;
                            self.records_received += 1;
                            self.phase = ReadPhase::Header;
                            return Poll::Ready(Ok(true));
                        }
                        Err(e) => {
                            if let Some(handle) = &self.resumption {
                                handle.invalidate();
                            }
                            return Poll::Ready(Err(self.fail(e)));
                        }
                    }
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_usable()?;

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // A client's first bytes may still be queued; the server won't
        // answer before it sees them.
        if this.role == Role::Client && !this.out.is_empty() {
            ready!(this.poll_drain(cx))?;
            ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        }

        while this.plaintext_pos >= this.plaintext.len() {
            if !ready!(this.poll_next_record(cx))? {
                return Poll::Ready(Ok(()));
            }
        }

        let available = &this.plaintext[this.plaintext_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.plaintext_pos += n;
        if this.plaintext_pos == this.plaintext.len() {
            this.plaintext.clear();
            this.plaintext_pos = 0;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_usable()?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.out.len() >= MAX_PENDING {
            ready!(this.poll_drain(cx))?;
        }

        let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
        if let Err(e) = this.send.seal_record(chunk, &mut this.out) {
            return Poll::Ready(Err(this.fail(e)));
        }

        // Push what the transport takes now; the rest goes out on the next
        // write or flush.
        // The nonce has moved on; a record lost here cannot be resent.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(this.fail(Error::Network(e))));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Nonce;
    use crate::framing::{encode_header, MIN_RECORD_LEN};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair(cipher: CipherKind) -> (SecureStream<DuplexStream>, SecureStream<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let secret = SharedSecret::combine(&[1u8; 32], &[2u8; 32]);
        let ticket = [3u8; 21];
        let client = SecureStream::new(a, Role::Client, secret.clone(), cipher, ticket).unwrap();
        let server = SecureStream::new(b, Role::Server, secret, cipher, ticket).unwrap();
        (client, server)
    }

    async fn send(from: &mut SecureStream<DuplexStream>, to: &mut SecureStream<DuplexStream>, msg: &[u8]) {
        from.write_all(msg).await.unwrap();
        from.flush().await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        to.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg);
    }

    /// Client stream whose peer is a raw pipe end.
    fn client_over_raw() -> (SecureStream<DuplexStream>, DuplexStream) {
        let (a, b) = duplex(64 * 1024);
        let secret = SharedSecret::combine(&[1u8; 32], &[2u8; 32]);
        let stream =
            SecureStream::new(a, Role::Client, secret, CipherKind::ChaCha20Poly1305, [3u8; 21]).unwrap();
        (stream, b)
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        for cipher in [CipherKind::ChaCha20Poly1305, CipherKind::Aes256Gcm] {
            let (mut client, mut server) = pair(cipher);

            for size in [1usize, 100, MAX_PLAINTEXT, MAX_PLAINTEXT + 1, 3 * 1024 * 1024 + 17] {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                let expected = payload.clone();

                let writer = tokio::spawn(async move {
                    client.write_all(&payload).await.unwrap();
                    client.flush().await.unwrap();
                    client
                });

                let mut received = vec![0u8; size];
                server.read_exact(&mut received).await.unwrap();
                assert_eq!(received, expected);
                client = writer.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_empty_write_sends_nothing() {
        let (mut client, _server) = pair(CipherKind::Aes256Gcm);
        assert_eq!(client.write(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_both_directions() {
        let (mut client, mut server) = pair(CipherKind::Aes256Gcm);

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_small_reads_drain_buffered_plaintext() {
        let (mut client, mut server) = pair(CipherKind::ChaCha20Poly1305);
        client.write_all(b"hello world").await.unwrap();
        client.flush().await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        while out.len() < 11 {
            let n = server.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (mut client, mut server) = pair(CipherKind::Aes256Gcm);
        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test]
    async fn test_random_precedes_first_record() {
        let (mut client, mut raw) = client_over_raw();
        client.write_all(&[0xaa; 20]).await.unwrap();
        client.flush().await.unwrap();

        let mut wire = [0u8; RANDOM_SIZE + HEADER_SIZE];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(decode_header(wire[RANDOM_SIZE..].try_into().unwrap()).unwrap(), 36);
    }

    #[tokio::test]
    async fn test_out_of_range_header_rejected() {
        for len in [MIN_RECORD_LEN - 1, MAX_RECORD_LEN + 1] {
            let (mut client, mut raw) = client_over_raw();
            raw.write_all(&[0u8; RANDOM_SIZE]).await.unwrap();
            raw.write_all(&encode_header(len)).await.unwrap();

            let mut buf = [0u8; 16];
            let err = client.read(&mut buf).await.unwrap_err();
            assert!(matches!(Error::from_io(&err), Some(Error::InvalidHeader(_))));
            assert!(client.is_failed());

            let err = client.read(&mut buf).await.unwrap_err();
            assert!(matches!(Error::from_io(&err), Some(Error::ConnectionFailed)));
        }
    }

    #[tokio::test]
    async fn test_failed_drain_latches() {
        let (mut client, raw) = client_over_raw();
        drop(raw);

        let err = client.write(b"lost").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(client.is_failed());

        let err = client.write(b"again").await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::ConnectionFailed)));
    }

    #[tokio::test]
    async fn test_key_generations_track_ratchets() {
        let (mut client, mut server) = pair(CipherKind::ChaCha20Poly1305);
        send(&mut client, &mut server, b"first").await;
        assert_eq!(client.key_generations(), (0, 0));

        client.send.set_nonce(Nonce::MAX);
        server.recv.as_mut().unwrap().set_nonce(Nonce::MAX);
        send(&mut client, &mut server, b"last under the old key").await;
        send(&mut client, &mut server, b"first under the new key").await;

        assert_eq!(client.key_generations(), (1, 0));
        assert_eq!(server.key_generations(), (0, 1));
    }

    #[test]
    fn test_debug_shows_no_key_material() {
        let (a, _b) = duplex(64);
        let secret = SharedSecret::combine(&[0xab; 32], &[0xcd; 32]);
        let stream = SecureStream::new(a, Role::Server, secret, CipherKind::Aes256Gcm, [3u8; 21]).unwrap();

        let shown = format!("{stream:?}");
        assert!(shown.contains("Server"));
        assert!(shown.contains("Aes256Gcm"));
        assert!(!shown.contains("secret") && !shown.contains("171"));
    }

    #[tokio::test]
    async fn test_single_bit_flip_detected() {
        // Flip one bit at a time across the header and the ciphertext.
        let (a, mut tap) = duplex(64 * 1024);
        let secret = SharedSecret::combine(&[1u8; 32], &[2u8; 32]);
        let mut client =
            SecureStream::new(a, Role::Client, secret.clone(), CipherKind::Aes256Gcm, [3u8; 21]).unwrap();
        client.write_all(b"attack at dawn").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = vec![0u8; RANDOM_SIZE + HEADER_SIZE + 14 + TAG_SIZE];
        tap.read_exact(&mut wire).await.unwrap();

        for bit in 0..(wire.len() - RANDOM_SIZE) * 8 {
            let mut tampered = wire.clone();
            tampered[RANDOM_SIZE + bit / 8] ^= 1 << (bit % 8);

            let (mut inject, b) = duplex(64 * 1024);
            let mut server =
                SecureStream::new(b, Role::Server, secret.clone(), CipherKind::Aes256Gcm, [3u8; 21])
                    .unwrap();
            inject.write_all(&tampered).await.unwrap();
            drop(inject);

            let mut buf = [0u8; 64];
            let result = server.read(&mut buf).await;
            assert!(result.is_err(), "bit {bit} went unnoticed");
        }
    }
}
