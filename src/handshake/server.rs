//! Server handshake engine.
//!
//! One [`ServerInstance`] owns the ticket cache and its sweeper and is shared
//! by every accepted connection. Build it inside a Tokio runtime when
//! resumption is enabled; tear it down with [`ServerInstance::close`] (or by
//! dropping it).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::crypto::{mlkem_encapsulate, random_padding, CipherKind, SecureRandom, SharedSecret, RANDOM_SIZE};
use crate::error::{Error, Result};
use crate::framing::{decode_header, looks_like_header, HEADER_SIZE};
use crate::handshake::config::ServerParams;
use crate::handshake::messages::{client_hello_fixed_len, encode_server_hello, skip_padding, ClientHello};
use crate::handshake::metrics::HandshakeMetrics;
use crate::handshake::session::{Resumption, SessionCache, SWEEP_INTERVAL};
use crate::handshake::{seal_ticket, Ticket, RESUME_HELLO_LEN, TICKET_SIZE};
use crate::obfuscation::ObfuscatedStream;
use crate::record::{Role, SecureStream};

/// Connection type produced by a server handshake.
pub type ServerStream<S> = SecureStream<ObfuscatedStream<S>>;

/// Size range of the noise answering an unknown ticket.
const DECOY_MIN: usize = 1279;
const DECOY_MAX: usize = 2279;

/// Handshake server.
pub struct ServerInstance {
    params: Arc<ServerParams>,
    cache: Option<Arc<SessionCache>>,
    metrics: Arc<HandshakeMetrics>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    /// Create a server from validated parameters.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if resumption is enabled outside a Tokio runtime
    /// (the sweeper task needs one).
    pub fn new(params: ServerParams) -> Result<Self> {
        let metrics = Arc::new(HandshakeMetrics::new());
        let ttl = params.resumption_ttl();

        let (cache, sweeper) = if ttl.is_zero() {
            (None, None)
        } else {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(Error::config("session resumption requires a Tokio runtime"));
            }
            let cache = Arc::new(SessionCache::new(ttl));
            let sweeper = cache.spawn_sweeper(SWEEP_INTERVAL, Arc::clone(&metrics));
            (Some(cache), Some(sweeper))
        };

        Ok(Self {
            params: Arc::new(params),
            cache,
            metrics,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// The parameters this server was built with.
    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    /// Handshake counters.
    pub fn metrics(&self) -> &Arc<HandshakeMetrics> {
        &self.metrics
    }

    /// The ticket cache, if resumption is enabled.
    pub fn cache(&self) -> Option<&Arc<SessionCache>> {
        self.cache.as_ref()
    }

    /// Stop the sweeper and drop every cached ticket.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Secure an accepted stream.
    ///
    /// # Errors
    ///
    /// - [`Error::Replay`] for a resumption random seen before
    /// - [`Error::InvalidTicket`] for an explicit resumption with an unknown
    ///   ticket (the peer has been sent decoy noise)
    /// - protocol, key-exchange and I/O errors for broken full handshakes
    ///
    /// The caller should drop the stream on error.
    pub async fn accept<S>(&self, stream: S) -> Result<ServerStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.accept_inner(stream).await;
        match &result {
            Ok(_) => {}
            Err(Error::Replay) => self.metrics.increment_replays_rejected(),
            Err(Error::InvalidTicket) => self.metrics.increment_invalid_tickets(),
            Err(_) => self.metrics.increment_handshake_failures(),
        }
        result
    }

    async fn accept_inner<S>(&self, stream: S) -> Result<ServerStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream =
            ObfuscatedStream::accept(stream, self.params.obfuscation(), self.params.obfuscation_key()).await?;

        let mut prefix = [0u8; RESUME_HELLO_LEN];
        stream.read_exact(&mut prefix).await?;
        let mut ticket: Ticket = [0u8; TICKET_SIZE];
        ticket.copy_from_slice(&prefix[..TICKET_SIZE]);
        let mut random = [0u8; RANDOM_SIZE];
        random.copy_from_slice(&prefix[TICKET_SIZE..]);

        if let Some(cache) = &self.cache {
            match cache.resume(&ticket, &random) {
                Resumption::Accepted(session) => {
                    self.metrics.increment_resumptions();
                    tracing::debug!("Resumed session");
                    return SecureStream::resumed_server(
                        stream,
                        session.secret().clone(),
                        session.cipher(),
                        ticket,
                        &random,
                    );
                }
                Resumption::Replayed => {
                    tracing::debug!("Rejected replayed resumption");
                    return Err(Error::Replay);
                }
                Resumption::Unknown => {}
            }
        }

        let mut window = [0u8; HEADER_SIZE];
        stream.read_exact(&mut window).await?;
        if decode_header(&window).is_ok() {
            tracing::debug!("Unknown ticket, sending decoy");
            stream.write_all(&decoy()).await?;
            stream.flush().await?;
            return Err(Error::InvalidTicket);
        }

        // Not a resumption: what was read so far opens a full client hello.
        let fixed_len = client_hello_fixed_len(self.params.nfs_ciphertext_len());
        let mut fixed = Vec::with_capacity(fixed_len);
        fixed.extend_from_slice(&prefix);
        fixed.extend_from_slice(&window);
        fixed.resize(fixed_len, 0);
        stream.read_exact(&mut fixed[RESUME_HELLO_LEN + HEADER_SIZE..]).await?;
        skip_padding(&mut stream).await?;

        let hello = ClientHello::parse(&fixed);
        let cipher = CipherKind::from_selector(hello.selector)
            .ok_or_else(|| Error::protocol(format!("unknown cipher selector {}", hello.selector)))?;

        let mut nfs_secret = Zeroizing::new(Vec::with_capacity(32 * self.params.keys().len()));
        let mut offset = 0;
        for key in self.params.keys() {
            let ciphertext = &hello.nfs_ciphertexts[offset..offset + key.ciphertext_len()];
            let secret = key
                .decapsulate(ciphertext)
                .map_err(|e| Error::protocol(format!("client hello rejected: {e}")))?;
            nfs_secret.extend_from_slice(secret.as_slice());
            offset += key.ciphertext_len();
        }

        let (pfs_secret, pfs_ciphertext) = mlkem_encapsulate(hello.ephemeral_public)
            .map_err(|e| Error::protocol(format!("client hello rejected: {e}")))?;
        let secret = SharedSecret::combine(pfs_secret.as_slice(), &nfs_secret);

        let ticket = seal_ticket(
            &secret,
            cipher,
            hello.nfs_ciphertexts,
            hello.ephemeral_public,
            &pfs_ciphertext,
        )?;
        if let Some(cache) = &self.cache {
            cache.insert(ticket, secret.clone(), cipher);
        }

        stream.write_all(&encode_server_hello(&pfs_ciphertext, &ticket)).await?;
        stream.flush().await?;

        self.metrics.increment_full_handshakes();
        tracing::debug!("Full handshake complete");

        SecureStream::new(stream, Role::Server, secret, cipher, ticket)
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Random bytes that a client will not mistake for the server's random
/// followed by a record header.
fn decoy() -> Vec<u8> {
    loop {
        let noise = random_padding(SecureRandom::between(DECOY_MIN, DECOY_MAX + 1));
        if !looks_like_header(&noise) && !looks_like_header(&noise[RANDOM_SIZE..]) {
            return noise;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoy_shape() {
        for _ in 0..100 {
            let noise = decoy();
            assert!((DECOY_MIN..=DECOY_MAX).contains(&noise.len()));
            assert!(!looks_like_header(&noise[RANDOM_SIZE..]));
        }
    }

    #[test]
    fn test_resumption_needs_runtime() {
        use crate::crypto::{KeyKind, ServerPrivateKey};
        use crate::obfuscation::ObfuscationMode;
        use std::time::Duration;

        let keys = vec![ServerPrivateKey::generate(KeyKind::X25519).unwrap()];
        let params = ServerParams::new(keys, Duration::from_secs(60), ObfuscationMode::Native).unwrap();
        assert!(matches!(ServerInstance::new(params), Err(Error::Config(_))));

        let keys = vec![ServerPrivateKey::generate(KeyKind::X25519).unwrap()];
        let params = ServerParams::new(keys, Duration::ZERO, ObfuscationMode::Native).unwrap();
        let server = ServerInstance::new(params).unwrap();
        assert!(server.cache().is_none());
    }
}
