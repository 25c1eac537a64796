//! Client handshake engine.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::crypto::{EphemeralKeyPair, SharedSecret, MLKEM768_CIPHERTEXT_SIZE};
use crate::error::Result;
use crate::handshake::config::ClientParams;
use crate::handshake::messages::{encode_client_hello, is_ambiguous, skip_padding};
use crate::handshake::session::{ClientSessionCache, ResumeHandle};
use crate::handshake::{verify_ticket, Ticket, TICKET_SIZE};
use crate::obfuscation::ObfuscatedStream;
use crate::record::{Role, SecureStream};

/// Connection type produced by a client handshake.
pub type ClientStream<S> = SecureStream<ObfuscatedStream<S>>;

/// Handshake client.
///
/// One instance per configured server; connections made through it share
/// the resumption cache.
pub struct ClientInstance {
    params: Arc<ClientParams>,
    cache: Arc<ClientSessionCache>,
}

impl ClientInstance {
    /// Create a client from validated parameters.
    pub fn new(params: ClientParams) -> Self {
        let cache = Arc::new(ClientSessionCache::new(params.resumption_ttl()));
        Self {
            params: Arc::new(params),
            cache,
        }
    }

    /// The parameters this client was built with.
    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    /// The resumption cache.
    pub fn cache(&self) -> &Arc<ClientSessionCache> {
        &self.cache
    }

    /// Secure an already-connected stream.
    ///
    /// With a live cached ticket this returns immediately and nothing is
    /// sent until the first write, flush or read. Otherwise it runs a full
    /// handshake.
    ///
    /// # Errors
    ///
    /// I/O errors, malformed server replies, and
    /// [`Error::Authentication`](crate::Error::Authentication) if the ticket
    /// does not verify (nothing is cached in that case).
    pub async fn handshake<S>(&self, stream: S) -> Result<ClientStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = ObfuscatedStream::connect(stream, self.params.obfuscation(), self.params.obfuscation_key());

        if let Some(session) = self.cache.current() {
            tracing::debug!("Resuming cached session");
            let handle = ResumeHandle::new(Arc::clone(&self.cache), session.ticket);
            return SecureStream::resumed_client(stream, session.secret, session.cipher, session.ticket, handle);
        }

        self.full_handshake(stream).await
    }

    async fn full_handshake<S>(&self, mut stream: ObfuscatedStream<S>) -> Result<ClientStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cipher = self.params.cipher();

        let mut nfs_secret = Zeroizing::new(Vec::with_capacity(32 * self.params.server_keys().len()));
        let mut nfs_ciphertexts = Vec::with_capacity(self.params.nfs_ciphertext_len());
        for key in self.params.server_keys() {
            let (secret, ciphertext) = key.encapsulate()?;
            nfs_secret.extend_from_slice(secret.as_slice());
            nfs_ciphertexts.extend_from_slice(&ciphertext);
        }

        let (ephemeral, hello) = loop {
            let ephemeral = EphemeralKeyPair::generate()?;
            let hello = encode_client_hello(cipher.selector(), ephemeral.public_bytes(), &nfs_ciphertexts);
            if !is_ambiguous(&hello) {
                break (ephemeral, hello);
            }
            tracing::trace!("Ephemeral key collides with a record header, regenerating");
        };

        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut pfs_ciphertext = [0u8; MLKEM768_CIPHERTEXT_SIZE];
        stream.read_exact(&mut pfs_ciphertext).await?;
        let mut ticket: Ticket = [0u8; TICKET_SIZE];
        stream.read_exact(&mut ticket).await?;
        skip_padding(&mut stream).await?;

        let pfs_secret = ephemeral.decapsulate(&pfs_ciphertext)?;
        let secret = SharedSecret::combine(pfs_secret.as_slice(), &nfs_secret);

        verify_ticket(
            &ticket,
            &secret,
            cipher,
            &nfs_ciphertexts,
            ephemeral.public_bytes(),
            &pfs_ciphertext,
        )?;

        self.cache.store(secret.clone(), ticket, cipher);
        tracing::debug!("Full handshake complete");

        SecureStream::new(stream, Role::Client, secret, cipher, ticket)
    }
}
