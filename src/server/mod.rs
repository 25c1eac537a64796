//! TCP tunnel server.
//!
//! Accepts obfuscated connections, runs the server handshake on each and
//! forwards the decrypted stream to a fixed plain TCP service.
//!
//! ```text
//!   veil-client ──obfuscated──▶ TunnelServer ──plain TCP──▶ forward_addr
//!                               │
//!                               └─ ServerInstance (ticket cache, sweeper)
//! ```
//!
//! Nothing about a connection is kept once it closes; the only state shared
//! between connections is the ticket cache inside [`ServerInstance`].

pub mod config;

pub use config::{ClientConfigFile, ServerConfig, ServerConfigFile};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::handshake::{HandshakeMetrics, ServerInstance};

/// How often the handshake counters are logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Main tunnel server.
pub struct TunnelServer {
    forward_addr: Arc<str>,
    listen_addr: SocketAddr,
    instance: Arc<ServerInstance>,
}

impl TunnelServer {
    /// Create a server with the given configuration.
    ///
    /// Must be called inside a Tokio runtime when resumption is enabled.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            forward_addr: config.forward_addr.into(),
            listen_addr: config.listen_addr,
            instance: Arc::new(ServerInstance::new(config.params)?),
        })
    }

    /// The handshake server shared by all connections.
    pub fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }

    /// Handshake counters.
    pub fn metrics(&self) -> &HandshakeMetrics {
        self.instance.metrics()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("veil server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let metrics = Arc::clone(self.instance.metrics());
        let reporter = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPORT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::info!("\n{}", metrics.format_report());
            }
        });

        let result = self.accept_loop(listener).await;
        reporter.abort();
        self.instance.close();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let instance = Arc::clone(&self.instance);
                    let forward_addr = Arc::clone(&self.forward_addr);

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(instance, &forward_addr, stream).await {
                            tracing::debug!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        instance: Arc<ServerInstance>,
        forward_addr: &str,
        stream: TcpStream,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        let mut secure = instance.accept(stream).await?;
        let mut upstream = TcpStream::connect(forward_addr).await?;
        upstream.set_nodelay(true)?;

        let (up, down) = tokio::io::copy_bidirectional(&mut secure, &mut upstream).await?;
        tracing::debug!(
            resumed = secure.is_resumed(),
            "Tunnel closed: {} bytes up, {} bytes down",
            up,
            down
        );
        Ok(())
    }
}
