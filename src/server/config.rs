//! Tunnel configuration.
//!
//! The server reads TOML, the client reads JSON. Both carry the listen
//! address, the far end to connect to, and an encryption string.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyKind, ServerPrivateKey};
use crate::error::{Error, Result};
use crate::handshake::config::DEFAULT_RESUMPTION_TTL;
use crate::handshake::{ClientParams, ServerParams};
use crate::obfuscation::ObfuscationMode;

/// Runtime configuration of the tunnel server.
#[derive(Debug)]
pub struct ServerConfig {
    /// Address accepting obfuscated connections
    pub listen_addr: SocketAddr,
    /// Plain TCP service every tunnel is forwarded to
    pub forward_addr: String,
    /// Handshake parameters
    pub params: ServerParams,
}

impl ServerConfig {
    /// Create a configuration with one fresh ML-KEM-768 key.
    pub fn new_random(
        listen_addr: SocketAddr,
        forward_addr: impl Into<String>,
        obfuscation: ObfuscationMode,
    ) -> Result<Self> {
        let key = ServerPrivateKey::generate(KeyKind::MlKem768)?;
        Ok(Self {
            listen_addr,
            forward_addr: forward_addr.into(),
            params: ServerParams::new(vec![key], DEFAULT_RESUMPTION_TTL, obfuscation)?,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.forward_addr.is_empty() {
            return Err(Error::config("forward_addr cannot be empty"));
        }
        Ok(())
    }
}

/// Server configuration file format.
#[derive(Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address, e.g. `0.0.0.0:443`
    pub listen_addr: String,
    /// Forward target, e.g. `127.0.0.1:8080`
    pub forward_addr: String,
    /// Server encryption string (contains private keys)
    pub encryption: String,
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let listen_addr = self
            .listen_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid listen_addr: {e}")))?;
        let config = ServerConfig {
            listen_addr,
            forward_addr: self.forward_addr.clone(),
            params: ServerParams::parse(&self.encryption)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.to_string(),
            forward_addr: config.forward_addr.clone(),
            encryption: config.params.to_encryption_string(),
        }
    }
}

/// Client configuration file format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Local address applications connect to
    pub listen_addr: String,
    /// Tunnel server address
    pub server_addr: String,
    /// Client encryption string (public keys only)
    pub encryption: String,
    /// Force a cipher: `"aes-256-gcm"` or `"chacha20-poly1305"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    /// Dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl ClientConfigFile {
    /// Client file matching a server configuration.
    pub fn for_server(config: &ServerConfig, server_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".into(),
            server_addr: server_addr.into(),
            encryption: config.params.client_encryption_string(),
            cipher: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Parse the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid listen_addr: {e}")))
    }

    /// Dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Build handshake parameters.
    pub fn params(&self) -> Result<ClientParams> {
        let params = ClientParams::parse(&self.encryption)?;
        match self.cipher.as_deref() {
            None => Ok(params),
            Some("aes-256-gcm") => Ok(params.with_cipher(crate::crypto::CipherKind::Aes256Gcm)),
            Some("chacha20-poly1305") => Ok(params.with_cipher(crate::crypto::CipherKind::ChaCha20Poly1305)),
            Some(other) => Err(Error::config(format!("unknown cipher {other:?}"))),
        }
    }
}
