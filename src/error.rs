//! Error types for the veil protocol.

use std::io;

use thiserror::Error;

/// Result type alias for veil operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during veil operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Key exchange failed (bad encapsulation key, non-contributory DH, ...)
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Ticket or record authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed, truncated or unexpected handshake/record bytes
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pseudo-record header with wrong magic or out-of-range length
    #[error("invalid header: {0:02x?}")]
    InvalidHeader([u8; 5]),

    /// A resumption random was presented twice for the same ticket
    #[error("replay detected")]
    Replay,

    /// Server side: the client resumed with a ticket that is unknown or expired
    #[error("invalid or expired ticket")]
    InvalidTicket,

    /// Client side: the server refused the cached ticket; a new full handshake is needed
    #[error("resumption rejected, new handshake needed")]
    ResumptionRejected,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// The connection already failed and cannot be used any more
    #[error("connection is closed after a fatal error")]
    ConnectionFailed,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Error::Authentication(msg.into())
    }

    /// Create a new key exchange error
    pub fn key_exchange(msg: impl Into<String>) -> Self {
        Error::KeyExchange(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }

    /// Check if a caller should retry once with a full handshake on a new connection.
    pub fn needs_full_handshake(&self) -> bool {
        matches!(self, Error::ResumptionRejected)
    }

    /// Recover the typed error carried inside an [`io::Error`] returned by the
    /// secure stream's `AsyncRead`/`AsyncWrite` implementation.
    pub fn from_io(err: &io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Network(e) => e,
            other => {
                let kind = match &other {
                    Error::Replay => io::ErrorKind::PermissionDenied,
                    Error::ResumptionRejected | Error::InvalidTicket => {
                        io::ErrorKind::ConnectionAborted
                    }
                    Error::ConnectionFailed => io::ErrorKind::BrokenPipe,
                    Error::Config(_) => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Replay;
        assert_eq!(err.to_string(), "replay detected");

        let err = Error::InvalidHeader([0x16, 0x03, 0x01, 0x00, 0x05]);
        assert_eq!(err.to_string(), "invalid header: [16, 03, 01, 00, 05]");
    }

    #[test]
    fn test_io_conversion_keeps_typed_error() {
        let io_err: io::Error = Error::authentication("record").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(Error::from_io(&io_err).unwrap().is_auth_failure());

        let io_err: io::Error = Error::ResumptionRejected.into();
        assert!(Error::from_io(&io_err).unwrap().needs_full_handshake());
    }

    #[test]
    fn test_io_conversion_passes_network_errors_through() {
        let original = io::Error::new(io::ErrorKind::TimedOut, "slow peer");
        let io_err: io::Error = Error::Network(original).into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
        assert!(Error::from_io(&io_err).is_none());
    }
}
