//! Error handling for the device core.
//!
//! All fallible operations return [`Result`]. Underlying library errors are
//! converted with `thiserror`'s `#[from]`; transport-level io errors can be
//! reclassified into the more specific network variants with
//! [`ProtocolError::from_io_error`].

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur in the device core.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or stream error.
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or parsing error.
    #[error("certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// A received line is not a valid packet (bad JSON, missing `type`,
    /// non-object `body`). Dropped with a warning on a live channel.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The peer announced a different device id than the one we connected to.
    #[error("identity mismatch: expected {expected}, peer announced {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// The TLS upgrade did not complete.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The peer's leaf certificate differs from the remembered one.
    #[error("certificate pinning failed: {0}")]
    CertificatePinningFailed(String),

    /// The channel is gone; any suspended send or receive fails with this.
    #[error("channel closed")]
    ChannelClosed,

    /// Connection attempt actively refused by the remote device.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the remote device.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// A network operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer did not answer a pairing request within the deadline.
    #[error("pairing timed out")]
    PairTimeout,

    /// The peer declined a pairing request.
    #[error("pairing rejected by peer")]
    PairRejected,

    /// A cache group could not be used; the entry is skipped.
    #[error("cache entry unusable: {0}")]
    CacheLoad(String),

    /// No device with the given id is known.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Handler registry contract violation.
    #[error("handler error: {0}")]
    Handler(String),
}

impl ProtocolError {
    /// Reclassify a generic I/O error into a more specific network variant.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{context}: {error}")),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{context}: {error}"))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{context}: {error}"))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::ChannelClosed
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Whether retrying the operation later could succeed.
    ///
    /// Transport errors are transient: the manager retries activation on the
    /// next discovery ping. Trust errors are not; they need user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};

        let e = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionRefused, "refused"),
            "connecting",
        );
        assert!(matches!(e, ProtocolError::ConnectionRefused(_)));
        assert!(e.is_recoverable());

        let e = ProtocolError::from_io_error(Error::new(ErrorKind::TimedOut, "slow"), "reading");
        assert!(matches!(e, ProtocolError::Timeout(_)));

        let e = ProtocolError::from_io_error(Error::new(ErrorKind::BrokenPipe, "gone"), "writing");
        assert!(matches!(e, ProtocolError::ChannelClosed));
    }

    #[test]
    fn test_trust_errors_not_recoverable() {
        let e = ProtocolError::CertificatePinningFailed("peer cert changed".into());
        assert!(!e.is_recoverable());
        assert!(!ProtocolError::PairRejected.is_recoverable());
    }
}
