//! Error handling for the lanlink protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are automatically converted from underlying library errors using
//! `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Error Propagation
//!
//! Use the `?` operator for automatic error propagation:
//!
//! ```rust,no_run
//! use lanlink_protocol::wire;
//! use lanlink_protocol::Result;
//! use tokio::net::TcpStream;
//!
//! async fn read_greeting(stream: &mut TcpStream) -> Result<String> {
//!     let name = wire::read_string(stream).await?; // IO errors auto-converted
//!     Ok(name)
//! }
//! ```
//!
//! ### Error Matching
//!
//! Match on specific variants for custom handling:
//!
//! ```rust
//! use lanlink_protocol::ProtocolError;
//!
//! fn describe(err: &ProtocolError) -> String {
//!     match err {
//!         ProtocolError::Remote(msg) => format!("peer reported: {msg}"),
//!         ProtocolError::DeviceNotFound(id) => format!("unknown device {id}"),
//!         other => other.to_string(),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// IO error (connection reset, dial failure, filesystem fault)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write did not complete within its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer speaks a different protocol revision
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    /// The fixed magic frame did not match
    #[error("Invalid magic frame")]
    BadMagic,

    /// A control byte outside the known vocabulary was received
    #[error("Unexpected control byte: {0:#04x}")]
    UnexpectedControl(u8),

    /// A length-prefixed field exceeded the permitted size
    #[error("Field too large: {0} bytes")]
    FieldTooLarge(u64),

    /// Application-level ERROR reply from the remote peer
    #[error("Remote error: {0}")]
    Remote(String),

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Transfer not found in the history
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// The transfer was canceled by either side
    #[error("Transfer canceled")]
    Canceled,

    /// A path argument could not be used (non-UTF-8, missing file name)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Received data violated the wire format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A discovery sweep was requested while one is already running
    #[error("Scan already in progress")]
    ScanInProgress,
}

impl ProtocolError {
    /// Whether the error represents a transient connection fault.
    ///
    /// Transfers that failed with a connection error remain resumable;
    /// the caller may retry with `continue_transfer`.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_errors() {
        let err = ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_connection_error());
        assert!(ProtocolError::Timeout("read".into()).is_connection_error());
        assert!(!ProtocolError::BadMagic.is_connection_error());
    }

    #[test]
    fn display_includes_context() {
        let err = ProtocolError::VersionMismatch {
            expected: 1,
            got: 3,
        };
        assert_eq!(err.to_string(), "Protocol version mismatch: expected 1, got 3");
        assert_eq!(
            ProtocolError::UnexpectedControl(0xff).to_string(),
            "Unexpected control byte: 0xff"
        );
    }
}
