//! Error taxonomy for the transfer engine.

use thiserror::Error;

/// Errors that can occur during discovery-to-delivery of a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Timeout, refusal or reset on the transfer connection. Fails the
    /// transfer; never retried at the transfer level.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed frame or unexpected message type. Dropped without tearing
    /// down the connection unless unrecoverable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Chunk or whole-file checksum mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Fingerprint mismatch or rejected verification. Hard failure; no
    /// partial trust.
    #[error("trust error: {0}")]
    Trust(String),

    /// Disk or permission failure.
    #[error("resource error: {0}")]
    Resource(#[from] std::io::Error),

    /// The transfer was cancelled by the operator.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// A connection error describing an operation that timed out.
    #[must_use]
    pub fn timeout(operation: &str) -> Self {
        Self::Connection(format!("{operation} timed out"))
    }
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
