//! Error types for the message bus.

use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus is not connected.
    #[error("Bus not connected")]
    NotConnected,

    /// The channel was closed (bus dropped).
    #[error("Bus channel closed")]
    Closed,

    /// A publish failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A wire message could not be decoded.
    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Result type alias for BusError.
pub type Result<T> = std::result::Result<T, BusError>;
