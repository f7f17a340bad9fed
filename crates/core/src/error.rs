//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A decimal string could not be parsed as a USD value.
    #[error("Invalid USD amount: {0}")]
    InvalidUsdAmount(String),

    /// A USD subtraction would have gone negative where that is not allowed.
    #[error("USD amount underflow: {minuend} - {subtrahend}")]
    UsdUnderflow {
        /// The value being subtracted from.
        minuend: String,
        /// The value being subtracted.
        subtrahend: String,
    },

    /// Invalid address format.
    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    /// Invalid hex encoding.
    #[error("Invalid hex encoding")]
    InvalidHex,

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
