//! Error types for the ownership tree.

use thiserror::Error;

/// Ownership tree error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// A tree cannot be built from zero leaves.
    #[error("Cannot build a tree with no leaves")]
    EmptyTree,

    /// The requested leaf is not part of this tree.
    #[error("Leaf not present in tree")]
    UnknownLeaf,
}

/// Result type alias for MerkleError.
pub type Result<T> = std::result::Result<T, MerkleError>;
