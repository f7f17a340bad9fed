//! Ownership Merkle tree for VaultBridge.
//!
//! This crate provides:
//! - Deterministic tree construction from ownership leaves
//! - Compact membership proofs (sibling lists, no direction bits)
//! - Proof verification against a published root
//!
//! The tree is a standard binary keccak256 tree with **sorted pairs**: each
//! internal node is `keccak256(min(a,b) || max(a,b))`, so a proof needs only
//! the sibling hashes; position is irrelevant at every level. Odd nodes are
//! carried up to the next level unhashed.

#![warn(missing_docs)]

pub mod error;
pub mod proof;
pub mod tree;

pub use error::{MerkleError, Result};
pub use proof::MerkleProof;
pub use tree::OwnershipTree;
