//! # VaultBridge Core
//!
//! Core types, constants, and hashing utilities for the VaultBridge event pipeline.
//!
//! This crate provides the fundamental building blocks shared by the producer
//! (block indexer) and consumer (ownership + collateral ledger) services,
//! ensuring consistent data types and cryptographic operations that match the
//! Solidity contracts.
//!
//! ## Features
//!
//! - **Ethereum Types**: Uses Alloy primitives for Address, B256, U256 and keccak256
//! - **Domain Types**: TokenId, UsdValue (fixed-scale decimal)
//! - **Constants**: Well-known event topics and tuning defaults
//! - **Hashing**: Keccak256 utilities for ownership leaves and sorted-pair nodes

#![warn(missing_docs)]

pub mod constants;
pub mod env;
pub mod error;
pub mod hashing;
pub mod types;

// Re-export commonly used items
pub use constants::*;
pub use error::{CoreError, Result};
pub use hashing::{hash_sorted_pair, keccak256, ownership_leaf};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{Address, B256, U256};
