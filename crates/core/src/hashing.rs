//! Hashing utilities for VaultBridge.
//!
//! Provides keccak256 hashing, the ownership leaf encoding, and the
//! sorted-pair combination used by the ownership tree. These must match the
//! Solidity verifier exactly.

use alloy_primitives::{keccak256 as alloy_keccak256, Address, B256};

use crate::types::TokenId;

/// Compute keccak256 hash of input data.
///
/// This is a re-export of Alloy's keccak256 for convenience.
pub fn keccak256(data: &[u8]) -> B256 {
    alloy_keccak256(data)
}

/// Compute the ownership leaf for an `(owner, tokenId)` pair.
///
/// The leaf is `keccak256(abi.encodePacked(address owner, uint256 tokenId))`:
/// - `owner`: 20 bytes
/// - `tokenId`: 32 bytes (uint256, big-endian)
/// - **Total preimage**: 52 bytes
///
/// This must match the Solidity computation exactly. Address case does not
/// matter here: the packed encoding is raw bytes, so any checksummed or
/// lowercased rendering of the same address produces the same leaf.
pub fn ownership_leaf(owner: &Address, token_id: &TokenId) -> B256 {
    let mut data = Vec::with_capacity(52);
    data.extend_from_slice(owner.as_slice());
    data.extend_from_slice(&token_id.to_be_bytes());

    keccak256(&data)
}

/// Combine two 32-byte nodes, sorting the pair ascending before hashing.
///
/// `keccak256(min(a,b) || max(a,b))`. The sorting makes the tree
/// order-insensitive at each level, which lets proofs omit direction bits.
pub fn hash_sorted_pair(a: &B256, b: &B256) -> B256 {
    let mut data = Vec::with_capacity(64);
    if a <= b {
        data.extend_from_slice(a.as_slice());
        data.extend_from_slice(b.as_slice());
    } else {
        data.extend_from_slice(b.as_slice());
        data.extend_from_slice(a.as_slice());
    }

    keccak256(&data)
}
