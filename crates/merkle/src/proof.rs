//! Proof verification for the ownership tree.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use vaultbridge_core::hashing::hash_sorted_pair;

/// A membership proof for an ownership leaf.
///
/// Because internal nodes hash their children in sorted order, the proof is
/// just the sibling hashes from leaf to root, with no direction bits. This is the
/// same shape the on-chain verifier consumes (`bytes32[] proof`).
///
/// # Examples
///
/// ```
/// use vaultbridge_merkle::OwnershipTree;
/// use alloy_primitives::B256;
///
/// let leaf = B256::from([0x01; 32]);
/// let tree = OwnershipTree::from_leaves(vec![leaf, B256::from([0x02; 32])]).unwrap();
///
/// let proof = tree.prove(&leaf).unwrap();
/// assert!(proof.verify(&tree.root()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// The leaf being proven.
    pub leaf: B256,

    /// Sibling hashes along the path from leaf to root, bottom-up. Levels
    /// where the node was carried up without a sibling are simply absent.
    pub siblings: Vec<B256>,
}

impl MerkleProof {
    /// Create a new proof.
    pub fn new(leaf: B256, siblings: Vec<B256>) -> Self {
        Self { leaf, siblings }
    }

    /// Verify this proof against a root.
    ///
    /// Returns `true` iff folding the siblings over the leaf with sorted-pair
    /// hashing reproduces `root`.
    pub fn verify(&self, root: &B256) -> bool {
        self.compute_root() == *root
    }

    /// Recompute the root committed to by this proof.
    pub fn compute_root(&self) -> B256 {
        self.siblings
            .iter()
            .fold(self.leaf, |acc, sibling| hash_sorted_pair(&acc, sibling))
    }

    /// The leaf this proof is for.
    pub fn leaf(&self) -> B256 {
        self.leaf
    }

    /// The sibling hashes.
    pub fn siblings(&self) -> &[B256] {
        &self.siblings
    }

    /// Whether the proof carries any siblings (a single-leaf tree does not).
    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }
}
