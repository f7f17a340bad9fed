//! Ownership tree construction and proof generation.

use alloy_primitives::B256;
use vaultbridge_core::hashing::hash_sorted_pair;

use crate::error::{MerkleError, Result};
use crate::proof::MerkleProof;

/// A deterministic sorted-pair keccak256 tree over ownership leaves.
///
/// Leaves are sorted and deduplicated before the tree is built, so the root
/// depends only on the leaf *set*: the iteration order of whatever map the
/// snapshot came from cannot change the commitment.
///
/// # Examples
///
/// ```
/// use vaultbridge_merkle::OwnershipTree;
/// use alloy_primitives::B256;
///
/// let leaves = vec![B256::from([0x01; 32]), B256::from([0x02; 32])];
/// let tree = OwnershipTree::from_leaves(leaves).unwrap();
/// let root = tree.root();
///
/// let proof = tree.prove(&B256::from([0x01; 32])).unwrap();
/// assert!(proof.verify(&root));
/// ```
#[derive(Debug, Clone)]
pub struct OwnershipTree {
    /// All levels of the tree. `levels[0]` holds the sorted leaves,
    /// `levels.last()` is the single-element root level.
    levels: Vec<Vec<B256>>,
}

impl OwnershipTree {
    /// Build a tree from a set of leaves.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::EmptyTree`] when `leaves` is empty. An empty
    /// snapshot never produces a root, so a previously published root is
    /// never clobbered by a degenerate rebuild.
    pub fn from_leaves(mut leaves: Vec<B256>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        leaves.sort_unstable();
        leaves.dedup();

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().cloned().unwrap_or_default();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));

            for pair in current.chunks(2) {
                match pair {
                    [a, b] => next.push(hash_sorted_pair(a, b)),
                    // Odd node carries up unhashed
                    [a] => next.push(*a),
                    _ => unreachable!("chunks(2) yields 1 or 2 elements"),
                }
            }

            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// The root commitment of this tree.
    pub fn root(&self) -> B256 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(B256::ZERO)
    }

    /// Number of leaves in the tree (after deduplication).
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Whether the given leaf is part of this tree.
    pub fn contains(&self, leaf: &B256) -> bool {
        self.levels
            .first()
            .map(|leaves| leaves.binary_search(leaf).is_ok())
            .unwrap_or(false)
    }

    /// Generate a membership proof for a leaf.
    ///
    /// The proof lists sibling hashes from the leaf level up to (but not
    /// including) the root. Levels where the node had no sibling (odd
    /// carry-up) contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::UnknownLeaf`] if the leaf is not in the tree.
    pub fn prove(&self, leaf: &B256) -> Result<MerkleProof> {
        let leaves = self.levels.first().ok_or(MerkleError::UnknownLeaf)?;
        let mut index = leaves
            .binary_search(leaf)
            .map_err(|_| MerkleError::UnknownLeaf)?;

        let mut siblings = Vec::new();
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = index ^ 1;
            if let Some(sibling) = level.get(sibling_index) {
                siblings.push(*sibling);
            }
            index /= 2;
        }

        Ok(MerkleProof::new(*leaf, siblings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;
    use vaultbridge_core::hashing::hash_sorted_pair;

    fn leaf(n: u8) -> B256 {
        B256::from([n; 32])
    }

    #[test]
    fn test_empty_tree_rejected() {
        assert_eq!(
            OwnershipTree::from_leaves(vec![]).unwrap_err(),
            MerkleError::EmptyTree
        );
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let l = b256!("1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef");
        let tree = OwnershipTree::from_leaves(vec![l]).unwrap();
        assert_eq!(tree.root(), l);
        assert_eq!(tree.leaf_count(), 1);

        // Single-leaf proof is empty and still verifies
        let proof = tree.prove(&l).unwrap();
        assert!(proof.siblings().is_empty());
        assert!(proof.verify(&tree.root()));
    }

    #[test]
    fn test_two_leaf_root() {
        let a = leaf(0x01);
        let b = leaf(0x02);
        let tree = OwnershipTree::from_leaves(vec![a, b]).unwrap();
        assert_eq!(tree.root(), hash_sorted_pair(&a, &b));
    }

    #[test]
    fn test_root_independent_of_insertion_order() {
        let leaves: Vec<B256> = (1u8..=7).map(leaf).collect();
        let mut reversed = leaves.clone();
        reversed.reverse();

        let t1 = OwnershipTree::from_leaves(leaves).unwrap();
        let t2 = OwnershipTree::from_leaves(reversed).unwrap();
        assert_eq!(t1.root(), t2.root());
    }

    #[test]
    fn test_duplicate_leaves_collapse() {
        let t1 = OwnershipTree::from_leaves(vec![leaf(1), leaf(2), leaf(2)]).unwrap();
        let t2 = OwnershipTree::from_leaves(vec![leaf(1), leaf(2)]).unwrap();
        assert_eq!(t1.root(), t2.root());
        assert_eq!(t1.leaf_count(), 2);
    }

    #[test]
    fn test_odd_count_carries_last_leaf() {
        // Three sorted leaves: root = H(H(a,b), c)
        let a = leaf(0x01);
        let b = leaf(0x02);
        let c = leaf(0x03);
        let tree = OwnershipTree::from_leaves(vec![a, b, c]).unwrap();

        let ab = hash_sorted_pair(&a, &b);
        assert_eq!(tree.root(), hash_sorted_pair(&ab, &c));
    }

    #[test]
    fn test_all_leaves_provable() {
        let leaves: Vec<B256> = (1u8..=13).map(leaf).collect();
        let tree = OwnershipTree::from_leaves(leaves.clone()).unwrap();
        let root = tree.root();

        for l in &leaves {
            let proof = tree.prove(l).unwrap();
            assert!(proof.verify(&root), "proof for {l} must verify");
        }
    }

    #[test]
    fn test_unknown_leaf_rejected() {
        let tree = OwnershipTree::from_leaves(vec![leaf(1), leaf(2)]).unwrap();
        assert_eq!(tree.prove(&leaf(9)).unwrap_err(), MerkleError::UnknownLeaf);
        assert!(!tree.contains(&leaf(9)));
        assert!(tree.contains(&leaf(1)));
    }

    #[test]
    fn test_proof_fails_against_other_root() {
        let t1 = OwnershipTree::from_leaves(vec![leaf(1), leaf(2)]).unwrap();
        let t2 = OwnershipTree::from_leaves(vec![leaf(1), leaf(3)]).unwrap();

        let proof = t1.prove(&leaf(1)).unwrap();
        assert!(proof.verify(&t1.root()));
        assert!(!proof.verify(&t2.root()));
    }

    #[test]
    fn test_changed_leaf_changes_root() {
        let t1 = OwnershipTree::from_leaves(vec![leaf(1), leaf(2), leaf(3)]).unwrap();
        let t2 = OwnershipTree::from_leaves(vec![leaf(1), leaf(2), leaf(4)]).unwrap();
        assert_ne!(t1.root(), t2.root());
    }
}
