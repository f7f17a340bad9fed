//! Ownership Merkle engine.
//!
//! Maintains the canonical `tokenId -> owner` map derived from Transfer
//! observations, rebuilds the sorted-pair tree when the snapshot changes,
//! stamps the covered transfers, and pushes the new root to every configured
//! relayer chain.
//!
//! The ownership map is incremental: it is folded once from storage at
//! startup and updated per transfer, so a rebuild costs O(live tokens)
//! instead of a full store re-scan.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vaultbridge_core::hashing::ownership_leaf;
use vaultbridge_core::TokenId;
use vaultbridge_merkle::{MerkleError, OwnershipTree};

use crate::events::TransferEvent;
use crate::relayer::RelayerClient;
use crate::storage::{NftTransfer, Storage};

/// Ownership entry with the coordinates that won it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnerEntry {
    owner: Address,
    block_number: u64,
    log_index: u64,
}

/// A proof query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofResult {
    /// Sibling hashes, leaf to root.
    pub proof: Vec<B256>,
    /// The root the proof verifies against.
    pub root: B256,
    /// Always true for returned proofs; the engine self-verifies before
    /// handing a proof out.
    pub verified: bool,
}

/// Derives ownership, builds trees, answers proof queries, submits roots.
pub struct MerkleEngine {
    storage: Storage,
    relayer: Arc<dyn RelayerClient>,
    target_chains: Vec<u64>,
    ownership: RwLock<HashMap<TokenId, OwnerEntry>>,
    current_root: RwLock<Option<B256>>,
}

impl MerkleEngine {
    /// Create an engine submitting roots to the given chains.
    pub fn new(storage: Storage, relayer: Arc<dyn RelayerClient>, target_chains: Vec<u64>) -> Self {
        Self {
            storage,
            relayer,
            target_chains,
            ownership: RwLock::new(HashMap::new()),
            current_root: RwLock::new(None),
        }
    }

    /// Fold the stored transfer history into the in-memory ownership map.
    ///
    /// Called once at startup; afterwards the map is maintained per transfer.
    pub async fn initialize(&self) -> Result<()> {
        let transfers = self.storage.all_transfers().await?;
        let count = transfers.len();

        let mut map = HashMap::new();
        for transfer in &transfers {
            Self::apply_transfer_to(&mut map, transfer)?;
        }

        let mut ownership = self.ownership.write().await;
        *ownership = map;
        drop(ownership);

        if let Some(committed) = self.storage.latest_committed_transfer().await? {
            *self.current_root.write().await = committed.merkle_root;
        }

        let live_tokens = self.ownership.read().await.len();
        info!(transfers = count, live_tokens, "Ownership map initialized");
        Ok(())
    }

    /// The last root built (or recovered from storage).
    pub async fn current_root(&self) -> Option<B256> {
        *self.current_root.read().await
    }

    /// Number of live tokens in the snapshot.
    pub async fn live_tokens(&self) -> usize {
        self.ownership.read().await.len()
    }

    /// React to a new Transfer observation.
    ///
    /// A replayed log (same tx hash) is dropped before it can touch the map.
    /// Otherwise the snapshot updates, the tree rebuilds, covered transfers
    /// are stamped, and the root fans out to every relayer chain; a single
    /// chain's failure is logged without blocking the others.
    pub async fn on_transfer(&self, event: &TransferEvent) -> Result<()> {
        let inserted = self.storage.insert_transfer(event).await?;
        if !inserted {
            debug!(tx = %event.tx_hash, "Duplicate transfer dropped");
            return Ok(());
        }

        {
            let mut ownership = self.ownership.write().await;
            let entry = OwnerEntry {
                owner: event.to,
                block_number: event.block_number,
                log_index: event.log_index,
            };
            Self::apply_entry(&mut ownership, event.token_id, entry);
        }

        self.rebuild_and_submit().await
    }

    /// Rebuild the tree from the current snapshot and push the root out.
    pub async fn rebuild_and_submit(&self) -> Result<()> {
        let leaves = {
            let ownership = self.ownership.read().await;
            Self::leaves_of(&ownership)
        };

        let tree = match OwnershipTree::from_leaves(leaves) {
            Ok(tree) => tree,
            // No live tokens: keep whatever root was published before
            Err(MerkleError::EmptyTree) => {
                debug!("No live tokens, keeping previous root");
                return Ok(());
            }
            Err(e) => return Err(e).context("Ownership tree construction failed"),
        };

        let root = tree.root();
        let stamped = self.storage.mark_included(&root).await?;
        *self.current_root.write().await = Some(root);

        info!(
            root = %root,
            leaves = tree.leaf_count(),
            stamped,
            "Ownership root rebuilt"
        );

        for chain_id in &self.target_chains {
            if let Err(e) = self.relayer.submit_root(*chain_id, root).await {
                // Retried opportunistically on the next rebuild
                warn!(chain_id, error = %e, "Root submission failed");
            }
        }

        Ok(())
    }

    /// Generate a proof that `owner` holds `token_id` under the latest
    /// committed root.
    ///
    /// Reconstructs the snapshot bounded by the committed transfer history so
    /// the proof matches the root that was actually published. Returns `None`
    /// when no root exists yet or the ownership claim does not hold.
    pub async fn get_proof(&self, owner: &Address, token_id: &TokenId) -> Result<Option<ProofResult>> {
        let Some(committed) = self.storage.latest_committed_transfer().await? else {
            return Ok(None);
        };

        let transfers = self
            .storage
            .transfers_up_to(committed.block_number)
            .await?;

        let mut map = HashMap::new();
        for transfer in &transfers {
            Self::apply_transfer_to(&mut map, transfer)?;
        }

        match map.get(token_id) {
            Some(entry) if entry.owner == *owner => {}
            _ => return Ok(None),
        }

        let tree = match OwnershipTree::from_leaves(Self::leaves_of(&map)) {
            Ok(tree) => tree,
            Err(MerkleError::EmptyTree) => return Ok(None),
            Err(e) => return Err(e).context("Proof tree construction failed"),
        };

        let leaf = ownership_leaf(owner, token_id);
        let proof = tree
            .prove(&leaf)
            .context("Snapshot owner missing from reconstructed tree")?;
        let root = tree.root();

        if !proof.verify(&root) {
            anyhow::bail!("Generated proof failed self-verification for token {token_id}");
        }

        Ok(Some(ProofResult {
            proof: proof.siblings().to_vec(),
            root,
            verified: true,
        }))
    }

    /// Whether `owner` provably holds `token_id`.
    ///
    /// When no root has ever been committed, Merkle verification is
    /// unavailable; only then, and only with `allow_deposit_fallback`, a
    /// prior deposit against the position is accepted as evidence.
    pub async fn verify_ownership(
        &self,
        owner: &Address,
        token_id: &TokenId,
        allow_deposit_fallback: bool,
    ) -> Result<bool> {
        if self.storage.latest_committed_transfer().await?.is_some() {
            return Ok(self.get_proof(owner, token_id).await?.is_some());
        }

        if allow_deposit_fallback {
            let key = crate::storage::addr_key(owner);
            return self.storage.has_deposit(&key, token_id).await;
        }

        Ok(false)
    }

    fn leaves_of(map: &HashMap<TokenId, OwnerEntry>) -> Vec<B256> {
        map.iter()
            .filter(|(_, entry)| !entry.owner.is_zero())
            .map(|(token_id, entry)| ownership_leaf(&entry.owner, token_id))
            .collect()
    }

    fn apply_transfer_to(
        map: &mut HashMap<TokenId, OwnerEntry>,
        transfer: &NftTransfer,
    ) -> Result<()> {
        let owner = Address::from_str(&transfer.to)
            .with_context(|| format!("Invalid owner address in store: {}", transfer.to))?;
        let entry = OwnerEntry {
            owner,
            block_number: transfer.block_number,
            log_index: transfer.log_index,
        };
        Self::apply_entry(map, transfer.token_id, entry);
        Ok(())
    }

    /// Latest-wins by (block number, log index); ties fall to the later
    /// arrival, matching insertion order.
    fn apply_entry(map: &mut HashMap<TokenId, OwnerEntry>, token_id: TokenId, entry: OwnerEntry) {
        match map.get(&token_id) {
            Some(existing)
                if (existing.block_number, existing.log_index)
                    > (entry.block_number, entry.log_index) => {}
            _ => {
                map.insert(token_id, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::mock::{MockRelayerClient, RelayerCall};
    use crate::storage::test_util;

    fn transfer(seed: u8, block: u64, token: u64, from: Address, to: Address) -> TransferEvent {
        TransferEvent {
            chain_id: 1,
            tx_hash: B256::from([seed; 32]),
            block_number: block,
            block_hash: B256::from([block as u8; 32]),
            token_address: Address::from([0x10; 20]),
            token_id: TokenId::from(token),
            from,
            to,
            log_index: seed as u64,
            timestamp: 1_700_000_000 + block,
        }
    }

    fn wallet(seed: u8) -> Address {
        Address::from([seed; 20])
    }

    async fn engine(chains: Vec<u64>) -> (MerkleEngine, Arc<MockRelayerClient>, tempfile::NamedTempFile) {
        let (storage, db) = test_util::storage().await;
        let relayer = Arc::new(MockRelayerClient::default());
        let engine = MerkleEngine::new(storage, relayer.clone(), chains);
        engine.initialize().await.unwrap();
        (engine, relayer, db)
    }

    #[tokio::test]
    async fn test_mint_then_proof_happy_path() {
        let (engine, relayer, _db) = engine(vec![1]).await;
        let alice = wallet(0xaa);
        let bob = wallet(0xbb);

        engine
            .on_transfer(&transfer(1, 100, 1, Address::ZERO, alice))
            .await
            .unwrap();

        let root = engine.current_root().await.unwrap();

        // The root just built was submitted
        assert_eq!(
            relayer.calls(),
            vec![RelayerCall::SubmitRoot { chain_id: 1, root }]
        );

        // Owner proves; non-owner cannot
        let proof = engine
            .get_proof(&alice, &TokenId::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert!(proof.verified);
        assert_eq!(proof.root, root);

        assert!(engine
            .get_proof(&bob, &TokenId::from(1u64))
            .await
            .unwrap()
            .is_none());

        assert!(engine
            .verify_ownership(&alice, &TokenId::from(1u64), false)
            .await
            .unwrap());
        assert!(!engine
            .verify_ownership(&bob, &TokenId::from(1u64), false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_latest_transfer_wins_ownership() {
        let (engine, _relayer, _db) = engine(vec![]).await;
        let alice = wallet(0xaa);
        let bob = wallet(0xbb);

        engine
            .on_transfer(&transfer(1, 100, 1, Address::ZERO, alice))
            .await
            .unwrap();
        engine
            .on_transfer(&transfer(2, 101, 1, alice, bob))
            .await
            .unwrap();

        assert!(engine
            .get_proof(&bob, &TokenId::from(1u64))
            .await
            .unwrap()
            .is_some());
        assert!(engine
            .get_proof(&alice, &TokenId::from(1u64))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_transfer_is_noop() {
        let (engine, relayer, _db) = engine(vec![1]).await;
        let alice = wallet(0xaa);

        let t = transfer(1, 100, 1, Address::ZERO, alice);
        engine.on_transfer(&t).await.unwrap();
        let calls_before = relayer.calls().len();

        engine.on_transfer(&t).await.unwrap();
        assert_eq!(relayer.calls().len(), calls_before);
        assert_eq!(engine.live_tokens().await, 1);
    }

    #[tokio::test]
    async fn test_multi_chain_submission_survives_one_failure() {
        let (engine, relayer, _db) = engine(vec![1, 8453]).await;
        relayer.failing_chains.lock().push(1);

        engine
            .on_transfer(&transfer(1, 100, 1, Address::ZERO, wallet(0xaa)))
            .await
            .unwrap();

        // Chain 1 failed but chain 8453 still received the root
        let calls = relayer.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            calls[0],
            RelayerCall::SubmitRoot { chain_id: 8453, .. }
        ));
        // The root is still recorded locally for opportunistic retry
        assert!(engine.current_root().await.is_some());
    }

    #[tokio::test]
    async fn test_burn_removes_leaf() {
        let (engine, _relayer, _db) = engine(vec![]).await;
        let alice = wallet(0xaa);

        engine
            .on_transfer(&transfer(1, 100, 1, Address::ZERO, alice))
            .await
            .unwrap();
        engine
            .on_transfer(&transfer(2, 101, 2, Address::ZERO, alice))
            .await
            .unwrap();
        let root_two_tokens = engine.current_root().await.unwrap();

        // Burn token 2
        engine
            .on_transfer(&transfer(3, 102, 2, alice, Address::ZERO))
            .await
            .unwrap();
        let root_after_burn = engine.current_root().await.unwrap();
        assert_ne!(root_two_tokens, root_after_burn);

        // The burned token no longer proves under the new root
        assert!(engine
            .get_proof(&alice, &TokenId::from(2u64))
            .await
            .unwrap()
            .is_none());
        assert!(engine
            .get_proof(&alice, &TokenId::from(1u64))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_no_root_without_transfers() {
        let (engine, relayer, _db) = engine(vec![1]).await;
        assert!(engine.current_root().await.is_none());

        engine.rebuild_and_submit().await.unwrap();
        assert!(engine.current_root().await.is_none());
        assert!(relayer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_recovers_state() {
        let (storage, _db) = test_util::storage().await;
        let relayer = Arc::new(MockRelayerClient::default());
        let alice = wallet(0xaa);

        // First engine processes a transfer, then goes away
        {
            let engine = MerkleEngine::new(storage.clone(), relayer.clone(), vec![]);
            engine.initialize().await.unwrap();
            engine
                .on_transfer(&transfer(1, 100, 1, Address::ZERO, alice))
                .await
                .unwrap();
        }

        // A fresh engine recovers the map and the committed root
        let engine = MerkleEngine::new(storage, relayer, vec![]);
        engine.initialize().await.unwrap();
        assert_eq!(engine.live_tokens().await, 1);
        assert!(engine.current_root().await.is_some());
        assert!(engine
            .get_proof(&alice, &TokenId::from(1u64))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_deposit_fallback_only_without_root() {
        let (engine, _relayer, _db) = engine(vec![]).await;
        let alice = wallet(0xaa);
        let token = TokenId::from(1u64);

        // No root, no deposit: nothing verifies
        assert!(!engine.verify_ownership(&alice, &token, true).await.unwrap());

        // Record a deposit; the fallback (and only the fallback) accepts it
        let event = crate::events::VaultEvent {
            kind: crate::events::VaultEventKind::Deposit,
            chain_id: 1,
            tx_hash: B256::from([0x55; 32]),
            log_index: 0,
            sender: alice,
            asset: wallet(0x01),
            vault: wallet(0x02),
            amount: alloy_primitives::U256::from(100u64),
            token_id: token,
            request_id: None,
            timestamp: 1_700_000_000,
        };
        engine
            .storage
            .insert_deposit(&event, &vaultbridge_core::UsdValue::from_dollars(100))
            .await
            .unwrap();

        assert!(engine.verify_ownership(&alice, &token, true).await.unwrap());
        assert!(!engine.verify_ownership(&alice, &token, false).await.unwrap());

        // Once a root exists, the fallback is no longer consulted
        engine
            .on_transfer(&transfer(1, 100, 2, Address::ZERO, wallet(0xbb)))
            .await
            .unwrap();
        assert!(!engine.verify_ownership(&alice, &token, true).await.unwrap());
    }
}
