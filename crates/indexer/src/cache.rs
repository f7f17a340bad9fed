//! Bounded transaction/receipt cache.
//!
//! The block processor consults this cache before hitting the RPC. Entries
//! are only inserted once both the transaction and its receipt (or an
//! explicit "no receipt") have been resolved, so a cancelled fetch can never
//! leave partial data behind.

use std::sync::Arc;

use alloy_primitives::B256;
use lru::LruCache;
use parking_lot::RwLock;

use vaultbridge_core::{TX_CACHE_RETAIN_DEN, TX_CACHE_RETAIN_NUM};

use crate::client::{ReceiptData, TxData};

/// A fully-resolved cache entry.
///
/// `receipt == None` is a legitimate value meaning "previously seen,
/// non-contract transaction"; it prevents re-fetching receipts for plain
/// transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCacheEntry {
    /// The transaction metadata.
    pub transaction: TxData,
    /// The receipt, or None for a confirmed receipt-less transaction.
    pub receipt: Option<ReceiptData>,
}

/// Bounded mapping `tx hash -> {transaction, receipt?}`.
///
/// When the size reaches the cap, the least-recently-inserted quarter is
/// evicted, retaining the most recently inserted 75%. Reads use `peek` so
/// they do not disturb insertion order.
pub struct TxCache {
    entries: RwLock<LruCache<B256, Arc<TxCacheEntry>>>,
    capacity: usize,
}

impl TxCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            capacity: capacity.max(4),
        }
    }

    /// Look up an entry without promoting it.
    pub fn get(&self, hash: &B256) -> Option<Arc<TxCacheEntry>> {
        self.entries.read().peek(hash).cloned()
    }

    /// Insert a fully-resolved entry, pruning if the cap is exceeded.
    pub fn insert(&self, transaction: TxData, receipt: Option<ReceiptData>) {
        let hash = transaction.hash;
        let entry = Arc::new(TxCacheEntry {
            transaction,
            receipt,
        });

        let mut entries = self.entries.write();
        entries.put(hash, entry);

        if entries.len() >= self.capacity {
            let target = self.capacity * TX_CACHE_RETAIN_NUM / TX_CACHE_RETAIN_DEN;
            while entries.len() > target {
                entries.pop_lru();
            }
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
