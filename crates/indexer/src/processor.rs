//! Per-block transaction filtering.
//!
//! Given a block with its transactions and the active topic set, the
//! processor returns the transactions whose receipts contain at least one
//! matched log, in block order. Receipt fetches fan out up to an adaptive
//! concurrency limit; a new block cancels the previous block's in-flight
//! work through its cancellation token.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::B256;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vaultbridge_bus::{FilteredTransaction, MatchedLog};
use vaultbridge_core::{
    ADAPTIVE_CRITICAL_MS, ADAPTIVE_FAST_MS, ADAPTIVE_INTERVAL_SECS, ADAPTIVE_LOWER_STEP,
    ADAPTIVE_LOW_MATCH_RATE, ADAPTIVE_RAISE_STEP, ADAPTIVE_SLOW_MS, ADAPTIVE_WINDOW_BLOCKS,
};

use crate::cache::TxCache;
use crate::client::{BlockData, ChainClient, ReceiptData, TxData};
use crate::filter::TopicMatcher;

/// Tuning for the block processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Starting receipt-fetch concurrency.
    pub concurrent_limit: usize,
    /// Lower bound for the adaptive limit.
    pub min_concurrent_limit: usize,
    /// Upper bound for the adaptive limit.
    pub max_concurrent_limit: usize,
    /// How often the limit is re-evaluated.
    pub adjustment_interval: Duration,
    /// How many recent blocks feed the evaluation.
    pub window: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 10,
            min_concurrent_limit: 1,
            max_concurrent_limit: 50,
            adjustment_interval: Duration::from_secs(ADAPTIVE_INTERVAL_SECS),
            window: ADAPTIVE_WINDOW_BLOCKS,
        }
    }
}

/// One block's worth of throughput data.
#[derive(Debug, Clone, Copy)]
struct BlockSample {
    elapsed_ms: u128,
    total_txs: usize,
    matched_txs: usize,
}

/// Sliding-window controller for the receipt-fetch concurrency.
///
/// Raised by [`ADAPTIVE_RAISE_STEP`] when recent blocks are fast and the
/// match rate is low (most fetches are wasted, so go wider); lowered when
/// blocks are slow (the RPC is saturated, so back off).
pub struct AdaptiveLimiter {
    current: AtomicUsize,
    min: usize,
    max: usize,
    interval: Duration,
    window_size: usize,
    window: Mutex<VecDeque<BlockSample>>,
    last_adjusted: Mutex<Instant>,
}

impl AdaptiveLimiter {
    fn new(config: &ProcessorConfig) -> Self {
        let start = config
            .concurrent_limit
            .clamp(config.min_concurrent_limit, config.max_concurrent_limit);
        Self {
            current: AtomicUsize::new(start),
            min: config.min_concurrent_limit,
            max: config.max_concurrent_limit,
            interval: config.adjustment_interval,
            window_size: config.window.max(1),
            window: Mutex::new(VecDeque::new()),
            last_adjusted: Mutex::new(Instant::now()),
        }
    }

    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    fn record(&self, sample: BlockSample) {
        let mut window = self.window.lock();
        window.push_back(sample);
        while window.len() > self.window_size {
            window.pop_front();
        }
    }

    fn maybe_adjust(&self) {
        {
            let mut last = self.last_adjusted.lock();
            if last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }
        self.adjust_now();
    }

    /// Re-evaluate the limit against the current window immediately.
    fn adjust_now(&self) {
        let (mean_ms, match_rate, samples) = {
            let window = self.window.lock();
            if window.is_empty() {
                return;
            }
            let mean_ms =
                window.iter().map(|s| s.elapsed_ms).sum::<u128>() / window.len() as u128;
            let total: usize = window.iter().map(|s| s.total_txs).sum();
            let matched: usize = window.iter().map(|s| s.matched_txs).sum();
            let match_rate = if total == 0 {
                0.0
            } else {
                matched as f64 / total as f64
            };
            (mean_ms, match_rate, window.len())
        };

        let current = self.limit();
        let next = if mean_ms > ADAPTIVE_CRITICAL_MS {
            current.saturating_sub(ADAPTIVE_LOWER_STEP).max(self.min)
        } else if mean_ms > ADAPTIVE_SLOW_MS {
            current.saturating_sub(1).max(self.min)
        } else if mean_ms < ADAPTIVE_FAST_MS && match_rate < ADAPTIVE_LOW_MATCH_RATE {
            (current + ADAPTIVE_RAISE_STEP).min(self.max)
        } else {
            current
        };

        if next != current {
            debug!(
                current,
                next, mean_ms, match_rate, samples, "Adjusting concurrent receipt limit"
            );
            self.current.store(next, Ordering::Relaxed);
        }
    }
}

/// Outcome of resolving one transaction's receipt.
enum Resolved {
    /// Transaction + receipt (or confirmed none) available.
    Ready(TxData, Option<ReceiptData>),
    /// The fetch was cancelled mid-flight; nothing was cached.
    Cancelled,
    /// The fetch failed; the tx is omitted, the block continues.
    Failed(B256),
}

/// Filters a block's transactions against the active topic set.
pub struct BlockProcessor {
    client: Arc<dyn ChainClient>,
    cache: Arc<TxCache>,
    chain_name: String,
    limiter: AdaptiveLimiter,
}

impl BlockProcessor {
    /// Create a processor for one chain.
    pub fn new(
        client: Arc<dyn ChainClient>,
        cache: Arc<TxCache>,
        chain_name: impl Into<String>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            client,
            cache,
            chain_name: chain_name.into(),
            limiter: AdaptiveLimiter::new(&config),
        }
    }

    /// The current receipt-fetch concurrency limit.
    pub fn concurrent_limit(&self) -> usize {
        self.limiter.limit()
    }

    /// Process a block: returns matched transactions in block order.
    ///
    /// A single transaction failure is logged and omitted; the block still
    /// completes. Cancellation aborts cleanly without mutating the cache.
    pub async fn process_block(
        &self,
        block: &BlockData,
        matcher: &TopicMatcher,
        cancel: &CancellationToken,
    ) -> Result<Vec<FilteredTransaction>> {
        if matcher.is_empty() || block.transactions.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let total_txs = block.transactions.len();

        let candidates = self.pre_filter(&block.transactions, matcher);
        debug!(
            chain = %self.chain_name,
            block = block.header.number,
            total = total_txs,
            candidates = candidates.len(),
            "Pre-filter complete"
        );

        let limit = self.limiter.limit();
        let resolved: Vec<Resolved> = stream::iter(candidates)
            .map(|tx: &TxData| -> BoxFuture<'_, Resolved> { Box::pin(self.resolve(tx, cancel)) })
            .buffered(limit.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            anyhow::bail!(
                "Block {} processing cancelled",
                block.header.number
            );
        }

        let mut matched = Vec::new();
        for entry in resolved {
            match entry {
                Resolved::Ready(tx, receipt) => {
                    if let Some(filtered) = self.match_receipt(block, tx, receipt, matcher) {
                        matched.push(filtered);
                    }
                }
                Resolved::Cancelled => {
                    anyhow::bail!("Block {} processing cancelled", block.header.number);
                }
                Resolved::Failed(hash) => {
                    warn!(
                        chain = %self.chain_name,
                        block = block.header.number,
                        tx = %hash,
                        "Transaction fetch failed, omitting from block output"
                    );
                }
            }
        }

        self.limiter.record(BlockSample {
            elapsed_ms: started.elapsed().as_millis(),
            total_txs,
            matched_txs: matched.len(),
        });
        self.limiter.maybe_adjust();

        Ok(matched)
    }

    /// Cheap candidate selection before any receipt is fetched.
    ///
    /// With contract-constrained filters, a tx survives if it targets one of
    /// the constrained contracts or carries calldata (the emitting contract
    /// may differ from `to`). Without constraints, a calldata heuristic is
    /// applied only when a small sample suggests most txs are plain
    /// transfers.
    fn pre_filter<'a>(&self, txs: &'a [TxData], matcher: &TopicMatcher) -> Vec<&'a TxData> {
        if matcher.has_contract_constraints() {
            let contracts: HashSet<_> = matcher.constrained_contracts().into_iter().collect();
            return txs
                .iter()
                .filter(|tx| {
                    tx.to.map(|to| contracts.contains(&to)).unwrap_or(false) || tx.has_calldata()
                })
                .collect();
        }

        let sample: Vec<_> = txs.iter().take(5).collect();
        let calls = sample.iter().filter(|tx| tx.has_calldata()).count();
        let ratio = calls as f64 / sample.len() as f64;

        if ratio < 0.2 {
            txs.iter().filter(|tx| tx.has_calldata()).collect()
        } else {
            txs.iter().collect()
        }
    }

    /// Resolve a transaction's receipt, from cache or RPC, cancellably.
    async fn resolve(&self, tx: &TxData, cancel: &CancellationToken) -> Resolved {
        if let Some(entry) = self.cache.get(&tx.hash) {
            return Resolved::Ready(entry.transaction.clone(), entry.receipt.clone());
        }

        let fetch = self.client.get_receipt(tx.hash);
        let receipt = tokio::select! {
            _ = cancel.cancelled() => return Resolved::Cancelled,
            result = fetch => match result {
                Ok(receipt) => receipt,
                Err(_) => return Resolved::Failed(tx.hash),
            },
        };

        // Both halves resolved: safe to cache. A receipt-less tx is cached
        // as an explicit None so it is never re-fetched.
        self.cache.insert(tx.clone(), receipt.clone());

        Resolved::Ready(tx.clone(), receipt)
    }

    /// Test a receipt's logs against the matcher and build the output.
    fn match_receipt(
        &self,
        block: &BlockData,
        tx: TxData,
        receipt: Option<ReceiptData>,
        matcher: &TopicMatcher,
    ) -> Option<FilteredTransaction> {
        let receipt = receipt?;

        let mut matched_topics = Vec::new();
        let mut logs = Vec::new();

        for log in &receipt.logs {
            let Some(topic0) = log.topics.first() else {
                continue;
            };
            if !matcher.may_match(topic0) {
                continue;
            }
            if let Some(matched) = matcher.match_log(log) {
                matched_topics.push(matched);
                logs.push(MatchedLog {
                    address: log.address,
                    topics: log.topics.clone(),
                    data: log.data.clone(),
                    log_index: log.log_index,
                });
            }
        }

        if logs.is_empty() {
            return None;
        }
        logs.sort_by_key(|l| l.log_index);

        Some(FilteredTransaction {
            chain_id: self.client.chain_id(),
            chain_name: self.chain_name.clone(),
            block_hash: block.header.hash,
            block_number: block.header.number,
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            data: Some(tx.input),
            status: Some(receipt.status),
            gas_used: Some(receipt.gas_used),
            gas_price: receipt.effective_gas_price.or(tx.gas_price),
            matched_topics,
            logs,
            timestamp: block.header.timestamp,
        })
    }
}
