//! Constants shared across VaultBridge components.

use alloy_primitives::{b256, B256};

/// Topic0 of the ERC-721 `Transfer(address,address,uint256)` event.
pub const ERC721_TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Number of fractional digits carried by every USD value.
pub const USD_SCALE: i64 = 8;

/// Maximum depth of the bounded reorg re-scan. Divergence deeper than this
/// pauses the indexer for external intervention.
pub const REORG_DEPTH: u64 = 10;

/// Maximum retries for a failed block before it is parked.
pub const MAX_RETRIES: u32 = 5;

/// Default delay between retries of a transient failure, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Default number of confirmations before a block is considered final.
pub const DEFAULT_BLOCK_CONFIRMATIONS: u64 = 2;

/// Default size of the transaction/receipt cache.
pub const DEFAULT_TX_CACHE_SIZE: usize = 4096;

/// Fraction of the cache retained when the cap is exceeded (most recent 75%).
pub const TX_CACHE_RETAIN_NUM: usize = 3;
/// Denominator of [`TX_CACHE_RETAIN_NUM`].
pub const TX_CACHE_RETAIN_DEN: usize = 4;

/// Bloom filter width in bits for the topic pre-filter.
pub const TOPIC_BLOOM_BITS: usize = 2048;

/// Number of probe positions per entry in the topic bloom.
pub const TOPIC_BLOOM_HASHES: usize = 3;

// Adaptive receipt-fetch concurrency tuning (evaluated over a sliding window of
// recent blocks, re-evaluated on a fixed interval).

/// Number of recent blocks sampled when adjusting the concurrent limit.
pub const ADAPTIVE_WINDOW_BLOCKS: usize = 20;

/// Seconds between concurrency adjustments.
pub const ADAPTIVE_INTERVAL_SECS: u64 = 60;

/// Increment applied when blocks are fast and the match rate is low.
pub const ADAPTIVE_RAISE_STEP: usize = 5;

/// Decrement applied when mean block time exceeds the hard threshold.
pub const ADAPTIVE_LOWER_STEP: usize = 3;

/// Mean block time (ms) under which the limit may be raised.
pub const ADAPTIVE_FAST_MS: u128 = 1_000;

/// Mean block time (ms) above which the limit is lowered by one.
pub const ADAPTIVE_SLOW_MS: u128 = 2_000;

/// Mean block time (ms) above which the limit is lowered hard.
pub const ADAPTIVE_CRITICAL_MS: u128 = 5_000;

/// Match rate (filtered/total) under which raising the limit is worthwhile.
pub const ADAPTIVE_LOW_MATCH_RATE: f64 = 0.1;

/// Scale divisor for lending-pool utilization values (1e6 fixed point).
pub const UTILIZATION_SCALE: u64 = 1_000_000;
