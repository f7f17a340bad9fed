//! Database types for the indexer storage layer.

use alloy_primitives::B256;

/// Lifecycle of an unprocessed block.
///
/// `PENDING -> PROCESSING -> {COMPLETED, FAILED}`; any state transitions to
/// `REORGED` when the hash at that height diverges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Currently being processed.
    Processing,
    /// Fully processed and published.
    Completed,
    /// Processing failed; retried until the retry cap.
    Failed,
    /// Superseded by a different block at the same height.
    Reorged,
}

impl BlockStatus {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "PENDING",
            BlockStatus::Processing => "PROCESSING",
            BlockStatus::Completed => "COMPLETED",
            BlockStatus::Failed => "FAILED",
            BlockStatus::Reorged => "REORGED",
        }
    }
}

impl std::str::FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BlockStatus::Pending),
            "PROCESSING" => Ok(BlockStatus::Processing),
            "COMPLETED" => Ok(BlockStatus::Completed),
            "FAILED" => Ok(BlockStatus::Failed),
            "REORGED" => Ok(BlockStatus::Reorged),
            _ => Err(format!("Unknown block status: {s}")),
        }
    }
}

/// A row in the unprocessed-block work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedBlock {
    /// Row id.
    pub id: i64,
    /// Chain id.
    pub chain_id: u64,
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Lifecycle status.
    pub status: BlockStatus,
    /// How many times processing has failed.
    pub retry_count: u32,
    /// Last failure message, if any.
    pub error_message: Option<String>,
    /// Unix timestamp of row creation.
    pub created_at: i64,
    /// Unix timestamp of last status change.
    pub updated_at: i64,
}

/// A processed-block progress marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBlock {
    /// Chain id.
    pub chain_id: u64,
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp, seconds.
    pub timestamp: u64,
    /// Number of matched transactions published for this block.
    pub tx_count: u64,
    /// True once the block was superseded by a fork.
    pub is_reorged: bool,
    /// Unix timestamp when processing finished.
    pub processed_at: i64,
}

/// Per-chain queue statistics for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Queued blocks.
    pub pending: u64,
    /// Blocks mid-processing.
    pub processing: u64,
    /// Completed queue rows.
    pub completed: u64,
    /// Failed queue rows.
    pub failed: u64,
    /// Reorged queue rows.
    pub reorged: u64,
    /// Processed-block markers (non-reorged).
    pub processed: u64,
    /// Highest non-reorged processed block.
    pub latest_processed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_str_roundtrip() {
        for status in [
            BlockStatus::Pending,
            BlockStatus::Processing,
            BlockStatus::Completed,
            BlockStatus::Failed,
            BlockStatus::Reorged,
        ] {
            assert_eq!(status.as_str().parse::<BlockStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<BlockStatus>().is_err());
    }
}
