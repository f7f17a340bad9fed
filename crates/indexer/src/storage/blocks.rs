//! Block ledger operations: the unprocessed work queue and processed markers.

use alloy_primitives::B256;
use anyhow::{Context, Result};
use sqlx::Row;

use vaultbridge_core::MAX_RETRIES;

use super::{BlockStatus, LedgerStats, ProcessedBlock, Storage, UnprocessedBlock};
use crate::client::BlockHeaderData;

impl Storage {
    /// Enqueue a block for processing.
    ///
    /// If an active (non-REORGED) row already exists for `(chain_id, number)`:
    /// - same hash → the existing row is returned unchanged
    /// - different hash → the existing row is marked REORGED and a fresh
    ///   PENDING row is inserted for the new fork
    pub async fn add_unprocessed(
        &self,
        chain_id: u64,
        header: &BlockHeaderData,
    ) -> Result<UnprocessedBlock> {
        if let Some(existing) = self.get_unprocessed(chain_id, header.number).await? {
            if existing.hash == header.hash {
                return Ok(existing);
            }

            tracing::warn!(
                chain_id,
                number = header.number,
                old_hash = %existing.hash,
                new_hash = %header.hash,
                "Hash divergence on enqueue, marking old row reorged"
            );
            self.mark_reorged(chain_id, &[header.number]).await?;
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO unprocessed_blocks (
                chain_id, number, hash, parent_hash,
                status, retry_count, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
            "#,
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(header.hash.as_slice())
        .bind(header.parent_hash.as_slice())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to insert unprocessed block")?;

        Ok(UnprocessedBlock {
            id: result.last_insert_rowid(),
            chain_id,
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            status: BlockStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// The active (non-REORGED) queue row for a height, if any.
    pub async fn get_unprocessed(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<UnprocessedBlock>> {
        let row = sqlx::query(
            r#"
            SELECT id, chain_id, number, hash, parent_hash,
                   status, retry_count, error_message, created_at, updated_at
            FROM unprocessed_blocks
            WHERE chain_id = ? AND number = ? AND status != 'REORGED'
            "#,
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_unprocessed).transpose()
    }

    /// Transition a queue row to PROCESSING.
    pub async fn mark_processing(&self, id: i64) -> Result<()> {
        self.set_status(id, BlockStatus::Processing, None).await
    }

    /// Transition a queue row to COMPLETED.
    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        self.set_status(id, BlockStatus::Completed, None).await
    }

    /// Transition a queue row to FAILED, recording the error and bumping the
    /// retry counter.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE unprocessed_blocks
            SET status = 'FAILED',
                retry_count = retry_count + 1,
                error_message = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(self.pool())
        .await
        .context("Failed to mark block failed")?;

        Ok(())
    }

    async fn set_status(&self, id: i64, status: BlockStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE unprocessed_blocks
            SET status = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("Failed to set block status {}", status.as_str()))?;

        Ok(())
    }

    /// Mark the active queue rows at the given heights REORGED.
    pub async fn mark_reorged(&self, chain_id: u64, numbers: &[u64]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for number in numbers {
            sqlx::query(
                r#"
                UPDATE unprocessed_blocks
                SET status = 'REORGED', updated_at = ?
                WHERE chain_id = ? AND number = ? AND status != 'REORGED'
                "#,
            )
            .bind(now)
            .bind(chain_id as i64)
            .bind(*number as i64)
            .execute(self.pool())
            .await
            .context("Failed to mark block reorged")?;
        }
        Ok(())
    }

    /// Queue rows eligible for processing: PENDING or FAILED under the retry
    /// cap, lowest heights first.
    pub async fn blocks_to_process(
        &self,
        chain_id: u64,
        limit: u32,
    ) -> Result<Vec<UnprocessedBlock>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, number, hash, parent_hash,
                   status, retry_count, error_message, created_at, updated_at
            FROM unprocessed_blocks
            WHERE chain_id = ?
              AND status IN ('PENDING', 'FAILED')
              AND retry_count < ?
            ORDER BY number ASC
            LIMIT ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(MAX_RETRIES as i64)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_unprocessed).collect()
    }

    /// Record (or refresh) a processed-block marker.
    pub async fn add_processed(
        &self,
        chain_id: u64,
        header: &BlockHeaderData,
        tx_count: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_blocks (
                chain_id, number, hash, parent_hash,
                timestamp, tx_count, is_reorged, processed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(chain_id, number) DO UPDATE SET
                hash = excluded.hash,
                parent_hash = excluded.parent_hash,
                timestamp = excluded.timestamp,
                tx_count = excluded.tx_count,
                is_reorged = 0,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(header.hash.as_slice())
        .bind(header.parent_hash.as_slice())
        .bind(header.timestamp as i64)
        .bind(tx_count as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool())
        .await
        .context("Failed to record processed block")?;

        Ok(())
    }

    /// The highest non-reorged processed block for a chain.
    pub async fn latest_processed(&self, chain_id: u64) -> Result<Option<ProcessedBlock>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, number, hash, parent_hash,
                   timestamp, tx_count, is_reorged, processed_at
            FROM processed_blocks
            WHERE chain_id = ? AND is_reorged = 0
            ORDER BY number DESC
            LIMIT 1
            "#,
        )
        .bind(chain_id as i64)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_processed).transpose()
    }

    /// A specific processed-block marker (reorged or not).
    pub async fn processed_block(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<ProcessedBlock>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, number, hash, parent_hash,
                   timestamp, tx_count, is_reorged, processed_at
            FROM processed_blocks
            WHERE chain_id = ? AND number = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_processed).transpose()
    }

    /// Whether a height has a non-reorged processed marker.
    pub async fn is_processed(&self, chain_id: u64, number: u64) -> Result<bool> {
        Ok(self
            .processed_block(chain_id, number)
            .await?
            .map(|b| !b.is_reorged)
            .unwrap_or(false))
    }

    /// Flag processed markers at the given heights as reorged.
    pub async fn mark_processed_reorged(&self, chain_id: u64, numbers: &[u64]) -> Result<()> {
        for number in numbers {
            sqlx::query(
                "UPDATE processed_blocks SET is_reorged = 1 WHERE chain_id = ? AND number = ?",
            )
            .bind(chain_id as i64)
            .bind(*number as i64)
            .execute(self.pool())
            .await
            .context("Failed to mark processed block reorged")?;
        }
        Ok(())
    }

    /// Queue and progress statistics for a chain.
    pub async fn stats(&self, chain_id: u64) -> Result<LedgerStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM unprocessed_blocks
            WHERE chain_id = ?
            GROUP BY status
            "#,
        )
        .bind(chain_id as i64)
        .fetch_all(self.pool())
        .await?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "PENDING" => stats.pending = count as u64,
                "PROCESSING" => stats.processing = count as u64,
                "COMPLETED" => stats.completed = count as u64,
                "FAILED" => stats.failed = count as u64,
                "REORGED" => stats.reorged = count as u64,
                _ => {}
            }
        }

        let processed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_blocks WHERE chain_id = ? AND is_reorged = 0",
        )
        .bind(chain_id as i64)
        .fetch_one(self.pool())
        .await?;
        stats.processed = processed as u64;
        stats.latest_processed = self.latest_processed(chain_id).await?.map(|b| b.number);

        Ok(stats)
    }

    fn row_to_unprocessed(row: sqlx::sqlite::SqliteRow) -> Result<UnprocessedBlock> {
        let hash: Vec<u8> = row.get("hash");
        let parent: Vec<u8> = row.get("parent_hash");
        let status: String = row.get("status");

        Ok(UnprocessedBlock {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            number: row.get::<i64, _>("number") as u64,
            hash: B256::from_slice(&hash),
            parent_hash: B256::from_slice(&parent),
            status: status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid block status in database")?,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_processed(row: sqlx::sqlite::SqliteRow) -> Result<ProcessedBlock> {
        let hash: Vec<u8> = row.get("hash");
        let parent: Vec<u8> = row.get("parent_hash");

        Ok(ProcessedBlock {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            number: row.get::<i64, _>("number") as u64,
            hash: B256::from_slice(&hash),
            parent_hash: B256::from_slice(&parent),
            timestamp: row.get::<i64, _>("timestamp") as u64,
            tx_count: row.get::<i64, _>("tx_count") as u64,
            is_reorged: row.get::<i64, _>("is_reorged") != 0,
            processed_at: row.get("processed_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util;

    fn header(number: u64, seed: u8) -> BlockHeaderData {
        BlockHeaderData {
            number,
            hash: B256::from([seed; 32]),
            parent_hash: B256::from([seed.wrapping_sub(1); 32]),
            timestamp: 1_700_000_000 + number,
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_for_same_hash() {
        let (storage, _db) = test_util::storage().await;

        let first = storage.add_unprocessed(1, &header(100, 10)).await.unwrap();
        let second = storage.add_unprocessed(1, &header(100, 10)).await.unwrap();
        assert_eq!(first.id, second.id);

        let stats = storage.stats(1).await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_enqueue_divergent_hash_reorgs_old_row() {
        let (storage, _db) = test_util::storage().await;

        let old = storage.add_unprocessed(1, &header(205, 10)).await.unwrap();
        let new = storage.add_unprocessed(1, &header(205, 20)).await.unwrap();
        assert_ne!(old.id, new.id);
        assert_eq!(new.status, BlockStatus::Pending);

        // Only the new row is active
        let active = storage.get_unprocessed(1, 205).await.unwrap().unwrap();
        assert_eq!(active.id, new.id);
        assert_eq!(active.hash, B256::from([20u8; 32]));

        let stats = storage.stats(1).await.unwrap();
        assert_eq!(stats.reorged, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (storage, _db) = test_util::storage().await;
        let row = storage.add_unprocessed(1, &header(7, 7)).await.unwrap();

        storage.mark_processing(row.id).await.unwrap();
        let current = storage.get_unprocessed(1, 7).await.unwrap().unwrap();
        assert_eq!(current.status, BlockStatus::Processing);

        storage.mark_completed(row.id).await.unwrap();
        let current = storage.get_unprocessed(1, 7).await.unwrap().unwrap();
        assert_eq!(current.status, BlockStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_cap_parks_block() {
        let (storage, _db) = test_util::storage().await;
        let row = storage.add_unprocessed(1, &header(50, 5)).await.unwrap();

        for _ in 0..MAX_RETRIES {
            storage.mark_failed(row.id, "rpc timeout").await.unwrap();
        }

        let current = storage.get_unprocessed(1, 50).await.unwrap().unwrap();
        assert_eq!(current.retry_count, MAX_RETRIES);
        assert_eq!(current.error_message.as_deref(), Some("rpc timeout"));

        // Exhausted rows are not handed out
        let eligible = storage.blocks_to_process(1, 10).await.unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_blocks_to_process_ordering() {
        let (storage, _db) = test_util::storage().await;
        storage.add_unprocessed(1, &header(30, 3)).await.unwrap();
        storage.add_unprocessed(1, &header(10, 1)).await.unwrap();
        storage.add_unprocessed(1, &header(20, 2)).await.unwrap();

        let eligible = storage.blocks_to_process(1, 10).await.unwrap();
        let numbers: Vec<u64> = eligible.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_latest_processed_ignores_reorged() {
        let (storage, _db) = test_util::storage().await;

        storage.add_processed(1, &header(100, 1), 2).await.unwrap();
        storage.add_processed(1, &header(101, 2), 0).await.unwrap();
        assert_eq!(storage.latest_processed(1).await.unwrap().unwrap().number, 101);

        storage.mark_processed_reorged(1, &[101]).await.unwrap();
        assert_eq!(storage.latest_processed(1).await.unwrap().unwrap().number, 100);
        assert!(!storage.is_processed(1, 101).await.unwrap());
        assert!(storage.is_processed(1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_reprocessing_clears_reorged_marker() {
        let (storage, _db) = test_util::storage().await;

        storage.add_processed(1, &header(205, 10), 3).await.unwrap();
        storage.mark_processed_reorged(1, &[205]).await.unwrap();

        // The new fork block at the same height replaces the marker
        storage.add_processed(1, &header(205, 20), 1).await.unwrap();
        let block = storage.processed_block(1, 205).await.unwrap().unwrap();
        assert!(!block.is_reorged);
        assert_eq!(block.hash, B256::from([20u8; 32]));
    }

    #[tokio::test]
    async fn test_chains_are_isolated() {
        let (storage, _db) = test_util::storage().await;
        storage.add_unprocessed(1, &header(5, 1)).await.unwrap();
        storage.add_unprocessed(2, &header(9, 2)).await.unwrap();

        assert_eq!(storage.stats(1).await.unwrap().pending, 1);
        assert_eq!(storage.stats(2).await.unwrap().pending, 1);
        assert!(storage.get_unprocessed(2, 5).await.unwrap().is_none());
    }
}
