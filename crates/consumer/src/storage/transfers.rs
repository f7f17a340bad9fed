//! NFT transfer storage with Merkle inclusion bookkeeping.

use alloy_primitives::B256;
use anyhow::{Context, Result};
use sqlx::Row;
use std::str::FromStr;

use vaultbridge_core::TokenId;

use super::{NftTransfer, Storage};
use crate::events::TransferEvent;

impl Storage {
    /// Insert a transfer observation; false means the tx hash was already
    /// recorded (replayed log).
    pub async fn insert_transfer(&self, event: &TransferEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO nft_transfers (
                chain_id, tx_hash, block_number, block_hash,
                token_address, token_id, from_address, to_address,
                log_index, timestamp, included_in_merkle
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(tx_hash) DO NOTHING
            "#,
        )
        .bind(event.chain_id as i64)
        .bind(event.tx_hash.as_slice())
        .bind(event.block_number as i64)
        .bind(event.block_hash.as_slice())
        .bind(super::addr_key(&event.token_address))
        .bind(event.token_id.to_string())
        .bind(super::addr_key(&event.from))
        .bind(super::addr_key(&event.to))
        .bind(event.log_index as i64)
        .bind(event.timestamp as i64)
        .execute(self.pool())
        .await
        .context("Failed to insert NFT transfer")?;

        Ok(result.rows_affected() > 0)
    }

    /// All transfers in snapshot order: block number, then log index, then
    /// insertion order.
    pub async fn all_transfers(&self) -> Result<Vec<NftTransfer>> {
        self.transfers_up_to(i64::MAX as u64).await
    }

    /// Transfers with `block_number <= max_block`, snapshot order.
    pub async fn transfers_up_to(&self, max_block: u64) -> Result<Vec<NftTransfer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, tx_hash, block_number, block_hash,
                   token_address, token_id, from_address, to_address,
                   log_index, timestamp, included_in_merkle, merkle_root
            FROM nft_transfers
            WHERE block_number <= ?
            ORDER BY block_number ASC, log_index ASC, id ASC
            "#,
        )
        .bind(max_block as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_transfer).collect()
    }

    /// The most recent transfer already covered by a published root.
    pub async fn latest_committed_transfer(&self) -> Result<Option<NftTransfer>> {
        let row = sqlx::query(
            r#"
            SELECT id, chain_id, tx_hash, block_number, block_hash,
                   token_address, token_id, from_address, to_address,
                   log_index, timestamp, included_in_merkle, merkle_root
            FROM nft_transfers
            WHERE merkle_root IS NOT NULL
            ORDER BY block_number DESC, log_index DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_transfer).transpose()
    }

    /// Stamp every not-yet-included transfer with the new root.
    ///
    /// Already-included rows keep their original root; the WHERE guard makes
    /// the stamp write-once.
    pub async fn mark_included(&self, root: &B256) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE nft_transfers
            SET included_in_merkle = 1, merkle_root = ?
            WHERE included_in_merkle = 0
            "#,
        )
        .bind(root.as_slice())
        .execute(self.pool())
        .await
        .context("Failed to mark transfers included")?;

        Ok(result.rows_affected())
    }

    /// Number of stored transfers.
    pub async fn transfer_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nft_transfers")
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }

    fn row_to_transfer(row: sqlx::sqlite::SqliteRow) -> Result<NftTransfer> {
        let tx_hash: Vec<u8> = row.get("tx_hash");
        let block_hash: Vec<u8> = row.get("block_hash");
        let root: Option<Vec<u8>> = row.get("merkle_root");
        let token_id: String = row.get("token_id");

        Ok(NftTransfer {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            tx_hash: B256::from_slice(&tx_hash),
            block_number: row.get::<i64, _>("block_number") as u64,
            block_hash: B256::from_slice(&block_hash),
            token_address: row.get("token_address"),
            token_id: TokenId::from_str(&token_id)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("Invalid token id in database")?,
            from: row.get("from_address"),
            to: row.get("to_address"),
            log_index: row.get::<i64, _>("log_index") as u64,
            timestamp: row.get::<i64, _>("timestamp") as u64,
            included_in_merkle: row.get::<i64, _>("included_in_merkle") != 0,
            merkle_root: root.map(|r| B256::from_slice(&r)),
        })
    }
}
