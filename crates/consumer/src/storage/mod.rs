//! Storage layer for the consumer.
//!
//! This module provides database operations for:
//! - The NFT transfer sequence (with Merkle inclusion bookkeeping)
//! - Ledger entities: users, deposits, withdrawals, borrows
//! - Raw vault/relayer event records (dedup keys)
//! - Processed-transaction markers (producer re-publish suppression)

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod ledger;
pub mod transfers;
pub mod types;

pub use types::*;

/// Database storage for the consumer.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let max_conn = max_connections.unwrap_or(5);
        let min_conn = min_connections.unwrap_or(1);

        info!(
            url = database_url,
            max = max_conn,
            min = min_conn,
            "Connecting to consumer database"
        );

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_conn)
            .min_connections(min_conn)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Create a new storage instance at a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Consumer migrations completed");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Aggregate row counts for status output.
    pub async fn stats(&self) -> Result<ConsumerStats> {
        let transfers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nft_transfers")
            .fetch_one(&self.pool)
            .await?;
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let deposits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deposits")
            .fetch_one(&self.pool)
            .await?;
        let withdrawals: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM withdrawals")
            .fetch_one(&self.pool)
            .await?;
        let borrows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM borrows WHERE status = 'ACTIVE'")
                .fetch_one(&self.pool)
                .await?;
        let pending_requests: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relayer_events WHERE event_type = 'COLLATERAL_REQUEST' AND status = 'PENDING'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ConsumerStats {
            transfers: transfers as u64,
            users: users as u64,
            deposits: deposits as u64,
            withdrawals: withdrawals as u64,
            active_borrows: borrows as u64,
            pending_requests: pending_requests as u64,
        })
    }

    /// Record that a transaction was consumed; false means it was seen before.
    pub async fn record_processed_tx(
        &self,
        chain_id: u64,
        tx_hash: &alloy_primitives::B256,
        block_number: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_transactions (chain_id, tx_hash, block_number, processed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chain_id, tx_hash) DO NOTHING
            "#,
        )
        .bind(chain_id as i64)
        .bind(tx_hash.as_slice())
        .bind(block_number as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to record processed transaction")?;

        Ok(result.rows_affected() > 0)
    }
}

/// Aggregate consumer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Stored NFT transfers.
    pub transfers: u64,
    /// Known users.
    pub users: u64,
    /// Recorded deposits.
    pub deposits: u64,
    /// Recorded withdrawals (any state).
    pub withdrawals: u64,
    /// Outstanding borrows.
    pub active_borrows: u64,
    /// Collateral requests awaiting processing.
    pub pending_requests: u64,
}
