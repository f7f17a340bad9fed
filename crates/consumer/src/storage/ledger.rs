//! Ledger entity storage: users, deposits, withdrawals, borrows, and the raw
//! vault/relayer event records behind the dedup keys.

use alloy_primitives::{B256, U256};
use anyhow::{Context, Result};
use sqlx::Row;
use std::str::FromStr;

use vaultbridge_core::{TokenId, UsdValue};

use super::{
    Borrow, BorrowStatus, Deposit, RelayerEventRecord, RelayerEventStatus, Storage, User,
    Withdrawal, WithdrawalStatus,
};
use crate::events::{RelayerEvent, VaultEvent};

impl Storage {
    // ---- users -----------------------------------------------------------

    /// Fetch a user by lowercase wallet address.
    pub async fn get_user(&self, wallet: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT wallet_address, total_usd_balance, floating_usd_balance, borrowed_usd_amount
            FROM users
            WHERE wallet_address = ?
            "#,
        )
        .bind(wallet)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_user).transpose()
    }

    /// Fetch a user, creating a zero-balance row if absent.
    pub async fn upsert_user(&self, wallet: &str) -> Result<User> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO users (
                wallet_address, total_usd_balance, floating_usd_balance,
                borrowed_usd_amount, created_at, updated_at
            )
            VALUES (?, '0.00000000', '0.00000000', '0.00000000', ?, ?)
            ON CONFLICT(wallet_address) DO NOTHING
            "#,
        )
        .bind(wallet)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to upsert user")?;

        self.get_user(wallet)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User row missing after upsert: {wallet}"))
    }

    /// Apply signed deltas to a user's balances inside one transaction.
    ///
    /// The row is re-read under the transaction so concurrent events for the
    /// same user serialize cleanly.
    pub async fn update_balances(
        &self,
        wallet: &str,
        total_delta: &UsdValue,
        floating_delta: &UsdValue,
        borrowed_delta: &UsdValue,
    ) -> Result<User> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT wallet_address, total_usd_balance, floating_usd_balance, borrowed_usd_amount
            FROM users
            WHERE wallet_address = ?
            "#,
        )
        .bind(wallet)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown user: {wallet}"))?;

        let mut user = Self::row_to_user(row)?;
        user.total_usd_balance += total_delta;
        user.floating_usd_balance += floating_delta;
        user.borrowed_usd_amount += borrowed_delta;

        sqlx::query(
            r#"
            UPDATE users
            SET total_usd_balance = ?,
                floating_usd_balance = ?,
                borrowed_usd_amount = ?,
                updated_at = ?
            WHERE wallet_address = ?
            "#,
        )
        .bind(user.total_usd_balance.to_string())
        .bind(user.floating_usd_balance.to_string())
        .bind(user.borrowed_usd_amount.to_string())
        .bind(chrono::Utc::now().timestamp())
        .bind(wallet)
        .execute(&mut *tx)
        .await
        .context("Failed to update user balances")?;

        tx.commit().await?;
        Ok(user)
    }

    // ---- deposits --------------------------------------------------------

    /// Record a deposit.
    pub async fn insert_deposit(&self, event: &VaultEvent, usd_value: &UsdValue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deposits (
                chain_id, tx_hash, sender, asset, vault,
                amount, token_id, usd_value, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.chain_id as i64)
        .bind(event.tx_hash.as_slice())
        .bind(super::addr_key(&event.sender))
        .bind(super::addr_key(&event.asset))
        .bind(super::addr_key(&event.vault))
        .bind(event.amount.to_string())
        .bind(event.token_id.to_string())
        .bind(usd_value.to_string())
        .bind(event.timestamp as i64)
        .execute(self.pool())
        .await
        .context("Failed to insert deposit")?;

        Ok(())
    }

    /// Total USD ever deposited by a wallet.
    pub async fn deposits_usd_total(&self, sender: &str) -> Result<UsdValue> {
        let values: Vec<String> =
            sqlx::query_scalar("SELECT usd_value FROM deposits WHERE sender = ?")
                .bind(sender)
                .fetch_all(self.pool())
                .await?;
        Self::sum_usd(values)
    }

    /// Whether a wallet has ever deposited against a token position.
    pub async fn has_deposit(&self, sender: &str, token_id: &TokenId) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deposits WHERE sender = ? AND token_id = ?")
                .bind(sender)
                .bind(token_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }

    /// All deposits backing a token position, across chains.
    pub async fn deposits_for_token(&self, token_id: &TokenId) -> Result<Vec<Deposit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, tx_hash, sender, asset, vault,
                   amount, token_id, usd_value, timestamp
            FROM deposits
            WHERE token_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(token_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_deposit).collect()
    }

    // ---- withdrawals -----------------------------------------------------

    /// Record a withdrawal row in the given state.
    pub async fn insert_withdrawal(
        &self,
        event: &VaultEvent,
        usd_value: &UsdValue,
        status: WithdrawalStatus,
    ) -> Result<i64> {
        let request_id = event.request_id.unwrap_or(B256::ZERO);
        let result = sqlx::query(
            r#"
            INSERT INTO withdrawals (
                chain_id, request_id, sender, asset, amount,
                token_id, usd_value, status, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.chain_id as i64)
        .bind(request_id.as_slice())
        .bind(super::addr_key(&event.sender))
        .bind(super::addr_key(&event.asset))
        .bind(event.amount.to_string())
        .bind(event.token_id.to_string())
        .bind(usd_value.to_string())
        .bind(status.as_str())
        .bind(event.timestamp as i64)
        .execute(self.pool())
        .await
        .context("Failed to insert withdrawal")?;

        Ok(result.last_insert_rowid())
    }

    /// The PENDING withdrawal for a request id, if any.
    pub async fn pending_withdrawal_by_request(
        &self,
        request_id: &B256,
    ) -> Result<Option<Withdrawal>> {
        let row = sqlx::query(
            r#"
            SELECT id, chain_id, request_id, sender, asset, amount,
                   token_id, usd_value, status, timestamp, completed_at
            FROM withdrawals
            WHERE request_id = ? AND status = 'PENDING'
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(request_id.as_slice())
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_withdrawal).transpose()
    }

    /// Mark a withdrawal COMPLETED.
    pub async fn complete_withdrawal(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE withdrawals SET status = 'COMPLETED', completed_at = ? WHERE id = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(self.pool())
        .await
        .context("Failed to complete withdrawal")?;

        Ok(())
    }

    /// Total USD of a wallet's withdrawals in one state.
    pub async fn withdrawals_usd_total(
        &self,
        sender: &str,
        status: WithdrawalStatus,
    ) -> Result<UsdValue> {
        let values: Vec<String> =
            sqlx::query_scalar("SELECT usd_value FROM withdrawals WHERE sender = ? AND status = ?")
                .bind(sender)
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?;
        Self::sum_usd(values)
    }

    // ---- borrows ---------------------------------------------------------

    /// Open a borrow.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_borrow(
        &self,
        chain_id: u64,
        request_id: &B256,
        sender: &str,
        token_id: &TokenId,
        protocol: &str,
        asset: &str,
        amount: &U256,
        usd_value: &UsdValue,
        timestamp: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO borrows (
                chain_id, request_id, sender, token_id, protocol,
                asset, amount, usd_value, status, loan_start_date
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'ACTIVE', ?)
            "#,
        )
        .bind(chain_id as i64)
        .bind(request_id.as_slice())
        .bind(sender)
        .bind(token_id.to_string())
        .bind(protocol)
        .bind(asset)
        .bind(amount.to_string())
        .bind(usd_value.to_string())
        .bind(timestamp)
        .execute(self.pool())
        .await
        .context("Failed to insert borrow")?;

        Ok(result.last_insert_rowid())
    }

    /// A wallet's active borrows, oldest first.
    pub async fn active_borrows(&self, sender: &str) -> Result<Vec<Borrow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, request_id, sender, token_id, protocol,
                   asset, amount, usd_value, status, loan_start_date, loan_end_date
            FROM borrows
            WHERE sender = ? AND status = 'ACTIVE'
            ORDER BY loan_start_date ASC, id ASC
            "#,
        )
        .bind(sender)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_borrow).collect()
    }

    /// Total outstanding USD across a wallet's active borrows.
    pub async fn active_borrows_usd_total(&self, sender: &str) -> Result<UsdValue> {
        let values: Vec<String> =
            sqlx::query_scalar("SELECT usd_value FROM borrows WHERE sender = ? AND status = 'ACTIVE'")
                .bind(sender)
                .fetch_all(self.pool())
                .await?;
        Self::sum_usd(values)
    }

    /// Distinct lending protocols with active borrows against a token.
    pub async fn active_borrow_protocols(&self, token_id: &TokenId) -> Result<Vec<String>> {
        let protocols: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT protocol FROM borrows WHERE token_id = ? AND status = 'ACTIVE'",
        )
        .bind(token_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(protocols)
    }

    /// Active borrows against a token position, across users and chains.
    pub async fn active_borrows_for_token(&self, token_id: &TokenId) -> Result<Vec<Borrow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, request_id, sender, token_id, protocol,
                   asset, amount, usd_value, status, loan_start_date, loan_end_date
            FROM borrows
            WHERE token_id = ? AND status = 'ACTIVE'
            ORDER BY loan_start_date ASC, id ASC
            "#,
        )
        .bind(token_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_borrow).collect()
    }

    /// Reduce a borrow's outstanding USD (partial repayment).
    pub async fn reduce_borrow(&self, id: i64, remaining: &UsdValue) -> Result<()> {
        sqlx::query("UPDATE borrows SET usd_value = ? WHERE id = ?")
            .bind(remaining.to_string())
            .bind(id)
            .execute(self.pool())
            .await
            .context("Failed to reduce borrow")?;
        Ok(())
    }

    /// Close a borrow as fully repaid.
    pub async fn close_borrow(&self, id: i64, end_date: i64) -> Result<()> {
        sqlx::query(
            "UPDATE borrows SET status = 'REPAID', usd_value = '0.00000000', loan_end_date = ? WHERE id = ?",
        )
        .bind(end_date)
        .bind(id)
        .execute(self.pool())
        .await
        .context("Failed to close borrow")?;
        Ok(())
    }

    // ---- raw event records ----------------------------------------------

    /// Record a vault event; false means the dedup key already exists.
    pub async fn insert_vault_event(&self, event: &VaultEvent, usd_value: &UsdValue) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO vault_events (
                event_type, chain_id, tx_hash, log_index, sender, asset,
                vault, amount, token_id, request_id, usd_value, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tx_hash, event_type, token_id, asset) DO NOTHING
            "#,
        )
        .bind(event.kind.as_str())
        .bind(event.chain_id as i64)
        .bind(event.tx_hash.as_slice())
        .bind(event.log_index as i64)
        .bind(super::addr_key(&event.sender))
        .bind(super::addr_key(&event.asset))
        .bind(super::addr_key(&event.vault))
        .bind(event.amount.to_string())
        .bind(event.token_id.to_string())
        .bind(event.request_id.map(|r| r.to_vec()))
        .bind(usd_value.to_string())
        .bind(event.timestamp as i64)
        .execute(self.pool())
        .await
        .context("Failed to insert vault event")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a relayer event as PENDING; false means the dedup key exists.
    pub async fn insert_relayer_event(&self, event: &RelayerEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO relayer_events (
                event_type, request_id, chain_id, token_id, protocol, asset,
                sender, amount, deadline, data, signature, status, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?)
            ON CONFLICT(request_id, chain_id, event_type) DO NOTHING
            "#,
        )
        .bind(event.kind.as_str())
        .bind(event.request_id.as_slice())
        .bind(event.chain_id as i64)
        .bind(event.token_id.map(|t| t.to_string()))
        .bind(event.protocol.map(|p| super::addr_key(&p)))
        .bind(event.asset.map(|a| super::addr_key(&a)))
        .bind(super::addr_key(&event.sender))
        .bind(event.amount.to_string())
        .bind(event.deadline.map(|d| d as i64))
        .bind(event.data.to_vec())
        .bind(event.signature.to_vec())
        .bind(event.timestamp as i64)
        .execute(self.pool())
        .await
        .context("Failed to insert relayer event")?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a relayer event by its dedup key.
    pub async fn get_relayer_event(
        &self,
        request_id: &B256,
        chain_id: u64,
        event_type: &str,
    ) -> Result<Option<RelayerEventRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_type, request_id, chain_id, token_id, protocol,
                   asset, sender, amount, deadline, data, signature, status,
                   error_data, process_tx_hash, timestamp
            FROM relayer_events
            WHERE request_id = ? AND chain_id = ? AND event_type = ?
            "#,
        )
        .bind(request_id.as_slice())
        .bind(chain_id as i64)
        .bind(event_type)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::row_to_relayer_event).transpose()
    }

    /// Update a relayer event's lifecycle status; false when no row matched.
    pub async fn set_relayer_event_status(
        &self,
        request_id: &B256,
        chain_id: u64,
        event_type: &str,
        status: RelayerEventStatus,
        error_data: Option<&str>,
        process_tx_hash: Option<&B256>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE relayer_events
            SET status = ?, error_data = ?, process_tx_hash = ?
            WHERE request_id = ? AND chain_id = ? AND event_type = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_data)
        .bind(process_tx_hash.map(|h| h.to_vec()))
        .bind(request_id.as_slice())
        .bind(chain_id as i64)
        .bind(event_type)
        .execute(self.pool())
        .await
        .context("Failed to update relayer event status")?;

        Ok(result.rows_affected() > 0)
    }

    /// All PENDING collateral requests (startup sweep).
    pub async fn pending_collateral_requests(&self) -> Result<Vec<RelayerEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, request_id, chain_id, token_id, protocol,
                   asset, sender, amount, deadline, data, signature, status,
                   error_data, process_tx_hash, timestamp
            FROM relayer_events
            WHERE event_type = 'COLLATERAL_REQUEST' AND status = 'PENDING'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::row_to_relayer_event).collect()
    }

    // ---- row mapping -----------------------------------------------------

    fn sum_usd(values: Vec<String>) -> Result<UsdValue> {
        let mut total = UsdValue::zero();
        for value in values {
            let parsed = UsdValue::parse(&value)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("Invalid USD value in database")?;
            total += &parsed;
        }
        Ok(total)
    }

    fn parse_usd(value: String) -> Result<UsdValue> {
        UsdValue::parse(&value)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("Invalid USD value in database")
    }

    fn parse_token_id(value: String) -> Result<TokenId> {
        TokenId::from_str(&value)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("Invalid token id in database")
    }

    fn parse_u256(value: String) -> Result<U256> {
        U256::from_str(&value).context("Invalid amount in database")
    }

    fn row_to_user(row: sqlx::sqlite::SqliteRow) -> Result<User> {
        Ok(User {
            wallet_address: row.get("wallet_address"),
            total_usd_balance: Self::parse_usd(row.get("total_usd_balance"))?,
            floating_usd_balance: Self::parse_usd(row.get("floating_usd_balance"))?,
            borrowed_usd_amount: Self::parse_usd(row.get("borrowed_usd_amount"))?,
        })
    }

    fn row_to_deposit(row: sqlx::sqlite::SqliteRow) -> Result<Deposit> {
        let tx_hash: Vec<u8> = row.get("tx_hash");
        Ok(Deposit {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            tx_hash: B256::from_slice(&tx_hash),
            sender: row.get("sender"),
            asset: row.get("asset"),
            vault: row.get("vault"),
            amount: Self::parse_u256(row.get("amount"))?,
            token_id: Self::parse_token_id(row.get("token_id"))?,
            usd_value: Self::parse_usd(row.get("usd_value"))?,
            timestamp: row.get::<i64, _>("timestamp") as u64,
        })
    }

    fn row_to_withdrawal(row: sqlx::sqlite::SqliteRow) -> Result<Withdrawal> {
        let request_id: Vec<u8> = row.get("request_id");
        let status: String = row.get("status");
        Ok(Withdrawal {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            request_id: B256::from_slice(&request_id),
            sender: row.get("sender"),
            asset: row.get("asset"),
            amount: Self::parse_u256(row.get("amount"))?,
            token_id: Self::parse_token_id(row.get("token_id"))?,
            usd_value: Self::parse_usd(row.get("usd_value"))?,
            status: status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid withdrawal status in database")?,
            timestamp: row.get::<i64, _>("timestamp") as u64,
            completed_at: row.get("completed_at"),
        })
    }

    fn row_to_borrow(row: sqlx::sqlite::SqliteRow) -> Result<Borrow> {
        let request_id: Vec<u8> = row.get("request_id");
        let status: String = row.get("status");
        Ok(Borrow {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            request_id: B256::from_slice(&request_id),
            sender: row.get("sender"),
            token_id: Self::parse_token_id(row.get("token_id"))?,
            protocol: row.get("protocol"),
            asset: row.get("asset"),
            amount: Self::parse_u256(row.get("amount"))?,
            usd_value: Self::parse_usd(row.get("usd_value"))?,
            status: status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid borrow status in database")?,
            loan_start_date: row.get("loan_start_date"),
            loan_end_date: row.get("loan_end_date"),
        })
    }

    fn row_to_relayer_event(row: sqlx::sqlite::SqliteRow) -> Result<RelayerEventRecord> {
        let request_id: Vec<u8> = row.get("request_id");
        let token_id: Option<String> = row.get("token_id");
        let status: String = row.get("status");
        let process_tx: Option<Vec<u8>> = row.get("process_tx_hash");
        let data: Option<Vec<u8>> = row.get("data");
        let signature: Option<Vec<u8>> = row.get("signature");

        Ok(RelayerEventRecord {
            id: row.get("id"),
            event_type: row.get("event_type"),
            request_id: B256::from_slice(&request_id),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            token_id: token_id.map(Self::parse_token_id).transpose()?,
            protocol: row.get("protocol"),
            asset: row.get("asset"),
            sender: row.get("sender"),
            amount: Self::parse_u256(row.get("amount"))?,
            deadline: row.get("deadline"),
            data: data.unwrap_or_default(),
            signature: signature.unwrap_or_default(),
            status: status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid relayer event status in database")?,
            error_data: row.get("error_data"),
            process_tx_hash: process_tx.map(|h| B256::from_slice(&h)),
            timestamp: row.get::<i64, _>("timestamp") as u64,
        })
    }
}
