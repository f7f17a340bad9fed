//! The collateral ledger state machine.
//!
//! Every message from the bus is decoded into pipeline events and folded
//! through this state machine in arrival order. Entity writes are guarded by
//! their natural dedup keys, so replays (producer recovery, at-least-once
//! delivery) never double-apply. A failure inside one event is logged and the
//! remaining events still process; only infrastructure failures bubble to the
//! supervisor.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use tracing::{debug, info, warn};

use vaultbridge_core::{TokenId, UsdValue, UTILIZATION_SCALE};

use crate::config::AssetTable;
use crate::events::{
    decode_message, Erc20TransferEvent, PipelineEvent, RelayerEvent, RelayerEventKind, VaultEvent,
    VaultEventKind,
};
use crate::merkle_engine::MerkleEngine;
use crate::oracle::PriceOracle;
use crate::relayer::{encode_asset, LendingPool, RelayerClient};
use crate::storage::{
    addr_key, RelayerEventRecord, RelayerEventStatus, Storage, WithdrawalStatus,
};
use vaultbridge_bus::ChainMessage;

/// Rejection reason used when a borrow would exceed the position's headroom.
const REASON_EXCEEDS_LTV: &str = "Exceeds LTV limits";

/// The event-driven collateral ledger.
pub struct Ledger {
    storage: Storage,
    merkle: Arc<MerkleEngine>,
    oracle: Arc<dyn PriceOracle>,
    relayer: Arc<dyn RelayerClient>,
    lending: Arc<dyn LendingPool>,
    assets: AssetTable,
    vault_handlers: HashMap<u64, Address>,
    /// Escape hatch: accept deposit history as ownership evidence while no
    /// Merkle root exists yet.
    allow_deposit_fallback: bool,
}

impl Ledger {
    /// Assemble the ledger from its collaborators.
    pub fn new(
        storage: Storage,
        merkle: Arc<MerkleEngine>,
        oracle: Arc<dyn PriceOracle>,
        relayer: Arc<dyn RelayerClient>,
        lending: Arc<dyn LendingPool>,
        assets: AssetTable,
        vault_handlers: HashMap<u64, Address>,
        allow_deposit_fallback: bool,
    ) -> Self {
        Self {
            storage,
            merkle,
            oracle,
            relayer,
            lending,
            assets,
            vault_handlers,
            allow_deposit_fallback,
        }
    }

    /// Process one message from the bus.
    ///
    /// Re-delivered transactions are dropped wholesale on the
    /// `(chain_id, tx_hash)` marker before any entity is touched.
    pub async fn handle_message(&self, message: &ChainMessage) -> Result<()> {
        let tx = &message.transaction;

        let fresh = self
            .storage
            .record_processed_tx(tx.chain_id, &tx.hash, tx.block_number)
            .await?;
        if !fresh {
            debug!(chain_id = tx.chain_id, tx = %tx.hash, "Replayed transaction dropped");
            return Ok(());
        }

        let events = decode_message(message);
        let erc20_transfers: Vec<Erc20TransferEvent> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Erc20Transfer(t) => Some(t.clone()),
                _ => None,
            })
            .collect();

        for event in &events {
            let outcome = match event {
                PipelineEvent::Transfer(transfer) => self.merkle.on_transfer(transfer).await,
                PipelineEvent::Vault(vault) => self.handle_vault_event(vault).await,
                PipelineEvent::Relayer(relayer) => {
                    self.handle_relayer_event(relayer, &erc20_transfers).await
                }
                // Standalone ERC-20 transfers only matter alongside a Repay
                PipelineEvent::Erc20Transfer(_) => Ok(()),
            };

            if let Err(e) = outcome {
                warn!(
                    chain_id = tx.chain_id,
                    tx = %tx.hash,
                    error = format!("{e:#}"),
                    "Event handling failed, continuing with next event"
                );
            }
        }

        Ok(())
    }

    // ---- vault events ----------------------------------------------------

    async fn handle_vault_event(&self, event: &VaultEvent) -> Result<()> {
        let usd_value = self
            .oracle
            .usd_value(event.chain_id, &event.asset, event.amount)
            .await
            .with_context(|| format!("Failed to price vault event asset {}", event.asset))?;

        let fresh = self.storage.insert_vault_event(event, &usd_value).await?;
        if !fresh {
            debug!(tx = %event.tx_hash, kind = event.kind.as_str(), "Duplicate vault event dropped");
            return Ok(());
        }

        match event.kind {
            VaultEventKind::Deposit => self.apply_deposit(event, &usd_value).await,
            VaultEventKind::WithdrawRequest => self.apply_withdraw_request(event, &usd_value).await,
            VaultEventKind::Withdraw => self.apply_withdraw_completion(event).await,
        }
    }

    async fn apply_deposit(&self, event: &VaultEvent, usd_value: &UsdValue) -> Result<()> {
        let wallet = addr_key(&event.sender);
        self.storage.upsert_user(&wallet).await?;
        self.storage.insert_deposit(event, usd_value).await?;

        let user = self
            .storage
            .update_balances(&wallet, usd_value, usd_value, &UsdValue::zero())
            .await?;

        info!(
            wallet = %wallet,
            usd = %usd_value,
            total = %user.total_usd_balance,
            "Deposit credited"
        );
        Ok(())
    }

    async fn apply_withdraw_request(&self, event: &VaultEvent, usd_value: &UsdValue) -> Result<()> {
        let wallet = addr_key(&event.sender);
        self.storage.upsert_user(&wallet).await?;

        let deposits = self.storage.deposits_usd_total(&wallet).await?;
        let completed = self
            .storage
            .withdrawals_usd_total(&wallet, WithdrawalStatus::Completed)
            .await?;
        let pending = self
            .storage
            .withdrawals_usd_total(&wallet, WithdrawalStatus::Pending)
            .await?;
        let borrowed = self.storage.active_borrows_usd_total(&wallet).await?;

        let available = deposits - &completed - &pending - &borrowed;

        if available < *usd_value {
            warn!(
                wallet = %wallet,
                requested = %usd_value,
                available = %available,
                "Withdrawal rejected: insufficient available balance"
            );
            self.storage
                .insert_withdrawal(event, usd_value, WithdrawalStatus::Rejected)
                .await?;
            return Ok(());
        }

        self.storage
            .insert_withdrawal(event, usd_value, WithdrawalStatus::Pending)
            .await?;
        let negative = UsdValue::zero() - usd_value;
        self.storage
            .update_balances(&wallet, &UsdValue::zero(), &negative, &UsdValue::zero())
            .await?;

        let request_id = event.request_id.unwrap_or(B256::ZERO);
        let proof = self.withdrawal_proof(&event.sender, &event.token_id).await?;

        let Some(handler) = self.vault_handlers.get(&event.chain_id).copied() else {
            warn!(
                chain_id = event.chain_id,
                request_id = %request_id,
                "No vault handler configured, withdrawal left pending"
            );
            return Ok(());
        };

        if let Err(e) = self
            .relayer
            .complete_withdraw(
                event.chain_id,
                handler,
                request_id,
                proof,
                encode_asset(&event.asset),
            )
            .await
        {
            // The withdrawal stays PENDING; completion arrives as a
            // WITHDRAW event once the relayer retries out of band.
            warn!(request_id = %request_id, error = %e, "completeWithdraw failed");
        }

        info!(wallet = %wallet, usd = %usd_value, request_id = %request_id, "Withdrawal pending");
        Ok(())
    }

    /// The proof argument for `completeWithdraw`: the Merkle proof when one
    /// exists, `[root]` when the proof is empty but a root exists, `[]`
    /// otherwise.
    async fn withdrawal_proof(&self, sender: &Address, token_id: &TokenId) -> Result<Vec<B256>> {
        if let Some(result) = self.merkle.get_proof(sender, token_id).await? {
            if result.proof.is_empty() {
                return Ok(vec![result.root]);
            }
            return Ok(result.proof);
        }

        match self.merkle.current_root().await {
            Some(root) => Ok(vec![root]),
            None => Ok(Vec::new()),
        }
    }

    async fn apply_withdraw_completion(&self, event: &VaultEvent) -> Result<()> {
        let Some(request_id) = event.request_id else {
            warn!(tx = %event.tx_hash, "Withdraw completion without request id, dropped");
            return Ok(());
        };

        // Resolution is strictly by request id; matching by user/asset/amount
        // can re-tag a different pending row.
        let Some(withdrawal) = self.storage.pending_withdrawal_by_request(&request_id).await? else {
            warn!(request_id = %request_id, "Withdraw completion with no pending request, dropped");
            return Ok(());
        };

        self.storage.complete_withdrawal(withdrawal.id).await?;

        // The floating balance was debited at request time; only the total
        // moves here.
        let negative = UsdValue::zero() - &withdrawal.usd_value;
        let user = self
            .storage
            .update_balances(
                &withdrawal.sender,
                &negative,
                &UsdValue::zero(),
                &UsdValue::zero(),
            )
            .await?;

        info!(
            wallet = %withdrawal.sender,
            usd = %withdrawal.usd_value,
            request_id = %request_id,
            total = %user.total_usd_balance,
            "Withdrawal completed"
        );
        Ok(())
    }

    // ---- relayer events --------------------------------------------------

    async fn handle_relayer_event(
        &self,
        event: &RelayerEvent,
        erc20_transfers: &[Erc20TransferEvent],
    ) -> Result<()> {
        match event.kind {
            RelayerEventKind::CollateralRequest => {
                let fresh = self.storage.insert_relayer_event(event).await?;
                if !fresh {
                    debug!(request_id = %event.request_id, "Duplicate collateral request dropped");
                    return Ok(());
                }
                self.process_collateral_request(event.request_id, event.chain_id)
                    .await
            }
            RelayerEventKind::CollateralProcess => self.apply_collateral_process(event).await,
            RelayerEventKind::Repay => self.apply_repay(event, erc20_transfers).await,
        }
    }

    /// Validate a pending collateral request and report the verdict on chain.
    ///
    /// Also invoked by the startup sweep over still-PENDING requests.
    pub async fn process_collateral_request(&self, request_id: B256, chain_id: u64) -> Result<()> {
        let Some(record) = self
            .storage
            .get_relayer_event(&request_id, chain_id, RelayerEventKind::CollateralRequest.as_str())
            .await?
        else {
            warn!(request_id = %request_id, "No stored collateral request to process");
            return Ok(());
        };

        if record.status != RelayerEventStatus::Pending {
            debug!(request_id = %request_id, status = record.status.as_str(), "Request already settled");
            return Ok(());
        }

        if let Some(reason) = self.validate_collateral_request(&record).await? {
            return self.reject_request(&record, &reason).await;
        }

        let token_id = record
            .token_id
            .ok_or_else(|| anyhow::anyhow!("Collateral request without token id"))?;
        let asset = Address::from_str(record.asset.as_deref().unwrap_or_default())
            .context("Collateral request with invalid asset")?;

        let (_total_value, total_ltv) = self.token_collateral_totals(&token_id).await?;
        let utilization = self.token_utilization(&token_id).await?;

        let amount_usd = self
            .oracle
            .usd_value(record.chain_id, &asset, record.amount)
            .await
            .context("Failed to price collateral request")?;

        let projected = utilization.clone() + &amount_usd;
        if projected > total_ltv {
            info!(
                request_id = %request_id,
                utilization = %utilization,
                requested = %amount_usd,
                headroom = %total_ltv,
                "Collateral request exceeds headroom"
            );
            return self.reject_request(&record, REASON_EXCEEDS_LTV).await;
        }

        self.relayer
            .process_request(record.chain_id, record.request_id, true)
            .await
            .context("processRequest(approve) failed")?;

        self.storage
            .set_relayer_event_status(
                &record.request_id,
                record.chain_id,
                record.event_type.as_str(),
                RelayerEventStatus::Approved,
                None,
                None,
            )
            .await?;

        info!(request_id = %request_id, amount_usd = %amount_usd, "Collateral request approved");

        // An out-of-order PROCESS may already have been observed for this
        // request; applying it now converges with the in-order outcome.
        if let Some(process) = self
            .storage
            .get_relayer_event(
                &request_id,
                chain_id,
                RelayerEventKind::CollateralProcess.as_str(),
            )
            .await?
        {
            if process.status == RelayerEventStatus::Approved {
                info!(request_id = %request_id, "Applying previously observed process outcome");
                self.activate_borrow(&record, process.timestamp as i64).await?;
            }
        }

        Ok(())
    }

    /// Pre-flight validation; returns the rejection reason on failure.
    async fn validate_collateral_request(
        &self,
        record: &RelayerEventRecord,
    ) -> Result<Option<String>> {
        if let Some(deadline) = record.deadline {
            if deadline < chrono::Utc::now().timestamp() {
                return Ok(Some("Request deadline expired".to_string()));
            }
        }

        if self.storage.get_user(&record.sender).await?.is_none() {
            return Ok(Some("Unknown user".to_string()));
        }

        let Some(token_id) = record.token_id else {
            return Ok(Some("Missing token id".to_string()));
        };
        let owner = Address::from_str(&record.sender)
            .with_context(|| format!("Invalid sender address: {}", record.sender))?;

        let owns = self
            .merkle
            .verify_ownership(&owner, &token_id, self.allow_deposit_fallback)
            .await?;
        if !owns {
            return Ok(Some("NFT ownership verification failed".to_string()));
        }

        Ok(None)
    }

    async fn reject_request(&self, record: &RelayerEventRecord, reason: &str) -> Result<()> {
        warn!(request_id = %record.request_id, reason, "Collateral request rejected");

        if let Err(e) = self
            .relayer
            .process_request(record.chain_id, record.request_id, false)
            .await
        {
            warn!(request_id = %record.request_id, error = %e, "processRequest(reject) failed");
        }

        self.storage
            .set_relayer_event_status(
                &record.request_id,
                record.chain_id,
                record.event_type.as_str(),
                RelayerEventStatus::Rejected,
                Some(reason),
                None,
            )
            .await?;
        Ok(())
    }

    /// Collateral value and LTV headroom for a position, summed across every
    /// chain's deposits. An asset with no configured LTV contributes value
    /// but no headroom.
    async fn token_collateral_totals(&self, token_id: &TokenId) -> Result<(UsdValue, UsdValue)> {
        let deposits = self.storage.deposits_for_token(token_id).await?;

        let mut total_value = UsdValue::zero();
        let mut total_ltv = UsdValue::zero();

        for deposit in &deposits {
            total_value += &deposit.usd_value;

            let asset = Address::from_str(&deposit.asset)
                .with_context(|| format!("Invalid asset address in deposit: {}", deposit.asset))?;
            match self
                .assets
                .get(deposit.chain_id, &asset)
                .and_then(|a| a.ltv_ratio())
            {
                Some(ratio) => {
                    let weighted = deposit.usd_value.as_decimal() * &ratio;
                    total_ltv += &UsdValue::from_decimal(weighted);
                }
                None => {
                    warn!(
                        chain_id = deposit.chain_id,
                        asset = %deposit.asset,
                        "NO LTV CONFIGURED for asset, contributing zero headroom"
                    );
                }
            }
        }

        Ok((total_value, total_ltv))
    }

    /// Current utilization against a position: the sum over distinct
    /// (chain, protocol) pairs with active borrows, scaled down from 1e6.
    async fn token_utilization(&self, token_id: &TokenId) -> Result<UsdValue> {
        let borrows = self.storage.active_borrows_for_token(token_id).await?;

        let mut seen: HashSet<(u64, String)> = HashSet::new();
        let mut total = UsdValue::zero();

        for borrow in &borrows {
            if !seen.insert((borrow.chain_id, borrow.protocol.clone())) {
                continue;
            }
            let protocol = Address::from_str(&borrow.protocol)
                .with_context(|| format!("Invalid protocol address: {}", borrow.protocol))?;
            let raw = self
                .lending
                .utilization(borrow.chain_id, protocol, token_id)
                .await
                .with_context(|| format!("utilization query failed at {}", borrow.protocol))?;

            let scaled =
                BigDecimal::from(raw) / BigDecimal::from(UTILIZATION_SCALE);
            total += &UsdValue::from_decimal(scaled);
        }

        Ok(total)
    }

    async fn apply_collateral_process(&self, event: &RelayerEvent) -> Result<()> {
        // Record the PROCESS observation itself; a replay stops here.
        let fresh = self.storage.insert_relayer_event(event).await?;
        if !fresh {
            debug!(request_id = %event.request_id, "Duplicate collateral process dropped");
            return Ok(());
        }

        let approved = event.process_status == Some(1);
        let error_data = event
            .error_data
            .as_ref()
            .filter(|d| !d.is_empty())
            .map(|d| format!("0x{}", hex::encode(d)));

        // The PROCESS record carries its own outcome so a late-arriving
        // REQUEST can still converge to the in-order result.
        self.storage
            .set_relayer_event_status(
                &event.request_id,
                event.chain_id,
                RelayerEventKind::CollateralProcess.as_str(),
                if approved {
                    RelayerEventStatus::Approved
                } else {
                    RelayerEventStatus::Rejected
                },
                error_data.as_deref(),
                Some(&event.tx_hash),
            )
            .await?;

        let Some(request) = self
            .storage
            .get_relayer_event(
                &event.request_id,
                event.chain_id,
                RelayerEventKind::CollateralRequest.as_str(),
            )
            .await?
        else {
            // Out-of-order PROCESS: dropped for now; the recorded outcome is
            // applied when the REQUEST arrives and validates.
            warn!(
                request_id = %event.request_id,
                "Collateral process without prior request, dropped"
            );
            return Ok(());
        };

        self.storage
            .set_relayer_event_status(
                &event.request_id,
                event.chain_id,
                RelayerEventKind::CollateralRequest.as_str(),
                if approved {
                    RelayerEventStatus::Approved
                } else {
                    RelayerEventStatus::Rejected
                },
                error_data.as_deref(),
                Some(&event.tx_hash),
            )
            .await?;

        if !approved {
            info!(request_id = %event.request_id, "Collateral request rejected on chain");
            return Ok(());
        }

        self.activate_borrow(&request, event.timestamp as i64).await
    }

    /// Open the borrow for an approved request and move the balances.
    async fn activate_borrow(&self, request: &RelayerEventRecord, timestamp: i64) -> Result<()> {
        let token_id = request
            .token_id
            .ok_or_else(|| anyhow::anyhow!("Approved request without token id"))?;
        let asset = Address::from_str(request.asset.as_deref().unwrap_or_default())
            .context("Approved request with invalid asset")?;
        let protocol = request
            .protocol
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Approved request without protocol"))?;

        let amount_usd = self
            .oracle
            .usd_value(request.chain_id, &asset, request.amount)
            .await
            .context("Failed to price approved borrow")?;

        self.storage.upsert_user(&request.sender).await?;
        self.storage
            .insert_borrow(
                request.chain_id,
                &request.request_id,
                &request.sender,
                &token_id,
                &protocol,
                request.asset.as_deref().unwrap_or_default(),
                &request.amount,
                &amount_usd,
                timestamp,
            )
            .await?;

        // Borrowing locks collateral: the borrowed amount moves out of the
        // floating balance, keeping floating = total - borrowed - pending.
        let locked = UsdValue::zero() - &amount_usd;
        let user = self
            .storage
            .update_balances(&request.sender, &UsdValue::zero(), &locked, &amount_usd)
            .await?;

        info!(
            wallet = %request.sender,
            request_id = %request.request_id,
            usd = %amount_usd,
            borrowed = %user.borrowed_usd_amount,
            "Borrow activated"
        );
        Ok(())
    }

    async fn apply_repay(
        &self,
        event: &RelayerEvent,
        erc20_transfers: &[Erc20TransferEvent],
    ) -> Result<()> {
        let wallet = addr_key(&event.sender);

        // The repaid asset is whichever ERC-20 moved in the same transaction.
        let Some(transfer) = erc20_transfers.first() else {
            warn!(tx = %event.tx_hash, "Repay without co-emitted ERC-20 transfer, dropped");
            return Ok(());
        };

        let usd = self
            .oracle
            .usd_value(event.chain_id, &transfer.token, event.amount)
            .await
            .context("Failed to price repayment")?;

        if self.storage.get_user(&wallet).await?.is_none() {
            warn!(wallet = %wallet, "Repay from unknown user, dropped");
            return Ok(());
        }

        let outstanding = self.storage.active_borrows_usd_total(&wallet).await?;
        let repaid = usd.min(outstanding.clone());
        if repaid.is_zero() {
            debug!(wallet = %wallet, "Repay with no outstanding borrows, nothing to do");
            return Ok(());
        }

        // Walk active borrows oldest first, closing or reducing.
        let now = chrono::Utc::now().timestamp();
        let mut remaining = repaid.clone();
        for borrow in self.storage.active_borrows(&wallet).await? {
            if remaining.is_zero() {
                break;
            }
            if borrow.usd_value <= remaining {
                remaining -= &borrow.usd_value;
                self.storage.close_borrow(borrow.id, now).await?;
            } else {
                let left = borrow.usd_value.clone() - &remaining;
                self.storage.reduce_borrow(borrow.id, &left).await?;
                remaining = UsdValue::zero();
            }
        }

        let negative = UsdValue::zero() - &repaid;
        let user = self
            .storage
            .update_balances(&wallet, &UsdValue::zero(), &repaid, &negative)
            .await?;

        info!(
            wallet = %wallet,
            repaid = %repaid,
            borrowed = %user.borrowed_usd_amount,
            "Repayment applied"
        );
        Ok(())
    }

    /// Re-run validation for every still-PENDING collateral request.
    ///
    /// There is no scheduler for this; it runs at startup and on the
    /// `sweep-pending` subcommand.
    pub async fn sweep_pending_requests(&self) -> Result<usize> {
        let pending = self.storage.pending_collateral_requests().await?;
        let count = pending.len();

        for record in pending {
            if let Err(e) = self
                .process_collateral_request(record.request_id, record.chain_id)
                .await
            {
                warn!(request_id = %record.request_id, error = format!("{e:#}"), "Sweep failed for request");
            }
        }

        Ok(count)
    }
}
