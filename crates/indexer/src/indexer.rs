//! Per-chain indexing orchestration.
//!
//! One [`ChainIndexer`] instance owns one chain: it tracks the chain head,
//! processes confirmed blocks sequentially through the [`BlockProcessor`],
//! records progress in the block ledger, and publishes matched transactions
//! to the message bus in block order. Reorg handling is a bounded re-scan:
//! divergence deeper than [`REORG_DEPTH`] pauses the indexer for external
//! intervention.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vaultbridge_bus::{ChainMessage, MessagePublisher};
use vaultbridge_core::{MAX_RETRIES, REORG_DEPTH};

use crate::client::{retry_rpc, BlockData, ChainClient};
use crate::filter::{TopicFilter, TopicMatcher};
use crate::processor::BlockProcessor;
use crate::storage::{BlockStatus, Storage};

/// Cursor sentinel meaning "no block processed yet".
const NO_BLOCK: u64 = u64::MAX;

/// Per-chain indexer tuning.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Chain id.
    pub chain_id: u64,
    /// Human-readable chain name (flows into every published message).
    pub chain_name: String,
    /// Bus channel to publish on.
    pub channel: String,
    /// Blocks behind the head considered final.
    pub block_confirmations: u64,
    /// Blocks processed per indexing tick.
    pub batch_size: u32,
    /// How often the chain head is refreshed.
    pub latest_block_interval: Duration,
    /// How often the continuous indexing tick fires.
    pub continuous_interval: Duration,
    /// How often the health check runs.
    pub health_interval: Duration,
    /// Base delay for RPC retries.
    pub retry_delay: Duration,
    /// RPC retry attempts.
    pub max_retries: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: 0,
            chain_name: String::new(),
            channel: "vaultbridge:events".to_string(),
            block_confirmations: 2,
            batch_size: 10,
            latest_block_interval: Duration::from_secs(2),
            continuous_interval: Duration::from_secs(1),
            health_interval: Duration::from_secs(60),
            retry_delay: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

/// Outcome of processing one block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOutcome {
    /// Processed (or verified already processed); cursor advances.
    Advanced,
    /// Retries exhausted; cursor advances past the parked block.
    SkippedExhausted,
    /// Failed this attempt; cursor stays, the height is retried.
    Failed,
}

/// Live indexer state, readable from other tasks.
#[derive(Debug, Default)]
pub struct IndexerState {
    latest_seen: AtomicU64,
    latest_processed: AtomicU64,
    running: AtomicBool,
    paused: AtomicBool,
    /// Set when the health check paused the indexer; only such pauses are
    /// auto-resumed on recovery. A reorg pause stays manual.
    auto_paused: AtomicBool,
    in_flight: AtomicBool,
}

/// Orchestrates the per-block pipeline for one chain.
pub struct ChainIndexer {
    client: Arc<dyn ChainClient>,
    publisher: Arc<dyn MessagePublisher>,
    storage: Storage,
    processor: BlockProcessor,
    matcher: RwLock<TopicMatcher>,
    config: IndexerConfig,
    state: IndexerState,
    current_block_cancel: Mutex<Option<CancellationToken>>,
}

impl ChainIndexer {
    /// Assemble an indexer from its collaborators.
    pub fn new(
        client: Arc<dyn ChainClient>,
        publisher: Arc<dyn MessagePublisher>,
        storage: Storage,
        processor: BlockProcessor,
        filters: Vec<TopicFilter>,
        config: IndexerConfig,
    ) -> Self {
        let state = IndexerState {
            latest_seen: AtomicU64::new(0),
            latest_processed: AtomicU64::new(NO_BLOCK),
            ..Default::default()
        };

        Self {
            client,
            publisher,
            storage,
            processor,
            matcher: RwLock::new(TopicMatcher::with_filters(filters)),
            config,
            state,
            current_block_cancel: Mutex::new(None),
        }
    }

    /// Add a topic filter at runtime.
    pub fn add_filter(&self, filter: TopicFilter) {
        self.matcher.write().add(filter);
    }

    /// Remove all filters for a topic hash at runtime.
    pub fn remove_filter(&self, hash: &alloy_primitives::B256) {
        self.matcher.write().remove(hash);
    }

    /// Highest block seen at the chain head.
    pub fn latest_seen(&self) -> u64 {
        self.state.latest_seen.load(Ordering::SeqCst)
    }

    /// Highest block fully processed this session, if any.
    pub fn latest_processed(&self) -> Option<u64> {
        match self.state.latest_processed.load(Ordering::SeqCst) {
            NO_BLOCK => None,
            n => Some(n),
        }
    }

    /// Whether the indexer is paused (reorg overflow or manual).
    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    /// Pause indexing and cancel the in-flight block, if any.
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.current_block_cancel.lock().as_ref() {
            cancel.cancel();
        }
        warn!(chain = %self.config.chain_name, "Indexer paused");
    }

    /// Resume a paused indexer.
    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
        info!(chain = %self.config.chain_name, "Indexer resumed");
    }

    /// Run the indexer until `shutdown` fires.
    ///
    /// Startup resumes from the last processed block (or `head -
    /// confirmations` on a fresh database), then drives three periodic
    /// loops from a single task: head refresh, the continuous indexing
    /// tick, and the health check. Processing stays sequential by
    /// construction: the watermark is monotone and messages leave in
    /// block order.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.startup().await?;
        self.state.running.store(true, Ordering::SeqCst);

        let mut heads = match self.client.subscribe_new_blocks().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(
                    chain = %self.config.chain_name,
                    error = %e,
                    "New-heads subscription unavailable, relying on polling"
                );
                None
            }
        };

        let mut latest_tick = tokio::time::interval(self.config.latest_block_interval);
        let mut index_tick = tokio::time::interval(self.config.continuous_interval);
        let mut health_tick = tokio::time::interval(self.config.health_interval);

        info!(
            chain = %self.config.chain_name,
            chain_id = self.config.chain_id,
            latest_processed = ?self.latest_processed(),
            "Indexer running"
        );

        loop {
            let head_recv = async {
                match heads.as_mut() {
                    Some(sub) => sub.rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            let mut heads_closed = false;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(chain = %self.config.chain_name, "Shutdown received, stopping indexer");
                    if let Some(cancel) = self.current_block_cancel.lock().as_ref() {
                        cancel.cancel();
                    }
                    break;
                }
                head = head_recv => {
                    if let Some(head) = head {
                        self.state.latest_seen.fetch_max(head.number, Ordering::SeqCst);
                    } else {
                        warn!(chain = %self.config.chain_name, "Heads stream ended, relying on polling");
                        heads_closed = true;
                    }
                }
                _ = latest_tick.tick() => {
                    if let Err(e) = self.refresh_latest().await {
                        debug!(chain = %self.config.chain_name, error = %e, "Head refresh failed");
                    }
                }
                _ = index_tick.tick() => {
                    if !self.is_paused() && !self.state.in_flight.load(Ordering::SeqCst) {
                        self.state.in_flight.store(true, Ordering::SeqCst);
                        if let Err(e) = self.tick(&shutdown).await {
                            warn!(chain = %self.config.chain_name, error = %e, "Indexing tick failed");
                        }
                        self.state.in_flight.store(false, Ordering::SeqCst);
                    }
                }
                _ = health_tick.tick() => {
                    self.health_check().await;
                }
            }

            if heads_closed {
                heads = None;
            }
        }

        if let Some(sub) = heads {
            sub.unsubscribe();
        }
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Determine the start block and prime the cursors.
    async fn startup(&self) -> Result<()> {
        let latest = retry_rpc(
            || self.client.latest_block_number(),
            self.config.max_retries,
            self.config.retry_delay,
        )
        .await
        .context("Failed to fetch chain head at startup")?;
        self.state.latest_seen.store(latest, Ordering::SeqCst);

        match self.storage.latest_processed(self.config.chain_id).await? {
            Some(marker) => {
                info!(
                    chain = %self.config.chain_name,
                    resume_from = marker.number + 1,
                    "Resuming from block ledger"
                );
                self.state
                    .latest_processed
                    .store(marker.number, Ordering::SeqCst);
            }
            None => {
                let start = latest.saturating_sub(self.config.block_confirmations);
                info!(
                    chain = %self.config.chain_name,
                    start,
                    "Fresh database, starting near the head"
                );
                // Cursor sits just below the first block to process
                self.state
                    .latest_processed
                    .store(start.saturating_sub(1), Ordering::SeqCst);
            }
        }

        Ok(())
    }

    async fn refresh_latest(&self) -> Result<()> {
        let latest = self.client.latest_block_number().await?;
        self.state.latest_seen.fetch_max(latest, Ordering::SeqCst);
        Ok(())
    }

    /// One continuous-indexing tick: process up to `batch_size` confirmed
    /// blocks, sequentially, stopping early on failure or shutdown.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<()> {
        let target = self
            .latest_seen()
            .saturating_sub(self.config.block_confirmations);

        for _ in 0..self.config.batch_size {
            if shutdown.is_cancelled() || self.is_paused() {
                break;
            }

            let cursor = self.state.latest_processed.load(Ordering::SeqCst);
            let next = if cursor == NO_BLOCK { 0 } else { cursor + 1 };
            if next > target {
                break;
            }

            match self.process_block_number(next, shutdown).await {
                Ok(BlockOutcome::Advanced) | Ok(BlockOutcome::SkippedExhausted) => {
                    self.state.latest_processed.store(next, Ordering::SeqCst);
                }
                Ok(BlockOutcome::Failed) => break,
                Err(e) => {
                    warn!(
                        chain = %self.config.chain_name,
                        block = next,
                        error = %e,
                        "Block processing error"
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    /// The full per-block pipeline for one height.
    async fn process_block_number(
        &self,
        number: u64,
        shutdown: &CancellationToken,
    ) -> Result<BlockOutcome> {
        // Duplicate suppression: a completed height is never re-published.
        if self.storage.is_processed(self.config.chain_id, number).await? {
            return Ok(BlockOutcome::Advanced);
        }

        let block = retry_rpc(
            || self.client.get_block_with_transactions(number),
            self.config.max_retries,
            self.config.retry_delay,
        )
        .await?;

        let Some(block) = block else {
            if let Some(row) = self
                .storage
                .get_unprocessed(self.config.chain_id, number)
                .await?
            {
                self.storage
                    .mark_failed(row.id, "getBlockWithTransactions returned null")
                    .await?;
            }
            anyhow::bail!("Block {number} not available");
        };

        // Reorg check: the incoming parent must extend what we processed.
        if let Some(prev) = self
            .storage
            .processed_block(self.config.chain_id, number.saturating_sub(1))
            .await?
        {
            if number > 0 && !prev.is_reorged && prev.hash != block.header.parent_hash {
                self.handle_reorg(number).await?;
                return Ok(BlockOutcome::Failed);
            }
        }

        let row = self
            .storage
            .add_unprocessed(self.config.chain_id, &block.header)
            .await?;

        // A completed row with this hash means publish already happened;
        // only the progress marker may be missing.
        if row.status == BlockStatus::Completed && row.hash == block.header.hash {
            self.storage
                .add_processed(self.config.chain_id, &block.header, 0)
                .await?;
            return Ok(BlockOutcome::Advanced);
        }

        if row.retry_count >= MAX_RETRIES {
            error!(
                chain = %self.config.chain_name,
                block = number,
                retries = row.retry_count,
                "Retries exhausted, advancing past block"
            );
            return Ok(BlockOutcome::SkippedExhausted);
        }

        self.storage.mark_processing(row.id).await?;

        let block_cancel = shutdown.child_token();
        *self.current_block_cancel.lock() = Some(block_cancel.clone());

        let matcher = self.matcher.read().clone();
        let processed = self
            .processor
            .process_block(&block, &matcher, &block_cancel)
            .await;
        *self.current_block_cancel.lock() = None;

        let matched = match processed {
            Ok(matched) => matched,
            Err(e) => {
                self.storage.mark_failed(row.id, &format!("{e:#}")).await?;
                return Ok(BlockOutcome::Failed);
            }
        };

        let count = matched.len() as u64;
        if !matched.is_empty() {
            if let Err(e) = self.publish_block(&block, matched).await {
                self.storage
                    .mark_failed(row.id, &format!("publish failed: {e:#}"))
                    .await?;
                return Ok(BlockOutcome::Failed);
            }
        }

        // These two commit together; if the marker write fails the row stays
        // COMPLETED and the next pass only re-adds the marker (no re-publish).
        self.storage.mark_completed(row.id).await?;
        if let Err(e) = self
            .storage
            .add_processed(self.config.chain_id, &block.header, count)
            .await
        {
            error!(
                chain = %self.config.chain_name,
                block = number,
                error = %e,
                "Progress marker write failed after publish"
            );
            return Ok(BlockOutcome::Failed);
        }

        if count > 0 {
            info!(
                chain = %self.config.chain_name,
                block = number,
                matched = count,
                "Block published"
            );
        } else {
            debug!(chain = %self.config.chain_name, block = number, "Block empty");
        }

        Ok(BlockOutcome::Advanced)
    }

    /// Publish a block's matched transactions as one ordered batch.
    async fn publish_block(
        &self,
        block: &BlockData,
        matched: Vec<vaultbridge_bus::FilteredTransaction>,
    ) -> Result<()> {
        let mut messages: Vec<ChainMessage> = matched
            .into_iter()
            .map(ChainMessage::from_transaction)
            .collect();

        // (blockNumber, logIndex) order within the block
        messages.sort_by_key(|m| {
            (
                m.transaction.block_number,
                m.transaction
                    .logs
                    .first()
                    .map(|l| l.log_index)
                    .unwrap_or_default(),
            )
        });

        self.publisher
            .publish_batch(&self.config.channel, messages)
            .await
            .with_context(|| format!("Failed to publish block {}", block.header.number))?;

        Ok(())
    }

    /// Bounded reorg re-scan.
    ///
    /// Walks back up to [`REORG_DEPTH`] blocks comparing stored hashes with
    /// the chain, marks divergent heights reorged in both tables, and drops
    /// the cursor to the common ancestor so the fork is re-processed. A
    /// divergence deeper than the bound pauses the indexer.
    async fn handle_reorg(&self, detected_at: u64) -> Result<()> {
        warn!(
            chain = %self.config.chain_name,
            block = detected_at,
            "Reorg detected, scanning for common ancestor"
        );

        let mut divergent = Vec::new();
        let mut ancestor: Option<u64> = None;

        let floor = detected_at.saturating_sub(REORG_DEPTH);
        let mut height = detected_at.saturating_sub(1);

        loop {
            let stored = self
                .storage
                .processed_block(self.config.chain_id, height)
                .await?;

            let on_chain = retry_rpc(
                || self.client.get_block(height),
                self.config.max_retries,
                self.config.retry_delay,
            )
            .await?;

            match (stored, on_chain) {
                (Some(stored), Some(on_chain)) if stored.hash == on_chain.hash => {
                    ancestor = Some(height);
                    break;
                }
                (Some(_), _) => divergent.push(height),
                // Nothing stored this deep: treat as the boundary
                (None, _) => {
                    ancestor = Some(height);
                    break;
                }
            }

            if height == 0 || height <= floor {
                break;
            }
            height -= 1;
        }

        let Some(ancestor) = ancestor else {
            error!(
                chain = %self.config.chain_name,
                depth = REORG_DEPTH,
                "Reorg deeper than scan bound, pausing for intervention"
            );
            self.pause();
            return Ok(());
        };

        if !divergent.is_empty() {
            info!(
                chain = %self.config.chain_name,
                ancestor,
                divergent = divergent.len(),
                "Rolling back reorged blocks"
            );
            self.storage
                .mark_reorged(self.config.chain_id, &divergent)
                .await?;
            self.storage
                .mark_processed_reorged(self.config.chain_id, &divergent)
                .await?;
        }

        // Re-process the fork from the ancestor; fresh PENDING rows are
        // created per height as the loop re-enqueues them.
        self.state.latest_processed.store(ancestor, Ordering::SeqCst);

        Ok(())
    }

    /// Once-a-minute liveness probe with auto stop/start.
    ///
    /// A degraded dependency stops the indexer (pause, cancelling in-flight
    /// work) so the pipeline never grinds against a dead RPC or bus. The
    /// same cadence then drives recovery: the bus is reconnected, the chain
    /// is re-probed, and once both answer the indexer restarts. Only pauses
    /// taken here are auto-resumed; a reorg pause waits for intervention.
    async fn health_check(&self) {
        let mut chain_ok = self.client.healthy().await;
        let mut bus_ok = self.publisher.connected();

        if !(chain_ok && bus_ok) {
            warn!(
                chain = %self.config.chain_name,
                chain_ok,
                bus_ok,
                "Health check degraded, stopping indexer"
            );

            if !self.is_paused() {
                self.state.auto_paused.store(true, Ordering::SeqCst);
                self.pause();
            }

            if !bus_ok {
                match self.publisher.connect().await {
                    Ok(()) => bus_ok = true,
                    Err(e) => {
                        error!(chain = %self.config.chain_name, error = %e, "Bus reconnect failed");
                    }
                }
            }

            if !chain_ok {
                // The HTTP client holds no connection state; a recovered
                // endpoint answers on the next probe.
                chain_ok = self.client.healthy().await;
                if !chain_ok {
                    error!(
                        chain = %self.config.chain_name,
                        "Chain still unreachable, indexer stays stopped"
                    );
                }
            }
        }

        if chain_ok && bus_ok && self.state.auto_paused.load(Ordering::SeqCst) {
            self.state.auto_paused.store(false, Ordering::SeqCst);
            self.resume();
            info!(chain = %self.config.chain_name, "Indexer restarted after recovery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TxCache;
    use crate::client::mock::MockChainClient;
    use crate::client::{BlockHeaderData, LogData, ReceiptData, TxData};
    use crate::processor::ProcessorConfig;
    use crate::storage::test_util;
    use alloy_primitives::{Address, B256, U256};
    use vaultbridge_bus::{InMemoryBus, MessageSubscriber, Subscription};
    use vaultbridge_core::ERC721_TRANSFER_TOPIC;

    const CHANNEL: &str = "vaultbridge:events";

    fn header(number: u64, hash: B256, parent: B256) -> BlockHeaderData {
        BlockHeaderData {
            number,
            hash,
            parent_hash: parent,
            timestamp: 1_700_000_000 + number,
        }
    }

    fn transfer_tx(seed: u8, nft: Address) -> (TxData, ReceiptData) {
        let tx = TxData {
            hash: B256::from([seed; 32]),
            from: Address::from([0xaa; 20]),
            to: Some(nft),
            value: U256::ZERO,
            input: "0x23b872dd".to_string(),
            gas_price: None,
        };
        let receipt = ReceiptData {
            tx_hash: tx.hash,
            status: true,
            gas_used: U256::from(60_000u64),
            effective_gas_price: None,
            logs: vec![LogData {
                address: nft,
                topics: vec![
                    ERC721_TRANSFER_TOPIC,
                    B256::ZERO,
                    B256::from([0x01; 32]),
                    B256::from([seed; 32]),
                ],
                data: "0x".to_string(),
                log_index: seed as u64,
            }],
        };
        (tx, receipt)
    }

    struct Harness {
        client: MockChainClient,
        bus: Arc<InMemoryBus>,
        indexer: ChainIndexer,
        subscription: Subscription,
        _db: tempfile::NamedTempFile,
    }

    async fn harness(confirmations: u64) -> Harness {
        let client = MockChainClient::new(1);
        let (storage, db) = test_util::storage().await;

        let bus = Arc::new(InMemoryBus::new());
        MessagePublisher::connect(bus.as_ref()).await.unwrap();
        let subscription = MessageSubscriber::subscribe(bus.as_ref(), CHANNEL)
            .await
            .unwrap();

        let processor = BlockProcessor::new(
            Arc::new(client.clone()),
            Arc::new(TxCache::new(64)),
            "testchain",
            ProcessorConfig::default(),
        );

        let config = IndexerConfig {
            chain_id: 1,
            chain_name: "testchain".to_string(),
            channel: CHANNEL.to_string(),
            block_confirmations: confirmations,
            batch_size: 10,
            retry_delay: Duration::from_millis(1),
            max_retries: 1,
            ..Default::default()
        };

        let indexer = ChainIndexer::new(
            Arc::new(client.clone()),
            bus.clone(),
            storage,
            processor,
            vec![TopicFilter::new(ERC721_TRANSFER_TOPIC)],
            config,
        );

        Harness {
            client,
            bus,
            indexer,
            subscription,
            _db: db,
        }
    }

    fn hash(seed: u8) -> B256 {
        B256::from([seed; 32])
    }

    #[tokio::test]
    async fn test_processes_confirmed_blocks_in_order() {
        let mut h = harness(0).await;
        let nft = Address::from([0x11; 20]);

        let (tx1, r1) = transfer_tx(1, nft);
        let (tx2, r2) = transfer_tx(2, nft);
        h.client.push_receipt(r1);
        h.client.push_receipt(r2);

        h.client.push_block(BlockData {
            header: header(100, hash(100), hash(99)),
            transactions: vec![tx1],
        });
        h.client.push_block(BlockData {
            header: header(101, hash(101), hash(100)),
            transactions: vec![tx2],
        });

        h.indexer.startup().await.unwrap();
        // Fresh DB with 0 confirmations: start at the head (101); wind the
        // cursor back so both blocks process.
        h.indexer
            .state
            .latest_processed
            .store(99, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();

        assert_eq!(h.indexer.latest_processed(), Some(101));

        let first = h.subscription.recv().await.unwrap();
        let second = h.subscription.recv().await.unwrap();
        assert_eq!(first.transaction.block_number, 100);
        assert_eq!(second.transaction.block_number, 101);
        assert_eq!(h.bus.messages_published(), 2);
    }

    #[tokio::test]
    async fn test_replay_publishes_nothing() {
        let mut h = harness(0).await;
        let nft = Address::from([0x11; 20]);
        let (tx1, r1) = transfer_tx(1, nft);
        h.client.push_receipt(r1);
        h.client.push_block(BlockData {
            header: header(50, hash(50), hash(49)),
            transactions: vec![tx1],
        });

        h.indexer.startup().await.unwrap();
        h.indexer
            .state
            .latest_processed
            .store(49, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();
        assert_eq!(h.bus.messages_published(), 1);

        // Rewind the cursor and replay the same height
        h.indexer
            .state
            .latest_processed
            .store(49, Ordering::SeqCst);
        h.indexer.tick(&shutdown).await.unwrap();

        // Zero additional messages, one progress marker
        assert_eq!(h.bus.messages_published(), 1);
        assert!(h.subscription.recv().await.is_ok());
        assert!(h.subscription.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_respects_confirmation_depth() {
        let h = harness(2).await;
        let nft = Address::from([0x11; 20]);
        let (tx1, r1) = transfer_tx(1, nft);
        h.client.push_receipt(r1);

        // Head is 10; block 10 is only 0 deep, so nothing is confirmed yet
        h.client.push_block(BlockData {
            header: header(10, hash(10), hash(9)),
            transactions: vec![tx1],
        });

        h.indexer.startup().await.unwrap();
        h.indexer.state.latest_processed.store(9, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();

        assert_eq!(h.indexer.latest_processed(), Some(9));
        assert_eq!(h.bus.messages_published(), 0);
    }

    #[tokio::test]
    async fn test_reorg_rolls_back_and_reprocesses_fork() {
        let mut h = harness(0).await;
        let nft = Address::from([0x11; 20]);

        // Original chain: 204 -> 205(H1)
        let (tx1, r1) = transfer_tx(1, nft);
        h.client.push_receipt(r1);
        h.client.push_block(BlockData {
            header: header(204, hash(204), hash(203)),
            transactions: vec![],
        });
        h.client.push_block(BlockData {
            header: header(205, hash(205), hash(204)),
            transactions: vec![tx1],
        });

        h.indexer.startup().await.unwrap();
        h.indexer
            .state
            .latest_processed
            .store(203, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();
        assert_eq!(h.indexer.latest_processed(), Some(205));
        assert_eq!(h.bus.messages_published(), 1);

        // Fork: 205 is replaced by H2 with a different transfer, then 206
        let (tx2, r2) = transfer_tx(9, nft);
        h.client.push_receipt(r2);
        h.client.push_block(BlockData {
            header: header(205, hash(105), hash(204)),
            transactions: vec![tx2.clone()],
        });
        h.client.push_block(BlockData {
            header: header(206, hash(206), hash(105)),
            transactions: vec![],
        });

        // Processing 206 trips the parent-hash check, rolls back to 204,
        // then the next ticks replay 205 (H2) and 206.
        h.indexer.refresh_latest().await.unwrap();
        h.indexer.tick(&shutdown).await.unwrap();
        h.indexer.tick(&shutdown).await.unwrap();

        assert_eq!(h.indexer.latest_processed(), Some(206));

        // The fork block's transfer was published exactly once
        let first = h.subscription.recv().await.unwrap();
        let second = h.subscription.recv().await.unwrap();
        assert_eq!(first.transaction.block_number, 205);
        assert_eq!(second.transaction.hash, tx2.hash);
        assert_eq!(second.transaction.block_hash, hash(105));
        assert!(h.subscription.try_recv().unwrap().is_none());

        // The H1 marker is flagged reorged, the H2 marker is active
        let marker = h
            .indexer
            .storage
            .processed_block(1, 205)
            .await
            .unwrap()
            .unwrap();
        assert!(!marker.is_reorged);
        assert_eq!(marker.hash, hash(105));
    }

    #[tokio::test]
    async fn test_missing_block_marks_failure_and_blocks_cursor() {
        let h = harness(0).await;

        // Head says 10 but the block body is unavailable
        h.client.chain.latest.store(10, Ordering::SeqCst);

        h.indexer.startup().await.unwrap();
        h.indexer.state.latest_processed.store(9, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();

        assert_eq!(h.indexer.latest_processed(), Some(9));
    }

    #[tokio::test]
    async fn test_health_check_stops_and_restarts_on_chain_outage() {
        let h = harness(0).await;
        let nft = Address::from([0x11; 20]);

        let (tx1, r1) = transfer_tx(1, nft);
        h.client.push_receipt(r1);
        h.client.push_block(BlockData {
            header: header(100, hash(100), hash(99)),
            transactions: vec![tx1],
        });

        h.indexer.startup().await.unwrap();
        h.indexer
            .state
            .latest_processed
            .store(99, Ordering::SeqCst);

        // RPC goes dark: the probe stops the indexer
        h.client.chain.healthy.store(false, Ordering::SeqCst);
        h.indexer.health_check().await;
        assert!(h.indexer.is_paused());

        // A stopped indexer processes nothing even with work available
        let shutdown = CancellationToken::new();
        h.indexer.tick(&shutdown).await.unwrap();
        assert_eq!(h.indexer.latest_processed(), Some(99));
        assert_eq!(h.bus.messages_published(), 0);

        // Still dark on the next probe: stays stopped
        h.indexer.health_check().await;
        assert!(h.indexer.is_paused());

        // RPC recovers: the next probe restarts the indexer and work flows
        h.client.chain.healthy.store(true, Ordering::SeqCst);
        h.indexer.health_check().await;
        assert!(!h.indexer.is_paused());

        h.indexer.tick(&shutdown).await.unwrap();
        assert_eq!(h.indexer.latest_processed(), Some(100));
        assert_eq!(h.bus.messages_published(), 1);
    }

    #[tokio::test]
    async fn test_health_check_reconnects_bus_and_restarts() {
        let h = harness(0).await;
        h.indexer.startup().await.unwrap();

        // Bus drops; the probe stops the indexer, reconnects, and since the
        // chain still answers, restarts within the same pass
        h.bus.disconnect().await;
        assert!(!MessagePublisher::connected(h.bus.as_ref()));

        h.indexer.health_check().await;
        assert!(MessagePublisher::connected(h.bus.as_ref()));
        assert!(!h.indexer.is_paused());
    }

    #[tokio::test]
    async fn test_health_check_leaves_manual_pause_alone() {
        let h = harness(0).await;
        h.indexer.startup().await.unwrap();

        // A reorg-style pause is not the health check's to undo
        h.indexer.pause();
        h.indexer.health_check().await;
        assert!(h.indexer.is_paused());
    }
}
