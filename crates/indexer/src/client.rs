//! Abstract EVM chain client.
//!
//! The indexer talks to chains through the [`ChainClient`] capability so the
//! block pipeline can be driven by mocks in tests. [`HttpChainClient`] is the
//! production implementation: HTTP JSON-RPC for reads, an optional WebSocket
//! new-heads subscription with a 1 s polling fallback.

use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, BlockTransactionsKind};
use alloy::transports::http::{Client, Http};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Block header fields the indexer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaderData {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// A block together with its full transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    /// Header fields.
    pub header: BlockHeaderData,
    /// Full transaction objects, block order.
    pub transactions: Vec<TxData>,
}

/// Transaction metadata used by the pre-filter and the published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxData {
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient; None for contract creation.
    pub to: Option<Address>,
    /// Native value.
    pub value: U256,
    /// Calldata, 0x-prefixed hex ("0x" for plain transfers).
    pub input: String,
    /// Gas price, when the envelope carries one.
    pub gas_price: Option<U256>,
}

impl TxData {
    /// Whether this transaction carries calldata (i.e. is a contract call).
    pub fn has_calldata(&self) -> bool {
        self.input.len() > 2
    }
}

/// A single log from a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogData {
    /// Emitting contract.
    pub address: Address,
    /// Log topics, topic0 first.
    pub topics: Vec<B256>,
    /// ABI-encoded data, 0x-prefixed hex.
    pub data: String,
    /// Log index within the block.
    pub log_index: u64,
}

/// Receipt fields used for matching and publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptData {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Execution status (true = success).
    pub status: bool,
    /// Gas used.
    pub gas_used: U256,
    /// Effective gas price.
    pub effective_gas_price: Option<U256>,
    /// All logs emitted by the transaction.
    pub logs: Vec<LogData>,
}

/// A new-heads subscription: either a WebSocket push stream or a poll loop.
pub struct NewHeadsSubscription {
    /// Receiving end of the heads channel.
    pub rx: mpsc::Receiver<BlockHeaderData>,
    handle: JoinHandle<()>,
}

impl NewHeadsSubscription {
    /// Stop the background subscription task.
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

/// Capability for talking to one EVM chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number at the head of the chain.
    async fn latest_block_number(&self) -> Result<u64>;

    /// Fetch a block header by number.
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeaderData>>;

    /// Fetch a block with its full transactions.
    async fn get_block_with_transactions(&self, number: u64) -> Result<Option<BlockData>>;

    /// Fetch a transaction by hash.
    async fn get_transaction(&self, hash: B256) -> Result<Option<TxData>>;

    /// Fetch a transaction receipt by hash.
    async fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptData>>;

    /// The chain id this client serves.
    fn chain_id(&self) -> u64;

    /// Liveness probe: a successful network identity call (and, when push is
    /// configured, a live connection).
    async fn healthy(&self) -> bool;

    /// Subscribe to new heads (push when available, 1 s poll otherwise).
    async fn subscribe_new_blocks(&self) -> Result<NewHeadsSubscription>;
}

/// Production chain client over alloy HTTP (+ optional WS heads).
pub struct HttpChainClient {
    provider: RootProvider<Http<Client>>,
    ws_url: Option<String>,
    chain_id: u64,
}

impl HttpChainClient {
    /// Connect to a chain and verify its id matches the configured one.
    pub async fn connect(rpc_url: &str, ws_url: Option<String>, chain_id: u64) -> Result<Self> {
        let url = rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC URL: {rpc_url}"))?;

        let provider = ProviderBuilder::new().on_http(url);

        let reported = provider
            .get_chain_id()
            .await
            .context("Failed to query chain id")?;
        if reported != chain_id {
            anyhow::bail!("Chain id mismatch: configured {chain_id}, RPC reports {reported}");
        }

        Ok(Self {
            provider,
            ws_url,
            chain_id,
        })
    }

    fn convert_header(header: &alloy::rpc::types::Header) -> BlockHeaderData {
        BlockHeaderData {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
        }
    }

    fn convert_transaction(tx: &alloy::rpc::types::Transaction) -> TxData {
        use alloy::consensus::Transaction as _;

        TxData {
            hash: *tx.inner.tx_hash(),
            from: tx.from,
            to: tx.inner.to(),
            value: tx.inner.value(),
            input: format!("0x{}", hex::encode(tx.inner.input())),
            gas_price: tx.inner.gas_price().map(U256::from),
        }
    }

    fn convert_receipt(receipt: &alloy::rpc::types::TransactionReceipt) -> ReceiptData {
        let logs = receipt
            .inner
            .logs()
            .iter()
            .map(|log| LogData {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: format!("0x{}", hex::encode(&log.data().data)),
                log_index: log.log_index.unwrap_or_default(),
            })
            .collect();

        ReceiptData {
            tx_hash: receipt.transaction_hash,
            status: receipt.status(),
            gas_used: U256::from(receipt.gas_used),
            effective_gas_price: Some(U256::from(receipt.effective_gas_price)),
            logs,
        }
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn latest_block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("Failed to get block number")
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeaderData>> {
        let block = self
            .provider
            .get_block_by_number(
                BlockNumberOrTag::Number(number),
                BlockTransactionsKind::Hashes,
            )
            .await
            .with_context(|| format!("Failed to fetch block {number}"))?;

        Ok(block.map(|b| Self::convert_header(&b.header)))
    }

    async fn get_block_with_transactions(&self, number: u64) -> Result<Option<BlockData>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number), BlockTransactionsKind::Full)
            .await
            .with_context(|| format!("Failed to fetch block {number} with transactions"))?;

        let Some(block) = block else {
            return Ok(None);
        };

        let header = Self::convert_header(&block.header);
        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| Self::convert_transaction(&tx))
            .collect();

        Ok(Some(BlockData {
            header,
            transactions,
        }))
    }

    async fn get_transaction(&self, hash: B256) -> Result<Option<TxData>> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .with_context(|| format!("Failed to fetch transaction {hash}"))?;

        Ok(tx.map(|tx| Self::convert_transaction(&tx)))
    }

    async fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptData>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .with_context(|| format!("Failed to fetch receipt {hash}"))?;

        Ok(receipt.map(|r| Self::convert_receipt(&r)))
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn healthy(&self) -> bool {
        match self.provider.get_chain_id().await {
            Ok(id) => id == self.chain_id,
            Err(e) => {
                warn!(chain_id = self.chain_id, error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn subscribe_new_blocks(&self) -> Result<NewHeadsSubscription> {
        let (tx, rx) = mpsc::channel(64);

        // Push subscription when a WS endpoint is configured, poll otherwise.
        if let Some(ws_url) = self.ws_url.clone() {
            let ws_provider = ProviderBuilder::new()
                .on_ws(WsConnect::new(ws_url))
                .await
                .context("Failed to open WebSocket connection")?;

            let handle = tokio::spawn(async move {
                let sub = match ws_provider.subscribe_blocks().await {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(error = %e, "WebSocket heads subscription failed");
                        return;
                    }
                };
                let mut stream = sub.into_stream();
                while let Some(header) = stream.next().await {
                    let head = BlockHeaderData {
                        number: header.number,
                        hash: header.hash,
                        parent_hash: header.parent_hash,
                        timestamp: header.timestamp,
                    };
                    if tx.send(head).await.is_err() {
                        break;
                    }
                }
                debug!("WebSocket heads stream ended");
            });

            return Ok(NewHeadsSubscription { rx, handle });
        }

        let provider = self.provider.clone();
        let handle = tokio::spawn(async move {
            let mut last_seen = 0u64;
            loop {
                match provider.get_block_number().await {
                    Ok(number) if number > last_seen => {
                        last_seen = number;
                        let head = match provider
                            .get_block_by_number(
                                BlockNumberOrTag::Number(number),
                                BlockTransactionsKind::Hashes,
                            )
                            .await
                        {
                            Ok(Some(block)) => Self::convert_header(&block.header),
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(error = %e, "Head poll failed");
                                continue;
                            }
                        };
                        if tx.send(head).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Block number poll failed"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(NewHeadsSubscription { rx, handle })
    }
}

/// Retry an async RPC operation with exponential backoff.
///
/// Transient failures (rate limits, network blips) are retried up to
/// `max_retries` times before the last error propagates.
pub async fn retry_rpc<F, Fut, T>(mut f: F, max_retries: u32, base_delay: Duration) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = base_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "RPC call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
        }
    }

    f().await
        .with_context(|| format!("RPC call failed after {max_retries} retries"))
}
