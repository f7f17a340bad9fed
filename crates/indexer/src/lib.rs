//! Block indexer for VaultBridge.
//!
//! This crate provides:
//! - An abstract EVM chain client with HTTP polling and optional WebSocket heads
//! - A bounded transaction/receipt cache
//! - Bloom-backed topic filtering
//! - Reorg-safe per-block bookkeeping (work queue + progress markers)
//! - A per-chain indexer that publishes matched transactions to the message bus
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │  vaultbridge-indexer (producer)    │
//! │                                    │
//! │  ┌───────────────┐                 │
//! │  │  ChainClient  │ ← Ethereum RPC  │
//! │  │ (HTTP + WS)   │                 │
//! │  └──────┬────────┘                 │
//! │         │                          │
//! │  ┌──────▼────────┐   ┌──────────┐  │
//! │  │ BlockProcessor│ ← │ TxCache  │  │
//! │  │ (topic match) │   │ (LRU)    │  │
//! │  └──────┬────────┘   └──────────┘  │
//! │         │                          │
//! │  ┌──────▼────────┐                 │
//! │  │  BlockLedger  │ ← SQLite        │
//! │  │ (reorg-safe)  │                 │
//! │  └──────┬────────┘                 │
//! │         │                          │
//! │         ▼                          │
//! │    MessageBus (ordered publish)    │
//! └────────────────────────────────────┘
//!          │
//!          ▼
//!   vaultbridge-consumer (ownership + ledger)
//! ```
//!
//! Within one chain, block processing is sequential: a block completes (or
//! fails cleanly) before the next begins, which keeps the processed watermark
//! monotone and publishes messages in block order. Receipt fetches inside a
//! block fan out up to an adaptive concurrency limit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod client;
pub mod config;
pub mod filter;
pub mod indexer;
pub mod processor;
pub mod storage;

pub use cache::{TxCache, TxCacheEntry};
pub use client::{
    BlockData, BlockHeaderData, ChainClient, HttpChainClient, LogData, ReceiptData, TxData,
};
pub use filter::{TopicFilter, TopicMatcher};
pub use indexer::ChainIndexer;
pub use processor::{BlockProcessor, ProcessorConfig};
pub use storage::Storage;
