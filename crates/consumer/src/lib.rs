//! VaultBridge consumer: ownership commitments and the collateral ledger.
//!
//! This crate subscribes to the message channel fed by the block indexer and
//! reacts to matched transactions:
//! - NFT `Transfer` logs update the durable ownership sequence and drive the
//!   Merkle engine (tree rebuild + multi-chain root submission)
//! - Vault events (`Deposit`, `WithdrawRequest`, `Withdraw`) and relayer
//!   events (`CollateralRequest`, `CollateralProcess`, `Repay`) drive the
//!   collateralized-borrow bookkeeping state machine
//!
//! # Architecture
//!
//! ```text
//!   MessageBus (from vaultbridge-indexer)
//!        │
//!   ┌────▼──────────────────────────────┐
//!   │  vaultbridge-consumer             │
//!   │                                   │
//!   │  ┌──────────────┐                 │
//!   │  │ Event decode │  sol! bindings  │
//!   │  └──────┬───────┘                 │
//!   │         │                         │
//!   │   ┌─────▼──────┐   ┌───────────┐  │
//!   │   │   Ledger   │   │  Merkle   │  │
//!   │   │ (balances, │   │  Engine   │  │
//!   │   │  LTV, ...) │   │ (roots,   │  │
//!   │   └─────┬──────┘   │  proofs)  │  │
//!   │         │          └─────┬─────┘  │
//!   │         └───────┬────────┘        │
//!   │            ┌────▼─────┐           │
//!   │            │ Relayer  │ → signed  │
//!   │            │  Client  │   writes  │
//!   │            └──────────┘           │
//!   └───────────────────────────────────┘
//! ```
//!
//! A single consumer task owns all ledger state transitions: events are
//! processed strictly in arrival order, and every entity write is guarded by
//! its natural dedup key so producer re-publishes never double-apply.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod events;
pub mod ledger;
pub mod merkle_engine;
pub mod oracle;
pub mod relayer;
pub mod service;
pub mod storage;

pub use ledger::Ledger;
pub use merkle_engine::MerkleEngine;
pub use oracle::{CachedOracle, PriceOracle, StaticPriceOracle};
pub use relayer::{LendingPool, RelayerClient};
pub use storage::Storage;
