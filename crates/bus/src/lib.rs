//! # VaultBridge Message Bus
//!
//! Pub/sub transport between the block indexer (producer) and the ownership /
//! collateral consumer.
//!
//! This crate provides:
//! - The wire message model: the canonical [`ChainMessage`] shape plus a
//!   [`WireMessage`] sum type that also accepts the legacy flat shape and
//!   normalizes it
//! - The [`MessagePublisher`] and [`MessageSubscriber`] capability traits
//! - An in-process broadcast transport ([`InMemoryBus`]) suitable for
//!   single-node operation; distributed deployments slot a networked
//!   transport (e.g. Redis) behind the same traits
//!
//! Ordering is per-publisher: one publisher's messages arrive in publish
//! order, but multiple publishers across chains may interleave freely.
//! Consumers must not assume global order beyond `metadata.timestamp`.

#![warn(missing_docs)]

pub mod error;
pub mod message;
pub mod publisher;
pub mod subscriber;

pub use error::{BusError, Result};
pub use message::{
    ChainMessage, EventRecord, FilteredTransaction, LegacyMessage, MatchedLog, MessageMetadata,
    WireMessage,
};
pub use publisher::{InMemoryBus, MessagePublisher};
pub use subscriber::{MessageSubscriber, Subscription};

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
