//! Wire message model for the VaultBridge pub/sub channel.
//!
//! The producer publishes one [`ChainMessage`] per matched transaction. The
//! consumer accepts both that "enhanced" shape and a legacy flat shape via
//! [`WireMessage`], normalizing either into the canonical form before any
//! event decoding happens.
//!
//! All integer fields wider than 53 bits (`value`, `gasUsed`, `gasPrice`,
//! amounts) travel as decimal strings so JavaScript-side consumers never see
//! silently truncated numbers.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Serde helpers encoding `U256` as a decimal string.
pub mod u256_string {
    use super::*;
    use serde::{Deserializer, Serializer};
    use std::str::FromStr;

    /// Serialize a U256 as a decimal string.
    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize a U256 from a decimal (or 0x-hex) string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers encoding `Option<U256>` as an optional decimal string.
pub mod u256_string_opt {
    use super::*;
    use serde::{Deserializer, Serializer};
    use std::str::FromStr;

    /// Serialize an optional U256 as an optional decimal string.
    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional U256 from an optional decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => U256::from_str(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A single matched log, in log-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedLog {
    /// The emitting contract.
    pub address: Address,
    /// All topics of the log (topic0 first).
    pub topics: Vec<B256>,
    /// ABI-encoded log data, 0x-prefixed hex.
    pub data: String,
    /// Log index within the block.
    pub log_index: u64,
}

/// A transaction that matched the active topic filters.
///
/// `logs` contains only the matched logs, preserving log-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredTransaction {
    /// Chain the transaction was observed on.
    pub chain_id: u64,
    /// Human-readable chain name.
    pub chain_name: String,
    /// Hash of the enclosing block.
    pub block_hash: B256,
    /// Number of the enclosing block.
    pub block_number: u64,
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient; absent for contract creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    /// Native value transferred, decimal string on the wire.
    #[serde(with = "u256_string")]
    pub value: U256,
    /// Calldata, 0x-prefixed hex; absent when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Receipt status (true = success); absent pre-receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
    /// Gas used, decimal string on the wire.
    #[serde(default, with = "u256_string_opt", skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<U256>,
    /// Effective gas price, decimal string on the wire.
    #[serde(default, with = "u256_string_opt", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    /// The topic0 hashes that matched, in match order.
    #[serde(default)]
    pub matched_topics: Vec<B256>,
    /// Matched logs only, log-index order.
    #[serde(default)]
    pub logs: Vec<MatchedLog>,
    /// Block timestamp, seconds since epoch.
    pub timestamp: u64,
}

/// A decoded event attached to a message (optional enrichment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Event name (e.g. "Transfer").
    pub name: String,
    /// Contract label the event belongs to.
    pub contract: String,
    /// Decoded arguments as loose JSON.
    pub args: serde_json::Value,
    /// Emitting address.
    pub address: Address,
}

/// Routing metadata carried with every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Chain id.
    pub chain_id: u64,
    /// Chain name.
    pub chain_name: String,
    /// Block number.
    pub block_number: u64,
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Block timestamp, seconds since epoch.
    pub timestamp: u64,
}

/// The canonical message published per matched transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMessage {
    /// The matched transaction with its matched logs.
    pub transaction: FilteredTransaction,
    /// Optional pre-decoded events.
    #[serde(default)]
    pub events: Vec<EventRecord>,
    /// Block timestamp, seconds since epoch.
    pub timestamp: u64,
    /// Routing metadata.
    pub metadata: MessageMetadata,
}

impl ChainMessage {
    /// Build the canonical message for a filtered transaction.
    pub fn from_transaction(transaction: FilteredTransaction) -> Self {
        let metadata = MessageMetadata {
            chain_id: transaction.chain_id,
            chain_name: transaction.chain_name.clone(),
            block_number: transaction.block_number,
            transaction_hash: transaction.hash,
            timestamp: transaction.timestamp,
        };
        let timestamp = transaction.timestamp;

        Self {
            transaction,
            events: Vec::new(),
            timestamp,
            metadata,
        }
    }
}

/// The legacy flat transaction shape still emitted by older producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTransaction {
    /// Hash of the enclosing block.
    pub block_hash: B256,
    /// Number of the enclosing block.
    pub block_number: u64,
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient.
    #[serde(default)]
    pub to: Option<Address>,
    /// Native value, decimal string.
    #[serde(with = "u256_string")]
    pub value: U256,
    /// Calldata hex.
    pub data: String,
    /// Chain id.
    pub chain_id: u64,
    /// Chain name.
    pub chain_name: String,
    /// Matched topic0 hashes.
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Matched logs, when the old producer included them.
    #[serde(default)]
    pub logs: Option<Vec<MatchedLog>>,
}

/// The legacy envelope: flat transaction + top-level topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMessage {
    /// The flat transaction.
    pub transaction: LegacyTransaction,
    /// Timestamp, seconds since epoch.
    pub timestamp: u64,
    /// Matched topics duplicated at the envelope level.
    #[serde(default)]
    pub topics: Vec<B256>,
}

/// Either wire shape. Deserialization tries the enhanced shape first (it is
/// the only one carrying `metadata`), then falls back to legacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    /// The canonical enhanced shape.
    Enhanced(ChainMessage),
    /// The legacy flat shape.
    Legacy(LegacyMessage),
}

impl WireMessage {
    /// Parse a raw JSON payload into either wire shape.
    pub fn from_json(payload: &str) -> crate::Result<Self> {
        serde_json::from_str(payload).map_err(|e| crate::BusError::Decode(e.to_string()))
    }

    /// Normalize either shape into the canonical [`ChainMessage`].
    pub fn normalize(self) -> ChainMessage {
        match self {
            WireMessage::Enhanced(msg) => msg,
            WireMessage::Legacy(legacy) => {
                let LegacyMessage {
                    transaction: tx,
                    timestamp,
                    topics,
                } = legacy;

                let matched_topics = if !tx.topics.is_empty() {
                    tx.topics.clone()
                } else {
                    topics
                };

                let transaction = FilteredTransaction {
                    chain_id: tx.chain_id,
                    chain_name: tx.chain_name.clone(),
                    block_hash: tx.block_hash,
                    block_number: tx.block_number,
                    hash: tx.hash,
                    from: tx.from,
                    to: tx.to,
                    value: tx.value,
                    data: Some(tx.data),
                    status: None,
                    gas_used: None,
                    gas_price: None,
                    matched_topics,
                    logs: tx.logs.unwrap_or_default(),
                    timestamp,
                };

                let metadata = MessageMetadata {
                    chain_id: transaction.chain_id,
                    chain_name: transaction.chain_name.clone(),
                    block_number: transaction.block_number,
                    transaction_hash: transaction.hash,
                    timestamp,
                };

                ChainMessage {
                    transaction,
                    events: Vec::new(),
                    timestamp,
                    metadata,
                }
            }
        }
    }
}
