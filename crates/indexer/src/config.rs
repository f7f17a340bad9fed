//! Configuration for the indexer service.
//!
//! Loaded from TOML with `${ENV_VAR}` placeholder expansion (placeholders in
//! comments are left alone), then validated before anything connects.

use std::path::Path;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::filter::TopicFilter;
use crate::indexer::IndexerConfig;
use crate::processor::ProcessorConfig;

/// Top-level configuration for the producer binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chains to index; one indexer task each.
    pub chains: Vec<ChainConfig>,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Message bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One chain's connection and tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Human-readable chain name.
    pub name: String,

    /// Chain id (verified against the RPC at connect time).
    pub chain_id: u64,

    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,

    /// Optional WebSocket endpoint for new-heads push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Blocks behind the head treated as final.
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,

    /// Blocks processed per indexing tick.
    #[serde(default = "default_batch_size")]
    pub indexing_batch_size: u32,

    /// Starting receipt-fetch concurrency.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_transaction_limit: usize,

    /// Adaptive concurrency floor.
    #[serde(default = "default_min_concurrent_limit")]
    pub min_concurrent_limit: usize,

    /// Adaptive concurrency cap.
    #[serde(default = "default_max_concurrent_limit")]
    pub max_concurrent_limit: usize,

    /// Chain-head refresh interval, milliseconds.
    #[serde(default = "default_latest_block_interval_ms")]
    pub latest_block_update_interval_ms: u64,

    /// Continuous indexing tick interval, milliseconds.
    #[serde(default = "default_continuous_interval_ms")]
    pub continuous_indexing_interval_ms: u64,

    /// Base RPC retry delay, milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// RPC retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Health check interval, milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Transaction/receipt cache size.
    #[serde(default = "default_tx_cache_size")]
    pub tx_cache_size: usize,

    /// Topic filters active for this chain.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

/// A topic filter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic0 hash (keccak256 of the event signature).
    pub hash: B256,

    /// Optional emitting-contract constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Address>,

    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<TopicConfig> for TopicFilter {
    fn from(config: TopicConfig) -> Self {
        TopicFilter {
            hash: config.hash,
            contract: config.contract,
            description: config.description,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g. "sqlite://indexer.db").
    pub url: String,

    /// Connection pool cap.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection pool floor.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Channel matched transactions are published on.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Per-channel buffer capacity.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            capacity: default_bus_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_block_confirmations() -> u64 {
    vaultbridge_core::DEFAULT_BLOCK_CONFIRMATIONS
}
fn default_batch_size() -> u32 {
    10
}
fn default_concurrent_limit() -> usize {
    10
}
fn default_min_concurrent_limit() -> usize {
    1
}
fn default_max_concurrent_limit() -> usize {
    50
}
fn default_latest_block_interval_ms() -> u64 {
    2_000
}
fn default_continuous_interval_ms() -> u64 {
    1_000
}
fn default_retry_delay_ms() -> u64 {
    vaultbridge_core::DEFAULT_RETRY_DELAY_MS
}
fn default_max_retries() -> u32 {
    3
}
fn default_health_interval_ms() -> u64 {
    60_000
}
fn default_tx_cache_size() -> usize {
    vaultbridge_core::DEFAULT_TX_CACHE_SIZE
}
fn default_max_connections() -> u32 {
    5
}
fn default_min_connections() -> u32 {
    1
}
fn default_channel() -> String {
    "vaultbridge:events".to_string()
}
fn default_bus_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ChainConfig {
    /// Derive the orchestrator tuning for this chain.
    pub fn indexer_config(&self, channel: String) -> IndexerConfig {
        IndexerConfig {
            chain_id: self.chain_id,
            chain_name: self.name.clone(),
            channel,
            block_confirmations: self.block_confirmations,
            batch_size: self.indexing_batch_size,
            latest_block_interval: Duration::from_millis(self.latest_block_update_interval_ms),
            continuous_interval: Duration::from_millis(self.continuous_indexing_interval_ms),
            health_interval: Duration::from_millis(self.health_check_interval_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retries: self.max_retries,
        }
    }

    /// Derive the block-processor tuning for this chain.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            concurrent_limit: self.concurrent_transaction_limit,
            min_concurrent_limit: self.min_concurrent_limit,
            max_concurrent_limit: self.max_concurrent_limit,
            ..ProcessorConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${ENV}` placeholders.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = vaultbridge_core::env::expand_env_vars(&contents)?;
        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (no env expansion).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("At least one chain must be configured");
        }

        for chain in &self.chains {
            if chain.name.is_empty() {
                anyhow::bail!("Chain name cannot be empty");
            }
            if chain.chain_id == 0 {
                anyhow::bail!("Chain '{}': chain_id must be non-zero", chain.name);
            }
            if chain.rpc_url.is_empty() {
                anyhow::bail!("Chain '{}': rpc_url cannot be empty", chain.name);
            }
            if chain.indexing_batch_size == 0 {
                anyhow::bail!("Chain '{}': indexing_batch_size must be > 0", chain.name);
            }
            if chain.min_concurrent_limit == 0 {
                anyhow::bail!("Chain '{}': min_concurrent_limit must be > 0", chain.name);
            }
            if chain.min_concurrent_limit > chain.max_concurrent_limit {
                anyhow::bail!(
                    "Chain '{}': min_concurrent_limit ({}) cannot exceed max_concurrent_limit ({})",
                    chain.name,
                    chain.min_concurrent_limit,
                    chain.max_concurrent_limit
                );
            }
            if chain.continuous_indexing_interval_ms == 0 {
                anyhow::bail!(
                    "Chain '{}': continuous_indexing_interval_ms must be > 0",
                    chain.name
                );
            }
            if chain.topics.is_empty() {
                anyhow::bail!("Chain '{}': at least one topic filter is required", chain.name);
            }
        }

        let mut ids: Vec<u64> = self.chains.iter().map(|c| c.chain_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.chains.len() {
            anyhow::bail!("Duplicate chain_id in configuration");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.bus.channel.is_empty() {
            anyhow::bail!("Bus channel cannot be empty");
        }
        if self.bus.capacity == 0 {
            anyhow::bail!("Bus capacity must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[chains]]
name = "mainnet"
chain_id = 1
rpc_url = "http://localhost:8545"

[[chains.topics]]
hash = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
description = "ERC721 Transfer"

[database]
url = "sqlite://indexer.db"
"#;

    #[test]
    fn test_load_sample_config_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.chains.len(), 1);

        let chain = &config.chains[0];
        assert_eq!(chain.chain_id, 1);
        assert_eq!(chain.block_confirmations, 2);
        assert_eq!(chain.indexing_batch_size, 10);
        assert_eq!(chain.concurrent_transaction_limit, 10);
        assert_eq!(chain.latest_block_update_interval_ms, 2_000);
        assert_eq!(chain.continuous_indexing_interval_ms, 1_000);
        assert_eq!(config.bus.channel, "vaultbridge:events");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_requires_topics() {
        let toml = r#"
[[chains]]
name = "mainnet"
chain_id = 1
rpc_url = "http://localhost:8545"

[database]
url = "sqlite://indexer.db"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("topic filter"));
    }

    #[test]
    fn test_validation_rejects_duplicate_chain_ids() {
        let toml = r#"
[[chains]]
name = "a"
chain_id = 1
rpc_url = "http://localhost:8545"
[[chains.topics]]
hash = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"

[[chains]]
name = "b"
chain_id = 1
rpc_url = "http://localhost:8546"
[[chains.topics]]
hash = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"

[database]
url = "sqlite://indexer.db"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate chain_id"));
    }

    #[test]
    fn test_validation_concurrency_bounds() {
        let toml = r#"
[[chains]]
name = "mainnet"
chain_id = 1
rpc_url = "http://localhost:8545"
min_concurrent_limit = 20
max_concurrent_limit = 5
[[chains.topics]]
hash = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"

[database]
url = "sqlite://indexer.db"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("min_concurrent_limit"));
    }

    #[test]
    fn test_indexer_config_derivation() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let derived = config.chains[0].indexer_config("chan".to_string());
        assert_eq!(derived.chain_id, 1);
        assert_eq!(derived.channel, "chan");
        assert_eq!(derived.latest_block_interval, Duration::from_secs(2));
        assert_eq!(derived.continuous_interval, Duration::from_secs(1));
    }
}
