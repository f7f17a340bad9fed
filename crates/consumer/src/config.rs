//! Configuration for the consumer service.

use std::collections::HashMap;
use std::path::Path;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the consumer binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Message bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Signer for relayer writes.
    pub signer: SignerConfig,

    /// Per-chain relayer targets. Root updates fan out to every entry.
    #[serde(default)]
    pub relayers: Vec<RelayerChainConfig>,

    /// Per-chain asset table (pricing + LTV).
    #[serde(default)]
    pub assets: Vec<AssetConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g. "sqlite://consumer.db").
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
    /// Channel to subscribe on.
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

/// Signer configuration for on-chain writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Private key, 64 hex chars, with or without 0x prefix. Use an
    /// environment placeholder in checked-in files.
    pub private_key: String,
}

impl SignerConfig {
    /// The private key with a 0x prefix.
    pub fn private_key_with_prefix(&self) -> String {
        format!("0x{}", self.private_key.trim_start_matches("0x"))
    }
}

/// One chain's relayer target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerChainConfig {
    /// Chain id.
    pub chain_id: u64,

    /// HTTP JSON-RPC endpoint for writes.
    pub rpc_url: String,

    /// Relayer contract address.
    pub relayer_address: Address,

    /// Vault handler passed to `completeWithdraw`.
    pub vault_handler: Address,
}

/// One asset's pricing and risk parameters on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Chain id.
    pub chain_id: u64,

    /// Display symbol.
    pub symbol: String,

    /// Token address.
    pub address: Address,

    /// Token decimals.
    pub decimals: u8,

    /// Loan-to-value percentage (0-100). Absent means the asset contributes
    /// value but no borrowing headroom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ltv_percent: Option<u32>,

    /// USD price of one whole token.
    pub unit_price_usd: BigDecimal,
}

impl AssetConfig {
    /// The LTV ratio as a decimal fraction, when configured.
    pub fn ltv_ratio(&self) -> Option<BigDecimal> {
        self.ltv_percent
            .map(|pct| BigDecimal::from(pct) / BigDecimal::from(100))
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

/// Indexed view over the configured assets.
#[derive(Debug, Clone, Default)]
pub struct AssetTable {
    by_key: HashMap<(u64, Address), AssetConfig>,
}

impl AssetTable {
    /// Build the lookup table from the raw config entries.
    pub fn new(assets: Vec<AssetConfig>) -> Self {
        let by_key = assets
            .into_iter()
            .map(|a| ((a.chain_id, a.address), a))
            .collect();
        Self { by_key }
    }

    /// Look up an asset on a chain.
    pub fn get(&self, chain_id: u64, address: &Address) -> Option<&AssetConfig> {
        self.by_key.get(&(chain_id, *address))
    }

    /// Number of configured assets.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no assets are configured.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
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

    /// The indexed asset table.
    pub fn asset_table(&self) -> AssetTable {
        AssetTable::new(self.assets.clone())
    }

    /// Chain ids with a configured relayer, ascending.
    pub fn relayer_chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.relayers.iter().map(|r| r.chain_id).collect();
        ids.sort_unstable();
        ids
    }

    /// The vault handler for a chain, if configured.
    pub fn vault_handler(&self, chain_id: u64) -> Option<Address> {
        self.relayers
            .iter()
            .find(|r| r.chain_id == chain_id)
            .map(|r| r.vault_handler)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.bus.channel.is_empty() {
            anyhow::bail!("Bus channel cannot be empty");
        }

        let key = self.signer.private_key.trim_start_matches("0x");
        if key.len() != 64 {
            anyhow::bail!(
                "Signer private_key must be 64 hex characters (got {})",
                key.len()
            );
        }
        if !key.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Signer private_key must be a valid hex string");
        }

        let mut relayer_ids: Vec<u64> = self.relayers.iter().map(|r| r.chain_id).collect();
        relayer_ids.sort_unstable();
        relayer_ids.dedup();
        if relayer_ids.len() != self.relayers.len() {
            anyhow::bail!("Duplicate relayer chain_id in configuration");
        }

        for relayer in &self.relayers {
            if relayer.rpc_url.is_empty() {
                anyhow::bail!("Relayer rpc_url cannot be empty (chain {})", relayer.chain_id);
            }
            if relayer.relayer_address.is_zero() {
                anyhow::bail!(
                    "Relayer address must be non-zero (chain {})",
                    relayer.chain_id
                );
            }
            if relayer.vault_handler.is_zero() {
                anyhow::bail!(
                    "Vault handler must be non-zero (chain {})",
                    relayer.chain_id
                );
            }
        }

        for asset in &self.assets {
            if asset.symbol.is_empty() {
                anyhow::bail!("Asset symbol cannot be empty (chain {})", asset.chain_id);
            }
            if let Some(pct) = asset.ltv_percent {
                if pct > 100 {
                    anyhow::bail!(
                        "Asset {} ltv_percent must be <= 100 (got {pct})",
                        asset.symbol
                    );
                }
            }
            if asset.unit_price_usd < BigDecimal::from(0) {
                anyhow::bail!("Asset {} unit_price_usd cannot be negative", asset.symbol);
            }
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
