//! USD pricing for vault assets.
//!
//! Pricing-API integration stays behind the [`PriceOracle`] capability; the
//! shipped implementation prices from the configured per-chain asset table.
//! A short-lived cache wrapper keeps repeated conversions for the same
//! `(chain, token, amount)` triple from re-hitting the underlying source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use vaultbridge_core::UsdValue;

use crate::config::AssetTable;

/// Capability: convert a raw token amount into USD.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD value of `amount` units of `token` on `chain_id`.
    async fn usd_value(&self, chain_id: u64, token: &Address, amount: U256) -> Result<UsdValue>;
}

/// Oracle backed by the configured asset table (symbol, decimals, unit price).
pub struct StaticPriceOracle {
    assets: AssetTable,
}

impl StaticPriceOracle {
    /// Build from the per-chain asset table.
    pub fn new(assets: AssetTable) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn usd_value(&self, chain_id: u64, token: &Address, amount: U256) -> Result<UsdValue> {
        let asset = self.assets.get(chain_id, token).ok_or_else(|| {
            anyhow::anyhow!("No price configured for asset {token} on chain {chain_id}")
        })?;

        Ok(UsdValue::from_token_amount(
            amount,
            asset.decimals,
            &asset.unit_price_usd,
        ))
    }
}

type CacheKey = (u64, Address, U256);

/// TTL cache in front of another oracle.
pub struct CachedOracle<O> {
    inner: O,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<CacheKey, (UsdValue, Instant)>>>,
}

impl<O: PriceOracle> CachedOracle<O> {
    /// Wrap an oracle with a cache of the given time-to-live.
    pub fn new(inner: O, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl<O: PriceOracle> PriceOracle for CachedOracle<O> {
    async fn usd_value(&self, chain_id: u64, token: &Address, amount: U256) -> Result<UsdValue> {
        let key = (chain_id, *token, amount);

        if let Some((value, at)) = self.cache.read().await.get(&key) {
            if at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }

        let value = self.inner.usd_value(chain_id, token, amount).await?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, (_, at)| at.elapsed() < self.ttl);
        cache.insert(key, (value.clone(), Instant::now()));
        debug!(chain_id, token = %token, "Price cached");

        Ok(value)
    }
}
