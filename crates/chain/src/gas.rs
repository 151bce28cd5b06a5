//! Gas price sources used for alert cost estimates.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::providers::{Provider, ProviderBuilder};
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::endpoint_pool::EndpointPool;

const WEI_PER_GWEI: f64 = 1e9;

/// Current gas price in gwei.
#[async_trait]
pub trait GasPriceSource: Send + Sync + Debug {
    async fn gas_price_gwei(&self) -> Result<f64>;

    fn name(&self) -> &'static str;
}

/// Gas price read with `eth_gasPrice` through the endpoint pool.
///
/// The last good reading is cached; when every endpoint fails the cached
/// value (initially the configured default) is returned instead.
#[derive(Debug)]
pub struct RpcGasPrice {
    pool: Arc<EndpointPool>,
    max_gwei: f64,
    /// f64 bits of the last reading
    cached: AtomicU64,
}

impl RpcGasPrice {
    pub fn new(pool: Arc<EndpointPool>, default_gwei: f64, max_gwei: f64) -> Self {
        Self {
            pool,
            max_gwei,
            cached: AtomicU64::new(default_gwei.min(max_gwei).to_bits()),
        }
    }

    pub fn cached_gwei(&self) -> f64 {
        f64::from_bits(self.cached.load(Ordering::Relaxed))
    }

    fn update_cache(&self, gwei: f64) -> f64 {
        let capped = gwei.min(self.max_gwei);
        self.cached.store(capped.to_bits(), Ordering::Relaxed);
        capped
    }
}

#[async_trait]
impl GasPriceSource for RpcGasPrice {
    async fn gas_price_gwei(&self) -> Result<f64> {
        let fetched = self
            .pool
            .execute(|url| async move {
                let provider = ProviderBuilder::new().on_http(url.parse()?);
                Ok::<_, anyhow::Error>(provider.get_gas_price().await?)
            })
            .await;

        match fetched {
            Ok(wei) => Ok(self.update_cache(wei as f64 / WEI_PER_GWEI)),
            Err(e) => {
                debug!(chain = self.pool.chain(), error = %e, "Gas price unavailable, using cached value");
                Ok(self.cached_gwei())
            }
        }
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

/// Constant gas price.
#[derive(Debug, Clone, Copy)]
pub struct FixedGasPrice(pub f64);

#[async_trait]
impl GasPriceSource for FixedGasPrice {
    async fn gas_price_gwei(&self) -> Result<f64> {
        Ok(self.0)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_pool::PoolConfig;

    #[tokio::test]
    async fn test_empty_pool_falls_back_to_default() {
        let pool = Arc::new(EndpointPool::new("ethereum", Vec::new(), PoolConfig::default()));
        let gas = RpcGasPrice::new(pool, 20.0, 500.0);
        assert_eq!(gas.gas_price_gwei().await.unwrap(), 20.0);
    }

    #[test]
    fn test_cache_is_capped() {
        let pool = Arc::new(EndpointPool::new("ethereum", Vec::new(), PoolConfig::default()));
        let gas = RpcGasPrice::new(pool, 20.0, 100.0);
        assert_eq!(gas.update_cache(250.0), 100.0);
        assert_eq!(gas.cached_gwei(), 100.0);
    }
}
