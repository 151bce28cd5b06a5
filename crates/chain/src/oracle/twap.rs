//! Uniswap V3 time-weighted average price source.
//!
//! Prices come from a pool's tick accumulator over a fixed window. The spot
//! tick from `slot0` is read alongside: quotes lose confidence as spot drifts
//! from the average and are refused past a deviation bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::sol;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{unix_now, PriceQuote, PriceSource, SourceKind};
use crate::endpoint_pool::EndpointPool;

sol! {
    #[sol(rpc)]
    interface IUniswapV3Pool {
        function observe(uint32[] calldata secondsAgos) external view returns (
            int56[] memory tickCumulatives,
            uint160[] memory secondsPerLiquidityCumulativeX128s
        );

        function slot0() external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint16 observationIndex,
            uint16 observationCardinality,
            uint16 observationCardinalityNext,
            uint8 feeProtocol,
            bool unlocked
        );
    }
}

/// Quote assets taken at one US dollar.
const USD_QUOTES: [&str; 4] = ["USD", "USDC", "USDT", "DAI"];

const DEFAULT_WINDOW: Duration = Duration::from_secs(1800);
const DEFAULT_MAX_SPOT_DEVIATION_PCT: f64 = 5.0;

/// One pool pricing an asset against its quote asset.
#[derive(Debug, Clone)]
pub struct TwapPool {
    pub pool: Address,
    /// Asset the pool prices against, e.g. `USDC` or `WETH`
    pub quote: String,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    /// Whether the priced asset is the pool's token0
    pub base_is_token0: bool,
}

impl TwapPool {
    /// Price of the base asset in quote units at `tick`.
    fn price_at(&self, tick: i64) -> f64 {
        let scale = 10f64.powi(i32::from(self.token0_decimals) - i32::from(self.token1_decimals));
        let token1_per_token0 = 1.0001f64.powf(tick as f64) * scale;
        if self.base_is_token0 {
            token1_per_token0
        } else if token1_per_token0 > 0.0 {
            1.0 / token1_per_token0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PoolReading {
    twap: f64,
    spot: f64,
}

fn is_usd(asset: &str) -> bool {
    USD_QUOTES.iter().any(|q| q.eq_ignore_ascii_case(asset))
}

/// Mean tick over `window_secs`, rounded toward negative infinity.
fn mean_tick(cumulatives: &[i64], window_secs: u32) -> Option<i64> {
    let [older, newer] = cumulatives else {
        return None;
    };
    if window_secs == 0 {
        return None;
    }
    Some((newer - older).div_euclid(i64::from(window_secs)))
}

/// Confidence left after spot and TWAP disagree. `None` past `max_pct`.
///
/// Falls linearly to half of `base` at the bound.
fn deviation_weight(base: f64, twap: f64, spot: f64, max_pct: f64) -> Option<f64> {
    if twap <= 0.0 || !spot.is_finite() {
        return None;
    }
    let deviation_pct = (spot - twap).abs() / twap * 100.0;
    if deviation_pct > max_pct {
        return None;
    }
    Some(base * (1.0 - 0.5 * deviation_pct / max_pct))
}

/// Uniswap V3 TWAP quotes for a set of assets on one chain.
#[derive(Debug)]
pub struct UniswapTwapSource {
    name: String,
    pool: Arc<EndpointPool>,
    pools: HashMap<String, TwapPool>,
    window: Duration,
    max_spot_deviation_pct: f64,
}

impl UniswapTwapSource {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            name: format!("uniswap-v3-twap:{}", pool.chain()),
            pool,
            pools: HashMap::new(),
            window: DEFAULT_WINDOW,
            max_spot_deviation_pct: DEFAULT_MAX_SPOT_DEVIATION_PCT,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window.max(Duration::from_secs(1));
        self
    }

    pub fn with_max_spot_deviation(mut self, pct: f64) -> Self {
        self.max_spot_deviation_pct = pct.max(f64::EPSILON);
        self
    }

    pub fn with_pool(mut self, asset: &str, pool: TwapPool) -> Self {
        self.pools.insert(asset.to_uppercase(), pool);
        self
    }

    pub fn assets(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    async fn read_pool(&self, info: &TwapPool) -> Result<PoolReading> {
        let window = u32::try_from(self.window.as_secs()).unwrap_or(u32::MAX);
        let address = info.pool;

        let (cumulatives, spot_tick) = self
            .pool
            .execute(|url| async move {
                let provider = ProviderBuilder::new().on_http(url.parse()?);
                let contract = IUniswapV3Pool::new(address, &provider);
                let observed = contract.observe(vec![window, 0]).call().await?;
                let slot0 = contract.slot0().call().await?;
                let cumulatives: Vec<i64> =
                    observed.tickCumulatives.iter().map(|c| c.as_i64()).collect();
                Ok::<_, anyhow::Error>((cumulatives, slot0.tick.as_i64()))
            })
            .await?;

        let tick = mean_tick(&cumulatives, window)
            .with_context(|| format!("pool {address} returned {} cumulatives", cumulatives.len()))?;
        Ok(PoolReading {
            twap: info.price_at(tick),
            spot: info.price_at(spot_tick),
        })
    }

    /// USD value of one unit of `quote`, through its own pool when not a dollar.
    async fn quote_usd(&self, quote: &str) -> Result<PoolReading> {
        if is_usd(quote) {
            return Ok(PoolReading { twap: 1.0, spot: 1.0 });
        }
        let Some(info) = self.pools.get(&quote.to_uppercase()) else {
            anyhow::bail!("no pool prices quote asset {quote}");
        };
        if !is_usd(&info.quote) {
            anyhow::bail!("quote asset {quote} is not priced against a dollar");
        }
        self.read_pool(info).await
    }
}

#[async_trait]
impl PriceSource for UniswapTwapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Twap
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn quote(&self, asset: &str) -> Result<Option<PriceQuote>> {
        let key = asset.to_uppercase();
        let Some(info) = self.pools.get(&key) else {
            return Ok(None);
        };

        let reading = self.read_pool(info).await?;
        let quote = self.quote_usd(&info.quote).await?;
        let twap = reading.twap * quote.twap;
        let spot = reading.spot * quote.spot;

        let Some(weight) = deviation_weight(self.weight(), twap, spot, self.max_spot_deviation_pct) else {
            anyhow::bail!(
                "{key} spot {spot:.6} strays from TWAP {twap:.6} beyond {}%",
                self.max_spot_deviation_pct
            );
        };
        debug!(asset = %key, twap, spot, weight, "TWAP quote");

        Ok(Some(PriceQuote {
            asset: key,
            value: twap,
            source: self.name.clone(),
            weight,
            observed_at: unix_now(),
            is_stale: false,
        }))
    }
}
