//! Chainlink AggregatorV3 price source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, I256};
use alloy::providers::ProviderBuilder;
use alloy::sol;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::{PriceQuote, PriceSource, SourceKind};
use crate::endpoint_pool::EndpointPool;

sol! {
    #[sol(rpc)]
    interface IAggregatorV3 {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );

        function decimals() external view returns (uint8);
    }
}

/// One aggregator contract.
#[derive(Debug, Clone, Copy)]
pub struct FeedInfo {
    pub aggregator: Address,
    pub decimals: u8,
}

/// Chainlink feeds for a set of assets on one chain.
#[derive(Debug)]
pub struct ChainlinkFeed {
    name: String,
    pool: Arc<EndpointPool>,
    feeds: RwLock<HashMap<String, FeedInfo>>,
    /// Feed heartbeat; quotes older than this are stale
    heartbeat: Option<Duration>,
}

impl ChainlinkFeed {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            name: format!("chainlink:{}", pool.chain()),
            pool,
            feeds: RwLock::new(HashMap::new()),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Register an aggregator. Chainlink USD feeds use 8 decimals.
    pub fn with_feed(self, asset: &str, aggregator: Address) -> Self {
        self.feeds.write().insert(
            asset.to_uppercase(),
            FeedInfo {
                aggregator,
                decimals: 8,
            },
        );
        self
    }

    pub fn assets(&self) -> Vec<String> {
        self.feeds.read().keys().cloned().collect()
    }

    /// Read `decimals()` from every registered aggregator.
    pub async fn refresh_decimals(&self) -> crate::Result<()> {
        let feeds: Vec<(String, Address)> = self
            .feeds
            .read()
            .iter()
            .map(|(asset, info)| (asset.clone(), info.aggregator))
            .collect();

        for (asset, aggregator) in feeds {
            let decimals = self
                .pool
                .execute(|url| async move {
                    let provider = ProviderBuilder::new().on_http(url.parse()?);
                    let contract = IAggregatorV3::new(aggregator, &provider);
                    Ok::<_, anyhow::Error>(contract.decimals().call().await?._0)
                })
                .await?;

            if let Some(info) = self.feeds.write().get_mut(&asset) {
                info.decimals = decimals;
            }
            debug!(asset = %asset, decimals, "Feed decimals loaded");
        }
        Ok(())
    }
}

/// Scale a raw aggregator answer. Non-positive answers are rejected.
fn scale_answer(answer: I256, decimals: u8) -> Option<f64> {
    if answer.is_negative() || answer.is_zero() {
        return None;
    }
    let raw = u128::try_from(answer.into_raw()).ok()?;
    Some(raw as f64 / 10f64.powi(i32::from(decimals)))
}

#[async_trait]
impl PriceSource for ChainlinkFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Oracle
    }

    fn max_age(&self) -> Option<Duration> {
        self.heartbeat
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn quote(&self, asset: &str) -> Result<Option<PriceQuote>> {
        let key = asset.to_uppercase();
        let Some(info) = self.feeds.read().get(&key).copied() else {
            return Ok(None);
        };

        let (answer, updated_at) = self
            .pool
            .execute(|url| async move {
                let provider = ProviderBuilder::new().on_http(url.parse()?);
                let contract = IAggregatorV3::new(info.aggregator, &provider);
                let round = contract.latestRoundData().call().await?;
                Ok::<_, anyhow::Error>((round.answer, u64::try_from(round.updatedAt).unwrap_or(0)))
            })
            .await?;

        let Some(value) = scale_answer(answer, info.decimals) else {
            anyhow::bail!("aggregator {} returned non-positive answer", info.aggregator);
        };

        Ok(Some(PriceQuote {
            asset: key,
            value,
            source: self.name.clone(),
            weight: self.weight(),
            observed_at: updated_at,
            is_stale: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn test_scale_answer() {
        let answer = I256::from_raw(U256::from(200_000_000_000u64));
        assert!((scale_answer(answer, 8).unwrap() - 2000.0).abs() < 1e-9);
        assert!((scale_answer(answer, 18).unwrap() - 2e-7).abs() < 1e-15);
    }

    #[test]
    fn test_non_positive_answer_rejected() {
        assert!(scale_answer(I256::ZERO, 8).is_none());
        assert!(scale_answer(I256::MINUS_ONE, 8).is_none());
    }

    #[test]
    fn test_feed_registration() {
        let pool = Arc::new(EndpointPool::new("ethereum", Vec::new(), Default::default()));
        let feed = ChainlinkFeed::new(pool)
            .with_feed("eth", Address::repeat_byte(1))
            .with_heartbeat(Duration::from_secs(3600));

        assert_eq!(feed.name(), "chainlink:ethereum");
        assert_eq!(feed.kind(), SourceKind::Oracle);
        assert_eq!(feed.assets(), vec!["ETH".to_string()]);
        assert_eq!(feed.max_age(), Some(Duration::from_secs(3600)));
    }
}
