//! Price sources and multi-source consensus.
//!
//! - [`PriceSource`]: one quoting backend (oracle feed, TWAP, aggregator API)
//! - [`PriceConsensus`]: confidence-ordered cross-checking with caching and
//!   single-flight fetches
//! - [`ChainlinkFeed`]: AggregatorV3 feed read through the endpoint pool
//! - [`UniswapTwapSource`]: Uniswap V3 pool TWAP, checked against spot

mod chainlink;
mod consensus;
mod twap;

pub use chainlink::ChainlinkFeed;
pub use consensus::{CacheStats, ConsensusConfig, ConsensusPrice, PriceConsensus};
pub use twap::{TwapPool, UniswapTwapSource};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of price source, ordered by default confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// On-chain oracle feed
    Oracle,
    /// Time-weighted DEX average
    Twap,
    /// Off-chain aggregator API
    Aggregator,
}

impl SourceKind {
    /// Static confidence weight used to order sources.
    pub fn default_weight(&self) -> f64 {
        match self {
            Self::Oracle => 0.95,
            Self::Twap => 0.85,
            Self::Aggregator => 0.75,
        }
    }
}

/// A single price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset: String,
    pub value: f64,
    pub source: String,
    pub weight: f64,
    /// Unix seconds at which the source observed the price
    pub observed_at: u64,
    /// Set by the consensus layer when the quote exceeds its staleness bound
    #[serde(default)]
    pub is_stale: bool,
}

impl PriceQuote {
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.observed_at)
    }
}

/// A quoting backend.
#[async_trait]
pub trait PriceSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn weight(&self) -> f64 {
        self.kind().default_weight()
    }

    /// Source-specific staleness bound, overriding the consensus default.
    fn max_age(&self) -> Option<Duration> {
        None
    }

    /// Quote `asset` in USD. `Ok(None)` when the source does not cover it.
    async fn quote(&self, asset: &str) -> Result<Option<PriceQuote>>;
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_weights_are_ordered() {
        assert!(SourceKind::Oracle.default_weight() > SourceKind::Twap.default_weight());
        assert!(SourceKind::Twap.default_weight() > SourceKind::Aggregator.default_weight());
    }

    #[test]
    fn test_quote_age() {
        let quote = PriceQuote {
            asset: "ETH".into(),
            value: 2000.0,
            source: "feed".into(),
            weight: 0.95,
            observed_at: 1_000,
            is_stale: false,
        };
        assert_eq!(quote.age_secs(1_600), 600);
        assert_eq!(quote.age_secs(900), 0);
    }
}
