//! Sentinel data-fetch and resilience layer.
//!
//! This crate provides:
//! - Error taxonomy shared by every crate in the workspace
//! - Token-bucket rate limiting per endpoint
//! - Endpoint pool with priority fallback, cooldowns and health tracking
//! - Multicall3 batch reads with individual-read fallback
//! - The [`DataSource`] capability implemented per protocol/chain
//! - Price sources and multi-source price consensus
//! - Gas price sources for cost estimates

pub mod batch;
pub mod endpoint_pool;
pub mod error;
pub mod gas;
pub mod metrics;
pub mod oracle;
pub mod protocol;
pub mod rate_limiter;
pub mod source;

pub use batch::{BatchCall, BatchReader, MULTICALL3_ADDRESS};
pub use endpoint_pool::{
    CallTracker, EndpointPool, EndpointSpec, EndpointState, EndpointStatus, PoolConfig, PoolStats,
};
pub use error::{Result, SentinelError};
pub use gas::{FixedGasPrice, GasPriceSource, RpcGasPrice};
pub use metrics::{Metric, MetricsSink, NoopMetrics};
pub use oracle::{
    unix_now, CacheStats, ChainlinkFeed, ConsensusConfig, ConsensusPrice, PriceConsensus,
    PriceQuote, PriceSource, SourceKind, TwapPool, UniswapTwapSource,
};
#[cfg(feature = "aave-v3")]
pub use protocol::{AaveV3Config, AaveV3Source, AssetMeta};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use source::{
    AssetBalance, BlockRange, DataSource, LiquidationEvent, PositionSnapshot, SourceCapabilities,
};
