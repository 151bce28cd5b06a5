//! Runtime configuration with profile support.
//!
//! Every section deserializes with per-field defaults, so a TOML file only
//! needs the values it wants to change. Durations are stored as plain
//! integers and exposed through accessor methods.

use std::sync::OnceLock;
use std::time::Duration;

use sentinel_chain::{ConsensusConfig, PoolConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};

use crate::position::TierThresholds;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub prices: PriceSettings,

    #[serde(default)]
    pub reorg: ReorgSettings,

    #[serde(default)]
    pub risk: RiskSettings,

    #[serde(default)]
    pub alerts: AlertSettings,

    #[serde(default)]
    pub cascade: CascadeSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    /// Per-chain endpoints and contracts
    #[serde(default)]
    pub chains: Vec<ChainSettings>,

    #[serde(default)]
    pub aggregator: AggregatorSettings,

    /// Accounts to monitor at startup
    #[serde(default)]
    pub watchlist: Vec<WatchEntry>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

// ---------------------------------------------------------------------------
// Endpoint pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Timeout applied to each network call (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Cooldown after a failure (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cooldown growth per extra consecutive failure; 1.0 keeps it fixed
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,

    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,

    /// Consecutive failures before an endpoint is disabled
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,

    /// Pause before trying the next endpoint (milliseconds)
    #[serde(default = "default_failover_delay_ms")]
    pub failover_delay_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_cooldown_multiplier() -> f64 {
    1.0
}
fn default_max_cooldown_secs() -> u64 {
    600
}
fn default_failure_ceiling() -> u32 {
    10
}
fn default_failover_delay_ms() -> u64 {
    50
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
            failure_ceiling: default_failure_ceiling(),
            failover_delay_ms: default_failover_delay_ms(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self, rate_limit: &RateLimitSettings) -> PoolConfig {
        PoolConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            cooldown: Duration::from_secs(self.cooldown_secs),
            cooldown_multiplier: self.cooldown_multiplier,
            max_cooldown: Duration::from_secs(self.max_cooldown_secs),
            failure_ceiling: self.failure_ceiling,
            failover_delay: Duration::from_millis(self.failover_delay_ms),
            rate_limit: rate_limit.to_rate_limit_config(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Bucket capacity (burst size)
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Tokens added per second
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

fn default_rate_capacity() -> u32 {
    10
}
fn default_refill_per_sec() -> f64 {
    10.0
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
        }
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSettings {
    /// Quotes older than this are rejected (seconds)
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,

    /// Relative deviation flagged as divergence (percent)
    #[serde(default = "default_max_deviation_pct")]
    pub max_deviation_pct: f64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Timeout for one source call (milliseconds)
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,

    #[serde(default = "default_cross_check")]
    pub cross_check: bool,
}

fn default_staleness_secs() -> u64 {
    3600
}
fn default_max_deviation_pct() -> f64 {
    5.0
}
fn default_cache_ttl_secs() -> u64 {
    30
}
fn default_source_timeout_ms() -> u64 {
    10_000
}
fn default_cross_check() -> bool {
    true
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            max_deviation_pct: default_max_deviation_pct(),
            cache_ttl_secs: default_cache_ttl_secs(),
            source_timeout_ms: default_source_timeout_ms(),
            cross_check: default_cross_check(),
        }
    }
}

impl PriceSettings {
    pub fn to_consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            staleness: Duration::from_secs(self.staleness_secs),
            max_deviation_pct: self.max_deviation_pct,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            source_timeout: Duration::from_millis(self.source_timeout_ms),
            cross_check: self.cross_check,
        }
    }
}

// ---------------------------------------------------------------------------
// Reorg
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgSettings {
    /// Matching reads required before a snapshot is confirmed
    #[serde(default = "default_confirmations")]
    pub confirmations: u32,

    /// Confirmations when the candidate is Critical or worse
    #[serde(default = "default_critical_confirmations")]
    pub critical_confirmations: u32,

    /// Relative health factor tolerance when comparing reads
    #[serde(default = "default_hf_tolerance")]
    pub hf_tolerance: f64,

    /// Relative collateral/debt tolerance when comparing reads
    #[serde(default = "default_value_tolerance")]
    pub value_tolerance: f64,
}

fn default_confirmations() -> u32 {
    3
}
fn default_critical_confirmations() -> u32 {
    2
}
fn default_hf_tolerance() -> f64 {
    0.01
}
fn default_value_tolerance() -> f64 {
    0.005
}

impl Default for ReorgSettings {
    fn default() -> Self {
        Self {
            confirmations: default_confirmations(),
            critical_confirmations: default_critical_confirmations(),
            hf_tolerance: default_hf_tolerance(),
            value_tolerance: default_value_tolerance(),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    /// At or below: Liquidatable
    #[serde(default = "default_liquidatable_hf")]
    pub liquidatable_hf: f64,

    /// At or below: Critical
    #[serde(default = "default_critical_hf")]
    pub critical_hf: f64,

    /// At or below: Warning
    #[serde(default = "default_warning_hf")]
    pub warning_hf: f64,

    /// Health factor remediation amounts aim for
    #[serde(default = "default_target_hf")]
    pub target_hf: f64,
}

fn default_liquidatable_hf() -> f64 {
    1.0
}
fn default_critical_hf() -> f64 {
    1.1
}
fn default_warning_hf() -> f64 {
    1.5
}
fn default_target_hf() -> f64 {
    1.5
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            liquidatable_hf: default_liquidatable_hf(),
            critical_hf: default_critical_hf(),
            warning_hf: default_warning_hf(),
            target_hf: default_target_hf(),
        }
    }
}

impl RiskSettings {
    pub fn thresholds(&self) -> TierThresholds {
        TierThresholds {
            liquidatable: self.liquidatable_hf,
            critical: self.critical_hf,
            warning: self.warning_hf,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_liquidatable_cooldown")]
    pub liquidatable_cooldown_secs: u64,

    #[serde(default = "default_critical_cooldown")]
    pub critical_cooldown_secs: u64,

    #[serde(default = "default_warning_cooldown")]
    pub warning_cooldown_secs: u64,

    #[serde(default = "default_healthy_cooldown")]
    pub healthy_cooldown_secs: u64,

    /// Relative health factor drop that counts as rapid deterioration (percent)
    #[serde(default = "default_deterioration_drop_pct")]
    pub deterioration_drop_pct: f64,

    /// How far back the deterioration check looks (seconds)
    #[serde(default = "default_deterioration_lookback")]
    pub deterioration_lookback_secs: u64,

    /// Minimum gap between two deterioration alerts (seconds)
    #[serde(default = "default_deterioration_rearm")]
    pub deterioration_rearm_secs: u64,

    /// Gas cost above this fraction of collateral is flagged as uneconomical
    #[serde(default = "default_gas_cost_ratio")]
    pub gas_cost_ratio: f64,

    /// Gas units assumed for one remediation transaction
    #[serde(default = "default_gas_units")]
    pub gas_units: u64,

    /// Drop uneconomical Warning/Healthy alerts instead of qualifying them
    #[serde(default)]
    pub suppress_uneconomical: bool,
}

fn default_liquidatable_cooldown() -> u64 {
    300
}
fn default_critical_cooldown() -> u64 {
    900
}
fn default_warning_cooldown() -> u64 {
    3600
}
fn default_healthy_cooldown() -> u64 {
    86_400
}
fn default_deterioration_drop_pct() -> f64 {
    10.0
}
fn default_deterioration_lookback() -> u64 {
    3600
}
fn default_deterioration_rearm() -> u64 {
    900
}
fn default_gas_cost_ratio() -> f64 {
    0.05
}
fn default_gas_units() -> u64 {
    200_000
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            liquidatable_cooldown_secs: default_liquidatable_cooldown(),
            critical_cooldown_secs: default_critical_cooldown(),
            warning_cooldown_secs: default_warning_cooldown(),
            healthy_cooldown_secs: default_healthy_cooldown(),
            deterioration_drop_pct: default_deterioration_drop_pct(),
            deterioration_lookback_secs: default_deterioration_lookback(),
            deterioration_rearm_secs: default_deterioration_rearm(),
            gas_cost_ratio: default_gas_cost_ratio(),
            gas_units: default_gas_units(),
            suppress_uneconomical: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeSettings {
    /// Trailing window (seconds)
    #[serde(default = "default_cascade_window")]
    pub window_secs: u64,

    #[serde(default = "default_warning_count")]
    pub warning_count: usize,
    #[serde(default = "default_critical_count")]
    pub critical_count: usize,
    #[serde(default = "default_severe_count")]
    pub severe_count: usize,

    #[serde(default = "default_warning_value")]
    pub warning_value_usd: f64,
    #[serde(default = "default_critical_value")]
    pub critical_value_usd: f64,
    #[serde(default = "default_severe_value")]
    pub severe_value_usd: f64,

    /// Blocks scanned on the first poll of a source
    #[serde(default = "default_initial_lookback")]
    pub initial_lookback_blocks: u64,

    /// Blocks re-scanned behind the cursor to survive reorgs
    #[serde(default = "default_overlap_blocks")]
    pub overlap_blocks: u64,

    /// Largest block range requested in one call
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,

    /// Borrowers listed in an alert
    #[serde(default = "default_max_affected")]
    pub max_affected: usize,
}

fn default_cascade_window() -> u64 {
    3600
}
fn default_warning_count() -> usize {
    5
}
fn default_critical_count() -> usize {
    10
}
fn default_severe_count() -> usize {
    20
}
fn default_warning_value() -> f64 {
    1_000_000.0
}
fn default_critical_value() -> f64 {
    5_000_000.0
}
fn default_severe_value() -> f64 {
    10_000_000.0
}
fn default_initial_lookback() -> u64 {
    300
}
fn default_overlap_blocks() -> u64 {
    12
}
fn default_max_block_range() -> u64 {
    1000
}
fn default_max_affected() -> usize {
    10
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            window_secs: default_cascade_window(),
            warning_count: default_warning_count(),
            critical_count: default_critical_count(),
            severe_count: default_severe_count(),
            warning_value_usd: default_warning_value(),
            critical_value_usd: default_critical_value(),
            severe_value_usd: default_severe_value(),
            initial_lookback_blocks: default_initial_lookback(),
            overlap_blocks: default_overlap_blocks(),
            max_block_range: default_max_block_range(),
            max_affected: default_max_affected(),
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Below this health factor: critical cadence
    #[serde(default = "default_poll_critical_hf")]
    pub critical_hf: f64,

    /// At or below this health factor: medium cadence
    #[serde(default = "default_poll_medium_hf")]
    pub medium_hf: f64,

    #[serde(default = "default_critical_interval")]
    pub critical_interval_secs: u64,

    #[serde(default = "default_medium_interval")]
    pub medium_interval_secs: u64,

    #[serde(default = "default_low_interval")]
    pub low_interval_secs: u64,

    /// No active position
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
}

fn default_poll_critical_hf() -> f64 {
    1.3
}
fn default_poll_medium_hf() -> f64 {
    2.0
}
fn default_critical_interval() -> u64 {
    30
}
fn default_medium_interval() -> u64 {
    120
}
fn default_low_interval() -> u64 {
    300
}
fn default_idle_interval() -> u64 {
    600
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            critical_hf: default_poll_critical_hf(),
            medium_hf: default_poll_medium_hf(),
            critical_interval_secs: default_critical_interval(),
            medium_interval_secs: default_medium_interval(),
            low_interval_secs: default_low_interval(),
            idle_interval_secs: default_idle_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Driver loop tick (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Entity pipelines running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Accounts per batch read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent individual reads when batching falls back
    #[serde(default = "default_fallback_concurrency")]
    pub fallback_concurrency: usize,

    /// Cascade detector cadence (seconds)
    #[serde(default = "default_cascade_interval")]
    pub cascade_interval_secs: u64,

    /// Time allowed for the in-flight cycle after shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Upper bound on one notification or persistence call (milliseconds)
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,

    /// JSON-lines file receiving confirmed snapshots
    #[serde(default)]
    pub persistence_path: Option<String>,

    /// Prometheus text file written periodically
    #[serde(default)]
    pub metrics_path: Option<String>,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_tick_ms() -> u64 {
    1000
}
fn default_max_concurrency() -> usize {
    16
}
fn default_batch_size() -> usize {
    50
}
fn default_fallback_concurrency() -> usize {
    8
}
fn default_cascade_interval() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_metrics_interval() -> u64 {
    15
}
fn default_sink_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
            fallback_concurrency: default_fallback_concurrency(),
            cascade_interval_secs: default_cascade_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            sink_timeout_ms: default_sink_timeout_ms(),
            persistence_path: None,
            metrics_path: None,
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl EngineSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
    pub fn cascade_interval(&self) -> Duration {
        Duration::from_secs(self.cascade_interval_secs)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Chains and sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Chain name, e.g. `ethereum`
    pub name: String,

    /// Endpoints in any order; `priority` decides the order used
    #[serde(default)]
    pub endpoints: Vec<EndpointSettings>,

    /// AAVE V3 pool; the chain gets an `aave-v3:<name>` source when set
    #[serde(default)]
    pub aave_pool: Option<String>,

    /// Multicall3 override
    #[serde(default)]
    pub multicall: Option<String>,

    /// Chainlink aggregators
    #[serde(default)]
    pub feeds: Vec<FeedSettings>,

    /// Reserve metadata for valuing liquidation events
    #[serde(default)]
    pub assets: Vec<AssetSettings>,

    /// Feed heartbeat used as the oracle staleness bound (seconds)
    #[serde(default)]
    pub feed_heartbeat_secs: Option<u64>,

    /// AAVE protocol data provider, enables per-reserve breakdowns
    #[serde(default)]
    pub aave_data_provider: Option<String>,

    /// AAVE price oracle, enables per-reserve breakdowns
    #[serde(default)]
    pub aave_oracle: Option<String>,

    /// Uniswap V3 pools quoted by TWAP
    #[serde(default)]
    pub twap_pools: Vec<TwapPoolSettings>,

    /// TWAP averaging window (seconds)
    #[serde(default = "default_twap_window_secs")]
    pub twap_window_secs: u64,

    /// Spot drift from TWAP past which a TWAP quote is refused (percent)
    #[serde(default = "default_twap_max_spot_deviation_pct")]
    pub twap_max_spot_deviation_pct: f64,

    #[serde(default)]
    pub gas: GasSettings,
}

impl ChainSettings {
    pub fn source_id(&self) -> String {
        format!("aave-v3:{}", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    pub asset: String,
    pub aggregator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSettings {
    pub address: String,
    pub symbol: String,
    #[serde(default = "default_asset_decimals")]
    pub decimals: u8,
}

fn default_asset_decimals() -> u8 {
    18
}

fn default_twap_window_secs() -> u64 {
    1800
}

fn default_twap_max_spot_deviation_pct() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapPoolSettings {
    /// Asset priced by the pool
    pub asset: String,
    pub pool: String,
    /// Counter asset, a dollar stablecoin or another TWAP-priced asset
    pub quote: String,
    #[serde(default = "default_asset_decimals")]
    pub token0_decimals: u8,
    #[serde(default = "default_asset_decimals")]
    pub token1_decimals: u8,
    #[serde(default = "default_base_is_token0")]
    pub base_is_token0: bool,
}

fn default_base_is_token0() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasSettings {
    #[serde(default = "default_gas_price_gwei")]
    pub default_gwei: f64,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gwei: f64,
}

fn default_gas_price_gwei() -> f64 {
    20.0
}
fn default_max_gas_price_gwei() -> f64 {
    500.0
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            default_gwei: default_gas_price_gwei(),
            max_gwei: default_max_gas_price_gwei(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSettings {
    #[serde(default = "default_aggregator_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_aggregator_enabled() -> bool {
    true
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            enabled: default_aggregator_enabled(),
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub account: String,
    /// Source identifier, e.g. `aave-v3:ethereum`
    pub source: String,
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            pool: PoolSettings::default(),
            rate_limit: RateLimitSettings::default(),
            prices: PriceSettings::default(),
            reorg: ReorgSettings::default(),
            risk: RiskSettings::default(),
            alerts: AlertSettings::default(),
            cascade: CascadeSettings::default(),
            polling: PollingSettings::default(),
            engine: EngineSettings::default(),
            chains: Vec::new(),
            aggregator: AggregatorSettings::default(),
            watchlist: Vec::new(),
        }
    }
}

impl SentinelConfig {
    /// Fast cadence and a single confirmation, for local chains and demos.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            pool: PoolSettings {
                call_timeout_ms: 3_000,
                cooldown_secs: 5,
                failover_delay_ms: 0,
                ..Default::default()
            },
            reorg: ReorgSettings {
                confirmations: 1,
                critical_confirmations: 1,
                ..Default::default()
            },
            alerts: AlertSettings {
                liquidatable_cooldown_secs: 30,
                critical_cooldown_secs: 60,
                warning_cooldown_secs: 120,
                healthy_cooldown_secs: 600,
                ..Default::default()
            },
            polling: PollingSettings {
                critical_interval_secs: 5,
                medium_interval_secs: 10,
                low_interval_secs: 20,
                idle_interval_secs: 60,
                ..Default::default()
            },
            engine: EngineSettings {
                tick_ms: 250,
                cascade_interval_secs: 10,
                shutdown_grace_secs: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Conservative settings for mainnet monitoring.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            pool: PoolSettings {
                cooldown_multiplier: 2.0,
                ..Default::default()
            },
            engine: EngineSettings {
                max_concurrency: 32,
                shutdown_grace_secs: 30,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Faster polling and confirmation, at the cost of more RPC traffic.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            rate_limit: RateLimitSettings {
                capacity: 25,
                refill_per_sec: 25.0,
            },
            reorg: ReorgSettings {
                confirmations: 2,
                critical_confirmations: 1,
                ..Default::default()
            },
            polling: PollingSettings {
                critical_interval_secs: 12,
                medium_interval_secs: 60,
                low_interval_secs: 180,
                idle_interval_secs: 600,
                ..Default::default()
            },
            engine: EngineSettings {
                tick_ms: 500,
                max_concurrency: 64,
                cascade_interval_secs: 30,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Profile by name. Unknown names fall back to the default profile.
    pub fn for_profile(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Profile from `SENTINEL_PROFILE`, or default.
    pub fn from_env() -> Self {
        let profile = std::env::var(super::loader::PROFILE_ENV).unwrap_or_else(|_| "default".to_string());
        Self::for_profile(&profile)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let risk = &self.risk;
        if !(risk.liquidatable_hf < risk.critical_hf && risk.critical_hf < risk.warning_hf) {
            anyhow::bail!(
                "tier thresholds must increase: liquidatable {} < critical {} < warning {}",
                risk.liquidatable_hf,
                risk.critical_hf,
                risk.warning_hf
            );
        }
        if risk.target_hf <= risk.liquidatable_hf {
            anyhow::bail!("target_hf {} must exceed liquidatable_hf", risk.target_hf);
        }
        if self.reorg.confirmations == 0 || self.reorg.critical_confirmations == 0 {
            anyhow::bail!("confirmation depths must be at least 1");
        }
        if self.reorg.critical_confirmations > self.reorg.confirmations {
            anyhow::bail!("critical_confirmations cannot exceed confirmations");
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_per_sec <= 0.0 {
            anyhow::bail!("rate limit capacity and refill rate must be positive");
        }
        if self.engine.max_concurrency == 0 || self.engine.batch_size == 0 {
            anyhow::bail!("engine concurrency and batch size must be positive");
        }
        if self.engine.sink_timeout_ms == 0 {
            anyhow::bail!("engine sink_timeout_ms must be positive");
        }
        if self.polling.critical_hf > self.polling.medium_hf {
            anyhow::bail!("polling critical_hf cannot exceed medium_hf");
        }
        let cascade = &self.cascade;
        if !(cascade.warning_count <= cascade.critical_count && cascade.critical_count <= cascade.severe_count) {
            anyhow::bail!("cascade count thresholds must be non-decreasing");
        }
        if cascade.max_block_range == 0 || cascade.overlap_blocks >= cascade.max_block_range {
            anyhow::bail!("cascade overlap_blocks must be smaller than max_block_range");
        }
        for chain in &self.chains {
            if chain.endpoints.is_empty() {
                anyhow::bail!("chain {} has no endpoints", chain.name);
            }
            if chain.aave_data_provider.is_some() != chain.aave_oracle.is_some() {
                anyhow::bail!("chain {} needs both aave_data_provider and aave_oracle for breakdowns", chain.name);
            }
            if !chain.twap_pools.is_empty() && (chain.twap_window_secs == 0 || chain.twap_max_spot_deviation_pct <= 0.0) {
                anyhow::bail!("chain {} TWAP window and spot deviation must be positive", chain.name);
            }
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Sentinel configuration loaded");
        tracing::info!(
            call_timeout_ms = self.pool.call_timeout_ms,
            cooldown_secs = self.pool.cooldown_secs,
            failure_ceiling = self.pool.failure_ceiling,
            rate_capacity = self.rate_limit.capacity,
            refill_per_sec = self.rate_limit.refill_per_sec,
            "Endpoint pool"
        );
        tracing::info!(
            staleness_secs = self.prices.staleness_secs,
            max_deviation_pct = self.prices.max_deviation_pct,
            cache_ttl_secs = self.prices.cache_ttl_secs,
            "Price consensus"
        );
        tracing::info!(
            confirmations = self.reorg.confirmations,
            critical_confirmations = self.reorg.critical_confirmations,
            "Reorg confirmation depths"
        );
        tracing::info!(
            liquidatable = self.risk.liquidatable_hf,
            critical = self.risk.critical_hf,
            warning = self.risk.warning_hf,
            target = self.risk.target_hf,
            "Risk tier thresholds"
        );
        tracing::info!(
            critical_secs = self.polling.critical_interval_secs,
            medium_secs = self.polling.medium_interval_secs,
            low_secs = self.polling.low_interval_secs,
            idle_secs = self.polling.idle_interval_secs,
            "Poll intervals"
        );
        tracing::info!(
            chains = self.chains.len(),
            watchlist = self.watchlist.len(),
            max_concurrency = self.engine.max_concurrency,
            "Engine"
        );
    }
}

static GLOBAL_CONFIG: OnceLock<SentinelConfig> = OnceLock::new();

/// Initialize global configuration.
pub fn init_config(config: SentinelConfig) {
    let _ = GLOBAL_CONFIG.set(config);
}

/// Get the global configuration, initializing from environment if needed.
pub fn config() -> &'static SentinelConfig {
    GLOBAL_CONFIG.get_or_init(SentinelConfig::from_env)
}
