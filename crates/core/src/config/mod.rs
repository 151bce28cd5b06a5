//! Configuration system.
//!
//! - Runtime settings per component, with profiles
//! - TOML loading with `${VAR}` expansion

mod loader;
mod settings;

pub use loader::{expand_env, load_config, CONFIG_ENV, PROFILE_ENV};
pub use settings::{
    config, init_config, AggregatorSettings, AlertSettings, AssetSettings, CascadeSettings,
    ChainSettings, EndpointSettings, EngineSettings, FeedSettings, GasSettings, PollingSettings,
    PoolSettings, PriceSettings, RateLimitSettings, ReorgSettings, RiskSettings, SentinelConfig,
    TwapPoolSettings, WatchEntry,
};
