//! Sentinel monitoring core.
//!
//! This crate provides the position monitoring engine:
//! - Configuration with profiles and TOML loading
//! - Risk tiers, health factor scoring and remediation amounts
//! - Reorg-safe confirmation of position reads
//! - Alert state machine with cooldowns and deterioration detection
//! - Liquidation cascade detection
//! - Adaptive polling schedule and the engine that drives it
//! - Notification, persistence and metrics sinks

pub mod alert;
pub mod analytics;
pub mod cascade;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod position;
pub mod reorg;
pub mod risk;
pub mod scheduler;
pub mod sinks;

pub use alert::{
    AlertKind, AlertMessage, AlertPreferences, AlertStateMachine, AlertStats, CooldownOverrides, GasQuote,
    PendingAlert,
};
pub use analytics::{
    max_additional_borrow, price_drop_to_liquidation, safe_withdrawal, simulate_price_move, stress_test,
    LiquidationRisk, PriceSimulation, STRESS_SCENARIOS,
};
pub use cascade::{CascadeAlert, CascadeDetector, CascadeStats, CascadeTier};
pub use config::{config, init_config, load_config, SentinelConfig};
pub use engine::{CycleReport, Engine, EngineStats};
pub use metrics::{HistogramSnapshot, MetricsSnapshot, SentinelMetrics, LATENCY_BUCKETS_MS};
pub use position::{EntityId, RiskTier, TierThresholds};
pub use reorg::{ConfirmationState, ConfirmedState, Observation, ReorgStats, ReorgTracker};
pub use risk::{RiskAssessment, RiskEngine, SourceScore, UnifiedScore};
pub use scheduler::{MonitoredEntity, PollBand, PollingStats, Scheduler};
pub use sinks::{
    JsonLinesPersistence, LogNotificationSink, NoopPersistence, Notification, NotificationSink, PersistenceSink,
    SnapshotRecord,
};
