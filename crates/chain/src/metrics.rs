//! Metrics sink abstraction.
//!
//! Components report through [`MetricsSink`]; the default [`NoopMetrics`]
//! discards everything so a missing exporter never changes behaviour.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Counters reported by the engine and its fetch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    RpcCalls,
    RpcErrors,
    EndpointFailovers,
    PriceCacheHits,
    PriceCacheMisses,
    PriceDivergences,
    ReorgResets,
    StatesConfirmed,
    AlertsSent,
    AlertsFailed,
    CascadeEvents,
    CascadeAlerts,
    PipelineErrors,
}

impl Metric {
    pub const ALL: [Metric; 13] = [
        Metric::RpcCalls,
        Metric::RpcErrors,
        Metric::EndpointFailovers,
        Metric::PriceCacheHits,
        Metric::PriceCacheMisses,
        Metric::PriceDivergences,
        Metric::ReorgResets,
        Metric::StatesConfirmed,
        Metric::AlertsSent,
        Metric::AlertsFailed,
        Metric::CascadeEvents,
        Metric::CascadeAlerts,
        Metric::PipelineErrors,
    ];

    /// Prometheus-style metric name.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::RpcCalls => "sentinel_rpc_calls_total",
            Metric::RpcErrors => "sentinel_rpc_errors_total",
            Metric::EndpointFailovers => "sentinel_endpoint_failovers_total",
            Metric::PriceCacheHits => "sentinel_price_cache_hits_total",
            Metric::PriceCacheMisses => "sentinel_price_cache_misses_total",
            Metric::PriceDivergences => "sentinel_price_divergences_total",
            Metric::ReorgResets => "sentinel_reorg_resets_total",
            Metric::StatesConfirmed => "sentinel_states_confirmed_total",
            Metric::AlertsSent => "sentinel_alerts_sent_total",
            Metric::AlertsFailed => "sentinel_alerts_failed_total",
            Metric::CascadeEvents => "sentinel_cascade_events_total",
            Metric::CascadeAlerts => "sentinel_cascade_alerts_total",
            Metric::PipelineErrors => "sentinel_pipeline_errors_total",
        }
    }

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|m| m == self).unwrap_or(0)
    }
}

/// Destination for counters and latency observations.
pub trait MetricsSink: Send + Sync + Debug {
    fn increment(&self, metric: Metric) {
        self.add(metric, 1);
    }

    fn add(&self, metric: Metric, value: u64);

    /// Record the latency of one call against an endpoint.
    fn observe_latency(&self, endpoint: &str, latency: Duration);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn add(&self, _metric: Metric, _value: u64) {}

    fn observe_latency(&self, _endpoint: &str, _latency: Duration) {}
}

/// Shared handle to the no-op sink.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}
