//! In-process metrics with Prometheus text exposition.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use serde::Serialize;

use sentinel_chain::{Metric, MetricsSink};

/// Upper bounds of the latency histogram buckets, in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

const COUNTERS: usize = Metric::ALL.len();

fn help(metric: Metric) -> &'static str {
    match metric {
        Metric::RpcCalls => "Endpoint calls attempted",
        Metric::RpcErrors => "Endpoint calls that failed",
        Metric::EndpointFailovers => "Operations that moved to a lower-priority endpoint",
        Metric::PriceCacheHits => "Price lookups served from cache",
        Metric::PriceCacheMisses => "Price lookups that queried sources",
        Metric::PriceDivergences => "Cross-checked prices outside the deviation bound",
        Metric::ReorgResets => "Pending confirmations discarded by a disagreeing read",
        Metric::StatesConfirmed => "Position snapshots confirmed",
        Metric::AlertsSent => "Alerts delivered",
        Metric::AlertsFailed => "Alert deliveries that failed",
        Metric::CascadeEvents => "Liquidation events ingested",
        Metric::CascadeAlerts => "Cascade escalations emitted",
        Metric::PipelineErrors => "Entity pipelines that failed or panicked",
    }
}

#[derive(Debug, Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        if let Some(i) = LATENCY_BUCKETS_MS.iter().position(|&bound| ms <= bound) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one endpoint's histogram. Buckets are not cumulative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: [u64; LATENCY_BUCKETS_MS.len()],
    pub count: u64,
    pub sum_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(&'static str, u64)>,
    pub latency: Vec<(String, HistogramSnapshot)>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(0, |(_, v)| *v)
    }
}

/// Lock-free counters plus per-endpoint latency histograms.
#[derive(Debug, Default)]
pub struct SentinelMetrics {
    counters: [AtomicU64; COUNTERS],
    latency: DashMap<String, LatencyHistogram>,
}

impl SentinelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counters[metric.index()].load(Ordering::Relaxed)
    }

    /// Each counter is read independently; the snapshot is not a global fence.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = Metric::ALL.iter().map(|m| (m.name(), self.get(*m))).collect();
        let mut latency: Vec<(String, HistogramSnapshot)> = self
            .latency
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        latency.sort_by(|a, b| a.0.cmp(&b.0));
        MetricsSnapshot { counters, latency }
    }

    pub fn to_prometheus_text(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(2048);

        for metric in Metric::ALL {
            let _ = writeln!(out, "# HELP {} {}", metric.name(), help(metric));
            let _ = writeln!(out, "# TYPE {} counter", metric.name());
            let _ = writeln!(out, "{} {}", metric.name(), snapshot.counter(metric.name()));
        }

        if !snapshot.latency.is_empty() {
            let name = "sentinel_endpoint_latency_ms";
            let _ = writeln!(out, "# HELP {name} Endpoint call latency in milliseconds");
            let _ = writeln!(out, "# TYPE {name} histogram");
            for (endpoint, histogram) in &snapshot.latency {
                let mut cumulative = 0;
                for (bound, count) in LATENCY_BUCKETS_MS.iter().zip(histogram.buckets) {
                    cumulative += count;
                    let _ = writeln!(out, "{name}_bucket{{endpoint=\"{endpoint}\",le=\"{bound}\"}} {cumulative}");
                }
                let _ = writeln!(out, "{name}_bucket{{endpoint=\"{endpoint}\",le=\"+Inf\"}} {}", histogram.count);
                let _ = writeln!(out, "{name}_sum{{endpoint=\"{endpoint}\"}} {}", histogram.sum_ms);
                let _ = writeln!(out, "{name}_count{{endpoint=\"{endpoint}\"}} {}", histogram.count);
            }
        }

        out
    }

    /// Write the exposition to `path` for a node-exporter textfile collector.
    pub async fn write_textfile(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("prom.tmp");
        tokio::fs::write(&tmp, self.to_prometheus_text())
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

impl MetricsSink for SentinelMetrics {
    fn add(&self, metric: Metric, value: u64) {
        self.counters[metric.index()].fetch_add(value, Ordering::Relaxed);
    }

    fn observe_latency(&self, endpoint: &str, latency: Duration) {
        if let Some(histogram) = self.latency.get(endpoint) {
            histogram.observe(latency);
            return;
        }
        self.latency.entry(endpoint.to_string()).or_default().observe(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = SentinelMetrics::new();
        metrics.increment(Metric::AlertsSent);
        metrics.add(Metric::CascadeEvents, 6);

        assert_eq!(metrics.get(Metric::AlertsSent), 1);
        assert_eq!(metrics.snapshot().counter("sentinel_cascade_events_total"), 6);
        assert_eq!(metrics.get(Metric::RpcErrors), 0);
    }

    #[test]
    fn test_prometheus_text() {
        let metrics = SentinelMetrics::new();
        metrics.increment(Metric::RpcCalls);
        metrics.observe_latency("alchemy", Duration::from_millis(40));
        metrics.observe_latency("alchemy", Duration::from_millis(700));
        metrics.observe_latency("alchemy", Duration::from_secs(30));

        let text = metrics.to_prometheus_text();
        assert!(text.contains("# TYPE sentinel_rpc_calls_total counter"));
        assert!(text.contains("sentinel_rpc_calls_total 1"));
        assert!(text.contains("sentinel_endpoint_latency_ms_bucket{endpoint=\"alchemy\",le=\"50\"} 1"));
        assert!(text.contains("sentinel_endpoint_latency_ms_bucket{endpoint=\"alchemy\",le=\"1000\"} 2"));
        assert!(text.contains("sentinel_endpoint_latency_ms_bucket{endpoint=\"alchemy\",le=\"+Inf\"} 3"));
        assert!(text.contains("sentinel_endpoint_latency_ms_sum{endpoint=\"alchemy\"} 30740"));
    }

    #[tokio::test]
    async fn test_write_textfile() {
        let dir = std::env::temp_dir().join(format!("sentinel-metrics-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("sentinel.prom");

        let metrics = SentinelMetrics::new();
        metrics.increment(Metric::StatesConfirmed);
        metrics.write_textfile(&path).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("sentinel_states_confirmed_total 1"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
