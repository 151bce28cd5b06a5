//! Multi-source price consensus.
//!
//! Sources are queried in confidence order. The first fresh quote is the
//! primary; the next fresh quote cross-checks it. Disagreement beyond the
//! configured bound is flagged, never fatal. Results are cached per asset and
//! concurrent misses for the same asset share one in-flight fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{unix_now, PriceQuote, PriceSource};
use crate::error::{Result, SentinelError};
use crate::metrics::{self, Metric, MetricsSink};

/// Consensus policy. All thresholds are tunable.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Quotes older than this are rejected
    pub staleness: Duration,
    /// Relative deviation (percent) above which sources are flagged as divergent
    pub max_deviation_pct: f64,
    /// How long a consensus price is served from cache
    pub cache_ttl: Duration,
    /// Timeout for a single source call
    pub source_timeout: Duration,
    /// Query a second source to cross-check the primary
    pub cross_check: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(3600),
            max_deviation_pct: 5.0,
            cache_ttl: Duration::from_secs(30),
            source_timeout: Duration::from_secs(10),
            cross_check: true,
        }
    }
}

/// Reconciled price for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusPrice {
    pub asset: String,
    pub value: f64,
    /// Name of the source that supplied `value`
    pub source: String,
    pub weight: f64,
    pub observed_at: u64,
    /// Quote used to cross-check the primary, if any
    pub cross_check: Option<PriceQuote>,
    /// Relative deviation of the cross-check from the primary (percent)
    pub deviation_pct: Option<f64>,
    pub divergent: bool,
}

impl ConsensusPrice {
    /// Divergence as an error value, for logging and metrics.
    pub fn divergence(&self) -> Option<SentinelError> {
        if !self.divergent {
            return None;
        }
        let secondary = self.cross_check.as_ref()?;
        Some(SentinelError::PriceDivergence {
            asset: self.asset.clone(),
            primary: format!("{}={}", self.source, self.value),
            secondary: format!("{}={}", secondary.source, secondary.value),
            deviation_pct: self.deviation_pct.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedPrice {
    price: ConsensusPrice,
    cached_at: Instant,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

type SharedFetch = Shared<BoxFuture<'static, Result<ConsensusPrice>>>;

/// Price consensus service.
pub struct PriceConsensus {
    /// Default source list, highest weight first
    sources: Vec<Arc<dyn PriceSource>>,
    /// Per-asset source lists
    asset_sources: DashMap<String, Vec<Arc<dyn PriceSource>>>,
    config: ConsensusConfig,
    cache: Arc<DashMap<String, CachedPrice>>,
    inflight: DashMap<String, SharedFetch>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for PriceConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceConsensus")
            .field("sources", &self.sources.len())
            .field("cached", &self.cache.len())
            .field("config", &self.config)
            .finish()
    }
}

fn by_weight(mut sources: Vec<Arc<dyn PriceSource>>) -> Vec<Arc<dyn PriceSource>> {
    sources.sort_by(|a, b| b.weight().total_cmp(&a.weight()));
    sources
}

fn normalize(asset: &str) -> String {
    asset.trim().to_uppercase()
}

fn deviation_pct(primary: f64, other: f64) -> Option<f64> {
    if primary <= 0.0 {
        return None;
    }
    Some((primary - other).abs() / primary * 100.0)
}

impl PriceConsensus {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>, config: ConsensusConfig) -> Self {
        Self {
            sources: by_weight(sources),
            asset_sources: DashMap::new(),
            config,
            cache: Arc::new(DashMap::new()),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a dedicated source list for one asset.
    pub fn set_asset_sources(&self, asset: &str, sources: Vec<Arc<dyn PriceSource>>) {
        self.asset_sources.insert(normalize(asset), by_weight(sources));
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    fn sources_for(&self, asset: &str) -> Vec<Arc<dyn PriceSource>> {
        self.asset_sources
            .get(asset)
            .map(|s| s.clone())
            .unwrap_or_else(|| self.sources.clone())
    }

    fn cached(&self, asset: &str) -> Option<ConsensusPrice> {
        let entry = self.cache.get(asset)?;
        if entry.cached_at.elapsed() < self.config.cache_ttl {
            Some(entry.price.clone())
        } else {
            None
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(Metric::PriceCacheHits);
    }

    /// Consensus price for `asset`, served from cache when fresh.
    pub async fn get_price(&self, asset: &str) -> Result<ConsensusPrice> {
        let key = normalize(asset);

        if let Some(price) = self.cached(&key) {
            self.record_hit();
            return Ok(price);
        }

        let fetch = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if let Some(price) = self.cached(&key) {
                    self.record_hit();
                    return Ok(price);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment(Metric::PriceCacheMisses);

                let fetch = reconcile(
                    key.clone(),
                    self.sources_for(&key),
                    self.config.clone(),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.metrics),
                )
                .boxed()
                .shared();
                entry.insert(fetch.clone());
                fetch
            }
        };

        let result = fetch.clone().await;
        self.inflight.remove_if(&key, |_, running| running.ptr_eq(&fetch));
        result
    }

    /// Prices for several assets, fetched concurrently.
    pub async fn get_prices(&self, assets: &[String]) -> HashMap<String, Result<ConsensusPrice>> {
        let results = join_all(assets.iter().map(|a| self.get_price(a))).await;
        assets.iter().map(|a| normalize(a)).zip(results).collect()
    }

    pub fn invalidate(&self, asset: &str) {
        self.cache.remove(&normalize(asset));
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

async fn reconcile(
    asset: String,
    sources: Vec<Arc<dyn PriceSource>>,
    config: ConsensusConfig,
    cache: Arc<DashMap<String, CachedPrice>>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<ConsensusPrice> {
    let now = unix_now();
    let mut primary: Option<PriceQuote> = None;
    let mut secondary: Option<PriceQuote> = None;

    for source in &sources {
        let quote = match tokio::time::timeout(config.source_timeout, source.quote(&asset)).await {
            Ok(Ok(Some(quote))) => quote,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                warn!(asset = %asset, source = source.name(), error = %e, "Price source failed");
                continue;
            }
            Err(_) => {
                warn!(asset = %asset, source = source.name(), "Price source timed out");
                continue;
            }
        };

        let bound = source.max_age().unwrap_or(config.staleness);
        if quote.age_secs(now) > bound.as_secs() {
            debug!(
                asset = %asset,
                source = source.name(),
                age_secs = quote.age_secs(now),
                "Rejecting stale quote"
            );
            continue;
        }

        // A source may lower its confidence per quote, never raise it
        let quote = PriceQuote {
            source: source.name().to_string(),
            weight: quote.weight.min(source.weight()),
            is_stale: false,
            ..quote
        };

        if primary.is_none() {
            primary = Some(quote);
            if !config.cross_check {
                break;
            }
        } else {
            secondary = Some(quote);
            break;
        }
    }

    let primary = primary.ok_or_else(|| SentinelError::NoPriceAvailable {
        asset: asset.clone(),
    })?;

    let deviation = secondary
        .as_ref()
        .and_then(|s| deviation_pct(primary.value, s.value));
    let divergent = deviation.is_some_and(|d| d > config.max_deviation_pct);

    let price = ConsensusPrice {
        asset: asset.clone(),
        value: primary.value,
        source: primary.source,
        weight: primary.weight,
        observed_at: primary.observed_at,
        cross_check: secondary,
        deviation_pct: deviation,
        divergent,
    };

    if let Some(err) = price.divergence() {
        warn!(error = %err, "Price sources disagree, keeping primary");
        metrics.increment(Metric::PriceDivergences);
    }

    cache.insert(
        asset,
        CachedPrice {
            price: price.clone(),
            cached_at: Instant::now(),
        },
    );
    Ok(price)
}
