//! Monitoring engine.
//!
//! Each cycle reads every due entity through the [`BatchReader`] (stage 1),
//! then runs one pipeline per entity with bounded concurrency (stage 2):
//! reconcile against the reorg tracker, reprice, score, evaluate alerts and
//! reschedule. The reconcile-to-reschedule section has no suspension points,
//! so a cancelled cycle never leaves an entity half-updated. Delivery and
//! persistence run afterwards and are best-effort.
//!
//! Liquidation events feed the cascade detector on a separate cadence.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::alert::{AlertStateMachine, AlertStats, GasQuote};
use crate::cascade::{CascadeAlert, CascadeDetector, CascadeStats};
use crate::config::{EngineSettings, SentinelConfig};
use crate::position::EntityId;
use crate::reorg::{Observation, ReorgStats, ReorgTracker};
use crate::risk::{RiskAssessment, RiskEngine, UnifiedScore};
use crate::scheduler::{PollingStats, Scheduler};
use crate::sinks::{LogNotificationSink, NoopPersistence, Notification, NotificationSink, PersistenceSink};
use sentinel_chain::{
    metrics, unix_now, AssetBalance, BatchReader, ConsensusPrice, DataSource, GasPriceSource, Metric, MetricsSink,
    PositionSnapshot, PriceConsensus, SentinelError,
};

/// Asset whose price converts gas cost to USD.
const GAS_ASSET: &str = "ETH";

/// Counts for one engine cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub polled: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub stale: usize,
    pub idle: usize,
    pub fetch_errors: usize,
    pub panicked: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Confirmed { delivered } => {
                self.confirmed += 1;
                match delivered {
                    Some(true) => self.alerts_sent += 1,
                    Some(false) => self.alerts_failed += 1,
                    None => {}
                }
            }
            Outcome::Pending => self.pending += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::Idle => self.idle += 1,
            Outcome::FetchFailed => self.fetch_errors += 1,
            Outcome::Panicked => self.panicked += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// `delivered` is set when an alert was attempted
    Confirmed { delivered: Option<bool> },
    Pending,
    Stale,
    Idle,
    FetchFailed,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub polling: PollingStats,
    pub reorg: ReorgStats,
    pub alerts: AlertStats,
    pub cascade: Vec<CascadeStats>,
}

type Read = anyhow::Result<Option<PositionSnapshot>>;

pub struct Engine {
    settings: EngineSettings,
    sources: HashMap<String, Arc<dyn DataSource>>,
    prices: Option<Arc<PriceConsensus>>,
    gas: Option<Arc<dyn GasPriceSource>>,
    batch: BatchReader,
    scheduler: Scheduler,
    reorg: ReorgTracker,
    risk: RiskEngine,
    alerts: AlertStateMachine,
    cascade: CascadeDetector,
    notifier: Arc<dyn NotificationSink>,
    persistence: Arc<dyn PersistenceSink>,
    metrics: Arc<dyn MetricsSink>,
    assessments: dashmap::DashMap<EntityId, RiskAssessment>,
    cycles: AtomicU64,
    last_cycle: Mutex<Option<CycleReport>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("entities", &self.scheduler.len())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    pub fn new(config: &SentinelConfig) -> Self {
        let risk = RiskEngine::new(&config.risk);
        let thresholds = *risk.thresholds();
        Self {
            settings: config.engine.clone(),
            sources: HashMap::new(),
            prices: None,
            gas: None,
            batch: BatchReader::new(config.engine.batch_size, config.engine.fallback_concurrency),
            scheduler: Scheduler::new(config.polling.clone()),
            reorg: ReorgTracker::new(config.reorg.clone(), thresholds),
            risk,
            alerts: AlertStateMachine::new(config.alerts.clone(), thresholds),
            cascade: CascadeDetector::new(config.cascade.clone()),
            notifier: Arc::new(LogNotificationSink),
            persistence: Arc::new(NoopPersistence),
            metrics: metrics::noop(),
            assessments: dashmap::DashMap::new(),
            cycles: AtomicU64::new(0),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.insert(source.id().to_string(), source);
        self
    }

    pub fn with_prices(mut self, prices: Arc<PriceConsensus>) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn with_gas(mut self, gas: Arc<dyn GasPriceSource>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn alerts(&self) -> &AlertStateMachine {
        &self.alerts
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start monitoring `account` on `source`. Stored preferences are loaded
    /// best-effort. Returns false when the pair was already watched.
    pub async fn watch(&self, account: &str, source: &str) -> anyhow::Result<bool> {
        if !self.sources.contains_key(source) {
            anyhow::bail!("unknown data source {source}");
        }
        let id = EntityId::new(account, source);
        if !self.scheduler.register(id.clone(), Instant::now()) {
            return Ok(false);
        }
        match self.persistence.load_preferences(account).await {
            Ok(Some(preferences)) => self.alerts.set_preferences(account, preferences),
            Ok(None) => {}
            Err(e) => warn!(account, error = %e, "Failed to load alert preferences"),
        }
        info!(entity = %id, "Watching position");
        Ok(true)
    }

    pub fn unwatch(&self, id: &EntityId) -> bool {
        let removed = self.scheduler.unregister(id).is_some();
        self.reorg.forget(id);
        self.alerts.forget_source(&id.account, &id.source);
        self.assessments.remove(id);
        removed
    }

    pub fn assessment(&self, id: &EntityId) -> Option<RiskAssessment> {
        self.assessments.get(id).map(|a| a.clone())
    }

    /// Portfolio view of `account` across its confirmed sources.
    pub fn unified(&self, account: &str) -> Option<UnifiedScore> {
        let owned: Vec<(String, RiskAssessment)> = self
            .assessments
            .iter()
            .filter(|e| e.key().account == account)
            .map(|e| (e.key().source.clone(), e.value().clone()))
            .collect();
        if owned.is_empty() {
            return None;
        }
        Some(self.risk.unified(owned.iter().map(|(s, a)| (s.as_str(), a))))
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle: *self.last_cycle.lock(),
            polling: self.scheduler.stats(),
            reorg: self.reorg.stats(),
            alerts: self.alerts.stats(),
            cascade: self.cascade.all_stats(),
        }
    }

    /// Poll every entity due at `now`.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_cycle(&self, now: Instant) -> CycleReport {
        let due = self.scheduler.due(now);
        let mut report = CycleReport {
            polled: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            return report;
        }

        let mut by_source: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for id in due {
            by_source.entry(id.source.clone()).or_default().push(id);
        }

        let reads: Vec<(EntityId, Read)> = join_all(
            by_source
                .into_iter()
                .map(|(source, ids)| self.read_source(source, ids)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let gas = self.gas_quote().await;

        let outcomes: Vec<Outcome> = futures::stream::iter(reads)
            .map(|(id, read)| self.guarded(id, read, gas, now))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle.lock() = Some(report);
        report
    }

    async fn read_source(&self, source_id: String, ids: Vec<EntityId>) -> Vec<(EntityId, Read)> {
        let Some(source) = self.sources.get(&source_id).cloned() else {
            return ids
                .into_iter()
                .map(|id| (id, Err(anyhow!("unknown data source {source_id}"))))
                .collect();
        };

        let accounts: Vec<String> = ids.iter().map(|id| id.account.clone()).collect();
        match AssertUnwindSafe(self.batch.read_positions(&source, &accounts))
            .catch_unwind()
            .await
        {
            Ok(results) => ids.into_iter().zip(results.into_iter().map(|(_, r)| r)).collect(),
            Err(_) => {
                error!(source = %source_id, accounts = accounts.len(), "Data source panicked during read");
                self.metrics.increment(Metric::PipelineErrors);
                ids.into_iter()
                    .map(|id| (id, Err(anyhow!("data source {source_id} panicked"))))
                    .collect()
            }
        }
    }

    async fn gas_quote(&self) -> Option<GasQuote> {
        let gas = self.gas.as_ref()?;
        let prices = self.prices.as_ref()?;
        let gas_price_gwei = match gas.gas_price_gwei().await {
            Ok(gwei) => gwei,
            Err(e) => {
                debug!(source = gas.name(), error = %e, "Gas price unavailable");
                return None;
            }
        };
        match prices.get_price(GAS_ASSET).await {
            Ok(price) => Some(GasQuote {
                gas_price_gwei,
                eth_price_usd: price.value,
            }),
            Err(e) => {
                debug!(error = %e, "Gas asset price unavailable");
                None
            }
        }
    }

    async fn guarded(&self, id: EntityId, read: Read, gas: Option<GasQuote>, now: Instant) -> Outcome {
        match AssertUnwindSafe(self.process(&id, read, gas, now)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(entity = %id, "Entity pipeline panicked, skipping this cycle");
                self.metrics.increment(Metric::PipelineErrors);
                self.scheduler.defer(&id, now, true);
                Outcome::Panicked
            }
        }
    }

    async fn process(&self, id: &EntityId, read: Read, gas: Option<GasQuote>, now: Instant) -> Outcome {
        let raw = match read {
            Ok(Some(raw)) => raw,
            // An empty account is confirmed like any other read
            Ok(None) => PositionSnapshot::empty(self.reorg.floor_block(id).unwrap_or(0)),
            Err(e) => {
                warn!(entity = %id, error = %e, "Position read failed");
                self.scheduler.defer(id, now, true);
                return Outcome::FetchFailed;
            }
        };

        let prices = self.prefetch_prices(&raw).await;

        // Commit section: no awaits until the entity is rescheduled
        let unix = unix_now();
        let (state, newly) = match self.reorg.observe(id, raw, unix) {
            Observation::Confirmed { state, newly } => (state, newly),
            Observation::Pending { depth, required } => {
                debug!(entity = %id, depth, required, "Awaiting confirmations");
                self.scheduler.defer(id, now, false);
                return Outcome::Pending;
            }
            Observation::Reset { discarded_block } => {
                let reorg = SentinelError::ReorgDetected {
                    entity: id.to_string(),
                    block: discarded_block,
                };
                debug!(error = %reorg, "Confirmation depth reset");
                self.metrics.increment(Metric::ReorgResets);
                self.scheduler.defer(id, now, false);
                return Outcome::Pending;
            }
            Observation::Stale => {
                debug!(entity = %id, "Stale read ignored");
                self.scheduler.defer(id, now, false);
                return Outcome::Stale;
            }
        };
        if newly {
            self.metrics.increment(Metric::StatesConfirmed);
        }
        if state.snapshot.is_empty() {
            if newly {
                debug!(entity = %id, "No active position");
            }
            self.alerts.forget_source(&id.account, &id.source);
            self.assessments.remove(id);
            self.scheduler.reschedule(id, None, None, now);
            return Outcome::Idle;
        }

        let (repriced, degraded) = reprice(&state.snapshot, &prices);
        let mut assessment = self.risk.assess(&repriced);
        assessment.degraded_assets = degraded;
        if assessment.is_degraded() {
            debug!(entity = %id, assets = ?assessment.degraded_assets, "Scoring with degraded prices");
        }
        self.assessments.insert(id.clone(), assessment.clone());

        let pending = self
            .alerts
            .evaluate(&id.account, &id.source, &assessment, gas, unix);
        let hf = assessment.has_debt().then_some(assessment.health_factor);
        self.scheduler.reschedule(id, hf, Some(assessment.tier), now);

        // Best-effort tail, bounded so a hung sink cannot hold the cycle
        let sink_timeout = self.settings.sink_timeout();
        if newly {
            match timeout(sink_timeout, self.persistence.record_snapshot(id, &state)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(entity = %id, error = %e, "Snapshot persistence failed"),
                Err(_) => warn!(entity = %id, timeout_ms = self.settings.sink_timeout_ms, "Snapshot persistence timed out"),
            }
        }

        let Some(pending) = pending else {
            return Outcome::Confirmed { delivered: None };
        };
        let notification = Notification::Position(pending.message.clone());
        let failure = match timeout(sink_timeout, self.notifier.deliver(&notification)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no response within {}ms", self.settings.sink_timeout_ms)),
        };
        let delivered = match failure {
            None => {
                self.metrics.increment(Metric::AlertsSent);
                true
            }
            Some(reason) => {
                let failure = SentinelError::NotificationDeliveryFailed {
                    account: id.account.clone(),
                    reason,
                };
                warn!(error = %failure, "Alert will be retried on the next eligible evaluation");
                self.metrics.increment(Metric::AlertsFailed);
                false
            }
        };
        self.alerts.commit(&pending, delivered);
        Outcome::Confirmed {
            delivered: Some(delivered),
        }
    }

    async fn prefetch_prices(&self, snapshot: &PositionSnapshot) -> HashMap<String, ConsensusPrice> {
        let Some(prices) = self.prices.as_ref() else {
            return HashMap::new();
        };
        let mut assets: Vec<String> = snapshot.assets().map(str::to_string).collect();
        if assets.is_empty() {
            return HashMap::new();
        }
        assets.sort();
        assets.dedup();

        let mut resolved = HashMap::new();
        for (asset, result) in prices.get_prices(&assets).await {
            match result {
                Ok(price) => {
                    if let Some(divergence) = price.divergence() {
                        warn!(error = %divergence, "Price sources disagree, using primary");
                    }
                    resolved.insert(asset, price);
                }
                Err(e) => debug!(asset = %asset, error = %e, "No consensus price"),
            }
        }
        resolved
    }

    /// Scan each source's next block range for liquidations.
    pub async fn run_cascade_pass(&self) -> Vec<CascadeAlert> {
        let mut sources: Vec<(&String, &Arc<dyn DataSource>)> = self.sources.iter().collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));

        let mut alerts = Vec::new();
        for (source_id, source) in sources {
            match AssertUnwindSafe(self.scan_source(source_id, source)).catch_unwind().await {
                Ok(Ok(Some(alert))) => alerts.push(alert),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(source = %source_id, error = %e, "Liquidation event scan failed"),
                Err(_) => {
                    error!(source = %source_id, "Liquidation event scan panicked");
                    self.metrics.increment(Metric::PipelineErrors);
                }
            }
        }

        for alert in &alerts {
            self.metrics.increment(Metric::CascadeAlerts);
            let notification = Notification::Cascade(alert.clone());
            match timeout(self.settings.sink_timeout(), self.notifier.deliver(&notification)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(source = %alert.source, error = %e, "Cascade notification failed");
                    self.metrics.increment(Metric::AlertsFailed);
                }
                Err(_) => {
                    warn!(source = %alert.source, "Cascade notification timed out");
                    self.metrics.increment(Metric::AlertsFailed);
                }
            }
        }
        alerts
    }

    async fn scan_source(&self, source_id: &str, source: &Arc<dyn DataSource>) -> anyhow::Result<Option<CascadeAlert>> {
        let latest = source.latest_block().await?;
        let Some(range) = self.cascade.next_range(source_id, latest) else {
            return Ok(self.cascade.ingest(source_id, Vec::new(), unix_now()));
        };
        let events = source.fetch_liquidation_events(range).await?;
        debug!(source = source_id, from = range.from, to = range.to, events = events.len(), "Scanned liquidations");
        self.metrics.add(Metric::CascadeEvents, events.len() as u64);
        let alert = self.cascade.ingest(source_id, events, unix_now());
        self.cascade.advance(source_id, range.to);
        Ok(alert)
    }

    /// Drive polling and cascade scanning until `shutdown` flips.
    ///
    /// On shutdown an in-flight cycle gets `shutdown_grace` to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            sources = self.sources.len(),
            entities = self.scheduler.len(),
            tick_ms = self.settings.tick_ms,
            "Starting monitoring engine"
        );

        let cascade = tokio::spawn(Arc::clone(&self).cascade_loop(shutdown.clone()));
        let grace = self.settings.shutdown_grace();
        let mut ticker = interval(self.settings.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let cycle = self.run_cycle(Instant::now());
            tokio::pin!(cycle);
            tokio::select! {
                report = &mut cycle => self.log_cycle(&report),
                _ = shutdown.changed() => {
                    info!(grace_secs = grace.as_secs(), "Shutdown requested, draining in-flight cycle");
                    match timeout(grace, &mut cycle).await {
                        Ok(report) => self.log_cycle(&report),
                        Err(_) => warn!("Grace period elapsed, abandoning in-flight cycle"),
                    }
                    break;
                }
            }
        }

        if timeout(grace, cascade).await.is_err() {
            warn!("Cascade scanner did not stop within the grace period");
        }
        info!(cycles = self.cycles.load(Ordering::Relaxed), "Monitoring engine stopped");
        Ok(())
    }

    async fn cascade_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.cascade_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let alerts = self.run_cascade_pass().await;
                    if !alerts.is_empty() {
                        info!(alerts = alerts.len(), "Cascade pass raised alerts");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn log_cycle(&self, report: &CycleReport) {
        if report.polled == 0 {
            return;
        }
        if report.fetch_errors > 0 || report.panicked > 0 || report.alerts_failed > 0 {
            warn!(
                polled = report.polled,
                confirmed = report.confirmed,
                fetch_errors = report.fetch_errors,
                panicked = report.panicked,
                alerts_failed = report.alerts_failed,
                "Cycle completed with errors"
            );
        } else {
            debug!(
                polled = report.polled,
                confirmed = report.confirmed,
                pending = report.pending,
                alerts = report.alerts_sent,
                "Cycle completed"
            );
        }
    }
}

/// Apply consensus prices to a snapshot's asset breakdown.
///
/// Totals move by each line's price change, so holdings the breakdown does
/// not list keep the value the source reported. Assets without a consensus
/// price keep the source's price and are reported as degraded. Snapshots
/// without a breakdown are returned unchanged.
fn reprice(snapshot: &PositionSnapshot, prices: &HashMap<String, ConsensusPrice>) -> (PositionSnapshot, Vec<String>) {
    let mut repriced = snapshot.clone();
    if repriced.collateral.is_empty() && repriced.debt.is_empty() {
        return (repriced, Vec::new());
    }

    let mut degraded = Vec::new();
    let collateral_delta = revalue(&mut repriced.collateral, prices, &mut degraded);
    let debt_delta = revalue(&mut repriced.debt, prices, &mut degraded);
    repriced.collateral_usd = (snapshot.collateral_usd + collateral_delta).max(0.0);
    repriced.debt_usd = (snapshot.debt_usd + debt_delta).max(0.0);
    (repriced, degraded)
}

/// Reprice `lines` in place, returning the change in their USD value.
fn revalue(lines: &mut [AssetBalance], prices: &HashMap<String, ConsensusPrice>, degraded: &mut Vec<String>) -> f64 {
    let mut delta = 0.0;
    for balance in lines {
        match prices.get(&balance.asset.trim().to_uppercase()) {
            Some(price) => {
                delta += balance.quantity * (price.value - balance.price_usd);
                balance.price_usd = price.value;
            }
            None => {
                if !degraded.contains(&balance.asset) {
                    degraded.push(balance.asset.clone());
                }
            }
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::config::ReorgSettings;
    use crate::position::RiskTier;
    use crate::scheduler::PollBand;
    use async_trait::async_trait;
    use sentinel_chain::{
        BlockRange, ConsensusConfig, LiquidationEvent, PriceQuote, PriceSource, SourceCapabilities, SourceKind,
    };
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeSource {
        id: String,
        positions: Mutex<HashMap<String, PositionSnapshot>>,
        block: AtomicU64,
        failing: Mutex<Vec<String>>,
        panics: AtomicBool,
        events: Mutex<Vec<LiquidationEvent>>,
    }

    impl FakeSource {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                positions: Mutex::new(HashMap::new()),
                block: AtomicU64::new(0),
                failing: Mutex::new(Vec::new()),
                panics: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, account: &str, collateral: f64, debt: f64) {
            self.positions
                .lock()
                .insert(account.to_string(), PositionSnapshot::new(collateral, debt, 0.8, 0));
        }
    }

    #[async_trait]
    impl DataSource for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities { supports_batch: false }
        }

        async fn fetch_raw_position(&self, account: &str) -> anyhow::Result<Option<PositionSnapshot>> {
            if self.panics.load(Ordering::SeqCst) {
                panic!("decoder bug");
            }
            if self.failing.lock().iter().any(|a| a == account) {
                anyhow::bail!("all endpoints unavailable");
            }
            let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.positions.lock().get(account).cloned().map(|mut snapshot| {
                snapshot.block_number = block;
                snapshot
            }))
        }

        async fn latest_block(&self) -> anyhow::Result<u64> {
            Ok(1_000)
        }

        async fn fetch_liquidation_events(&self, range: BlockRange) -> anyhow::Result<Vec<LiquidationEvent>> {
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| e.block_number >= range.from && e.block_number <= range.to)
                .cloned()
                .collect())
        }
    }

    /// Fixed USD prices for a few assets.
    #[derive(Debug)]
    struct StaticPrices(HashMap<&'static str, f64>);

    #[async_trait]
    impl PriceSource for StaticPrices {
        fn name(&self) -> &str {
            "static"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Oracle
        }

        async fn quote(&self, asset: &str) -> anyhow::Result<Option<PriceQuote>> {
            Ok(self.0.get(asset).map(|value| PriceQuote {
                asset: asset.to_string(),
                value: *value,
                source: "static".to_string(),
                weight: self.weight(),
                observed_at: unix_now(),
                is_stale: false,
            }))
        }
    }

    #[derive(Debug, Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("chat service down");
            }
            self.delivered.lock().push(notification.clone());
            Ok(())
        }
    }

    fn config() -> SentinelConfig {
        let mut config = SentinelConfig::default();
        config.reorg = ReorgSettings {
            confirmations: 1,
            critical_confirmations: 1,
            ..ReorgSettings::default()
        };
        config
    }

    fn engine(sources: &[Arc<FakeSource>], sink: Arc<RecordingSink>) -> Engine {
        let mut engine = Engine::new(&config()).with_notifier(sink);
        for source in sources {
            engine = engine.with_source(Arc::clone(source) as Arc<dyn DataSource>);
        }
        engine
    }

    fn position_alerts(sink: &RecordingSink) -> Vec<crate::alert::AlertMessage> {
        sink.delivered
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Position(m) => Some(m.clone()),
                Notification::Cascade(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_crash_alerts_after_confirmation() {
        let source = FakeSource::new("fake");
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&[Arc::clone(&source)], Arc::clone(&sink));
        source.set("0xabc", 10_000.0, 4_000.0);
        assert!(engine.watch("0xabc", "fake").await.unwrap());

        let t0 = Instant::now();
        let report = engine.run_cycle(t0).await;
        assert_eq!(report.pending, 1);

        // Pending entities are re-read on the critical cadence
        assert_eq!(engine.run_cycle(t0 + Duration::from_secs(10)).await.polled, 0);
        let report = engine.run_cycle(t0 + Duration::from_secs(30)).await;
        assert_eq!(report.confirmed, 1);
        let id = EntityId::new("0xabc", "fake");
        let healthy = engine.assessment(&id).unwrap();
        assert!((healthy.health_factor - 2.0).abs() < 1e-9);
        assert_eq!(healthy.tier, RiskTier::Healthy);
        assert!(position_alerts(&sink).is_empty());
        // HF 2.0 polls every 120s
        assert_eq!(
            engine.scheduler().get(&id).unwrap().next_poll,
            t0 + Duration::from_secs(150)
        );

        source.set("0xabc", 5_000.0, 4_000.0);
        let report = engine.run_cycle(t0 + Duration::from_secs(150)).await;
        assert_eq!(report.pending, 1);
        let report = engine.run_cycle(t0 + Duration::from_secs(180)).await;
        assert_eq!(report.alerts_sent, 1);

        let alerts = position_alerts(&sink);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tier, RiskTier::Liquidatable);
        assert_eq!(alerts[0].kind, AlertKind::Escalation);
        assert!((alerts[0].health_factor - 1.0).abs() < 1e-9);
        let stats = engine.stats();
        assert_eq!(stats.reorg.confirmed, 1);
        assert_eq!(stats.last_cycle.map(|c| c.alerts_sent), Some(1));
    }

    #[tokio::test]
    async fn test_failing_account_does_not_block_others() {
        let source = FakeSource::new("fake");
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&[Arc::clone(&source)], Arc::clone(&sink));
        source.set("0xgood", 5_000.0, 4_000.0);
        source.set("0xbad", 5_000.0, 4_000.0);
        source.failing.lock().push("0xbad".to_string());
        engine.watch("0xgood", "fake").await.unwrap();
        engine.watch("0xbad", "fake").await.unwrap();

        let t0 = Instant::now();
        engine.run_cycle(t0).await;
        let report = engine.run_cycle(t0 + Duration::from_secs(30)).await;

        assert_eq!(report.fetch_errors, 1);
        assert_eq!(report.alerts_sent, 1);
        let bad = engine.scheduler().get(&EntityId::new("0xbad", "fake")).unwrap();
        assert_eq!(bad.consecutive_errors, 2);
        assert!(engine.assessment(&EntityId::new("0xbad", "fake")).is_none());
    }

    #[tokio::test]
    async fn test_panicking_source_is_isolated() {
        let healthy = FakeSource::new("healthy");
        let broken = FakeSource::new("broken");
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&[Arc::clone(&healthy), Arc::clone(&broken)], Arc::clone(&sink));
        healthy.set("0xabc", 5_250.0, 4_000.0);
        broken.set("0xabc", 5_250.0, 4_000.0);
        broken.panics.store(true, Ordering::SeqCst);
        engine.watch("0xabc", "healthy").await.unwrap();
        engine.watch("0xabc", "broken").await.unwrap();

        let t0 = Instant::now();
        let first = engine.run_cycle(t0).await;
        assert_eq!(first.fetch_errors, 1);
        let second = engine.run_cycle(t0 + Duration::from_secs(30)).await;
        assert_eq!(second.alerts_sent, 1);

        let alerts = position_alerts(&sink);
        assert_eq!(alerts[0].tier, RiskTier::Critical);
        assert_eq!(alerts[0].source, "healthy");
        assert_eq!(engine.stats().polling.erroring, 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_next_cycle() {
        let source = FakeSource::new("fake");
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let engine = engine(&[Arc::clone(&source)], Arc::clone(&sink));
        source.set("0xabc", 5_000.0, 4_000.0);
        engine.watch("0xabc", "fake").await.unwrap();

        let t0 = Instant::now();
        engine.run_cycle(t0).await;
        let report = engine.run_cycle(t0 + Duration::from_secs(30)).await;
        assert_eq!(report.alerts_failed, 1);

        sink.fail.store(false, Ordering::SeqCst);
        let report = engine.run_cycle(t0 + Duration::from_secs(60)).await;
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(position_alerts(&sink).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_position_polls_idle_once_confirmed() {
        let source = FakeSource::new("fake");
        let engine = engine(&[Arc::clone(&source)], Arc::new(RecordingSink::default()));
        engine.watch("0xnobody", "fake").await.unwrap();
        let id = EntityId::new("0xnobody", "fake");

        let t0 = Instant::now();
        assert_eq!(engine.run_cycle(t0).await.pending, 1);
        let later = t0 + Duration::from_secs(30);
        assert_eq!(engine.run_cycle(later).await.idle, 1);
        let entity = engine.scheduler().get(&id).unwrap();
        assert_eq!(entity.band, PollBand::Idle);
        assert_eq!(entity.next_poll, later + Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_single_empty_read_keeps_critical_schedule() {
        let source = FakeSource::new("fake");
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&[Arc::clone(&source)], Arc::clone(&sink));
        source.set("0xabc", 5_250.0, 4_000.0);
        engine.watch("0xabc", "fake").await.unwrap();
        let id = EntityId::new("0xabc", "fake");

        let t0 = Instant::now();
        engine.run_cycle(t0).await;
        assert_eq!(engine.run_cycle(t0 + Duration::from_secs(30)).await.confirmed, 1);
        assert_eq!(engine.scheduler().get(&id).unwrap().band, PollBand::Critical);

        // One read on a fork where the position does not exist
        source.positions.lock().remove("0xabc");
        let report = engine.run_cycle(t0 + Duration::from_secs(60)).await;
        assert_eq!(report.pending, 1);
        assert_eq!(report.idle, 0);
        let entity = engine.scheduler().get(&id).unwrap();
        assert_eq!(entity.band, PollBand::Critical);
        assert_eq!(entity.next_poll, t0 + Duration::from_secs(90));
        assert!(engine.assessment(&id).is_some());
        assert_eq!(engine.stats().reorg.tracked, 1);

        // The position comes back before the empty read is confirmed
        source.set("0xabc", 5_250.0, 4_000.0);
        let report = engine.run_cycle(t0 + Duration::from_secs(90)).await;
        assert_eq!(report.idle, 0);
        assert_eq!(engine.scheduler().get(&id).unwrap().band, PollBand::Critical);
        assert_eq!(position_alerts(&sink).len(), 1);
    }

    #[derive(Debug)]
    struct HungSink;

    #[async_trait]
    impl NotificationSink for HungSink {
        async fn deliver(&self, _notification: &Notification) -> anyhow::Result<()> {
            std::future::pending::<anyhow::Result<()>>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_notifier_does_not_stall_cycle() {
        let source = FakeSource::new("fake");
        let engine = Engine::new(&config())
            .with_notifier(Arc::new(HungSink))
            .with_source(Arc::clone(&source) as Arc<dyn DataSource>);
        source.set("0xabc", 5_000.0, 4_000.0);
        engine.watch("0xabc", "fake").await.unwrap();

        let t0 = Instant::now();
        engine.run_cycle(t0).await;
        let report = tokio::time::timeout(Duration::from_secs(60), engine.run_cycle(t0 + Duration::from_secs(30)))
            .await
            .expect("cycle finishes despite a hung notifier");

        assert_eq!(report.confirmed, 1);
        assert_eq!(report.alerts_failed, 1);
        assert_eq!(engine.alerts().failures("0xabc"), 1);
    }

    #[tokio::test]
    async fn test_watch_rejects_unknown_source() {
        let engine = engine(&[], Arc::new(RecordingSink::default()));
        assert!(engine.watch("0xabc", "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_cascade_pass_alerts_once() {
        let source = FakeSource::new("fake");
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&[Arc::clone(&source)], Arc::clone(&sink));
        let now = unix_now();
        *source.events.lock() = (0..6)
            .map(|n| LiquidationEvent {
                source: "fake".to_string(),
                tx_hash: format!("0x{n:02x}"),
                log_index: 0,
                block_number: 900 + n,
                borrower: format!("0xb{n}"),
                liquidator: "0xliq".to_string(),
                value_usd: 200_000.0,
                timestamp: now,
            })
            .collect();

        let alerts = engine.run_cascade_pass().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_count, 6);
        assert!(engine.run_cascade_pass().await.is_empty());
        assert_eq!(sink.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_breakdown_scored_at_consensus_prices() {
        let source = FakeSource::new("fake");
        let feed: Arc<dyn PriceSource> = Arc::new(StaticPrices(HashMap::from([("WETH", 1_500.0)])));
        let prices = Arc::new(PriceConsensus::new(vec![feed], ConsensusConfig::default()));
        let engine = engine(&[Arc::clone(&source)], Arc::new(RecordingSink::default())).with_prices(prices);

        // 4 WETH read at $2,500 against 4,000 USDC
        let mut snapshot = PositionSnapshot::new(10_000.0, 4_000.0, 0.8, 0);
        snapshot.collateral = vec![AssetBalance {
            asset: "WETH".to_string(),
            quantity: 4.0,
            price_usd: 2_500.0,
            apy: Some(0.02),
        }];
        snapshot.debt = vec![AssetBalance {
            asset: "USDC".to_string(),
            quantity: 4_000.0,
            price_usd: 1.0,
            apy: Some(0.05),
        }];
        source.positions.lock().insert("0xabc".to_string(), snapshot);
        assert!(engine.watch("0xabc", "fake").await.unwrap());

        let t0 = Instant::now();
        engine.run_cycle(t0).await;
        assert_eq!(engine.run_cycle(t0 + Duration::from_secs(30)).await.confirmed, 1);

        let assessment = engine.assessment(&EntityId::new("0xabc", "fake")).unwrap();
        assert!((assessment.collateral_usd - 6_000.0).abs() < 1e-9);
        assert!((assessment.health_factor - 1.2).abs() < 1e-9);
        assert_eq!(assessment.degraded_assets, vec!["USDC".to_string()]);
    }

    #[test]
    fn test_reprice_marks_missing_assets_degraded() {
        // $1,000 of the collateral sits in a reserve the breakdown does not list
        let mut snapshot = PositionSnapshot::new(5_000.0, 1_000.0, 0.8, 1);
        snapshot.collateral = vec![AssetBalance {
            asset: "WETH".to_string(),
            quantity: 2.0,
            price_usd: 2_000.0,
            apy: None,
        }];
        snapshot.debt = vec![AssetBalance {
            asset: "USDC".to_string(),
            quantity: 1_000.0,
            price_usd: 1.0,
            apy: None,
        }];
        let mut prices = HashMap::new();
        prices.insert(
            "WETH".to_string(),
            ConsensusPrice {
                asset: "WETH".to_string(),
                value: 1_500.0,
                source: "test".to_string(),
                weight: 0.95,
                observed_at: 0,
                cross_check: None,
                deviation_pct: None,
                divergent: false,
            },
        );

        let (repriced, degraded) = reprice(&snapshot, &prices);
        assert_eq!(repriced.collateral_usd, 4_000.0);
        assert_eq!(repriced.collateral[0].price_usd, 1_500.0);
        assert_eq!(repriced.debt_usd, 1_000.0);
        assert_eq!(degraded, vec!["USDC".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let source = FakeSource::new("fake");
        let engine = Arc::new(engine(&[Arc::clone(&source)], Arc::new(RecordingSink::default())));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&engine).run(rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(30), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
