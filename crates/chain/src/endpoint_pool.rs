//! Resilient endpoint pool with priority fallback and health tracking.
//!
//! Each endpoint carries its own rate limiter and a record guarded by its own
//! lock, so concurrent operations only contend on the endpoint they use.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SentinelError};
use crate::metrics::{self, Metric, MetricsSink};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};

/// Pool behaviour.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Timeout applied to every individual call
    pub call_timeout: Duration,
    /// Cooldown after the first failure
    pub cooldown: Duration,
    /// Growth factor applied per additional consecutive failure (1.0 = fixed)
    pub cooldown_multiplier: f64,
    /// Upper bound on the cooldown
    pub max_cooldown: Duration,
    /// Consecutive failures after which the endpoint is disabled
    pub failure_ceiling: u32,
    /// Pause before falling through to the next endpoint
    pub failover_delay: Duration,
    /// Per-endpoint rate limit
    pub rate_limit: RateLimitConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
            cooldown_multiplier: 1.0,
            max_cooldown: Duration::from_secs(600),
            failure_ceiling: 10,
            failover_delay: Duration::from_millis(50),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl PoolConfig {
    fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16) as i32;
        let secs = self.cooldown.as_secs_f64() * self.cooldown_multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs).min(self.max_cooldown.max(self.cooldown))
    }
}

/// Configured endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    /// Lower value = tried first
    pub priority: u32,
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority,
        }
    }
}

/// Endpoint health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Active,
    Cooling { until: Instant },
    /// Needs an operator to re-enable
    Disabled,
}

impl EndpointState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooling { .. } => "cooling",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug)]
struct EndpointRecord {
    state: EndpointState,
    consecutive_failures: u32,
    total_failures: u64,
    total_calls: u64,
    latency_ms: Option<f64>,
    last_failure: Option<Instant>,
}

impl EndpointRecord {
    fn new() -> Self {
        Self {
            state: EndpointState::Active,
            consecutive_failures: 0,
            total_failures: 0,
            total_calls: 0,
            latency_ms: None,
            last_failure: None,
        }
    }

    /// Promote an expired cooldown back to Active. Returns whether usable.
    fn is_available(&mut self, now: Instant) -> bool {
        match self.state {
            EndpointState::Active => true,
            EndpointState::Disabled => false,
            EndpointState::Cooling { until } if now >= until => {
                self.state = EndpointState::Active;
                true
            }
            EndpointState::Cooling { .. } => false,
        }
    }
}

struct Endpoint {
    spec: EndpointSpec,
    url: Arc<str>,
    limiter: RateLimiter,
    record: Mutex<EndpointRecord>,
}

/// Snapshot of one endpoint for stats and logging.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub name: String,
    pub priority: u32,
    pub state: EndpointState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_calls: u64,
    pub latency_ms: Option<f64>,
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub calls_per_minute: usize,
    pub error_rate: f64,
    pub endpoints: Vec<EndpointStatus>,
}

/// Sliding one-minute record of calls and errors.
#[derive(Debug)]
pub struct CallTracker {
    window: Duration,
    calls: Mutex<VecDeque<(Instant, bool)>>,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CallTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        calls.push_back((now, success));
        Self::prune(&mut calls, now, self.window);
    }

    pub fn calls_per_minute(&self) -> usize {
        let mut calls = self.calls.lock();
        Self::prune(&mut calls, Instant::now(), self.window);
        calls.len()
    }

    pub fn error_rate(&self) -> f64 {
        let mut calls = self.calls.lock();
        Self::prune(&mut calls, Instant::now(), self.window);
        if calls.is_empty() {
            return 0.0;
        }
        let errors = calls.iter().filter(|(_, ok)| !ok).count();
        errors as f64 / calls.len() as f64
    }

    fn prune(calls: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while let Some((at, _)) = calls.front() {
            if now.saturating_duration_since(*at) > window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Ordered set of endpoints for one chain.
pub struct EndpointPool {
    chain: String,
    endpoints: Vec<Endpoint>,
    config: PoolConfig,
    tracker: CallTracker,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("chain", &self.chain)
            .field("endpoints", &self.endpoints.len())
            .field("call_timeout", &self.config.call_timeout)
            .finish()
    }
}

impl EndpointPool {
    pub fn new(chain: impl Into<String>, specs: Vec<EndpointSpec>, config: PoolConfig) -> Self {
        let mut specs = specs;
        specs.sort_by_key(|s| s.priority);

        let endpoints = specs
            .into_iter()
            .map(|spec| Endpoint {
                url: Arc::from(spec.url.as_str()),
                limiter: RateLimiter::new(config.rate_limit),
                record: Mutex::new(EndpointRecord::new()),
                spec,
            })
            .collect();

        Self {
            chain: chain.into(),
            endpoints,
            config,
            tracker: CallTracker::default(),
            metrics: metrics::noop(),
        }
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Run `operation` against the first healthy endpoint, falling through on failure.
    ///
    /// The operation receives the endpoint URL. Cooling and disabled endpoints
    /// are skipped; the whole call fails only once every candidate is exhausted.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(Arc<str>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempted = 0usize;
        let mut last_error = String::from("no endpoint available");

        for endpoint in &self.endpoints {
            if !endpoint.record.lock().is_available(Instant::now()) {
                continue;
            }

            if attempted > 0 {
                self.metrics.increment(Metric::EndpointFailovers);
                if !self.config.failover_delay.is_zero() {
                    tokio::time::sleep(self.config.failover_delay).await;
                }
            }
            attempted += 1;

            endpoint.limiter.acquire().await;
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.config.call_timeout, operation(Arc::clone(&endpoint.url)))
                    .await;
            let latency = started.elapsed();
            self.metrics.increment(Metric::RpcCalls);

            let err = match outcome {
                Ok(Ok(value)) => {
                    self.record_success(endpoint, started, latency);
                    return Ok(value);
                }
                Ok(Err(e)) => SentinelError::EndpointUnavailable {
                    endpoint: endpoint.spec.name.clone(),
                    reason: format!("{e:#}"),
                },
                Err(_) => SentinelError::EndpointUnavailable {
                    endpoint: endpoint.spec.name.clone(),
                    reason: format!("timed out after {:?}", self.config.call_timeout),
                },
            };

            self.record_failure(endpoint);
            warn!(chain = %self.chain, error = %err, "Endpoint call failed");
            last_error = err.to_string();
        }

        Err(SentinelError::AllEndpointsUnavailable {
            attempted,
            last_error,
        })
    }

    fn record_success(&self, endpoint: &Endpoint, started: Instant, latency: Duration) {
        self.tracker.record(true);
        self.metrics.observe_latency(&endpoint.spec.name, latency);

        let mut record = endpoint.record.lock();
        record.total_calls += 1;
        record.consecutive_failures = 0;

        let sample = latency.as_secs_f64() * 1000.0;
        record.latency_ms = Some(match record.latency_ms {
            Some(prev) => prev * 0.8 + sample * 0.2,
            None => sample,
        });

        // A failure recorded while this call was in flight keeps its cooldown.
        let failed_meanwhile = record.last_failure.is_some_and(|at| at > started);
        if matches!(record.state, EndpointState::Cooling { .. }) && !failed_meanwhile {
            record.state = EndpointState::Active;
        }
    }

    fn record_failure(&self, endpoint: &Endpoint) {
        self.tracker.record(false);
        self.metrics.increment(Metric::RpcErrors);

        let now = Instant::now();
        let mut record = endpoint.record.lock();
        record.total_calls += 1;
        record.total_failures += 1;
        record.consecutive_failures += 1;
        record.last_failure = Some(now);

        if record.state == EndpointState::Disabled {
            return;
        }

        if record.consecutive_failures >= self.config.failure_ceiling {
            record.state = EndpointState::Disabled;
            warn!(
                chain = %self.chain,
                endpoint = %endpoint.spec.name,
                failures = record.consecutive_failures,
                "Endpoint disabled after repeated failures"
            );
        } else {
            let cooldown = self.config.cooldown_for(record.consecutive_failures);
            record.state = EndpointState::Cooling {
                until: now + cooldown,
            };
            debug!(
                chain = %self.chain,
                endpoint = %endpoint.spec.name,
                cooldown_secs = cooldown.as_secs_f64(),
                "Endpoint cooling"
            );
        }
    }

    /// Operator action: put a disabled or cooling endpoint back into rotation.
    pub fn enable(&self, name: &str) -> bool {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.spec.name == name) else {
            return false;
        };
        let mut record = endpoint.record.lock();
        record.state = EndpointState::Active;
        record.consecutive_failures = 0;
        info!(chain = %self.chain, endpoint = name, "Endpoint re-enabled");
        true
    }

    /// Operator action: take an endpoint out of rotation.
    pub fn disable(&self, name: &str) -> bool {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.spec.name == name) else {
            return false;
        };
        endpoint.record.lock().state = EndpointState::Disabled;
        info!(chain = %self.chain, endpoint = name, "Endpoint disabled by operator");
        true
    }

    pub fn state_of(&self, name: &str) -> Option<EndpointState> {
        let endpoint = self.endpoints.iter().find(|e| e.spec.name == name)?;
        let mut record = endpoint.record.lock();
        record.is_available(Instant::now());
        Some(record.state)
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let endpoints = self
            .endpoints
            .iter()
            .map(|e| {
                let mut record = e.record.lock();
                record.is_available(now);
                EndpointStatus {
                    name: e.spec.name.clone(),
                    priority: e.spec.priority,
                    state: record.state,
                    consecutive_failures: record.consecutive_failures,
                    total_failures: record.total_failures,
                    total_calls: record.total_calls,
                    latency_ms: record.latency_ms,
                }
            })
            .collect();

        PoolStats {
            calls_per_minute: self.tracker.calls_per_minute(),
            error_rate: self.tracker.error_rate(),
            endpoints,
        }
    }
}
