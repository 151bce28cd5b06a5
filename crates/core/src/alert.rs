//! Alert state machine.
//!
//! One record per account. Evaluation is two-phase: [`AlertStateMachine::evaluate`]
//! reserves the alert under the account's entry lock and
//! [`AlertStateMachine::commit`] either keeps the reservation or rolls it back
//! when delivery failed, so the next eligible evaluation retries.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::config::AlertSettings;
use crate::position::{RiskTier, TierThresholds};
use crate::risk::RiskAssessment;

/// Per-tier cooldown overrides in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownOverrides {
    pub liquidatable: Option<u64>,
    pub critical: Option<u64>,
    pub warning: Option<u64>,
    pub healthy: Option<u64>,
}

/// Account-level alert preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPreferences {
    /// Custom upper bound of the Warning tier
    pub warning_hf: Option<f64>,
    /// Custom upper bound of the Critical tier
    pub critical_hf: Option<f64>,
    pub cooldowns: CooldownOverrides,
    pub muted: bool,
}

impl AlertPreferences {
    pub fn thresholds(&self, base: &TierThresholds) -> TierThresholds {
        TierThresholds {
            liquidatable: base.liquidatable,
            critical: self.critical_hf.unwrap_or(base.critical),
            warning: self.warning_hf.unwrap_or(base.warning),
        }
    }
}

/// Gas price and ETH price used for the transaction cost estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GasQuote {
    pub gas_price_gwei: f64,
    pub eth_price_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Tier more severe than the last one sent
    Escalation,
    /// Same tier, cooldown elapsed
    Reminder,
    /// Less severe tier, cooldown elapsed
    Recovery,
    /// Rapid health factor drop
    Deterioration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub account: String,
    pub kind: AlertKind,
    pub tier: RiskTier,
    pub previous_tier: Option<RiskTier>,
    /// Source with the lowest health factor
    pub source: String,
    pub health_factor: f64,
    pub score: f64,
    pub collateral_usd: f64,
    pub debt_usd: f64,
    pub repay_to_target: f64,
    pub deposit_to_target: f64,
    pub target_hf: f64,
    pub hf_drop_pct: Option<f64>,
    pub gas_cost_usd: Option<f64>,
    pub uneconomical: bool,
    pub degraded_assets: Vec<String>,
    pub block_number: u64,
    pub created_at: u64,
}

impl AlertMessage {
    /// Human-readable rendering.
    pub fn text(&self) -> String {
        let mut text = format!(
            "[{}] {} on {}: health factor {:.3} (score {:.0})",
            self.tier.label().to_uppercase(),
            self.account,
            self.source,
            self.health_factor,
            self.score
        );
        if let Some(drop) = self.hf_drop_pct {
            let _ = write!(text, ", down {drop:.1}% within the lookback window");
        }
        if self.repay_to_target > 0.0 {
            let _ = write!(
                text,
                ". Repay ${:.2} or deposit ${:.2} of collateral to reach {:.2}",
                self.repay_to_target, self.deposit_to_target, self.target_hf
            );
        }
        if let Some(cost) = self.gas_cost_usd {
            let _ = write!(text, ". Estimated transaction cost ${cost:.2}");
            if self.uneconomical {
                text.push_str(", may not be economical");
            }
        }
        if !self.degraded_assets.is_empty() {
            let _ = write!(text, ". Stale prices for {}", self.degraded_assets.join(", "));
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HfSample {
    at: u64,
    health_factor: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SentState {
    tier: Option<RiskTier>,
    at: u64,
    deterioration_at: Option<u64>,
}

#[derive(Debug, Default)]
struct AlertRecord {
    sent: SentState,
    latest: HashMap<String, RiskAssessment>,
    samples: SmallVec<[HfSample; 8]>,
    failures: u32,
}

/// A reserved alert awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub message: AlertMessage,
    prior: SentState,
    applied: SentState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub accounts: usize,
    pub sent: u64,
    pub failed: u64,
    pub suppressed: u64,
}

#[derive(Debug)]
pub struct AlertStateMachine {
    settings: AlertSettings,
    thresholds: TierThresholds,
    records: DashMap<String, AlertRecord>,
    preferences: DashMap<String, AlertPreferences>,
    sent: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

impl AlertStateMachine {
    pub fn new(settings: AlertSettings, thresholds: TierThresholds) -> Self {
        Self {
            settings,
            thresholds,
            records: DashMap::new(),
            preferences: DashMap::new(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn set_preferences(&self, account: &str, preferences: AlertPreferences) {
        self.preferences.insert(account.to_string(), preferences);
    }

    pub fn preferences(&self, account: &str) -> AlertPreferences {
        self.preferences
            .get(account)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn cooldown_secs(&self, tier: RiskTier, preferences: &AlertPreferences) -> u64 {
        let (custom, default) = match tier {
            RiskTier::Liquidatable => (
                preferences.cooldowns.liquidatable,
                self.settings.liquidatable_cooldown_secs,
            ),
            RiskTier::Critical => (preferences.cooldowns.critical, self.settings.critical_cooldown_secs),
            RiskTier::Warning => (preferences.cooldowns.warning, self.settings.warning_cooldown_secs),
            RiskTier::Healthy => (preferences.cooldowns.healthy, self.settings.healthy_cooldown_secs),
        };
        custom.unwrap_or(default)
    }

    /// `gas price × gas units × ETH price`, in USD.
    pub fn gas_cost_usd(&self, gas: &GasQuote) -> f64 {
        gas.gas_price_gwei * 1e-9 * self.settings.gas_units as f64 * gas.eth_price_usd
    }

    /// Evaluate a fresh assessment of `account` on `source`.
    ///
    /// The account's tier is the worst across its sources. Assessments older
    /// than the last one seen for the same source are ignored.
    pub fn evaluate(
        &self,
        account: &str,
        source: &str,
        assessment: &RiskAssessment,
        gas: Option<GasQuote>,
        now: u64,
    ) -> Option<PendingAlert> {
        let preferences = self.preferences(account);
        let thresholds = preferences.thresholds(&self.thresholds);
        let mut record = self.records.entry(account.to_string()).or_default();

        if let Some(previous) = record.latest.get(source) {
            if assessment.block_number < previous.block_number {
                debug!(account, source, block = assessment.block_number, "Ignoring out-of-order assessment");
                return None;
            }
        }
        record.latest.insert(source.to_string(), assessment.clone());

        let (worst_source, worst) = record
            .latest
            .iter()
            .min_by(|a, b| a.1.health_factor.total_cmp(&b.1.health_factor))
            .map(|(s, a)| (s.clone(), a.clone()))?;
        let tier = RiskTier::classify(worst.health_factor, &thresholds);

        let drop_pct = self.deterioration(&record.samples, worst.health_factor, now);
        self.push_sample(&mut record.samples, worst.health_factor, now);

        if preferences.muted {
            return None;
        }

        let prior = record.sent;
        let tier_kind = match prior.tier {
            None if tier > RiskTier::Healthy => Some(AlertKind::Escalation),
            None => None,
            Some(last) if tier > last => Some(AlertKind::Escalation),
            Some(last) => {
                let elapsed = now >= prior.at.saturating_add(self.cooldown_secs(last, &preferences));
                match (elapsed, tier == last) {
                    (false, _) => None,
                    (true, true) => Some(AlertKind::Reminder),
                    (true, false) => Some(AlertKind::Recovery),
                }
            }
        };
        let deteriorated = drop_pct.filter(|_| {
            prior
                .deterioration_at
                .map_or(true, |at| now >= at.saturating_add(self.settings.deterioration_rearm_secs))
        });

        let kind = tier_kind.or(deteriorated.map(|_| AlertKind::Deterioration))?;

        let gas_cost = gas.map(|g| self.gas_cost_usd(&g));
        let uneconomical = gas_cost.map_or(false, |cost| cost > self.settings.gas_cost_ratio * worst.collateral_usd);
        if uneconomical && self.settings.suppress_uneconomical && !tier.is_critical_or_worse() {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(account, tier = %tier, "Alert suppressed as uneconomical");
            return None;
        }

        let mut applied = prior;
        if tier_kind.is_some() {
            applied.tier = Some(tier);
            applied.at = now;
        }
        if deteriorated.is_some() {
            applied.deterioration_at = Some(now);
        }
        record.sent = applied;

        let message = AlertMessage {
            account: account.to_string(),
            kind,
            tier,
            previous_tier: prior.tier,
            source: worst_source,
            health_factor: worst.health_factor,
            score: worst.score,
            collateral_usd: worst.collateral_usd,
            debt_usd: worst.debt_usd,
            repay_to_target: worst.repay_to_target,
            deposit_to_target: worst.deposit_to_target,
            target_hf: worst.target_hf,
            hf_drop_pct: deteriorated,
            gas_cost_usd: gas_cost,
            uneconomical,
            degraded_assets: worst.degraded_assets,
            block_number: worst.block_number,
            created_at: now,
        };

        Some(PendingAlert {
            message,
            prior,
            applied,
        })
    }

    /// Relative drop from the reference sample, when above the configured bound.
    fn deterioration(&self, samples: &[HfSample], current: f64, now: u64) -> Option<f64> {
        let cutoff = now.saturating_sub(self.settings.deterioration_lookback_secs);
        let reference = samples
            .iter()
            .rev()
            .find(|s| s.at <= cutoff)
            .or_else(|| samples.first())?;

        if !reference.health_factor.is_finite() || !current.is_finite() || reference.health_factor <= 0.0 {
            return None;
        }
        let drop_pct = (reference.health_factor - current) / reference.health_factor * 100.0;
        (drop_pct > self.settings.deterioration_drop_pct).then_some(drop_pct)
    }

    fn push_sample(&self, samples: &mut SmallVec<[HfSample; 8]>, health_factor: f64, now: u64) {
        samples.push(HfSample { at: now, health_factor });
        let cutoff = now.saturating_sub(self.settings.deterioration_lookback_secs);
        // Keep one sample at or before the cutoff as the reference
        while samples.len() > 1 && samples[1].at <= cutoff {
            samples.remove(0);
        }
    }

    /// Finish a reserved alert. A failed delivery restores the prior state.
    pub fn commit(&self, pending: &PendingAlert, delivered: bool) {
        let Some(mut record) = self.records.get_mut(&pending.message.account) else {
            return;
        };
        if delivered {
            record.failures = 0;
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            if record.sent == pending.applied {
                record.sent = pending.prior;
            }
            record.failures += 1;
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Consecutive delivery failures for `account`.
    pub fn failures(&self, account: &str) -> u32 {
        self.records.get(account).map_or(0, |r| r.failures)
    }

    pub fn last_sent_tier(&self, account: &str) -> Option<RiskTier> {
        self.records.get(account).and_then(|r| r.sent.tier)
    }

    /// Drop the account's record so the next evaluation starts fresh.
    pub fn clear(&self, account: &str) {
        self.records.remove(account);
    }

    /// Forget one source's contribution, e.g. when the entity is unregistered.
    pub fn forget_source(&self, account: &str, source: &str) {
        if let Some(mut record) = self.records.get_mut(account) {
            record.latest.remove(source);
        }
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            accounts: self.records.len(),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskEngine;
    use sentinel_chain::PositionSnapshot;

    const ACCOUNT: &str = "0xabc";
    const SOURCE: &str = "aave-v3:ethereum";

    fn machine() -> AlertStateMachine {
        AlertStateMachine::new(AlertSettings::default(), TierThresholds::default())
    }

    fn assess(collateral: f64, block: u64) -> RiskAssessment {
        RiskEngine::default().assess(&PositionSnapshot::new(collateral, 4_000.0, 0.8, block))
    }

    fn deliver(m: &AlertStateMachine, collateral: f64, block: u64, now: u64) -> Option<AlertMessage> {
        let pending = m.evaluate(ACCOUNT, SOURCE, &assess(collateral, block), None, now)?;
        m.commit(&pending, true);
        Some(pending.message)
    }

    #[test]
    fn test_cooldown_and_escalation() {
        let m = machine();

        // HF 1.2 → Warning
        let first = deliver(&m, 6_000.0, 1, 0).expect("first warning");
        assert_eq!(first.kind, AlertKind::Escalation);
        assert_eq!(first.tier, RiskTier::Warning);
        assert!(deliver(&m, 6_000.0, 2, 600).is_none());

        // HF 1.05 → Critical inside the warning cooldown
        let escalated = deliver(&m, 5_250.0, 3, 700).expect("escalation");
        assert_eq!(escalated.tier, RiskTier::Critical);
        assert_eq!(escalated.previous_tier, Some(RiskTier::Warning));

        assert!(deliver(&m, 5_250.0, 4, 700 + 899).is_none());
        let reminder = deliver(&m, 5_250.0, 5, 700 + 900).expect("reminder");
        assert_eq!(reminder.kind, AlertKind::Reminder);
        assert_eq!(m.stats().sent, 3);
    }

    #[test]
    fn test_crash_alerts_immediately() {
        let m = machine();
        assert!(deliver(&m, 10_000.0, 1, 0).is_none());

        let alert = deliver(&m, 5_000.0, 2, 30).expect("liquidatable alert");
        assert_eq!(alert.tier, RiskTier::Liquidatable);
        assert_eq!(alert.kind, AlertKind::Escalation);
        assert!(alert.repay_to_target > 0.0);
        assert!((alert.deposit_to_target - 2_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_recovery_after_cooldown() {
        let m = machine();
        deliver(&m, 6_000.0, 1, 0).unwrap();
        assert!(deliver(&m, 10_000.0, 2, 1_000).is_none());
        let recovery = deliver(&m, 10_000.0, 3, 3_600).expect("recovery");
        assert_eq!(recovery.kind, AlertKind::Recovery);
        assert_eq!(recovery.tier, RiskTier::Healthy);
    }

    #[test]
    fn test_rapid_deterioration() {
        let m = machine();
        // 1.8 → 1.55, both above the warning threshold
        assert!(deliver(&m, 9_000.0, 1, 0).is_none());
        let alert = deliver(&m, 7_750.0, 2, 1_800).expect("deterioration alert");
        assert_eq!(alert.kind, AlertKind::Deterioration);
        assert_eq!(alert.tier, RiskTier::Healthy);
        let drop = alert.hf_drop_pct.unwrap();
        assert!((drop - 13.888).abs() < 0.01);

        // Still down from the reference, but not yet re-armed
        assert!(deliver(&m, 7_750.0, 3, 1_900).is_none());
    }

    #[test]
    fn test_slow_decline_over_lookback_alerts() {
        let m = machine();
        // 1.8 → 1.6 linearly over an hour, one read a minute
        let mut kinds = Vec::new();
        for minute in 0..=60u64 {
            let hf = 1.8 - 0.2 * minute as f64 / 60.0;
            if let Some(alert) = deliver(&m, hf * 5_000.0, minute + 1, minute * 60) {
                kinds.push(alert.kind);
            }
        }
        assert_eq!(kinds, vec![AlertKind::Deterioration]);
    }

    #[test]
    fn test_small_drop_does_not_alert() {
        let m = machine();
        assert!(deliver(&m, 9_000.0, 1, 0).is_none());
        // 1.8 → 1.7 is a 5.6% drop
        assert!(deliver(&m, 8_500.0, 2, 1_800).is_none());
    }

    #[test]
    fn test_gas_qualifier_never_suppresses_critical() {
        let settings = AlertSettings {
            suppress_uneconomical: true,
            ..AlertSettings::default()
        };
        let m = AlertStateMachine::new(settings, TierThresholds::default());
        let gas = GasQuote {
            gas_price_gwei: 50.0,
            eth_price_usd: 3_000.0,
        };
        // $30 cost
        assert!((m.gas_cost_usd(&gas) - 30.0).abs() < 1e-9);

        let engine = RiskEngine::default();
        let small = engine.assess(&PositionSnapshot::new(500.0, 450.0, 0.8, 1));
        let pending = m.evaluate(ACCOUNT, SOURCE, &small, Some(gas), 0).expect("critical alert");
        assert!(pending.message.uneconomical);
        assert!(pending.message.text().contains("may not be economical"));

        // Warning tier on a small position is suppressed
        let warning = engine.assess(&PositionSnapshot::new(300.0, 200.0, 0.8, 1));
        assert!(m.evaluate("0xdef", SOURCE, &warning, Some(gas), 0).is_none());
        assert_eq!(m.stats().suppressed, 1);
    }

    #[test]
    fn test_out_of_order_blocks_ignored() {
        let m = machine();
        deliver(&m, 6_000.0, 10, 0).unwrap();
        // Older read claiming a liquidation must not win
        assert!(m.evaluate(ACCOUNT, SOURCE, &assess(4_000.0, 9), None, 10).is_none());
        assert_eq!(m.last_sent_tier(ACCOUNT), Some(RiskTier::Warning));
    }

    #[test]
    fn test_failed_delivery_is_retried() {
        let m = machine();
        let pending = m.evaluate(ACCOUNT, SOURCE, &assess(6_000.0, 1), None, 0).unwrap();
        m.commit(&pending, false);
        assert_eq!(m.failures(ACCOUNT), 1);
        assert_eq!(m.last_sent_tier(ACCOUNT), None);

        let retry = deliver(&m, 6_000.0, 2, 10).expect("retried alert");
        assert_eq!(retry.tier, RiskTier::Warning);
        assert_eq!(m.failures(ACCOUNT), 0);
        assert_eq!(m.stats().failed, 1);
    }

    #[test]
    fn test_worst_source_drives_tier() {
        let m = machine();
        let engine = RiskEngine::default();
        let safe = engine.assess(&PositionSnapshot::new(10_000.0, 4_000.0, 0.8, 1));
        let risky = engine.assess(&PositionSnapshot::new(5_250.0, 4_000.0, 0.8, 1));

        assert!(m.evaluate(ACCOUNT, "a", &safe, None, 0).is_none());
        let alert = m.evaluate(ACCOUNT, "b", &risky, None, 0).unwrap().message;
        assert_eq!(alert.tier, RiskTier::Critical);
        assert_eq!(alert.source, "b");
    }

    #[test]
    fn test_preferences() {
        let m = machine();
        m.set_preferences(
            ACCOUNT,
            AlertPreferences {
                warning_hf: Some(2.5),
                ..Default::default()
            },
        );
        let alert = deliver(&m, 10_000.0, 1, 0).expect("custom warning");
        assert_eq!(alert.tier, RiskTier::Warning);

        m.set_preferences(
            "0xmuted",
            AlertPreferences {
                muted: true,
                ..Default::default()
            },
        );
        assert!(m.evaluate("0xmuted", SOURCE, &assess(4_000.0, 1), None, 0).is_none());
    }

    #[test]
    fn test_clear_resets_record() {
        let m = machine();
        deliver(&m, 6_000.0, 1, 0).unwrap();
        m.clear(ACCOUNT);
        assert!(deliver(&m, 6_000.0, 2, 10).is_some());
    }
}
