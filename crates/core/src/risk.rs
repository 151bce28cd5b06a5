//! Risk engine: health factor, normalized score, tiers and remediation.
//!
//! Pure computation, no I/O.

use serde::{Deserialize, Serialize};

use crate::config::RiskSettings;
use crate::position::{RiskTier, TierThresholds};
use sentinel_chain::PositionSnapshot;

/// `collateral × threshold / debt`; infinite when there is no debt.
pub fn health_factor(collateral_usd: f64, debt_usd: f64, liquidation_threshold: f64) -> f64 {
    if debt_usd <= 0.0 {
        f64::INFINITY
    } else {
        collateral_usd * liquidation_threshold / debt_usd
    }
}

/// Normalized score on [0, 100], non-decreasing in the health factor.
pub fn score(hf: f64) -> f64 {
    if hf.is_nan() {
        return 0.0;
    }
    if hf >= 10.0 {
        100.0
    } else if hf <= 1.0 {
        0.0
    } else if hf <= 2.0 {
        (hf - 1.0) * 80.0
    } else {
        80.0 + ((hf - 2.0) / 8.0) * 20.0
    }
}

/// Debt to repay to reach `target_hf`, clamped to zero.
pub fn repay_to_target(collateral_usd: f64, debt_usd: f64, liquidation_threshold: f64, target_hf: f64) -> f64 {
    if target_hf <= 0.0 {
        return 0.0;
    }
    (debt_usd - collateral_usd * liquidation_threshold / target_hf).max(0.0)
}

/// Collateral to add to reach `target_hf`, clamped to zero.
///
/// Infinite when the position carries debt but no collateral counts toward it.
pub fn deposit_to_target(collateral_usd: f64, debt_usd: f64, liquidation_threshold: f64, target_hf: f64) -> f64 {
    if debt_usd <= 0.0 {
        return 0.0;
    }
    if liquidation_threshold <= 0.0 {
        return f64::INFINITY;
    }
    (target_hf * debt_usd / liquidation_threshold - collateral_usd).max(0.0)
}

/// Risk view of one confirmed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub health_factor: f64,
    pub score: f64,
    pub tier: RiskTier,
    pub collateral_usd: f64,
    pub debt_usd: f64,
    pub liquidation_threshold: f64,
    pub repay_to_target: f64,
    pub deposit_to_target: f64,
    pub target_hf: f64,
    pub block_number: u64,
    /// Assets whose price could not be refreshed
    #[serde(default)]
    pub degraded_assets: Vec<String>,
}

impl RiskAssessment {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_assets.is_empty()
    }

    pub fn has_debt(&self) -> bool {
        self.debt_usd > 0.0
    }
}

/// One source's contribution to a unified score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceScore {
    pub source: String,
    pub health_factor: f64,
    pub collateral_usd: f64,
    pub debt_usd: f64,
    pub tier: RiskTier,
}

/// Portfolio view across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedScore {
    /// Debt-weighted health factor; infinite when nothing is borrowed
    pub health_factor: f64,
    pub score: f64,
    pub tier: RiskTier,
    pub total_collateral_usd: f64,
    pub total_debt_usd: f64,
    pub sources: Vec<SourceScore>,
    /// Source with the lowest health factor among those with debt
    pub riskiest_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    thresholds: TierThresholds,
    target_hf: f64,
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new(&RiskSettings::default())
    }
}

impl RiskEngine {
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            thresholds: settings.thresholds(),
            target_hf: settings.target_hf,
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn target_hf(&self) -> f64 {
        self.target_hf
    }

    pub fn tier(&self, hf: f64) -> RiskTier {
        RiskTier::classify(hf, &self.thresholds)
    }

    pub fn assess(&self, snapshot: &PositionSnapshot) -> RiskAssessment {
        let (c, d, lt) = (
            snapshot.collateral_usd,
            snapshot.debt_usd,
            snapshot.liquidation_threshold,
        );
        let hf = health_factor(c, d, lt);
        RiskAssessment {
            health_factor: hf,
            score: score(hf),
            tier: self.tier(hf),
            collateral_usd: c,
            debt_usd: d,
            liquidation_threshold: lt,
            repay_to_target: repay_to_target(c, d, lt, self.target_hf),
            deposit_to_target: deposit_to_target(c, d, lt, self.target_hf),
            target_hf: self.target_hf,
            block_number: snapshot.block_number,
            degraded_assets: Vec::new(),
        }
    }

    /// Combine per-source assessments of one account.
    pub fn unified<'a, I>(&self, assessments: I) -> UnifiedScore
    where
        I: IntoIterator<Item = (&'a str, &'a RiskAssessment)>,
    {
        let mut sources = Vec::new();
        let mut weighted = 0.0;
        let mut total_collateral = 0.0;
        let mut total_debt = 0.0;
        let mut riskiest: Option<(f64, &str)> = None;

        for (source, assessment) in assessments {
            total_collateral += assessment.collateral_usd;
            if assessment.has_debt() {
                total_debt += assessment.debt_usd;
                weighted += assessment.health_factor * assessment.debt_usd;
                if riskiest.map_or(true, |(hf, _)| assessment.health_factor < hf) {
                    riskiest = Some((assessment.health_factor, source));
                }
            }
            sources.push(SourceScore {
                source: source.to_string(),
                health_factor: assessment.health_factor,
                collateral_usd: assessment.collateral_usd,
                debt_usd: assessment.debt_usd,
                tier: assessment.tier,
            });
        }

        let hf = if total_debt > 0.0 {
            weighted / total_debt
        } else {
            f64::INFINITY
        };

        UnifiedScore {
            health_factor: hf,
            score: score(hf),
            tier: self.tier(hf),
            total_collateral_usd: total_collateral,
            total_debt_usd: total_debt,
            sources,
            riskiest_source: riskiest.map(|(_, s)| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(&RiskSettings::default())
    }

    #[test]
    fn test_score_anchors() {
        assert_eq!(score(f64::INFINITY), 100.0);
        assert_eq!(score(10.0), 100.0);
        assert_eq!(score(1.0), 0.0);
        assert_eq!(score(0.3), 0.0);
        assert!((score(1.5) - 40.0).abs() < 1e-9);
        assert!((score(2.0) - 80.0).abs() < 1e-9);
        assert!((score(6.0) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_monotonic() {
        let mut previous = score(0.0);
        let mut hf = 0.0;
        while hf < 12.0 {
            hf += 0.01;
            let current = score(hf);
            assert!(current >= previous, "score dropped at hf {hf}");
            previous = current;
        }
        assert!(score(f64::INFINITY) >= previous);
    }

    #[test]
    fn test_end_to_end_crash_scenario() {
        let engine = engine();

        let before = engine.assess(&PositionSnapshot::new(10_000.0, 4_000.0, 0.8, 1));
        assert!((before.health_factor - 2.0).abs() < 1e-12);
        assert_eq!(before.tier, RiskTier::Healthy);
        assert_eq!(before.repay_to_target, 0.0);

        let after = engine.assess(&PositionSnapshot::new(5_000.0, 4_000.0, 0.8, 2));
        assert!((after.health_factor - 1.0).abs() < 1e-12);
        assert_eq!(after.tier, RiskTier::Liquidatable);
        assert_eq!(after.score, 0.0);
    }

    #[test]
    fn test_remediation_amounts() {
        // HF 1.0 at 5000 × 0.8 / 4000; target 1.5
        let repay = repay_to_target(5_000.0, 4_000.0, 0.8, 1.5);
        assert!((repay - (4_000.0 - 4_000.0 / 1.5)).abs() < 1e-9);

        let deposit = deposit_to_target(5_000.0, 4_000.0, 0.8, 1.5);
        assert!((deposit - 2_500.0).abs() < 1e-9);

        assert_eq!(deposit_to_target(20_000.0, 4_000.0, 0.8, 1.5), 0.0);
        assert_eq!(deposit_to_target(1_000.0, 0.0, 0.8, 1.5), 0.0);
        assert!(deposit_to_target(1_000.0, 100.0, 0.0, 1.5).is_infinite());
    }

    #[test]
    fn test_no_debt_is_infinitely_healthy() {
        let assessment = engine().assess(&PositionSnapshot::new(1_000.0, 0.0, 0.8, 1));
        assert!(assessment.health_factor.is_infinite());
        assert_eq!(assessment.score, 100.0);
        assert_eq!(assessment.tier, RiskTier::Healthy);
    }

    #[test]
    fn test_unified_score_is_debt_weighted() {
        let engine = engine();
        let a = engine.assess(&PositionSnapshot::new(10_000.0, 4_000.0, 0.8, 1)); // HF 2.0
        let b = engine.assess(&PositionSnapshot::new(3_000.0, 2_000.0, 0.8, 1)); // HF 1.2
        let c = engine.assess(&PositionSnapshot::new(5_000.0, 0.0, 0.8, 1)); // no debt

        let unified = engine.unified([("a", &a), ("b", &b), ("c", &c)]);

        let expected = (2.0 * 4_000.0 + 1.2 * 2_000.0) / 6_000.0;
        assert!((unified.health_factor - expected).abs() < 1e-9);
        assert_eq!(unified.total_debt_usd, 6_000.0);
        assert_eq!(unified.total_collateral_usd, 18_000.0);
        assert_eq!(unified.riskiest_source.as_deref(), Some("b"));
        assert_eq!(unified.sources.len(), 3);
    }

    #[test]
    fn test_unified_without_debt() {
        let engine = engine();
        let a = engine.assess(&PositionSnapshot::new(10_000.0, 0.0, 0.8, 1));
        let unified = engine.unified([("a", &a)]);
        assert!(unified.health_factor.is_infinite());
        assert_eq!(unified.score, 100.0);
        assert!(unified.riskiest_source.is_none());
    }
}
