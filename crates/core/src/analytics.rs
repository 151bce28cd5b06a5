//! Position analytics: stress tests and distance to liquidation.

use arrayvec::ArrayVec;
use serde::Serialize;

use crate::position::RiskTier;
use crate::risk::{health_factor, RiskAssessment};

/// Collateral price moves applied by [`stress_test`] (percent).
pub const STRESS_SCENARIOS: [f64; 8] = [-5.0, -10.0, -15.0, -20.0, -25.0, -30.0, -40.0, -50.0];

/// Outcome of one simulated collateral price move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSimulation {
    pub price_change_pct: f64,
    pub health_factor: f64,
    pub would_liquidate: bool,
    pub collateral_at_risk_usd: f64,
}

/// How far prices can fall before liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiquidationRisk {
    None,
    Low,
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl LiquidationRisk {
    pub fn from_price_drop(drop_pct: Option<f64>) -> Self {
        match drop_pct {
            None => Self::None,
            Some(d) if d <= 5.0 => Self::Extreme,
            Some(d) if d <= 10.0 => Self::VeryHigh,
            Some(d) if d <= 20.0 => Self::High,
            Some(d) if d <= 30.0 => Self::Moderate,
            Some(_) => Self::Low,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Low => "Low",
            Self::Moderate => "Moderate",
            Self::High => "High",
            Self::VeryHigh => "Very High",
            Self::Extreme => "Extreme",
        }
    }
}

pub fn simulate_price_move(assessment: &RiskAssessment, price_change_pct: f64) -> PriceSimulation {
    let collateral = assessment.collateral_usd * (1.0 + price_change_pct / 100.0);
    let hf = health_factor(collateral, assessment.debt_usd, assessment.liquidation_threshold);
    let would_liquidate = RiskTier::from_health_factor(hf) == RiskTier::Liquidatable;
    PriceSimulation {
        price_change_pct,
        health_factor: hf,
        would_liquidate,
        collateral_at_risk_usd: if would_liquidate { assessment.collateral_usd } else { 0.0 },
    }
}

pub fn stress_test(assessment: &RiskAssessment) -> ArrayVec<PriceSimulation, 8> {
    STRESS_SCENARIOS
        .iter()
        .map(|&change| simulate_price_move(assessment, change))
        .collect()
}

/// Percent collateral price drop that brings the position to HF 1.0.
///
/// `None` without debt; zero when already liquidatable.
pub fn price_drop_to_liquidation(assessment: &RiskAssessment) -> Option<f64> {
    let hf = assessment.health_factor;
    if !assessment.has_debt() || hf.is_infinite() || hf <= 0.0 {
        return None;
    }
    Some(((1.0 - 1.0 / hf) * 100.0).max(0.0))
}

/// Collateral that can be withdrawn while staying at `target_hf`.
pub fn safe_withdrawal(assessment: &RiskAssessment, target_hf: f64) -> f64 {
    if !assessment.has_debt() {
        return assessment.collateral_usd;
    }
    if assessment.liquidation_threshold <= 0.0 {
        return 0.0;
    }
    let required = target_hf * assessment.debt_usd / assessment.liquidation_threshold;
    (assessment.collateral_usd - required).max(0.0)
}

/// Additional debt that keeps the position at `target_hf`.
pub fn max_additional_borrow(assessment: &RiskAssessment, target_hf: f64) -> f64 {
    if target_hf <= 0.0 {
        return 0.0;
    }
    let capacity = assessment.collateral_usd * assessment.liquidation_threshold / target_hf;
    (capacity - assessment.debt_usd).max(0.0)
}
