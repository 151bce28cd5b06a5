//! Risk tiers and monitored entity identity.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Risk tier derived from the health factor, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// HF above the warning threshold
    Healthy,
    /// HF in (critical, warning]
    Warning,
    /// HF in (liquidatable, critical]
    Critical,
    /// HF at or below 1.0
    Liquidatable,
}

/// Upper bounds of each tier. Boundaries are closed on the lower tier, so a
/// health factor exactly equal to `critical` is Critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub liquidatable: f64,
    pub critical: f64,
    pub warning: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            liquidatable: 1.0,
            critical: 1.1,
            warning: 1.5,
        }
    }
}

impl RiskTier {
    /// Classify with the default thresholds.
    pub fn from_health_factor(hf: f64) -> Self {
        Self::classify(hf, &TierThresholds::default())
    }

    pub fn classify(hf: f64, thresholds: &TierThresholds) -> Self {
        if hf <= thresholds.liquidatable {
            Self::Liquidatable
        } else if hf <= thresholds.critical {
            Self::Critical
        } else if hf <= thresholds.warning {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    pub fn is_critical_or_worse(&self) -> bool {
        *self >= Self::Critical
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Liquidatable => "liquidatable",
        }
    }

    /// Default re-alert cooldown after an alert at this tier.
    pub fn default_cooldown(&self) -> Duration {
        match self {
            Self::Liquidatable => Duration::from_secs(300),
            Self::Critical => Duration::from_secs(900),
            Self::Warning => Duration::from_secs(3600),
            Self::Healthy => Duration::from_secs(86_400),
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An (account, data source) pair under observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub account: String,
    pub source: String,
}

impl EntityId {
    pub fn new(account: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries_are_closed_below() {
        assert_eq!(RiskTier::from_health_factor(1.0), RiskTier::Liquidatable);
        assert_eq!(RiskTier::from_health_factor(0.5), RiskTier::Liquidatable);
        assert_eq!(RiskTier::from_health_factor(1.0 + 1e-9), RiskTier::Critical);
        assert_eq!(RiskTier::from_health_factor(1.1), RiskTier::Critical);
        assert_eq!(RiskTier::from_health_factor(1.1 + 1e-9), RiskTier::Warning);
        assert_eq!(RiskTier::from_health_factor(1.5), RiskTier::Warning);
        assert_eq!(RiskTier::from_health_factor(1.5 + 1e-9), RiskTier::Healthy);
        assert_eq!(RiskTier::from_health_factor(f64::INFINITY), RiskTier::Healthy);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(RiskTier::Liquidatable > RiskTier::Critical);
        assert!(RiskTier::Critical > RiskTier::Warning);
        assert!(RiskTier::Warning > RiskTier::Healthy);
        assert!(RiskTier::Critical.is_critical_or_worse());
        assert!(!RiskTier::Warning.is_critical_or_worse());
    }

    #[test]
    fn test_entity_display() {
        let id = EntityId::new("0xabc", "aave-v3:ethereum");
        assert_eq!(id.to_string(), "aave-v3:ethereum/0xabc");
    }
}
