//! Data source capability implemented once per protocol/chain.
//!
//! The engine only ever holds `Arc<dyn DataSource>`; adding a protocol means
//! implementing this trait, nothing else.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One asset line of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Asset identifier (symbol)
    pub asset: String,
    /// Token quantity in whole units
    pub quantity: f64,
    /// USD price used by the source
    pub price_usd: f64,
    /// Supply or borrow rate, if the source reports one
    #[serde(default)]
    pub apy: Option<f64>,
}

impl AssetBalance {
    pub fn value_usd(&self) -> f64 {
        self.quantity * self.price_usd
    }
}

/// Result of one successful position read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub collateral_usd: f64,
    pub debt_usd: f64,
    /// Weighted liquidation threshold as a fraction (0.80 = 80%)
    pub liquidation_threshold: f64,
    #[serde(default)]
    pub collateral: Vec<AssetBalance>,
    #[serde(default)]
    pub debt: Vec<AssetBalance>,
    pub block_number: u64,
}

impl PositionSnapshot {
    pub fn new(collateral_usd: f64, debt_usd: f64, liquidation_threshold: f64, block_number: u64) -> Self {
        Self {
            collateral_usd,
            debt_usd,
            liquidation_threshold,
            collateral: Vec::new(),
            debt: Vec::new(),
            block_number,
        }
    }

    /// An account holding nothing, observed at `block_number`.
    pub fn empty(block_number: u64) -> Self {
        Self::new(0.0, 0.0, 0.0, block_number)
    }

    pub fn is_empty(&self) -> bool {
        self.collateral_usd <= 0.0 && self.debt_usd <= 0.0 && self.collateral.is_empty() && self.debt.is_empty()
    }

    /// `collateral × threshold / debt`, infinite when there is no debt.
    pub fn health_factor(&self) -> f64 {
        if self.debt_usd <= 0.0 {
            f64::INFINITY
        } else {
            self.collateral_usd * self.liquidation_threshold / self.debt_usd
        }
    }

    pub fn has_debt(&self) -> bool {
        self.debt_usd > 0.0
    }

    /// Assets referenced by either side of the position.
    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.collateral
            .iter()
            .chain(self.debt.iter())
            .map(|b| b.asset.as_str())
    }
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }
}

/// A liquidation observed on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub source: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub borrower: String,
    pub liquidator: String,
    /// Debt covered, in USD
    pub value_usd: f64,
    /// Unix seconds
    pub timestamp: u64,
}

impl LiquidationEvent {
    /// Identity used for de-duplication across re-scanned ranges.
    pub fn identity(&self) -> (String, u64) {
        (self.tx_hash.clone(), self.log_index)
    }
}

/// What a source can do beyond single reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub supports_batch: bool,
}

/// Protocol/chain adapter.
#[async_trait]
pub trait DataSource: Send + Sync + Debug {
    /// Stable identifier, e.g. `aave-v3:ethereum`.
    fn id(&self) -> &str;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    /// Read one account. `Ok(None)` means no active position.
    async fn fetch_raw_position(&self, account: &str) -> Result<Option<PositionSnapshot>>;

    /// Read many accounts in one round trip, results in request order.
    ///
    /// Only called when `capabilities().supports_batch` is set.
    async fn fetch_positions_batch(
        &self,
        accounts: &[String],
    ) -> Result<Vec<Result<Option<PositionSnapshot>>>> {
        let _ = accounts;
        anyhow::bail!("{} does not support batch reads", self.id())
    }

    async fn latest_block(&self) -> Result<u64>;

    async fn fetch_liquidation_events(&self, range: BlockRange) -> Result<Vec<LiquidationEvent>>;
}
