//! Error taxonomy shared by the fetch, price and alerting layers.

use thiserror::Error;

/// Failures the monitoring engine distinguishes between.
///
/// `Clone` so a single in-flight price fetch can hand the same outcome to
/// every waiter.
#[derive(Debug, Clone, Error)]
pub enum SentinelError {
    /// A single endpoint failed; the pool falls through to the next one.
    #[error("endpoint {endpoint} unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    /// Every candidate endpoint was cooling, disabled or failed.
    #[error("all endpoints unavailable ({attempted} attempted): {last_error}")]
    AllEndpointsUnavailable { attempted: usize, last_error: String },

    /// No source produced a fresh quote for the asset.
    #[error("no price available for {asset}")]
    NoPriceAvailable { asset: String },

    /// Two sources disagree by more than the configured bound.
    #[error("price divergence on {asset}: {primary} vs {secondary} ({deviation_pct:.2}%)")]
    PriceDivergence {
        asset: String,
        primary: String,
        secondary: String,
        deviation_pct: f64,
    },

    /// A pending confirmation was invalidated by a conflicting read.
    #[error("reorg detected for {entity} at block {block}")]
    ReorgDetected { entity: String, block: u64 },

    /// The notification sink rejected a message.
    #[error("notification delivery to {account} failed: {reason}")]
    NotificationDeliveryFailed { account: String, reason: String },
}

impl SentinelError {
    /// Whether the error is expected to clear on its own (next cycle, next endpoint).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EndpointUnavailable { .. }
                | Self::AllEndpointsUnavailable { .. }
                | Self::NotificationDeliveryFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
