//! Protocol adapters implementing [`DataSource`](crate::source::DataSource).

#[cfg(feature = "aave-v3")]
mod aave_v3;

#[cfg(feature = "aave-v3")]
pub use aave_v3::{AaveV3Config, AaveV3Source, AssetMeta};
