//! Off-chain HTTP clients.
//!
//! - CoinGecko: aggregator price source used as the last-resort quote

mod coingecko;

pub use coingecko::CoinGeckoSource;
