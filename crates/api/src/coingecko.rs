//! CoinGecko-style aggregator price source.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_chain::{unix_now, PriceQuote, PriceSource, SourceKind};
use serde::Deserialize;
use tracing::{debug, instrument};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Symbol to aggregator id for the assets we usually see.
const DEFAULT_IDS: &[(&str, &str)] = &[
    ("ETH", "ethereum"),
    ("WETH", "weth"),
    ("USDC", "usd-coin"),
    ("USDT", "tether"),
    ("DAI", "dai"),
    ("WBTC", "wrapped-bitcoin"),
    ("LINK", "chainlink"),
    ("UNI", "uniswap"),
    ("AAVE", "aave"),
    ("CRV", "curve-dao-token"),
    ("MKR", "maker"),
    ("SNX", "synthetix-network-token"),
    ("COMP", "compound-governance-token"),
    ("LDO", "lido-dao"),
    ("RPL", "rocket-pool"),
    ("CBETH", "coinbase-wrapped-staked-eth"),
    ("RETH", "rocket-pool-eth"),
    ("STETH", "staked-ether"),
    ("WSTETH", "wrapped-steth"),
];

#[derive(Debug, Deserialize)]
struct SimplePrice {
    usd: Option<f64>,
    last_updated_at: Option<u64>,
}

/// Aggregator API client.
#[derive(Debug)]
pub struct CoinGeckoSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    ids: DashMap<String, String>,
    max_age: Option<Duration>,
}

impl Default for CoinGeckoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinGeckoSource {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client against a custom base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let ids = DEFAULT_IDS
            .iter()
            .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
            .collect();
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            ids,
            max_age: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Map a symbol to an aggregator id, replacing any existing mapping.
    pub fn register_id(&self, symbol: &str, id: &str) {
        self.ids.insert(symbol.to_uppercase(), id.to_string());
    }

    pub fn id_for(&self, symbol: &str) -> Option<String> {
        self.ids.get(&symbol.to_uppercase()).map(|id| id.clone())
    }

    async fn simple_price(&self, id: &str) -> Result<Option<SimplePrice>> {
        let url = format!("{}/simple/price", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("ids", id),
            ("vs_currencies", "usd"),
            ("include_last_updated_at", "true"),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let response = request.send().await.context("aggregator request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("aggregator API error: {} - {}", status, body);
        }

        let mut data: HashMap<String, SimplePrice> = response
            .json()
            .await
            .context("malformed aggregator response")?;
        Ok(data.remove(id))
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Aggregator
    }

    fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    #[instrument(skip(self))]
    async fn quote(&self, asset: &str) -> Result<Option<PriceQuote>> {
        let Some(id) = self.id_for(asset) else {
            return Ok(None);
        };

        let Some(SimplePrice {
            usd: Some(value),
            last_updated_at,
        }) = self.simple_price(&id).await?
        else {
            debug!(asset, id = %id, "Aggregator has no USD price");
            return Ok(None);
        };

        Ok(Some(PriceQuote {
            asset: asset.to_uppercase(),
            value,
            source: self.name().to_string(),
            weight: self.weight(),
            observed_at: last_updated_at.unwrap_or_else(unix_now),
            is_stale: false,
        }))
    }
}
