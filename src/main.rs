//! Liquidation Sentinel
//!
//! Watches collateralized borrowing positions on AAVE V3 markets and raises
//! alerts before they become liquidatable:
//! - Endpoint pool with priority fallback and per-endpoint rate limits
//! - Reorg-safe confirmation of position reads
//! - Multi-source price consensus (Chainlink, Uniswap V3 TWAP, CoinGecko)
//! - Tiered alerts with cooldowns, deterioration detection and gas awareness
//! - Liquidation cascade detection per market

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_api::CoinGeckoSource;
use sentinel_chain::{
    AaveV3Config, AaveV3Source, ChainlinkFeed, DataSource, EndpointPool, EndpointSpec, GasPriceSource,
    MetricsSink, PriceConsensus, PriceSource, RpcGasPrice, TwapPool, UniswapTwapSource,
};
use sentinel_core::config::{config, init_config, load_config, ChainSettings, SentinelConfig};
use sentinel_core::{Engine, JsonLinesPersistence, LogNotificationSink, SentinelMetrics};

/// Environment variable names.
mod env {
    pub const LOG_JSON: &str = "SENTINEL_LOG_JSON";
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // SENTINEL_CONFIG (file) wins over SENTINEL_PROFILE
    let loaded = load_config().context("loading sentinel configuration")?;
    loaded.log_config();
    init_config(loaded);
    let config = config();

    info!("Starting Liquidation Sentinel");

    let metrics = Arc::new(SentinelMetrics::new());
    let engine = Arc::new(build_engine(config, Arc::clone(&metrics))?);

    for entry in &config.watchlist {
        if let Err(e) = engine.watch(&entry.account, &entry.source).await {
            warn!(account = %entry.account, source = %entry.source, error = %e, "Skipping watchlist entry");
        }
    }
    info!(
        sources = ?engine.source_ids(),
        entities = engine.scheduler().len(),
        "Watchlist registered"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let exporter = config.engine.metrics_path.clone().map(|path| {
        tokio::spawn(export_metrics(
            Arc::clone(&metrics),
            PathBuf::from(path),
            config.engine.metrics_interval(),
            shutdown_rx.clone(),
        ))
    });

    let mut runner = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    tokio::select! {
        result = &mut runner => {
            result.context("engine task failed")??;
            warn!("Engine stopped on its own");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            runner.await.context("engine task failed")??;
        }
    }
    let _ = shutdown_tx.send(true);

    if let Some(exporter) = exporter {
        let _ = exporter.await;
    }

    let stats = engine.stats();
    info!(
        cycles = stats.cycles,
        alerts_sent = stats.alerts.sent,
        alerts_failed = stats.alerts.failed,
        confirmed = stats.reorg.confirmed,
        "Liquidation Sentinel stopped"
    );
    Ok(())
}

/// Human-readable logs by default; JSON lines when `SENTINEL_LOG_JSON=1`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sentinel_core=debug,sentinel_chain=debug"));
    let json = std::env::var(env::LOG_JSON).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }
}

fn parse_address(value: &str, what: &str) -> Result<Address> {
    value
        .parse()
        .with_context(|| format!("invalid {what} address {value}"))
}

fn build_pool(chain: &ChainSettings, config: &SentinelConfig, metrics: Arc<dyn MetricsSink>) -> Arc<EndpointPool> {
    let specs = chain
        .endpoints
        .iter()
        .map(|e| EndpointSpec::new(e.name.clone(), e.url.clone(), e.priority))
        .collect();
    let pool_config = config.pool.to_pool_config(&config.rate_limit);
    Arc::new(EndpointPool::new(chain.name.clone(), specs, pool_config).with_metrics(metrics))
}

fn build_feed(chain: &ChainSettings, pool: Arc<EndpointPool>) -> Result<ChainlinkFeed> {
    let mut feed = ChainlinkFeed::new(pool);
    if let Some(heartbeat) = chain.feed_heartbeat_secs {
        feed = feed.with_heartbeat(Duration::from_secs(heartbeat));
    }
    for f in &chain.feeds {
        feed = feed.with_feed(&f.asset, parse_address(&f.aggregator, "aggregator")?);
    }
    Ok(feed)
}

fn build_twap(chain: &ChainSettings, pool: Arc<EndpointPool>) -> Result<UniswapTwapSource> {
    let mut twap = UniswapTwapSource::new(pool)
        .with_window(Duration::from_secs(chain.twap_window_secs))
        .with_max_spot_deviation(chain.twap_max_spot_deviation_pct);
    for p in &chain.twap_pools {
        twap = twap.with_pool(
            &p.asset,
            TwapPool {
                pool: parse_address(&p.pool, "TWAP pool")?,
                quote: p.quote.clone(),
                token0_decimals: p.token0_decimals,
                token1_decimals: p.token1_decimals,
                base_is_token0: p.base_is_token0,
            },
        );
    }
    Ok(twap)
}

fn build_engine(config: &SentinelConfig, metrics: Arc<SentinelMetrics>) -> Result<Engine> {
    let sink: Arc<dyn MetricsSink> = metrics;

    let pools: Vec<(&ChainSettings, Arc<EndpointPool>)> = config
        .chains
        .iter()
        .map(|chain| (chain, build_pool(chain, config, Arc::clone(&sink))))
        .collect();

    // Sources in confidence order: on-chain feeds, DEX TWAPs, then the aggregator
    let mut price_sources: Vec<Arc<dyn PriceSource>> = Vec::new();
    for (chain, pool) in &pools {
        if !chain.feeds.is_empty() {
            price_sources.push(Arc::new(build_feed(chain, Arc::clone(pool))?));
        }
    }
    for (chain, pool) in &pools {
        if !chain.twap_pools.is_empty() {
            price_sources.push(Arc::new(build_twap(chain, Arc::clone(pool))?));
        }
    }
    if config.aggregator.enabled {
        let coingecko = match &config.aggregator.base_url {
            Some(url) => CoinGeckoSource::with_base_url(url.clone()),
            None => CoinGeckoSource::new(),
        }
        .with_api_key(config.aggregator.api_key.clone());
        price_sources.push(Arc::new(coingecko));
    }
    let prices = Arc::new(
        PriceConsensus::new(price_sources, config.prices.to_consensus_config()).with_metrics(Arc::clone(&sink)),
    );

    let mut engine = Engine::new(config)
        .with_prices(Arc::clone(&prices))
        .with_notifier(Arc::new(LogNotificationSink))
        .with_metrics(Arc::clone(&sink));

    if let Some(path) = &config.engine.persistence_path {
        engine = engine.with_persistence(Arc::new(JsonLinesPersistence::new(path)));
    }

    if let Some((chain, pool)) = pools.first() {
        let gas: Arc<dyn GasPriceSource> =
            Arc::new(RpcGasPrice::new(Arc::clone(pool), chain.gas.default_gwei, chain.gas.max_gwei));
        engine = engine.with_gas(gas);
    }

    for (chain, pool) in &pools {
        let Some(pool_address) = &chain.aave_pool else {
            continue;
        };
        let mut market = AaveV3Config::new(chain.source_id(), parse_address(pool_address, "pool")?);
        if let Some(multicall) = &chain.multicall {
            market.multicall_address = parse_address(multicall, "multicall")?;
        }
        if let (Some(data_provider), Some(oracle)) = (&chain.aave_data_provider, &chain.aave_oracle) {
            market = market.with_reserve_reads(
                parse_address(data_provider, "data provider")?,
                parse_address(oracle, "oracle")?,
            );
        }
        for asset in &chain.assets {
            market = market.with_asset(parse_address(&asset.address, "asset")?, asset.symbol.clone(), asset.decimals);
        }
        let source: Arc<dyn DataSource> =
            Arc::new(AaveV3Source::new(market, Arc::clone(pool)).with_prices(Arc::clone(&prices)));
        info!(source = source.id(), endpoints = pool.len(), "Data source configured");
        engine = engine.with_source(source);
    }

    Ok(engine)
}

/// Periodically write the Prometheus exposition to `path`.
async fn export_metrics(
    metrics: Arc<SentinelMetrics>,
    path: PathBuf,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = metrics.write_textfile(&path).await {
            warn!(path = %path.display(), error = %e, "Metrics export failed");
        }
    }
    // Final flush on shutdown
    if let Err(e) = metrics.write_textfile(&path).await {
        warn!(path = %path.display(), error = %e, "Final metrics export failed");
    }
}
