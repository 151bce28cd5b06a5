//! AAVE V3 data source.
//!
//! Works for AAVE V3 and forks that keep the Pool interface. Account totals
//! come from `getUserAccountData`, which reports values in the market's base
//! currency (USD with 8 decimals on the reference deployments).
//!
//! When the market's protocol data provider and price oracle are configured,
//! every read also carries a per-reserve breakdown for the configured assets:
//! balances from `getUserReserveData`, prices from `getAssetsPrices` and rates
//! from `getReserveData`. All of it is read at the same block as the totals.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockId, BlockNumberOrTag, Filter, Log};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::batch::{self, BatchCall, IMulticall3, MULTICALL3_ADDRESS};
use crate::endpoint_pool::EndpointPool;
use crate::oracle::{unix_now, PriceConsensus};
use crate::source::{
    AssetBalance, BlockRange, DataSource, LiquidationEvent, PositionSnapshot, SourceCapabilities,
};

sol! {
    #[sol(rpc)]
    interface IAavePool {
        function getUserAccountData(address user) external view returns (
            uint256 totalCollateralBase,
            uint256 totalDebtBase,
            uint256 availableBorrowsBase,
            uint256 currentLiquidationThreshold,
            uint256 ltv,
            uint256 healthFactor
        );

        event LiquidationCall(
            address indexed collateralAsset,
            address indexed debtAsset,
            address indexed user,
            uint256 debtToCover,
            uint256 liquidatedCollateralAmount,
            address liquidator,
            bool receiveAToken
        );
    }

    #[sol(rpc)]
    interface IAaveDataProvider {
        function getUserReserveData(address asset, address user) external view returns (
            uint256 currentATokenBalance,
            uint256 currentStableDebt,
            uint256 currentVariableDebt,
            uint256 principalStableDebt,
            uint256 scaledVariableDebt,
            uint256 stableBorrowRate,
            uint256 liquidityRate,
            uint40 stableRateLastUpdated,
            bool usageAsCollateralEnabled
        );

        function getReserveData(address asset) external view returns (
            uint256 unbacked,
            uint256 accruedToTreasuryScaled,
            uint256 totalAToken,
            uint256 totalStableDebt,
            uint256 totalVariableDebt,
            uint256 liquidityRate,
            uint256 variableBorrowRate,
            uint256 stableBorrowRate,
            uint256 averageStableBorrowRate,
            uint256 liquidityIndex,
            uint256 variableBorrowIndex,
            uint40 lastUpdateTimestamp
        );
    }

    #[sol(rpc)]
    interface IAaveOracle {
        function getAssetsPrices(address[] calldata assets) external view returns (uint256[] memory);
    }
}

/// Base currency unit (8 decimals).
const BASE_CURRENCY_UNIT: f64 = 1e8;
/// Liquidation threshold unit (basis points).
const BPS: f64 = 10_000.0;
/// Rate unit (27 decimals).
const RAY: f64 = 1e27;

/// Reserve metadata used to value liquidation events and label breakdowns.
#[derive(Debug, Clone)]
pub struct AssetMeta {
    pub symbol: String,
    pub decimals: u8,
}

/// Market deployment.
#[derive(Debug, Clone)]
pub struct AaveV3Config {
    /// Source identifier, e.g. `aave-v3:ethereum`
    pub id: String,
    pub pool_address: Address,
    pub multicall_address: Address,
    /// Protocol data provider, required for per-reserve breakdowns
    pub data_provider: Option<Address>,
    /// Market price oracle, required for per-reserve breakdowns
    pub oracle: Option<Address>,
    pub assets: HashMap<Address, AssetMeta>,
}

impl AaveV3Config {
    pub fn new(id: impl Into<String>, pool_address: Address) -> Self {
        Self {
            id: id.into(),
            pool_address,
            multicall_address: MULTICALL3_ADDRESS,
            data_provider: None,
            oracle: None,
            assets: HashMap::new(),
        }
    }

    pub fn with_asset(mut self, address: Address, symbol: impl Into<String>, decimals: u8) -> Self {
        self.assets.insert(
            address,
            AssetMeta {
                symbol: symbol.into(),
                decimals,
            },
        );
        self
    }

    pub fn with_reserve_reads(mut self, data_provider: Address, oracle: Address) -> Self {
        self.data_provider = Some(data_provider);
        self.oracle = Some(oracle);
        self
    }

    /// Breakdown reads, if the market is configured for them.
    fn reserve_reads(&self) -> Option<ReserveReads> {
        let (data_provider, oracle) = (self.data_provider?, self.oracle?);
        if self.assets.is_empty() {
            return None;
        }
        let mut reserves: Vec<(Address, AssetMeta)> =
            self.assets.iter().map(|(a, m)| (*a, m.clone())).collect();
        reserves.sort_by(|a, b| a.1.symbol.cmp(&b.1.symbol).then(a.0.cmp(&b.0)));
        Some(ReserveReads {
            data_provider,
            oracle,
            reserves,
        })
    }
}

/// Reserve-wide values shared by every account read at one block.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReserveMarket {
    price_usd: f64,
    supply_apy: f64,
    variable_borrow_apy: f64,
}

impl ReserveMarket {
    fn new(price: U256, reserve: &IAaveDataProvider::getReserveDataReturn) -> Self {
        Self {
            price_usd: u256_to_f64(price) / BASE_CURRENCY_UNIT,
            supply_apy: ray_to_rate(reserve.liquidityRate),
            variable_borrow_apy: ray_to_rate(reserve.variableBorrowRate),
        }
    }
}

/// Contracts and reserve order for breakdown reads.
#[derive(Debug, Clone)]
struct ReserveReads {
    data_provider: Address,
    oracle: Address,
    /// Configured reserves, sorted by symbol
    reserves: Vec<(Address, AssetMeta)>,
}

impl ReserveReads {
    fn assets(&self) -> Vec<Address> {
        self.reserves.iter().map(|(a, _)| *a).collect()
    }

    /// Oracle prices followed by one `getReserveData` per reserve.
    fn market_calls(&self) -> Vec<BatchCall> {
        let mut calls = Vec::with_capacity(self.reserves.len() + 1);
        calls.push(BatchCall {
            target: self.oracle,
            calldata: Bytes::from(
                IAaveOracle::getAssetsPricesCall {
                    assets: self.assets(),
                }
                .abi_encode(),
            ),
        });
        calls.extend(self.reserves.iter().map(|(asset, _)| BatchCall {
            target: self.data_provider,
            calldata: Bytes::from(IAaveDataProvider::getReserveDataCall { asset: *asset }.abi_encode()),
        }));
        calls
    }

    fn user_calls(&self, user: Address) -> impl Iterator<Item = BatchCall> + '_ {
        self.reserves.iter().map(move |(asset, _)| BatchCall {
            target: self.data_provider,
            calldata: Bytes::from(
                IAaveDataProvider::getUserReserveDataCall {
                    asset: *asset,
                    user,
                }
                .abi_encode(),
            ),
        })
    }

    fn markets(
        &self,
        prices: Vec<U256>,
        reserves: &[IAaveDataProvider::getReserveDataReturn],
    ) -> Result<Vec<ReserveMarket>> {
        if prices.len() != self.reserves.len() || reserves.len() != self.reserves.len() {
            anyhow::bail!(
                "expected {} reserves, oracle returned {} prices and {} reserve reads",
                self.reserves.len(),
                prices.len(),
                reserves.len()
            );
        }
        Ok(prices
            .into_iter()
            .zip(reserves)
            .map(|(price, reserve)| ReserveMarket::new(price, reserve))
            .collect())
    }

    fn decode_markets(&self, results: &[Option<Bytes>]) -> Result<Vec<ReserveMarket>> {
        let (prices, reserves) = results.split_first().context("missing oracle read")?;
        let prices = prices.as_ref().context("getAssetsPrices reverted")?;
        let prices = IAaveOracle::getAssetsPricesCall::abi_decode_returns(prices, true)?._0;
        let reserves = reserves
            .iter()
            .zip(&self.reserves)
            .map(|(data, (_, meta))| {
                let data = data
                    .as_ref()
                    .with_context(|| format!("getReserveData reverted for {}", meta.symbol))?;
                Ok(IAaveDataProvider::getReserveDataCall::abi_decode_returns(data, true)?)
            })
            .collect::<Result<Vec<_>>>()?;
        self.markets(prices, &reserves)
    }

    fn decode_user(&self, results: &[Option<Bytes>]) -> Result<Vec<IAaveDataProvider::getUserReserveDataReturn>> {
        results
            .iter()
            .zip(&self.reserves)
            .map(|(data, (_, meta))| {
                let data = data
                    .as_ref()
                    .with_context(|| format!("getUserReserveData reverted for {}", meta.symbol))?;
                Ok(IAaveDataProvider::getUserReserveDataCall::abi_decode_returns(data, true)?)
            })
            .collect()
    }

    /// Collateral and debt lines for one account, in reserve order.
    ///
    /// Supplied reserves count as collateral only while enabled as such.
    fn breakdown(
        &self,
        markets: &[ReserveMarket],
        user: &[IAaveDataProvider::getUserReserveDataReturn],
    ) -> (Vec<AssetBalance>, Vec<AssetBalance>) {
        let mut collateral = Vec::new();
        let mut debt = Vec::new();

        for (((_, meta), market), reserve) in self.reserves.iter().zip(markets).zip(user) {
            let line = |raw: U256, apy: f64| AssetBalance {
                asset: meta.symbol.to_uppercase(),
                quantity: token_amount(raw, meta.decimals),
                price_usd: market.price_usd,
                apy: Some(apy),
            };

            if reserve.usageAsCollateralEnabled && !reserve.currentATokenBalance.is_zero() {
                collateral.push(line(reserve.currentATokenBalance, market.supply_apy));
            }
            if !reserve.currentVariableDebt.is_zero() {
                debt.push(line(reserve.currentVariableDebt, market.variable_borrow_apy));
            }
            if !reserve.currentStableDebt.is_zero() {
                debt.push(line(reserve.currentStableDebt, ray_to_rate(reserve.stableBorrowRate)));
            }
        }
        (collateral, debt)
    }
}

#[derive(Debug)]
pub struct AaveV3Source {
    config: AaveV3Config,
    pool: Arc<EndpointPool>,
    prices: Option<Arc<PriceConsensus>>,
}

impl AaveV3Source {
    pub fn new(config: AaveV3Config, pool: Arc<EndpointPool>) -> Self {
        Self {
            config,
            pool,
            prices: None,
        }
    }

    /// Price service used to value liquidation events in USD.
    pub fn with_prices(mut self, prices: Arc<PriceConsensus>) -> Self {
        self.prices = Some(prices);
        self
    }

    async fn event_value_usd(&self, debt_asset: Address, debt_to_cover: U256) -> f64 {
        let Some(meta) = self.config.assets.get(&debt_asset) else {
            return 0.0;
        };
        let Some(prices) = &self.prices else {
            return 0.0;
        };
        match prices.get_price(&meta.symbol).await {
            Ok(price) => token_amount(debt_to_cover, meta.decimals) * price.value,
            Err(e) => {
                debug!(asset = %meta.symbol, error = %e, "Cannot value liquidation");
                0.0
            }
        }
    }

    /// Header timestamp of `block_number`, memoized in `cache`.
    ///
    /// Falls back to the current time when the header cannot be read.
    async fn block_timestamp(&self, block_number: u64, cache: &mut HashMap<u64, u64>) -> u64 {
        if let Some(timestamp) = cache.get(&block_number) {
            return *timestamp;
        }

        let header = self
            .pool
            .execute(|url| async move {
                let provider = ProviderBuilder::new().on_http(url.parse()?);
                let block = provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await?;
                Ok::<_, anyhow::Error>(block.map(|b| b.header.inner.timestamp))
            })
            .await;

        let timestamp = match header {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => {
                warn!(block = block_number, "Block not found, stamping event with current time");
                unix_now()
            }
            Err(e) => {
                warn!(block = block_number, error = %e, "Block header unavailable, stamping event with current time");
                unix_now()
            }
        };
        cache.insert(block_number, timestamp);
        timestamp
    }

    /// Aggregate layout: block number, market reads (when breakdowns are
    /// enabled), then per account its totals followed by its reserve reads.
    fn batch_calls(&self, reads: Option<&ReserveReads>, users: &[Address]) -> Vec<BatchCall> {
        let mut calls = vec![BatchCall {
            target: self.config.multicall_address,
            calldata: Bytes::from(IMulticall3::getBlockNumberCall {}.abi_encode()),
        }];
        if let Some(reads) = reads {
            calls.extend(reads.market_calls());
        }
        for &user in users {
            calls.push(BatchCall {
                target: self.config.pool_address,
                calldata: Bytes::from(IAavePool::getUserAccountDataCall { user }.abi_encode()),
            });
            if let Some(reads) = reads {
                calls.extend(reads.user_calls(user));
            }
        }
        calls
    }

    /// Split an aggregate response laid out by [`Self::batch_calls`].
    ///
    /// A failed market read degrades every account to totals only; a failed
    /// account read fails that account alone.
    fn decode_batch(
        &self,
        reads: Option<&ReserveReads>,
        accounts: &[String],
        results: &[Option<Bytes>],
    ) -> Result<Vec<Result<Option<PositionSnapshot>>>> {
        let reserve_count = reads.map_or(0, |r| r.reserves.len());
        let market_len = if reads.is_some() { reserve_count + 1 } else { 0 };
        let account_len = 1 + reserve_count;
        let expected = 1 + market_len + accounts.len() * account_len;
        if results.len() != expected {
            anyhow::bail!("multicall returned {} results, expected {expected}", results.len());
        }

        let block_data = results[0].as_ref().context("getBlockNumber failed inside multicall")?;
        let block = IMulticall3::getBlockNumberCall::abi_decode_returns(block_data, true)?.blockNumber;
        let block = u64::try_from(block).ok().context("block number out of range")?;

        let markets = match reads {
            Some(reads) => match reads.decode_markets(&results[1..1 + market_len]) {
                Ok(markets) => Some(markets),
                Err(e) => {
                    warn!(source = %self.config.id, error = %e, "Reserve market reads failed, using totals only");
                    None
                }
            },
            None => None,
        };

        Ok(results[1 + market_len..]
            .chunks(account_len)
            .zip(accounts)
            .map(|(chunk, account)| -> Result<Option<PositionSnapshot>> {
                let data = chunk[0]
                    .as_ref()
                    .with_context(|| format!("getUserAccountData reverted for {account}"))?;
                let totals = IAavePool::getUserAccountDataCall::abi_decode_returns(data, true)?;
                let balances = match (reads, &markets) {
                    (Some(reads), Some(markets)) => {
                        Some(reads.breakdown(markets, &reads.decode_user(&chunk[1..])?))
                    }
                    _ => None,
                };
                Ok(position_from(&totals, block, balances))
            })
            .collect())
    }
}

fn u256_to_f64(value: U256) -> f64 {
    match u128::try_from(value) {
        Ok(v) => v as f64,
        Err(_) => value.to_string().parse().unwrap_or(f64::MAX),
    }
}

fn token_amount(raw: U256, decimals: u8) -> f64 {
    u256_to_f64(raw) / 10f64.powi(i32::from(decimals))
}

fn ray_to_rate(raw: U256) -> f64 {
    u256_to_f64(raw) / RAY
}

/// Build a snapshot from account totals. `None` when the account holds nothing.
fn snapshot_from(data: &IAavePool::getUserAccountDataReturn, block_number: u64) -> Option<PositionSnapshot> {
    if data.totalCollateralBase.is_zero() && data.totalDebtBase.is_zero() {
        return None;
    }
    Some(PositionSnapshot::new(
        u256_to_f64(data.totalCollateralBase) / BASE_CURRENCY_UNIT,
        u256_to_f64(data.totalDebtBase) / BASE_CURRENCY_UNIT,
        u256_to_f64(data.currentLiquidationThreshold) / BPS,
        block_number,
    ))
}

/// Totals plus the per-reserve breakdown when one was read.
fn position_from(
    totals: &IAavePool::getUserAccountDataReturn,
    block_number: u64,
    balances: Option<(Vec<AssetBalance>, Vec<AssetBalance>)>,
) -> Option<PositionSnapshot> {
    let mut snapshot = snapshot_from(totals, block_number)?;
    if let Some((collateral, debt)) = balances {
        snapshot.collateral = collateral;
        snapshot.debt = debt;
    }
    Some(snapshot)
}

fn parse_account(account: &str) -> Result<Address> {
    account
        .parse()
        .with_context(|| format!("invalid account address {account}"))
}

#[async_trait]
impl DataSource for AaveV3Source {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            supports_batch: true,
        }
    }

    #[instrument(skip(self), fields(source = %self.config.id))]
    async fn fetch_raw_position(&self, account: &str) -> Result<Option<PositionSnapshot>> {
        let user = parse_account(account)?;
        let pool_address = self.config.pool_address;
        let reads = self.config.reserve_reads();

        let (totals, block, detail) = self
            .pool
            .execute(|url| {
                let reads = reads.clone();
                async move {
                    let provider = ProviderBuilder::new().on_http(url.parse()?);
                    let block = provider.get_block_number().await?;
                    let at = BlockId::number(block);
                    let totals = IAavePool::new(pool_address, &provider)
                        .getUserAccountData(user)
                        .block(at)
                        .call()
                        .await?;

                    let Some(reads) = reads else {
                        return Ok::<_, anyhow::Error>((totals, block, None));
                    };
                    let prices = IAaveOracle::new(reads.oracle, &provider)
                        .getAssetsPrices(reads.assets())
                        .block(at)
                        .call()
                        .await?
                        ._0;
                    let data_provider = IAaveDataProvider::new(reads.data_provider, &provider);
                    let mut markets = Vec::with_capacity(reads.reserves.len());
                    let mut user_reserves = Vec::with_capacity(reads.reserves.len());
                    for (asset, _) in &reads.reserves {
                        markets.push(data_provider.getReserveData(*asset).block(at).call().await?);
                        user_reserves.push(data_provider.getUserReserveData(*asset, user).block(at).call().await?);
                    }
                    Ok((totals, block, Some((reads, prices, markets, user_reserves))))
                }
            })
            .await?;

        let balances = match detail {
            Some((reads, prices, markets, user_reserves)) => {
                let markets = reads.markets(prices, &markets)?;
                Some(reads.breakdown(&markets, &user_reserves))
            }
            None => None,
        };
        Ok(position_from(&totals, block, balances))
    }

    async fn fetch_positions_batch(
        &self,
        accounts: &[String],
    ) -> Result<Vec<Result<Option<PositionSnapshot>>>> {
        let users = accounts
            .iter()
            .map(|a| parse_account(a))
            .collect::<Result<Vec<_>>>()?;

        // Block number rides in the same aggregate so every read shares it
        let reads = self.config.reserve_reads();
        let calls = self.batch_calls(reads.as_ref(), &users);
        let results = batch::multicall(&self.pool, self.config.multicall_address, &calls).await?;
        self.decode_batch(reads.as_ref(), accounts, &results)
    }

    async fn latest_block(&self) -> Result<u64> {
        let block = self
            .pool
            .execute(|url| async move {
                let provider = ProviderBuilder::new().on_http(url.parse()?);
                Ok::<_, anyhow::Error>(provider.get_block_number().await?)
            })
            .await?;
        Ok(block)
    }

    #[instrument(skip(self), fields(source = %self.config.id))]
    async fn fetch_liquidation_events(&self, range: BlockRange) -> Result<Vec<LiquidationEvent>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .address(self.config.pool_address)
            .event_signature(IAavePool::LiquidationCall::SIGNATURE_HASH)
            .from_block(range.from)
            .to_block(range.to);

        let logs: Vec<Log> = self
            .pool
            .execute(|url| {
                let filter = filter.clone();
                async move {
                    let provider = ProviderBuilder::new().on_http(url.parse()?);
                    Ok::<_, anyhow::Error>(provider.get_logs(&filter).await?)
                }
            })
            .await?;

        let mut timestamps = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(tx_hash), Some(log_index), Some(block_number)) =
                (log.transaction_hash, log.log_index, log.block_number)
            else {
                // Pending logs carry no position in the chain yet
                continue;
            };

            let decoded = match log.log_decode::<IAavePool::LiquidationCall>() {
                Ok(decoded) => decoded.inner.data,
                Err(e) => {
                    warn!(tx = %tx_hash, error = %e, "Undecodable LiquidationCall log");
                    continue;
                }
            };

            let timestamp = match log.block_timestamp {
                Some(timestamp) => timestamp,
                None => self.block_timestamp(block_number, &mut timestamps).await,
            };
            let value_usd = self.event_value_usd(decoded.debtAsset, decoded.debtToCover).await;
            events.push(LiquidationEvent {
                source: self.config.id.clone(),
                tx_hash: tx_hash.to_string(),
                log_index,
                block_number,
                borrower: decoded.user.to_string(),
                liquidator: decoded.liquidator.to_string(),
                value_usd,
                timestamp,
            });
        }

        debug!(from = range.from, to = range.to, count = events.len(), "Liquidation events fetched");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_pool::PoolConfig;
    use alloy::primitives::address;

    const WETH: Address = address!("1111111111111111111111111111111111111111");
    const USDC: Address = address!("2222222222222222222222222222222222222222");

    fn account_data(collateral: u64, debt: u64, lt_bps: u64) -> IAavePool::getUserAccountDataReturn {
        IAavePool::getUserAccountDataReturn {
            totalCollateralBase: U256::from(collateral),
            totalDebtBase: U256::from(debt),
            availableBorrowsBase: U256::ZERO,
            currentLiquidationThreshold: U256::from(lt_bps),
            ltv: U256::ZERO,
            healthFactor: U256::ZERO,
        }
    }

    fn ray(rate: f64) -> U256 {
        U256::from((rate * RAY) as u128)
    }

    fn source(config: AaveV3Config) -> AaveV3Source {
        let pool = Arc::new(EndpointPool::new("ethereum", Vec::new(), PoolConfig::default()));
        AaveV3Source::new(config, pool)
    }

    fn market_config() -> AaveV3Config {
        AaveV3Config::new("aave-v3:ethereum", Address::repeat_byte(0xaa))
            .with_asset(WETH, "WETH", 18)
            .with_asset(USDC, "USDC", 6)
            .with_reserve_reads(Address::repeat_byte(0xdd), Address::repeat_byte(0xee))
    }

    fn encoded_block(block: u64) -> Option<Bytes> {
        Some(IMulticall3::getBlockNumberCall::abi_encode_returns(&(U256::from(block),)).into())
    }

    fn encoded_totals(collateral: u64, debt: u64, lt_bps: u64) -> Option<Bytes> {
        Some(
            IAavePool::getUserAccountDataCall::abi_encode_returns(&(
                U256::from(collateral),
                U256::from(debt),
                U256::ZERO,
                U256::from(lt_bps),
                U256::ZERO,
                U256::ZERO,
            ))
            .into(),
        )
    }

    fn encoded_prices(prices: &[u64]) -> Option<Bytes> {
        let prices: Vec<U256> = prices.iter().map(|p| U256::from(*p)).collect();
        Some(IAaveOracle::getAssetsPricesCall::abi_encode_returns(&(prices,)).into())
    }

    fn encoded_reserve(supply: f64, variable_borrow: f64) -> Option<Bytes> {
        Some(
            IAaveDataProvider::getReserveDataCall::abi_encode_returns(&(
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                ray(supply),
                ray(variable_borrow),
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                alloy::primitives::aliases::U40::ZERO,
            ))
            .into(),
        )
    }

    fn encoded_user_reserve(supplied: u128, variable_debt: u128, as_collateral: bool) -> Option<Bytes> {
        Some(
            IAaveDataProvider::getUserReserveDataCall::abi_encode_returns(&(
                U256::from(supplied),
                U256::ZERO,
                U256::from(variable_debt),
                U256::ZERO,
                U256::from(variable_debt),
                U256::ZERO,
                U256::ZERO,
                alloy::primitives::aliases::U40::ZERO,
                as_collateral,
            ))
            .into(),
        )
    }

    /// Two accounts: 4 WETH collateral against 4,000 USDC debt, then an empty one.
    fn aggregate_response() -> Vec<Option<Bytes>> {
        vec![
            encoded_block(42),
            // Reserve order is by symbol: USDC, WETH
            encoded_prices(&[100_000_000, 250_000_000_000]),
            encoded_reserve(0.04, 0.05),
            encoded_reserve(0.02, 0.03),
            encoded_totals(1_000_000_000_000, 400_000_000_000, 8_000),
            encoded_user_reserve(0, 4_000_000_000, false),
            encoded_user_reserve(4_000_000_000_000_000_000, 0, true),
            encoded_totals(0, 0, 0),
            encoded_user_reserve(0, 0, false),
            encoded_user_reserve(0, 0, false),
        ]
    }

    fn accounts() -> Vec<String> {
        vec![Address::repeat_byte(1).to_string(), Address::repeat_byte(2).to_string()]
    }

    #[test]
    fn test_snapshot_from_account_data() {
        // $10,000 collateral, $4,000 debt, 80% threshold
        let data = account_data(1_000_000_000_000, 400_000_000_000, 8_000);
        let snapshot = snapshot_from(&data, 42).unwrap();

        assert!((snapshot.collateral_usd - 10_000.0).abs() < 1e-6);
        assert!((snapshot.debt_usd - 4_000.0).abs() < 1e-6);
        assert!((snapshot.liquidation_threshold - 0.8).abs() < 1e-12);
        assert!((snapshot.health_factor() - 2.0).abs() < 1e-9);
        assert_eq!(snapshot.block_number, 42);
    }

    #[test]
    fn test_empty_account_has_no_position() {
        assert!(snapshot_from(&account_data(0, 0, 0), 1).is_none());
    }

    #[test]
    fn test_token_amount() {
        let one_eth = U256::from(1_000_000_000_000_000_000u128);
        assert!((token_amount(one_eth, 18) - 1.0).abs() < 1e-12);
        assert!((token_amount(U256::from(2_500_000u64), 6) - 2.5).abs() < 1e-12);
        assert!((ray_to_rate(ray(0.035)) - 0.035).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_reads_need_provider_and_oracle() {
        let bare = AaveV3Config::new("aave-v3:ethereum", Address::ZERO).with_asset(WETH, "WETH", 18);
        assert!(bare.reserve_reads().is_none());

        let reads = market_config().reserve_reads().unwrap();
        let symbols: Vec<&str> = reads.reserves.iter().map(|(_, m)| m.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["USDC", "WETH"]);
    }

    #[test]
    fn test_batch_layout() {
        let config = market_config();
        let reads = config.reserve_reads();
        let source = source(config);
        let users = [Address::repeat_byte(1), Address::repeat_byte(2)];

        let calls = source.batch_calls(reads.as_ref(), &users);
        // block + (prices + 2 reserves) + 2 * (totals + 2 reserves)
        assert_eq!(calls.len(), 1 + 3 + 2 * 3);
        assert_eq!(calls[1].target, Address::repeat_byte(0xee));
        assert_eq!(calls[4].target, Address::repeat_byte(0xaa));

        assert_eq!(source.batch_calls(None, &users).len(), 3);
    }

    #[test]
    fn test_decode_batch_with_breakdown() {
        let config = market_config();
        let reads = config.reserve_reads();
        let source = source(config);

        let results = source
            .decode_batch(reads.as_ref(), &accounts(), &aggregate_response())
            .unwrap();
        assert_eq!(results.len(), 2);

        let snapshot = results[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(snapshot.block_number, 42);
        assert!((snapshot.collateral_usd - 10_000.0).abs() < 1e-6);
        assert!((snapshot.debt_usd - 4_000.0).abs() < 1e-6);

        assert_eq!(snapshot.collateral.len(), 1);
        let weth = &snapshot.collateral[0];
        assert_eq!(weth.asset, "WETH");
        assert!((weth.quantity - 4.0).abs() < 1e-12);
        assert!((weth.price_usd - 2_500.0).abs() < 1e-9);
        assert!((weth.apy.unwrap() - 0.02).abs() < 1e-9);
        assert!((weth.value_usd() - 10_000.0).abs() < 1e-6);

        assert_eq!(snapshot.debt.len(), 1);
        let usdc = &snapshot.debt[0];
        assert_eq!(usdc.asset, "USDC");
        assert!((usdc.quantity - 4_000.0).abs() < 1e-9);
        assert!((usdc.price_usd - 1.0).abs() < 1e-12);
        assert!((usdc.apy.unwrap() - 0.05).abs() < 1e-9);

        assert!(results[1].as_ref().unwrap().is_none());
    }

    #[test]
    fn test_failed_market_reads_keep_totals() {
        let config = market_config();
        let reads = config.reserve_reads();
        let source = source(config);
        let mut response = aggregate_response();
        response[1] = None;

        let results = source.decode_batch(reads.as_ref(), &accounts(), &response).unwrap();
        let snapshot = results[0].as_ref().unwrap().as_ref().unwrap();
        assert!((snapshot.collateral_usd - 10_000.0).abs() < 1e-6);
        assert!(snapshot.collateral.is_empty());
        assert!(snapshot.debt.is_empty());
    }

    #[test]
    fn test_failed_user_read_fails_only_that_account() {
        let config = market_config();
        let reads = config.reserve_reads();
        let source = source(config);
        let mut response = aggregate_response();
        response[5] = None;

        let results = source.decode_batch(reads.as_ref(), &accounts(), &response).unwrap();
        assert!(results[0].is_err());
        assert!(results[1].as_ref().unwrap().is_none());
    }

    #[test]
    fn test_decode_batch_rejects_short_response() {
        let config = market_config();
        let reads = config.reserve_reads();
        let source = source(config);
        let mut response = aggregate_response();
        response.pop();

        assert!(source.decode_batch(reads.as_ref(), &accounts(), &response).is_err());
    }

    #[test]
    fn test_stable_debt_and_disabled_collateral() {
        let reads = market_config().reserve_reads().unwrap();
        let market = ReserveMarket {
            price_usd: 1.0,
            supply_apy: 0.01,
            variable_borrow_apy: 0.05,
        };
        let user_reserve = |supplied: u64, stable: u64, variable: u64| IAaveDataProvider::getUserReserveDataReturn {
            currentATokenBalance: U256::from(supplied),
            currentStableDebt: U256::from(stable),
            currentVariableDebt: U256::from(variable),
            principalStableDebt: U256::ZERO,
            scaledVariableDebt: U256::ZERO,
            stableBorrowRate: ray(0.07),
            liquidityRate: U256::ZERO,
            stableRateLastUpdated: alloy::primitives::aliases::U40::ZERO,
            usageAsCollateralEnabled: false,
        };
        // Supplied USDC is not enabled as collateral
        let usdc = user_reserve(1_000_000_000, 2_000_000, 3_000_000);
        let weth = user_reserve(0, 0, 0);

        let (collateral, debt) = reads.breakdown(&[market, market], &[usdc, weth]);
        assert!(collateral.is_empty());
        assert_eq!(debt.len(), 2);
        assert!((debt[0].quantity - 3.0).abs() < 1e-12);
        assert!((debt[1].quantity - 2.0).abs() < 1e-12);
        assert!((debt[1].apy.unwrap() - 0.07).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_block_timestamp_cached_per_block() {
        let source = source(market_config());
        let mut cache = HashMap::from([(100u64, 1_700_000_000u64)]);

        assert_eq!(source.block_timestamp(100, &mut cache).await, 1_700_000_000);

        // No endpoint can serve the header, so the current time is used and kept
        let before = unix_now();
        let fallback = source.block_timestamp(101, &mut cache).await;
        assert!(fallback >= before);
        assert_eq!(cache.get(&101), Some(&fallback));
        assert_eq!(source.block_timestamp(101, &mut cache).await, fallback);
    }

    #[tokio::test]
    async fn test_unknown_asset_values_at_zero() {
        let source = source(AaveV3Config::new("aave-v3:ethereum", Address::ZERO));
        assert_eq!(source.event_value_usd(Address::repeat_byte(9), U256::from(1u64)).await, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_account_rejected() {
        let source = source(AaveV3Config::new("aave-v3:ethereum", Address::ZERO));
        assert!(source.fetch_raw_position("not-an-address").await.is_err());
    }

    #[test]
    fn test_liquidation_signature() {
        assert_eq!(
            IAavePool::LiquidationCall::SIGNATURE,
            "LiquidationCall(address,address,address,uint256,uint256,address,bool)"
        );
    }
}
