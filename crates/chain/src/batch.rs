//! Batched reads.
//!
//! [`BatchReader`] groups position reads for one source into batch round trips
//! and falls back to individual reads when batching is unsupported or the
//! batch itself fails. [`multicall`] is the Multicall3 `aggregate3` helper that
//! on-chain adapters use to implement their batch path.

use std::sync::Arc;

use alloy::primitives::{address, Address, Bytes};
use alloy::providers::ProviderBuilder;
use alloy::sol;
use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::endpoint_pool::EndpointPool;
use crate::source::{DataSource, PositionSnapshot};

sol! {
    /// Multicall3 aggregation contract
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result3 {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result3[] memory returnData);

        function getBlockNumber() external view returns (uint256 blockNumber);
    }
}

/// Canonical Multicall3 deployment (same address on most EVM chains).
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// One call inside an aggregate.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub target: Address,
    pub calldata: Bytes,
}

/// Execute `calls` in one `aggregate3` round trip through the pool.
///
/// Individual call failures come back as `None`, in request order.
pub async fn multicall(
    pool: &EndpointPool,
    multicall_address: Address,
    calls: &[BatchCall],
) -> crate::Result<Vec<Option<Bytes>>> {
    let encoded: Vec<IMulticall3::Call3> = calls
        .iter()
        .map(|c| IMulticall3::Call3 {
            target: c.target,
            allowFailure: true,
            callData: c.calldata.clone(),
        })
        .collect();

    pool.execute(|url| {
        let encoded = encoded.clone();
        async move {
            let provider = ProviderBuilder::new().on_http(url.parse()?);
            let contract = IMulticall3::new(multicall_address, &provider);
            let results = contract.aggregate3(encoded).call().await?;
            let decoded: Vec<Option<Bytes>> = results
                .returnData
                .into_iter()
                .map(|r| r.success.then_some(r.returnData))
                .collect();
            Ok::<_, anyhow::Error>(decoded)
        }
    })
    .await
}

/// Aggregates position reads for a source.
#[derive(Debug, Clone)]
pub struct BatchReader {
    /// Accounts per batch round trip
    max_batch_size: usize,
    /// Concurrent individual reads on the fallback path
    max_concurrent: usize,
}

impl Default for BatchReader {
    fn default() -> Self {
        Self::new(50, 8)
    }
}

impl BatchReader {
    pub fn new(max_batch_size: usize, max_concurrent: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Read every account, returning results in request order.
    pub async fn read_positions(
        &self,
        source: &Arc<dyn DataSource>,
        accounts: &[String],
    ) -> Vec<(String, Result<Option<PositionSnapshot>>)> {
        if accounts.is_empty() {
            return Vec::new();
        }

        if !source.capabilities().supports_batch {
            return self.read_individually(source, accounts).await;
        }

        let mut results = Vec::with_capacity(accounts.len());
        for chunk in accounts.chunks(self.max_batch_size) {
            match source.fetch_positions_batch(chunk).await {
                Ok(batch) if batch.len() == chunk.len() => {
                    debug!(source = source.id(), size = chunk.len(), "Batch read complete");
                    results.extend(self.retry_failed_items(source, chunk, batch).await);
                }
                Ok(batch) => {
                    warn!(
                        source = source.id(),
                        expected = chunk.len(),
                        got = batch.len(),
                        "Batch response length mismatch, reading individually"
                    );
                    results.extend(self.read_individually(source, chunk).await);
                }
                Err(e) => {
                    warn!(source = source.id(), error = %e, "Batch read failed, reading individually");
                    results.extend(self.read_individually(source, chunk).await);
                }
            }
        }
        results
    }

    /// Re-read accounts whose item failed inside an otherwise successful batch.
    async fn retry_failed_items(
        &self,
        source: &Arc<dyn DataSource>,
        chunk: &[String],
        batch: Vec<Result<Option<PositionSnapshot>>>,
    ) -> Vec<(String, Result<Option<PositionSnapshot>>)> {
        let mut merged: Vec<(String, Result<Option<PositionSnapshot>>)> =
            chunk.iter().cloned().zip(batch).collect();
        let failed: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter_map(|(i, (_, result))| result.is_err().then_some(i))
            .collect();
        if failed.is_empty() {
            return merged;
        }

        debug!(source = source.id(), failed = failed.len(), "Retrying failed batch items individually");
        let retry: Vec<String> = failed.iter().map(|&i| merged[i].0.clone()).collect();
        let reread = self.read_individually(source, &retry).await;
        for (i, (_, result)) in failed.into_iter().zip(reread) {
            merged[i].1 = result;
        }
        merged
    }

    async fn read_individually(
        &self,
        source: &Arc<dyn DataSource>,
        accounts: &[String],
    ) -> Vec<(String, Result<Option<PositionSnapshot>>)> {
        stream::iter(accounts.iter().cloned())
            .map(|account| {
                let source = Arc::clone(source);
                async move {
                    let result = source.fetch_raw_position(&account).await;
                    (account, result)
                }
            })
            .buffered(self.max_concurrent)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BlockRange, LiquidationEvent, SourceCapabilities};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeSource {
        batch: bool,
        batch_fails: bool,
        /// Accounts whose item reverts inside the batch
        item_failures: Vec<String>,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    fn snapshot_for(account: &str) -> PositionSnapshot {
        let n = account.trim_start_matches("acct").parse::<f64>().unwrap_or(0.0);
        PositionSnapshot::new(1_000.0 + n, 100.0, 0.8, 7)
    }

    #[async_trait]
    impl DataSource for FakeSource {
        fn id(&self) -> &str {
            "fake"
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                supports_batch: self.batch,
            }
        }

        async fn fetch_raw_position(&self, account: &str) -> Result<Option<PositionSnapshot>> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if account == "empty" {
                return Ok(None);
            }
            Ok(Some(snapshot_for(account)))
        }

        async fn fetch_positions_batch(
            &self,
            accounts: &[String],
        ) -> Result<Vec<Result<Option<PositionSnapshot>>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.batch_fails {
                anyhow::bail!("multicall reverted");
            }
            Ok(accounts
                .iter()
                .map(|a| {
                    if self.item_failures.contains(a) {
                        anyhow::bail!("call reverted for {a}");
                    }
                    Ok(Some(snapshot_for(a)))
                })
                .collect())
        }

        async fn latest_block(&self) -> Result<u64> {
            Ok(7)
        }

        async fn fetch_liquidation_events(&self, _range: BlockRange) -> Result<Vec<LiquidationEvent>> {
            Ok(Vec::new())
        }
    }

    fn accounts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("acct{i}")).collect()
    }

    fn assert_in_order(results: &[(String, Result<Option<PositionSnapshot>>)], accounts: &[String]) {
        assert_eq!(results.len(), accounts.len());
        for ((account, result), expected) in results.iter().zip(accounts) {
            assert_eq!(account, expected);
            let snapshot = result.as_ref().unwrap().as_ref().unwrap();
            assert_eq!(snapshot, &snapshot_for(expected));
        }
    }

    #[tokio::test]
    async fn test_batches_are_chunked_and_ordered() {
        let fake = Arc::new(FakeSource {
            batch: true,
            ..Default::default()
        });
        let source: Arc<dyn DataSource> = fake.clone();
        let accounts = accounts(7);

        let results = BatchReader::new(3, 2).read_positions(&source, &accounts).await;

        assert_in_order(&results, &accounts);
        assert_eq!(fake.batch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(fake.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_individual_reads() {
        let fake = Arc::new(FakeSource {
            batch: true,
            batch_fails: true,
            ..Default::default()
        });
        let source: Arc<dyn DataSource> = fake.clone();
        let accounts = accounts(5);

        let results = BatchReader::new(10, 2).read_positions(&source, &accounts).await;

        assert_in_order(&results, &accounts);
        assert_eq!(fake.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.single_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failed_items_are_reread_individually() {
        let fake = Arc::new(FakeSource {
            batch: true,
            item_failures: vec!["acct1".to_string(), "acct3".to_string()],
            ..Default::default()
        });
        let source: Arc<dyn DataSource> = fake.clone();
        let accounts = accounts(5);

        let results = BatchReader::new(10, 2).read_positions(&source, &accounts).await;

        assert_in_order(&results, &accounts);
        assert_eq!(fake.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.single_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_batch_reads_individually() {
        let fake = Arc::new(FakeSource::default());
        let source: Arc<dyn DataSource> = fake.clone();
        let accounts = vec!["acct1".to_string(), "empty".to_string()];

        let results = BatchReader::default().read_positions(&source, &accounts).await;

        assert_eq!(results.len(), 2);
        assert!(results[1].1.as_ref().unwrap().is_none());
        assert_eq!(fake.batch_calls.load(Ordering::SeqCst), 0);
    }
}
