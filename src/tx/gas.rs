//! Gas estimation from recent fee history, with static fallbacks
//!
//! Fee statistics are computed over a sliding window of blocks fetched
//! through the [`HeaderCache`]. Nodes that lack EIP-1559 support or report
//! degenerate values switch the affected feature off once, for the lifetime
//! of the estimator.

use super::cache::HeaderCache;
use crate::chain::{ChainRpc, FeeSample};
use crate::config::{Bucket, NetworkConfig, Priority};
use crate::error::{Capability, ClientError, ClientResult, RpcError, RpcErrorKind};
use crate::metrics;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Percentile at which each block's priority fees are sampled for suggestions.
/// Kept fixed so overlapping windows are served from the cache.
pub const BLOCK_TIP_PERCENTILE: f64 = 50.0;

const GWEI: u64 = 1_000_000_000;

/// Distribution of a fee over the statistics window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub max: U256,
    pub p99: U256,
    pub p75: U256,
    pub p50: U256,
    pub p25: U256,
}

impl Percentiles {
    /// Nearest-rank percentiles of `values`
    pub fn from_values(mut values: Vec<U256>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort();

        let rank = |p: usize| {
            let idx = (p * values.len()).div_ceil(100).saturating_sub(1);
            values[idx.min(values.len() - 1)]
        };

        Self {
            max: values[values.len() - 1],
            p99: rank(99),
            p75: rank(75),
            p50: rank(50),
            p25: rank(25),
        }
    }

    fn uniform(value: U256) -> Self {
        Self {
            max: value,
            p99: value,
            p75: value,
            p50: value,
            p25: value,
        }
    }

    pub fn bucket(&self, bucket: Bucket) -> U256 {
        match bucket {
            Bucket::Max => self.max,
            Bucket::P99 => self.p99,
            Bucket::P75 => self.p75,
            Bucket::P50 => self.p50,
            Bucket::P25 => self.p25,
        }
    }
}

/// Fee statistics over the last blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GasStats {
    /// Base fee distribution
    pub gas_price: Percentiles,
    /// Priority fee distribution
    pub tip_cap: Percentiles,
    pub suggested_gas_price: U256,
    pub suggested_gas_tip_cap: U256,
    pub latest_base_fee: U256,
}

/// Input of [`GasEstimator::calculate_gas_estimations`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimationRequest {
    pub gas_estimation_enabled: bool,
    pub fallback_gas_price: U256,
    pub fallback_gas_fee_cap: U256,
    pub fallback_gas_tip_cap: U256,
    pub priority: Priority,
}

/// Priced transaction proposal, valid for a single transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GasEstimations {
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
}

impl GasEstimations {
    fn fallback(request: &GasEstimationRequest) -> Self {
        Self {
            gas_price: Some(request.fallback_gas_price),
            gas_fee_cap: Some(request.fallback_gas_fee_cap),
            gas_tip_cap: Some(request.fallback_gas_tip_cap),
        }
    }
}

/// Gas estimator for transactions
pub struct GasEstimator {
    rpc: Arc<dyn ChainRpc>,
    network: NetworkConfig,
    cache: Mutex<HeaderCache>,
    dynamic_fees: AtomicBool,
    estimation_enabled: AtomicBool,
}

impl GasEstimator {
    /// Create a new gas estimator, the cache holds one estimation window
    pub fn new(rpc: Arc<dyn ChainRpc>, network: NetworkConfig) -> Self {
        let capacity = network.gas_price_estimation_blocks as usize;
        Self {
            rpc,
            cache: Mutex::new(HeaderCache::new(capacity)),
            dynamic_fees: AtomicBool::new(network.eip1559_dynamic_fees),
            estimation_enabled: AtomicBool::new(network.gas_price_estimation_enabled),
            network,
        }
    }

    pub fn dynamic_fees_enabled(&self) -> bool {
        self.dynamic_fees.load(Ordering::SeqCst)
    }

    pub fn estimation_enabled(&self) -> bool {
        self.estimation_enabled.load(Ordering::SeqCst)
    }

    /// Request built from the current network configuration
    pub fn default_request(&self) -> GasEstimationRequest {
        GasEstimationRequest {
            gas_estimation_enabled: self.estimation_enabled(),
            fallback_gas_price: U256::from(self.network.gas_price),
            fallback_gas_fee_cap: U256::from(self.network.gas_fee_cap),
            fallback_gas_tip_cap: U256::from(self.network.gas_tip_cap),
            priority: self.network.priority(),
        }
    }

    /// Fee statistics over the last `block_count` blocks
    ///
    /// Simulated networks get the configured static values without any RPC call.
    pub async fn stats(&self, block_count: u64, tip_percentile: f64) -> ClientResult<GasStats> {
        if self.network.is_simulated() {
            let gas_price = U256::from(self.network.gas_price);
            let tip = U256::from(self.network.gas_tip_cap);
            return Ok(GasStats {
                gas_price: Percentiles::uniform(gas_price),
                tip_cap: Percentiles::uniform(tip),
                suggested_gas_price: gas_price,
                suggested_gas_tip_cap: tip,
                latest_base_fee: U256::zero(),
            });
        }
        if block_count == 0 {
            return Err(ClientError::GasEstimation(
                "block count for gas statistics must be greater than 0".to_string(),
            ));
        }

        let latest = self.rpc.block_number().await?;
        let first = latest.saturating_sub(block_count - 1);
        let samples = self.fee_samples(first, latest, tip_percentile).await?;

        let latest_base_fee = samples
            .iter()
            .find(|s| s.block_number == latest)
            .map(|s| s.base_fee)
            .unwrap_or_default();
        let gas_price = Percentiles::from_values(samples.iter().map(|s| s.base_fee).collect());
        let tip_cap = Percentiles::from_values(samples.iter().map(|s| s.priority_fee).collect());

        let suggested_gas_price = self.rpc.suggest_gas_price().await?;
        let suggested_gas_tip_cap = self
            .rpc
            .suggest_gas_tip_cap()
            .await
            .map_err(dynamic_fee_error)?;

        let stats = GasStats {
            gas_price,
            tip_cap,
            suggested_gas_price,
            suggested_gas_tip_cap,
            latest_base_fee,
        };
        debug!(first, latest, ?stats, "Computed gas statistics");
        Ok(stats)
    }

    /// Samples of blocks `first..=latest`, missing blocks fetched concurrently
    async fn fee_samples(
        &self,
        first: u64,
        latest: u64,
        tip_percentile: f64,
    ) -> ClientResult<Vec<FeeSample>> {
        let mut samples = Vec::new();
        let mut misses = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for block in first..=latest {
                match cache.get(block, tip_percentile) {
                    Some(entry) => samples.push(FeeSample {
                        block_number: entry.block_number,
                        base_fee: entry.base_fee,
                        priority_fee: entry.priority_fee_sample,
                    }),
                    None => misses.push(block),
                }
            }
        }
        metrics::record_header_cache(&self.network.name, samples.len(), misses.len());

        let fetched = try_join_all(
            misses
                .iter()
                .map(|block| self.rpc.fee_sample(*block, tip_percentile)),
        )
        .await
        .map_err(dynamic_fee_error)?;

        let mut cache = self.cache.lock().await;
        for sample in fetched {
            cache.insert(
                sample.block_number,
                sample.base_fee,
                sample.priority_fee,
                tip_percentile,
            );
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Fee cap and tip for `priority` from the statistics window
    pub async fn suggest_eip1559_fees(&self, priority: Priority) -> ClientResult<(U256, U256)> {
        let stats = self
            .stats(self.network.gas_price_estimation_blocks, BLOCK_TIP_PERCENTILE)
            .await?;
        let tier = self.network.priority_tiers.tier(priority);

        let base_fee = stats.gas_price.bucket(tier.bucket).max(stats.latest_base_fee);
        if base_fee.is_zero() {
            return Err(ClientError::ZeroGasSuggested {
                method: "eth_feeHistory",
            });
        }

        let mut tip = stats.tip_cap.bucket(tier.bucket);
        if tip.is_zero() {
            tip = stats.suggested_gas_tip_cap;
        }
        if tip.is_zero() {
            return Err(ClientError::ZeroGasSuggested {
                method: "eth_maxPriorityFeePerGas",
            });
        }

        let mut fee_cap = base_fee * 2 + tip;
        if self.network.max_gas_price_gwei > 0 {
            let max = U256::from(self.network.max_gas_price_gwei) * U256::from(GWEI);
            if fee_cap > max {
                warn!(?fee_cap, ?max, "Suggested fee cap exceeds configured maximum, capping");
                fee_cap = max;
                tip = tip.min(max);
            }
        }

        debug!(%priority, ?base_fee, ?fee_cap, ?tip, "Suggested EIP-1559 fees");
        Ok((fee_cap, tip))
    }

    /// Node gas price scaled for `priority`
    pub async fn suggest_legacy_fees(&self, priority: Priority) -> ClientResult<U256> {
        let suggested = self.rpc.suggest_gas_price().await?;
        if suggested.is_zero() {
            return Err(ClientError::ZeroGasSuggested {
                method: "eth_gasPrice",
            });
        }

        let tier = self.network.priority_tiers.tier(priority);
        let gas_price = suggested * tier.legacy_multiplier_percent / 100;
        debug!(%priority, ?suggested, ?gas_price, "Suggested legacy gas price");
        Ok(gas_price)
    }

    /// Price the next transaction, never fails
    ///
    /// Errors fall back to the static values of `request`.
    pub async fn calculate_gas_estimations(
        &self,
        request: &GasEstimationRequest,
    ) -> GasEstimations {
        if self.network.is_simulated()
            || !request.gas_estimation_enabled
            || !self.estimation_enabled()
        {
            return GasEstimations::fallback(request);
        }

        let mut estimations = GasEstimations::default();

        if self.dynamic_fees_enabled() {
            match self.suggest_eip1559_fees(request.priority).await {
                Ok((fee_cap, tip)) => {
                    estimations.gas_fee_cap = Some(fee_cap);
                    estimations.gas_tip_cap = Some(tip);
                    return estimations;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to get suggested EIP-1559 fees. Using fallback values");
                    metrics::record_gas_fallback(&self.network.name, "eip1559");
                    estimations.gas_fee_cap = Some(request.fallback_gas_fee_cap);
                    estimations.gas_tip_cap = Some(request.fallback_gas_tip_cap);

                    self.disable_estimation_if_needed(&e);

                    if !matches!(
                        e,
                        ClientError::CapabilityUnsupported {
                            capability: Capability::DynamicFees,
                            ..
                        }
                    ) {
                        return estimations;
                    }
                    self.disable_dynamic_fees();
                    if !self.estimation_enabled() {
                        estimations.gas_price = Some(request.fallback_gas_price);
                        return estimations;
                    }
                }
            }
        }

        estimations.gas_price = Some(match self.suggest_legacy_fees(request.priority).await {
            Ok(gas_price) => gas_price,
            Err(e) => {
                warn!(error = %e, "Failed to get suggested legacy fees. Using fallback value");
                metrics::record_gas_fallback(&self.network.name, "legacy");
                self.disable_estimation_if_needed(&e);
                request.fallback_gas_price
            }
        });
        estimations
    }

    /// Gas limit of a plain value transfer
    pub async fn estimate_transfer_gas_limit(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> ClientResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new().from(from).to(to).value(value).into();
        self.rpc.estimate_gas(&tx).await.map_err(|e| {
            warn!(error = %e, "Failed to estimate gas for fund transfer");
            ClientError::GasEstimation(format!("failed to estimate gas for fund transfer: {}", e))
        })
    }

    fn disable_estimation_if_needed(&self, err: &ClientError) {
        if !matches!(err, ClientError::ZeroGasSuggested { .. }) {
            return;
        }
        if self.estimation_enabled.swap(false, Ordering::SeqCst) {
            warn!("Received zero gas suggestions. Gas estimation is disabled, fallback values will be used from now on");
            metrics::record_capability_downgrade(&self.network.name, Capability::GasEstimation);
        }
    }

    fn disable_dynamic_fees(&self) {
        if self.dynamic_fees.swap(false, Ordering::SeqCst) {
            warn!("EIP-1559 fees are not supported by the network. Switching to legacy fees");
            if self.network.gas_price == 0 {
                warn!("Fallback gas price is 0. If legacy estimations fail transactions will be rejected, set gas_price in config");
            }
            metrics::record_capability_downgrade(&self.network.name, Capability::DynamicFees);
            info!(network = %self.network.name, "Dynamic fees disabled");
        }
    }
}

/// Unsupported fee methods mean the node has no EIP-1559 support
fn dynamic_fee_error(err: RpcError) -> ClientError {
    match err.kind {
        RpcErrorKind::MethodUnsupported => ClientError::CapabilityUnsupported {
            capability: Capability::DynamicFees,
            message: err.to_string(),
        },
        _ => ClientError::Rpc(err),
    }
}
