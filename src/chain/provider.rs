//! Ethers-backed RPC adapter with multi-RPC support and automatic failover

use super::{ChainRpc, FeeSample, RpcResult};
use crate::config::NetworkConfig;
use crate::error::{ClientError, ClientResult, RpcError, RpcErrorKind};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError as _};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;
/// Geth reports reverts of eth_call / eth_estimateGas with this code
const EXECUTION_ERROR: i64 = 3;

/// Multi-provider wrapper with automatic failover
pub struct EthersRpc {
    network: String,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Deadline applied to every single call
    call_timeout: Duration,
}

impl EthersRpc {
    /// Create providers for every configured url, skipping the ones that fail to parse
    pub fn new(config: &NetworkConfig) -> ClientResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(config.receipt_poll_interval());
                    http_providers.push(provider);
                    debug!("Added HTTP provider for network {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ClientError::Config(format!(
                "No valid RPC providers for network {}",
                config.name
            )));
        }

        Ok(Self {
            network: config.name.clone(),
            http_providers,
            current_provider: AtomicUsize::new(0),
            call_timeout: config.txn_timeout(),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Network {} failover to provider {}", self.network, next);
    }

    /// Run an idempotent call, failing over on transport errors and timeouts
    async fn read<T, F, Fut>(&self, method: &'static str, op: F) -> RpcResult<T>
    where
        F: Fn(Provider<Http>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        T: Send,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            let err = match timeout(self.call_timeout, op(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => classify(method, e),
                Err(_) => RpcError::new(
                    method,
                    RpcErrorKind::Timeout,
                    format!("no response within {:?}", self.call_timeout),
                ),
            };

            if !matches!(err.kind, RpcErrorKind::Transport | RpcErrorKind::Timeout) {
                return Err(err);
            }
            warn!("{} failed on network {}: {}", method, self.network, err);
            self.failover();
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| {
            RpcError::new(method, RpcErrorKind::Transport, "All providers failed")
        }))
    }
}

/// Decide the structural kind of a provider failure
fn classify(method: &'static str, err: ProviderError) -> RpcError {
    if let Some(resp) = ethers::providers::RpcError::as_error_response(&err) {
        let message = resp.message.clone();
        let kind = if resp.code == METHOD_NOT_FOUND || is_unsupported_message(&message) {
            RpcErrorKind::MethodUnsupported
        } else if resp.code == EXECUTION_ERROR || message.to_lowercase().contains("revert") {
            RpcErrorKind::Execution
        } else {
            RpcErrorKind::Rejected
        };

        let rpc_error = RpcError::new(method, kind, message);
        let data = resp
            .data
            .as_ref()
            .and_then(|d| d.as_str())
            .and_then(|d| d.parse::<Bytes>().ok());
        return match data {
            Some(data) if !data.is_empty() => rpc_error.with_data(data),
            _ => rpc_error,
        };
    }

    match err {
        ProviderError::UnsupportedRPC => {
            RpcError::new(method, RpcErrorKind::MethodUnsupported, err.to_string())
        }
        other => RpcError::new(method, RpcErrorKind::Transport, other.to_string()),
    }
}

fn is_unsupported_message(message: &str) -> bool {
    let message = message.to_lowercase();
    [
        "method not found",
        "does not exist",
        "not available",
        "not supported",
        "unsupported",
        // legacy-only nodes fail to parse typed envelopes
        "expected input list for types.txdata",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

fn at_block(block: Option<u64>) -> Option<BlockId> {
    block.map(|b| BlockId::Number(BlockNumber::Number(b.into())))
}

#[async_trait]
impl ChainRpc for EthersRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        self.read("eth_chainId", |p| async move {
            p.get_chainid().await.map(|id| id.as_u64())
        })
        .await
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.read("eth_blockNumber", |p| async move {
            p.get_block_number().await.map(|n| n.as_u64())
        })
        .await
    }

    async fn pending_nonce_at(&self, address: Address) -> RpcResult<u64> {
        self.read("eth_getTransactionCount", move |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
                .map(|n| n.as_u64())
        })
        .await
    }

    async fn nonce_at(&self, address: Address) -> RpcResult<u64> {
        self.read("eth_getTransactionCount", move |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Latest.into()))
                .await
                .map(|n| n.as_u64())
        })
        .await
    }

    async fn fee_sample(&self, block: u64, tip_percentile: f64) -> RpcResult<FeeSample> {
        let history = self
            .read("eth_feeHistory", move |p| async move {
                let percentiles = [tip_percentile];
                p.fee_history(1u64, BlockNumber::Number(block.into()), &percentiles)
                    .await
            })
            .await?;

        let base_fee = history.base_fee_per_gas.first().copied().ok_or_else(|| {
            RpcError::new(
                "eth_feeHistory",
                RpcErrorKind::MethodUnsupported,
                format!("block {} has no base fee", block),
            )
        })?;
        // empty blocks have no rewards
        let priority_fee = history
            .reward
            .first()
            .and_then(|r| r.first())
            .copied()
            .unwrap_or_default();

        Ok(FeeSample {
            block_number: block,
            base_fee,
            priority_fee,
        })
    }

    async fn suggest_gas_price(&self) -> RpcResult<U256> {
        self.read("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn suggest_gas_tip_cap(&self) -> RpcResult<U256> {
        self.read("eth_maxPriorityFeePerGas", |p| async move {
            p.request::<_, U256>("eth_maxPriorityFeePerGas", ()).await
        })
        .await
    }

    async fn balance_at(&self, address: Address) -> RpcResult<U256> {
        self.read("eth_getBalance", move |p| async move {
            p.get_balance(address, None).await
        })
        .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RpcResult<U256> {
        self.read("eth_estimateGas", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256> {
        // Not idempotent from the caller's point of view, no failover here
        let method = "eth_sendRawTransaction";
        match timeout(self.call_timeout, self.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(classify(method, e)),
            Err(_) => Err(RpcError::new(
                method,
                RpcErrorKind::Timeout,
                format!("no response within {:?}", self.call_timeout),
            )),
        }
    }

    async fn transaction_receipt(&self, hash: H256) -> RpcResult<Option<TransactionReceipt>> {
        self.read("eth_getTransactionReceipt", move |p| async move {
            p.get_transaction_receipt(hash).await
        })
        .await
    }

    async fn call(&self, tx: &TypedTransaction, block: Option<u64>) -> RpcResult<Bytes> {
        self.read("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, at_block(block)).await }
        })
        .await
    }
}
