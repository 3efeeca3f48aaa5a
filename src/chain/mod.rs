//! Chain module - the RPC surface the client runtime consumes
//!
//! This module provides:
//! - The `ChainRpc` seam every component talks to
//! - An ethers-backed implementation with multi-RPC failover

pub mod provider;

pub use provider::EthersRpc;

use crate::error::RpcError;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};

/// Result type for raw RPC calls
pub type RpcResult<T> = Result<T, RpcError>;

/// Base fee and priority fee sample of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSample {
    pub block_number: u64,
    pub base_fee: U256,
    pub priority_fee: U256,
}

/// Remote node operations used by the nonce manager, gas estimator,
/// transaction sender and decode orchestrator.
///
/// Implementations bound every call with a deadline and classify failures
/// into [`crate::error::RpcErrorKind`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> RpcResult<u64>;

    async fn block_number(&self) -> RpcResult<u64>;

    /// Next nonce including transactions still in the mempool
    async fn pending_nonce_at(&self, address: Address) -> RpcResult<u64>;

    /// Next nonce according to the latest mined block
    async fn nonce_at(&self, address: Address) -> RpcResult<u64>;

    /// Base fee of `block` and the priority fee paid at `tip_percentile` within it
    async fn fee_sample(&self, block: u64, tip_percentile: f64) -> RpcResult<FeeSample>;

    async fn suggest_gas_price(&self) -> RpcResult<U256>;

    async fn suggest_gas_tip_cap(&self) -> RpcResult<U256>;

    async fn balance_at(&self, address: Address) -> RpcResult<U256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RpcResult<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> RpcResult<Option<TransactionReceipt>>;

    /// `eth_call` of `tx` against the state at `block` (latest when `None`)
    async fn call(&self, tx: &TypedTransaction, block: Option<u64>) -> RpcResult<Bytes>;
}
