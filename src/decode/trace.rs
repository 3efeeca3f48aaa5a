//! Call tracer collaborator

use async_trait::async_trait;
use ethers::types::H256;
use serde_json::Value;
use thiserror::Error;

/// Why a trace could not be produced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The node does not expose `debug_traceTransaction`
    #[error("debug API unavailable: {0}")]
    DebugApiUnavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Fetches and decodes full call traces of mined transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Trace `tx_hash` and keep its decoded call tree
    async fn trace_geth_tx(&self, tx_hash: H256) -> Result<(), TraceError>;

    /// Decoded call tree of a transaction traced earlier
    fn decoded_calls(&self, tx_hash: &H256) -> Option<Value>;
}
