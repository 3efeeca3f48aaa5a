//! Error types for the ethpilot client runtime

use ethers::types::{Address, Bytes, H256};
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;

/// Structural classification of an RPC failure, decided by the provider
/// adapter so callers never inspect error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Connection, HTTP or decoding failure
    Transport,
    /// The requested object (receipt, block) is not known to the node yet
    NotFound,
    /// The node does not implement the called method
    MethodUnsupported,
    /// The node executed the call and it reverted
    Execution,
    /// The node answered with an error response (nonce too low, underpriced, ...)
    Rejected,
    /// The per-operation deadline elapsed
    Timeout,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcErrorKind::Transport => "transport",
            RpcErrorKind::NotFound => "not found",
            RpcErrorKind::MethodUnsupported => "method unsupported",
            RpcErrorKind::Execution => "execution reverted",
            RpcErrorKind::Rejected => "rejected",
            RpcErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// A failed JSON-RPC call
#[derive(Error, Debug, Clone)]
#[error("{method} failed ({kind}): {message}")]
pub struct RpcError {
    pub method: &'static str,
    pub kind: RpcErrorKind,
    pub message: String,
    /// Revert payload returned alongside execution errors
    pub data: Option<Bytes>,
}

impl RpcError {
    pub fn new(method: &'static str, kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            method,
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }
}

/// Node features that can be switched off for the lifetime of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    DynamicFees,
    GasEstimation,
    DebugTrace,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::DynamicFees => "dynamic_fees",
            Capability::GasEstimation => "gas_estimation",
            Capability::DebugTrace => "debug_trace",
        };
        f.write_str(name)
    }
}

/// Main error type for the client
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Failed to refresh nonces for {address:?}: {source}")]
    NonceRefresh { address: Address, source: RpcError },

    #[error("Address {address:?} is not managed by the nonce manager")]
    UnknownAddress { address: Address },

    #[error("keyNum is out of range. Expected 0-{max}. Got: {key_num}{hint}")]
    KeyOutOfRange {
        key_num: usize,
        max: usize,
        hint: &'static str,
    },

    #[error(
        "pending nonce for key {key_num} is higher than last nonce, there are {pending} pending transactions. \
         Either the same key is used from multiple concurrent tasks (each task should use a unique key), \
         or earlier transactions are stuck and need to be replaced with a higher gas price"
    )]
    PendingNonce { key_num: usize, pending: u64 },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Node suggested zero gas from {method}")]
    ZeroGasSuggested { method: &'static str },

    #[error("Capability {capability} is not supported by the node: {message}")]
    CapabilityUnsupported {
        capability: Capability,
        message: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Cancelled while {operation}")]
    Cancelled { operation: String },

    #[error("{reason}: {source}")]
    SubmissionReverted {
        reason: String,
        source: Box<ClientError>,
    },

    #[error("Transaction {tx_hash:?} reverted: {reason}")]
    ExecutionReverted { tx_hash: H256, reason: String },

    #[error("No ABI method found for selector {selector} on {address:?}")]
    NoAbiMethod {
        address: Option<Address>,
        selector: String,
    },

    #[error("Failed to decode transaction input: {0}")]
    InputDecode(String),

    #[error("Failed to decode log: {0}")]
    LogDecode(String),

    #[error("Tracing of {tx_hash:?} failed: {message}")]
    Trace { tx_hash: H256, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Funding error: {0}")]
    Funding(String),

    #[error("RPC health check failed: {0}")]
    HealthCheck(Box<ClientError>),

    #[error("{}", join_errors(.0))]
    Accumulated(Vec<ClientError>),
}

fn join_errors(errors: &[ClientError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl ClientError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Rpc(e) | ClientError::NonceRefresh { source: e, .. } => {
                matches!(e.kind, RpcErrorKind::Transport | RpcErrorKind::Timeout)
            }
            ClientError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Revert payload attached to a failed submission, if the node sent one
    pub fn revert_data(&self) -> Option<&Bytes> {
        match self {
            ClientError::Rpc(e) | ClientError::NonceRefresh { source: e, .. } => e.data.as_ref(),
            ClientError::SubmissionReverted { source, .. } | ClientError::HealthCheck(source) => {
                source.revert_data()
            }
            _ => None,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors collected while preparing transaction options
///
/// Append-only for the lifetime of a client. Any non-empty list makes
/// decoding fail fast.
#[derive(Debug, Default)]
pub struct AccumulatedErrors {
    errors: Mutex<Vec<ClientError>>,
}

impl AccumulatedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, err: ClientError) {
        self.errors.lock().await.push(err);
    }

    pub async fn snapshot(&self) -> Vec<ClientError> {
        self.errors.lock().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.errors.lock().await.is_empty()
    }
}
