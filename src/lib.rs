//! ethpilot - hardened multi-key EVM client runtime
//!
//! Many keys submit transactions concurrently through one client. The
//! client hands out nonces, prices transactions from recent fee history and
//! turns mined transactions back into decoded calls, logs and revert reasons.

pub mod artifacts;
pub mod chain;
pub mod client;
pub mod config;
pub mod contracts;
pub mod decode;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod tx;

pub use client::{Client, DeploymentData, FundingPlan};
pub use config::{Priority, Settings, TracingLevel};
pub use decode::{DecodeOutcome, DecodedTransaction, DecodedTransactionLog};
pub use error::{ClientError, ClientResult};
pub use tx::{PreparedOpts, TransactOpts, TxOption, TIMEOUT_KEY_NUM};
