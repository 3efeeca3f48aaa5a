//! Transaction lifecycle: nonce management, gas estimation, options and submission

mod cache;
mod gas;
mod nonce;
mod opts;
mod sender;

pub use cache::{HeaderCache, HeaderCacheEntry};
pub use gas::{
    GasEstimationRequest, GasEstimations, GasEstimator, GasStats, Percentiles,
    BLOCK_TIP_PERCENTILE,
};
pub use nonce::{NonceManager, NonceRecord, TIMEOUT_KEY_NUM};
pub use opts::{CallOpts, PreparedOpts, TransactOpts, TxOption};
pub use sender::{wait_mined, TransactionSender};
