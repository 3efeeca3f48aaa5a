//! Transaction and call options handed to callers

use super::gas::GasEstimations;
use crate::error::ClientError;

use ethers::types::{Address, U256};

/// Everything needed to sign and send one transaction from a key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactOpts {
    pub key_num: usize,
    pub from: Address,
    pub nonce: Option<U256>,
    pub value: Option<U256>,
    /// Legacy gas price, `None` in dynamic-fee mode
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    /// Zero lets the node estimate the limit
    pub gas_limit: u64,
    /// Build and sign but do not submit
    pub no_send: bool,
}

/// Override applied on top of the proposed options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOption {
    Value(U256),
    GasPrice(U256),
    GasLimit(u64),
    NoSend,
    Nonce(U256),
    GasFeeCap(U256),
    GasTipCap(U256),
}

impl TransactOpts {
    /// Apply gas estimations for the active fee mode
    pub(crate) fn with_estimations(
        mut self,
        estimations: &GasEstimations,
        dynamic_fees: bool,
    ) -> Self {
        if dynamic_fees {
            self.gas_price = None;
            self.gas_fee_cap = estimations.gas_fee_cap;
            self.gas_tip_cap = estimations.gas_tip_cap;
        } else {
            self.gas_price = estimations.gas_price;
        }
        self
    }

    pub fn apply(&mut self, option: TxOption) {
        match option {
            TxOption::Value(v) => self.value = Some(v),
            TxOption::GasPrice(p) => self.gas_price = Some(p),
            TxOption::GasLimit(l) => self.gas_limit = l,
            TxOption::NoSend => self.no_send = true,
            TxOption::Nonce(n) => self.nonce = Some(n),
            TxOption::GasFeeCap(c) => self.gas_fee_cap = Some(c),
            TxOption::GasTipCap(t) => self.gas_tip_cap = Some(t),
        }
    }

    pub fn is_dynamic_fee(&self) -> bool {
        self.gas_price.is_none() && self.gas_fee_cap.is_some()
    }
}

/// Options that are always present, carrying the error that poisoned them
///
/// Callers must check for the error before signing. Poisoned options are
/// empty apart from what was known before the failure.
#[derive(Debug, Clone)]
pub enum PreparedOpts {
    Ready(TransactOpts),
    Poisoned(TransactOpts, ClientError),
}

impl PreparedOpts {
    pub fn error(&self) -> Option<&ClientError> {
        match self {
            PreparedOpts::Ready(_) => None,
            PreparedOpts::Poisoned(_, err) => Some(err),
        }
    }

    pub fn opts(&self) -> &TransactOpts {
        match self {
            PreparedOpts::Ready(opts) | PreparedOpts::Poisoned(opts, _) => opts,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(self, PreparedOpts::Poisoned(..))
    }

    /// Options safe to sign, or the error carried by them
    pub fn into_ready(self) -> Result<TransactOpts, ClientError> {
        match self {
            PreparedOpts::Ready(opts) => Ok(opts),
            PreparedOpts::Poisoned(_, err) => Err(err),
        }
    }
}

/// Options for read-only contract calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOpts {
    pub from: Address,
    /// Latest block when `None`
    pub block_number: Option<u64>,
}
