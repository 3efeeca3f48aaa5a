//! Transaction signing, submission and inclusion polling

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::opts::TransactOpts;
use crate::chain::ChainRpc;
use crate::config::NetworkConfig;
use crate::error::{ClientError, ClientResult, RpcErrorKind};
use crate::keys::{Key, Keyring};
use crate::metrics;

use ethers::prelude::*;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Signs and submits transactions for the keys of a client
pub struct TransactionSender {
    rpc: Arc<dyn ChainRpc>,
    keys: Arc<Keyring>,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: Arc<GasEstimator>,
    network: NetworkConfig,
    chain_id: u64,
}

impl TransactionSender {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        keys: Arc<Keyring>,
        nonce_manager: Arc<NonceManager>,
        gas_estimator: Arc<GasEstimator>,
        network: NetworkConfig,
        chain_id: u64,
    ) -> Self {
        Self {
            rpc,
            keys,
            nonce_manager,
            gas_estimator,
            network,
            chain_id,
        }
    }

    fn key(&self, key_num: usize) -> ClientResult<&Key> {
        self.keys.get(key_num).ok_or(ClientError::KeyOutOfRange {
            key_num,
            max: self.keys.len().saturating_sub(1),
            hint: "",
        })
    }

    /// Sign and submit a call to `to` (a deployment when `None`)
    ///
    /// Returns the transaction as it was submitted. Errors keep the node's
    /// revert payload so the caller can decode a reason.
    pub async fn send(
        &self,
        opts: &TransactOpts,
        to: Option<Address>,
        data: Bytes,
    ) -> ClientResult<Transaction> {
        let key = self.key(opts.key_num)?;
        let (nonce, allocated) = match opts.nonce {
            Some(nonce) => (nonce, false),
            None => (self.nonce_manager.next_nonce(key.address)?.into(), true),
        };
        let release = || -> ClientResult<()> {
            if allocated {
                self.nonce_manager.release_nonce(key.address, nonce.as_u64())?;
            }
            Ok(())
        };

        let (raw, transaction) = match self.prepare(key, opts, to, data, nonce).await {
            Ok(signed) => signed,
            Err(e) => {
                release()?;
                return Err(e);
            }
        };

        if opts.no_send {
            release()?;
            debug!(tx_hash = ?transaction.hash, "Signed transaction, not sending");
            return Ok(transaction);
        }

        let tx_hash = match self.rpc.send_raw_transaction(raw).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                // a transport failure may still have delivered the transaction
                if matches!(e.kind, RpcErrorKind::Execution | RpcErrorKind::Rejected) {
                    release()?;
                }
                return Err(e.into());
            }
        };
        if !allocated {
            self.nonce_manager.mark_used(key.address, nonce.as_u64())?;
        }

        info!(
            key_num = opts.key_num,
            ?tx_hash,
            nonce = %nonce,
            "Transaction sent"
        );
        Ok(transaction)
    }

    /// Build, size and sign a transaction without submitting it
    async fn prepare(
        &self,
        key: &Key,
        opts: &TransactOpts,
        to: Option<Address>,
        data: Bytes,
        nonce: U256,
    ) -> ClientResult<(Bytes, Transaction)> {
        let mut tx = self.build_tx(opts, key.address, to, data, nonce);

        let gas_limit = if opts.gas_limit != 0 {
            U256::from(opts.gas_limit)
        } else {
            self.rpc.estimate_gas(&tx).await?
        };
        tx.set_gas(gas_limit);

        self.sign(key, &tx).await
    }

    fn build_tx(
        &self,
        opts: &TransactOpts,
        from: Address,
        to: Option<Address>,
        data: Bytes,
        nonce: U256,
    ) -> TypedTransaction {
        let value = opts.value.unwrap_or_default();

        if opts.is_dynamic_fee() {
            let mut tx = Eip1559TransactionRequest::new()
                .from(from)
                .data(data)
                .value(value)
                .nonce(nonce)
                .chain_id(self.chain_id);
            if let Some(to) = to {
                tx = tx.to(to);
            }
            if let Some(fee_cap) = opts.gas_fee_cap {
                tx = tx.max_fee_per_gas(fee_cap);
            }
            if let Some(tip) = opts.gas_tip_cap {
                tx = tx.max_priority_fee_per_gas(tip);
            }
            TypedTransaction::Eip1559(tx)
        } else {
            let mut tx = TransactionRequest::new()
                .from(from)
                .data(data)
                .value(value)
                .nonce(nonce)
                .chain_id(self.chain_id);
            if let Some(to) = to {
                tx = tx.to(to);
            }
            if let Some(gas_price) = opts.gas_price {
                tx = tx.gas_price(gas_price);
            }
            TypedTransaction::Legacy(tx)
        }
    }

    /// Sign with the key's wallet, returning the raw envelope and its transaction view
    async fn sign(&self, key: &Key, tx: &TypedTransaction) -> ClientResult<(Bytes, Transaction)> {
        let signature = key
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| ClientError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        let (gas_price, max_fee, max_tip, tx_type) = match tx {
            TypedTransaction::Eip1559(inner) => (
                None,
                inner.max_fee_per_gas,
                inner.max_priority_fee_per_gas,
                Some(U64::from(2)),
            ),
            _ => (tx.gas_price(), None, None, Some(U64::zero())),
        };

        let transaction = Transaction {
            hash,
            nonce: tx.nonce().copied().unwrap_or_default(),
            from: key.address,
            to: tx.to_addr().copied(),
            value: tx.value().copied().unwrap_or_default(),
            gas_price,
            gas: tx.gas().copied().unwrap_or_default(),
            input: tx.data().cloned().unwrap_or_default(),
            v: U64::from(signature.v),
            r: signature.r,
            s: signature.s,
            transaction_type: tx_type,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_tip,
            chain_id: Some(U256::from(self.chain_id)),
            ..Default::default()
        };

        Ok((raw, transaction))
    }

    /// Send `value` wei from a key to `to` with a legacy transfer and wait for inclusion
    pub async fn transfer_eth_from_key(
        &self,
        key_num: usize,
        to: Address,
        value: U256,
        gas_price: U256,
        cancel: &CancellationToken,
    ) -> ClientResult<TransactionReceipt> {
        let key = self.key(key_num)?;

        let gas_limit = match self
            .gas_estimator
            .estimate_transfer_gas_limit(key.address, to, value)
            .await
        {
            Ok(limit) => limit,
            Err(e) => {
                warn!(error = %e, "Using configured transfer gas fee as gas limit");
                U256::from(self.network.transfer_gas_fee)
            }
        };

        let nonce = self.nonce_manager.next_nonce(key.address)?;
        let tx: TypedTransaction = TransactionRequest::new()
            .from(key.address)
            .to(to)
            .value(value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id)
            .into();

        let submitted = match self.sign(key, &tx).await {
            Ok((raw, _)) => self.rpc.send_raw_transaction(raw).await.map_err(|e| {
                let refused = matches!(e.kind, RpcErrorKind::Execution | RpcErrorKind::Rejected);
                (ClientError::from(e), refused)
            }),
            Err(e) => Err((e, true)),
        };
        let tx_hash = match submitted {
            Ok(tx_hash) => tx_hash,
            Err((e, refused)) => {
                if refused {
                    self.nonce_manager.release_nonce(key.address, nonce)?;
                }
                return Err(e);
            }
        };
        info!(
            key_num,
            from = ?key.address,
            to = ?to,
            %value,
            nonce,
            ?tx_hash,
            "Sent funds"
        );

        wait_mined(self.rpc.as_ref(), &self.network, tx_hash, cancel).await
    }

    /// Wait for the receipt of `tx_hash`
    pub async fn wait_mined(
        &self,
        tx_hash: H256,
        cancel: &CancellationToken,
    ) -> ClientResult<TransactionReceipt> {
        wait_mined(self.rpc.as_ref(), &self.network, tx_hash, cancel).await
    }
}

/// Poll for a receipt on a fixed interval
///
/// Bounded by the network transaction timeout. Stops as soon as `cancel`
/// fires. Errors while polling are logged and polling continues.
pub async fn wait_mined(
    rpc: &dyn ChainRpc,
    network: &NetworkConfig,
    tx_hash: H256,
    cancel: &CancellationToken,
) -> ClientResult<TransactionReceipt> {
    let started = Instant::now();
    let poll = async {
        let mut ticker = interval(network.receipt_poll_interval());
        loop {
            ticker.tick().await;
            match rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return receipt,
                Ok(None) => trace!(?tx_hash, "Transaction not mined yet"),
                Err(e) if e.kind == RpcErrorKind::NotFound => {
                    trace!(?tx_hash, "Transaction not mined yet")
                }
                Err(e) => warn!(?tx_hash, error = %e, "Failed to fetch receipt, retrying"),
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Cancelled {
            operation: format!("waiting for receipt of {:?}", tx_hash),
        }),
        result = timeout(network.txn_timeout(), poll) => match result {
            Ok(receipt) => {
                metrics::observe_receipt_wait(&network.name, started.elapsed().as_secs_f64());
                debug!(?tx_hash, block = ?receipt.block_number, "Transaction mined");
                Ok(receipt)
            }
            Err(_) => Err(ClientError::Timeout {
                operation: format!("receipt of transaction {:?}", tx_hash),
            }),
        },
    }
}
