//! Decode module - turns submitted transactions into diagnosable records
//!
//! After submission the orchestrator waits for inclusion, classifies the
//! outcome, decodes inputs and logs and, depending on the tracing level,
//! asks the [`Tracer`] for the full call tree. A reverted transaction yields
//! both a decoded record and an error.

pub mod abi;
pub mod logs;
pub mod trace;

pub use abi::{decode_input, decode_revert_reason, DecodedInput};
pub use logs::{decode_logs, DecodedTransactionLog};
pub use trace::{TraceError, Tracer};

use crate::artifacts::ArtifactWriter;
use crate::chain::ChainRpc;
use crate::config::{NetworkConfig, Settings, TracingLevel};
use crate::contracts::ContractStore;
use crate::error::{AccumulatedErrors, Capability, ClientError};
use crate::metrics;
use crate::tx::wait_mined;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Transaction, TransactionReceipt, TransactionRequest, H256, U256, U64};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Decoded view of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_name: Option<String>,
    pub signature: Option<String>,
    pub method: Option<String>,
    pub input: BTreeMap<String, String>,
    pub logs: Vec<DecodedTransactionLog>,
    pub status: Option<u64>,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
    pub revert_reason: Option<String>,
}

/// Result of [`DecodeOrchestrator::decode`]
///
/// Both fields can be set at once: a reverted transaction is decoded and
/// its revert error is returned alongside.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub decoded: Option<DecodedTransaction>,
    pub error: Option<ClientError>,
}

impl DecodeOutcome {
    fn failed(error: ClientError) -> Self {
        Self {
            decoded: None,
            error: Some(error),
        }
    }
}

/// Runs the post-submission state machine once per transaction
pub struct DecodeOrchestrator {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn ContractStore>,
    tracer: Option<Arc<dyn Tracer>>,
    errors: Arc<AccumulatedErrors>,
    artifacts: ArtifactWriter,
    network: NetworkConfig,
    /// Lowered to NONE for good when the node has no debug API
    tracing_level: AtomicU8,
    trace_to_json: bool,
    reverted_file: String,
    cancel: CancellationToken,
}

impl DecodeOrchestrator {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn ContractStore>,
        tracer: Option<Arc<dyn Tracer>>,
        errors: Arc<AccumulatedErrors>,
        settings: &Settings,
        reverted_file: String,
        cancel: CancellationToken,
    ) -> Self {
        let level = settings.tracing_level();
        if level != TracingLevel::None && tracer.is_none() {
            warn!(%level, "Tracing level is set but no tracer is configured, traces will be skipped");
        }

        Self {
            rpc,
            store,
            tracer,
            errors,
            artifacts: ArtifactWriter::new(&settings.artifacts_dir),
            network: settings.network.clone(),
            tracing_level: AtomicU8::new(level as u8),
            trace_to_json: settings.trace_to_json,
            reverted_file,
            cancel,
        }
    }

    pub fn tracing_level(&self) -> TracingLevel {
        TracingLevel::from_u8(self.tracing_level.load(Ordering::SeqCst))
    }

    /// Decode the outcome of a submission
    ///
    /// `Ok(None)` (nothing was sent) is a no-op.
    pub async fn decode(&self, submitted: Result<Option<Transaction>, ClientError>) -> DecodeOutcome {
        let accumulated = self.errors.snapshot().await;
        if !accumulated.is_empty() {
            return DecodeOutcome::failed(ClientError::Accumulated(accumulated));
        }

        let tx = match submitted {
            Err(err) => {
                trace!("Skipping decoding, transaction submission failed");
                return DecodeOutcome::failed(self.submission_error(err));
            }
            Ok(None) => {
                trace!("Skipping decoding, no transaction to decode");
                return DecodeOutcome::default();
            }
            Ok(Some(tx)) => tx,
        };

        let receipt = match wait_mined(self.rpc.as_ref(), &self.network, tx.hash, &self.cancel).await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                trace!(tx_hash = ?tx.hash, error = %err, "Skipping decoding, transaction was not mined");
                return DecodeOutcome::failed(err);
            }
        };

        let revert_err = if receipt.status == Some(U64::zero()) {
            Some(self.revert_error(&tx, &receipt).await)
        } else {
            None
        };

        let (decoded, decode_err) = self.decode_transaction(&tx, &receipt, revert_err.as_ref());

        match decode_err {
            Some(err @ ClientError::NoAbiMethod { .. }) => {
                metrics::record_decoded(&self.network.name, "undecodable");
                debug!(tx_hash = ?tx.hash, error = %err, "Transaction could not be decoded");
                if self.trace_to_json {
                    self.save_undecodable(tx.hash).await;
                }
                return DecodeOutcome {
                    decoded: Some(decoded),
                    error: revert_err,
                };
            }
            Some(err) => warn!(tx_hash = ?tx.hash, error = %err, "Partially decoded transaction"),
            None => {}
        }

        let reverted = revert_err.is_some();
        metrics::record_decoded(
            &self.network.name,
            if reverted { "reverted" } else { "success" },
        );

        let level = self.tracing_level();
        let traced = match level {
            TracingLevel::None => false,
            TracingLevel::Reverted => reverted,
            TracingLevel::All => true,
        };
        if traced {
            self.trace(&decoded).await;
        } else {
            trace!(tx_hash = ?tx.hash, %level, reverted, "Transaction doesn't match tracing level, skipping trace");
        }

        DecodeOutcome {
            decoded: Some(decoded),
            error: revert_err,
        }
    }

    /// Wrap a submission error with its decoded revert reason, when there is one
    fn submission_error(&self, err: ClientError) -> ClientError {
        let reason = err
            .revert_data()
            .and_then(|data| decode_revert_reason(data, &self.store.abis()));

        match reason {
            Some(reason) => ClientError::SubmissionReverted {
                reason,
                source: Box::new(err),
            },
            None => err,
        }
    }

    /// Replay a reverted transaction at its block to recover the reason
    async fn revert_error(&self, tx: &Transaction, receipt: &TransactionReceipt) -> ClientError {
        let mut call = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            call = call.to(to);
        }
        if let Some(gas_price) = tx.gas_price {
            call = call.gas_price(gas_price);
        }
        let call: TypedTransaction = call.into();

        let block = receipt.block_number.map(|b| b.as_u64());
        let reason = match self.rpc.call(&call, block).await {
            Ok(_) => "execution reverted, replay did not reproduce the revert".to_string(),
            Err(e) => e
                .data
                .as_ref()
                .and_then(|data| decode_revert_reason(data, &self.store.abis()))
                .unwrap_or(e.message),
        };

        info!(tx_hash = ?tx.hash, %reason, "Transaction reverted");
        ClientError::ExecutionReverted {
            tx_hash: tx.hash,
            reason,
        }
    }

    /// Decode inputs and logs, keeping whatever could be decoded
    fn decode_transaction(
        &self,
        tx: &Transaction,
        receipt: &TransactionReceipt,
        revert_err: Option<&ClientError>,
    ) -> (DecodedTransaction, Option<ClientError>) {
        let revert_reason = match revert_err {
            Some(ClientError::ExecutionReverted { reason, .. }) => Some(reason.clone()),
            _ => None,
        };
        let mut decoded = DecodedTransaction {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            contract_name: None,
            signature: None,
            method: None,
            input: BTreeMap::new(),
            logs: Vec::new(),
            status: receipt.status.map(|s| s.as_u64()),
            block_number: receipt.block_number.map(|b| b.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            revert_reason,
        };

        let called = tx.to.and_then(|to| self.store.find_abi(&to));
        let mut error = None;

        if let Some(to) = tx.to {
            if !tx.input.is_empty() {
                let input = match &called {
                    Some((_, abi)) => decode_input(abi, &tx.input),
                    None => Err(ClientError::NoAbiMethod {
                        address: None,
                        selector: format!("0x{}", hex::encode(&tx.input[..tx.input.len().min(4)])),
                    }),
                };
                match input {
                    Ok(input) => {
                        decoded.signature = Some(input.signature);
                        decoded.method = Some(input.method);
                        decoded.input = input.params;
                    }
                    Err(ClientError::NoAbiMethod { selector, .. }) => {
                        error = Some(ClientError::NoAbiMethod {
                            address: Some(to),
                            selector,
                        });
                    }
                    Err(e) => error = Some(e),
                }
            }
        }

        let called_abi = called.as_ref().map(|(_, abi)| abi);
        decoded.contract_name = called.as_ref().map(|(name, _)| name.clone());
        decoded.logs = decode_logs(&receipt.logs, called_abi, self.store.as_ref());

        (decoded, error)
    }

    async fn save_undecodable(&self, tx_hash: H256) {
        match self
            .artifacts
            .append_to_json_array(&self.reverted_file, &format!("{:?}", tx_hash))
            .await
        {
            Ok(path) => trace!(?tx_hash, ?path, "Saved undecodable transaction hash"),
            Err(e) => warn!(?tx_hash, error = %e, "Failed to save undecodable transaction hash"),
        }
    }

    async fn trace(&self, decoded: &DecodedTransaction) {
        let Some(tracer) = &self.tracer else {
            warn!(tx_hash = ?decoded.hash, "No tracer configured, skipping trace");
            return;
        };

        match tracer.trace_geth_tx(decoded.hash).await {
            Ok(()) => {
                metrics::record_trace(&self.network.name, "ok");
                if self.trace_to_json {
                    match tracer.decoded_calls(&decoded.hash) {
                        Some(calls) => self.save_trace(decoded.hash, &calls).await,
                        None => warn!(tx_hash = ?decoded.hash, "Tracer kept no decoded calls"),
                    }
                }
            }
            Err(e) => {
                metrics::record_trace(&self.network.name, "failed");
                if self.trace_to_json {
                    // keep at least the decoded transaction
                    self.save_trace(decoded.hash, decoded).await;
                }

                match e {
                    TraceError::DebugApiUnavailable(_) => self.disable_tracing(&e),
                    TraceError::Failed(_) => {
                        warn!(tx_hash = ?decoded.hash, error = %e, "Failed to trace transaction")
                    }
                }
            }
        }
    }

    async fn save_trace<T: Serialize>(&self, tx_hash: H256, item: &T) {
        match self.artifacts.save_trace(tx_hash, item).await {
            Ok(path) => trace!(?tx_hash, ?path, "Saved trace"),
            Err(e) => warn!(?tx_hash, error = %e, "Failed to save trace"),
        }
    }

    fn disable_tracing(&self, err: &TraceError) {
        let previous = self
            .tracing_level
            .swap(TracingLevel::None as u8, Ordering::SeqCst);
        if previous != TracingLevel::None as u8 {
            warn!(error = %err, "Debug API is either disabled or not available on the node. Disabling tracing");
            metrics::record_capability_downgrade(&self.network.name, Capability::DebugTrace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainRpc;
    use crate::config::test_settings;
    use crate::contracts::InMemoryContractStore;
    use crate::decode::abi::tests::{insufficient_balance, vault_abi, withdraw_input};
    use crate::decode::trace::MockTracer;
    use crate::error::{RpcError, RpcErrorKind};
    use ethers::types::Bytes;
    use serde_json::{json, Value};
    use std::path::Path;

    fn vault() -> Address {
        Address::from_low_u64_be(0xfeed)
    }

    fn store() -> Arc<InMemoryContractStore> {
        let store = InMemoryContractStore::new();
        store.add_abi("Vault", (*vault_abi()).clone());
        store.add_contract(vault(), "Vault");
        Arc::new(store)
    }

    fn submitted(to: Address) -> Transaction {
        Transaction {
            hash: H256::repeat_byte(7),
            from: Address::from_low_u64_be(1),
            to: Some(to),
            input: Bytes::from(withdraw_input(10)),
            ..Default::default()
        }
    }

    fn mined(status: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::repeat_byte(7),
            status: Some(U64::from(status)),
            block_number: Some(U64::from(5)),
            ..Default::default()
        }
    }

    fn reverting_rpc() -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_transaction_receipt()
            .returning(|_| Ok(Some(mined(0))));
        rpc.expect_call().returning(|_, block| {
            assert_eq!(block, Some(5));
            Err(RpcError::new("eth_call", RpcErrorKind::Execution, "execution reverted")
                .with_data(Bytes::from(insufficient_balance(1, 10))))
        });
        rpc
    }

    fn successful_rpc() -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_transaction_receipt()
            .returning(|_| Ok(Some(mined(1))));
        rpc
    }

    fn orchestrator(
        rpc: MockChainRpc,
        tracer: Option<MockTracer>,
        level: &str,
        trace_to_json: bool,
        dir: &Path,
    ) -> DecodeOrchestrator {
        let mut settings = test_settings();
        settings.tracing_level = level.to_string();
        settings.trace_to_json = trace_to_json;
        settings.artifacts_dir = dir.to_path_buf();

        DecodeOrchestrator::new(
            Arc::new(rpc),
            store(),
            tracer.map(|t| Arc::new(t) as Arc<dyn Tracer>),
            Arc::new(AccumulatedErrors::new()),
            &settings,
            "reverted_transactions_test.json".to_string(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_nothing_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = orchestrator(MockChainRpc::new(), None, "ALL", false, dir.path());

        let outcome = decoder.decode(Ok(None)).await;
        assert!(outcome.decoded.is_none());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_submission_revert_reason_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = orchestrator(MockChainRpc::new(), None, "ALL", false, dir.path());
        let err = ClientError::Rpc(
            RpcError::new("eth_estimateGas", RpcErrorKind::Execution, "execution reverted")
                .with_data(Bytes::from(insufficient_balance(3, 4))),
        );

        let outcome = decoder.decode(Err(err)).await;
        assert!(outcome.decoded.is_none());
        let err = outcome.error.unwrap();
        assert!(matches!(err, ClientError::SubmissionReverted { .. }));
        assert!(err.to_string().contains("InsufficientBalance"));
    }

    #[tokio::test]
    async fn test_undecodable_submission_error_is_returned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = orchestrator(MockChainRpc::new(), None, "ALL", false, dir.path());
        let err = ClientError::Rpc(RpcError::new(
            "eth_sendRawTransaction",
            RpcErrorKind::Rejected,
            "nonce too low",
        ));

        let outcome = decoder.decode(Err(err)).await;
        assert!(matches!(outcome.error, Some(ClientError::Rpc(_))));
    }

    #[tokio::test]
    async fn test_accumulated_errors_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = orchestrator(MockChainRpc::new(), None, "ALL", false, dir.path());
        decoder
            .errors
            .push(ClientError::Config("first".to_string()))
            .await;
        decoder
            .errors
            .push(ClientError::Signing("second".to_string()))
            .await;

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(outcome.decoded.is_none());
        let msg = outcome.error.unwrap().to_string();
        assert!(msg.contains("first") && msg.contains("second"));
    }

    #[tokio::test]
    async fn test_revert_without_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer.expect_trace_geth_tx().never();
        let decoder = orchestrator(reverting_rpc(), Some(tracer), "NONE", false, dir.path());

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        let decoded = outcome.decoded.unwrap();
        assert_eq!(decoded.method.as_deref(), Some("withdraw"));
        assert_eq!(decoded.contract_name.as_deref(), Some("Vault"));
        assert_eq!(decoded.status, Some(0));
        let err = outcome.error.unwrap();
        assert!(matches!(err, ClientError::ExecutionReverted { .. }));
        assert!(err.to_string().contains("InsufficientBalance(1, 10)"));
    }

    #[tokio::test]
    async fn test_revert_is_traced_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer
            .expect_trace_geth_tx()
            .times(1)
            .returning(|_| Ok(()));
        let decoder = orchestrator(reverting_rpc(), Some(tracer), "REVERTED", false, dir.path());

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(outcome.decoded.is_some());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_success_not_traced_at_reverted_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer.expect_trace_geth_tx().never();
        let decoder = orchestrator(successful_rpc(), Some(tracer), "REVERTED", false, dir.path());

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(outcome.decoded.is_some());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_debug_api_disables_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer.expect_trace_geth_tx().times(1).returning(|_| {
            Err(TraceError::DebugApiUnavailable(
                "the method debug_traceTransaction does not exist".to_string(),
            ))
        });
        let decoder = orchestrator(successful_rpc(), Some(tracer), "ALL", false, dir.path());

        let first = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(first.decoded.is_some());
        assert!(first.error.is_none());
        assert_eq!(decoder.tracing_level(), TracingLevel::None);

        let second = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(second.decoded.is_some());
    }

    #[tokio::test]
    async fn test_trace_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer.expect_trace_geth_tx().returning(|_| Ok(()));
        tracer
            .expect_decoded_calls()
            .returning(|_| Some(json!([{"method": "withdraw"}])));
        let decoder = orchestrator(successful_rpc(), Some(tracer), "ALL", true, dir.path());

        decoder.decode(Ok(Some(submitted(vault())))).await;

        let path = dir
            .path()
            .join("traces")
            .join(format!("{:?}.json", H256::repeat_byte(7)));
        let saved: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved[0]["method"], "withdraw");
    }

    #[tokio::test]
    async fn test_failed_trace_keeps_level_and_saves_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer
            .expect_trace_geth_tx()
            .times(2)
            .returning(|_| Err(TraceError::Failed("tracer timed out".to_string())));
        tracer.expect_decoded_calls().never();
        let decoder = orchestrator(reverting_rpc(), Some(tracer), "REVERTED", true, dir.path());

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(matches!(outcome.error, Some(ClientError::ExecutionReverted { .. })));
        assert_eq!(decoder.tracing_level(), TracingLevel::Reverted);

        let path = dir
            .path()
            .join("traces")
            .join(format!("{:?}.json", H256::repeat_byte(7)));
        let saved: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved["method"], "withdraw");
        assert_eq!(saved["contract_name"], "Vault");
        assert_eq!(saved["status"], 0);

        // still traced the next time
        decoder.decode(Ok(Some(submitted(vault())))).await;
        assert_eq!(decoder.tracing_level(), TracingLevel::Reverted);
    }

    #[tokio::test]
    async fn test_unknown_method_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracer = MockTracer::new();
        tracer.expect_trace_geth_tx().never();
        let decoder = orchestrator(reverting_rpc(), Some(tracer), "ALL", true, dir.path());

        let unknown = Address::from_low_u64_be(0xbeef);
        let outcome = decoder.decode(Ok(Some(submitted(unknown)))).await;

        let decoded = outcome.decoded.unwrap();
        assert!(decoded.method.is_none());
        assert!(matches!(outcome.error, Some(ClientError::ExecutionReverted { .. })));

        let saved: Vec<String> = serde_json::from_slice(
            &std::fs::read(dir.path().join("reverted_transactions_test.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved, vec![format!("{:?}", H256::repeat_byte(7))]);
    }

    #[tokio::test]
    async fn test_receipt_timeout_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut rpc = MockChainRpc::new();
        rpc.expect_transaction_receipt().returning(|_| Ok(None));
        let mut settings = test_settings();
        settings.network.txn_timeout_secs = 1;
        settings.artifacts_dir = dir.path().to_path_buf();
        let decoder = DecodeOrchestrator::new(
            Arc::new(rpc),
            store(),
            None,
            Arc::new(AccumulatedErrors::new()),
            &settings,
            "reverted.json".to_string(),
            CancellationToken::new(),
        );

        let outcome = decoder.decode(Ok(Some(submitted(vault())))).await;
        assert!(outcome.decoded.is_none());
        assert!(matches!(outcome.error, Some(ClientError::Timeout { .. })));
    }
}
