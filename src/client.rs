//! Client runtime - composes keys, nonce management, gas estimation,
//! submission and decoding for one network
//!
//! Construction connects to the node, refreshes nonces, optionally checks
//! RPC health, funds ephemeral keys and checks dynamic fee support.

use crate::chain::{ChainRpc, EthersRpc};
use crate::config::{Priority, Settings};
use crate::contracts::{ContractStore, InMemoryContractStore};
use crate::decode::{DecodeOrchestrator, DecodeOutcome, Tracer};
use crate::error::{AccumulatedErrors, ClientError, ClientResult};
use crate::keys::Keyring;
use crate::tx::{
    CallOpts, GasEstimationRequest, GasEstimations, GasEstimator, GasStats, NonceManager,
    PreparedOpts, TransactOpts, TransactionSender, TxOption, TIMEOUT_KEY_NUM,
};

use ethers::abi::{Abi, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Transaction, TransactionReceipt, TransactionRequest, H256, U256, U64,
};
use ethers::utils::{get_contract_address, WEI_IN_ETHER};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Value sent from the root key to itself by the RPC health check
const HEALTH_CHECK_TRANSFER_WEI: u64 = 10_000;

/// How the root key balance is split between ephemeral keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingPlan {
    pub root_balance: U256,
    /// Gas cost of every funding transfer
    pub total_fee: U256,
    /// Kept on the root key
    pub root_buffer: U256,
    pub free_balance: U256,
    pub per_address: U256,
}

/// A contract deployed by [`Client::deploy_contract`]
#[derive(Debug, Clone)]
pub struct DeploymentData {
    pub address: Address,
    pub transaction: Transaction,
    pub receipt: TransactionReceipt,
}

/// Multi-key client for one network
pub struct Client {
    settings: Settings,
    rpc: Arc<dyn ChainRpc>,
    keys: Arc<Keyring>,
    chain_id: u64,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: Arc<GasEstimator>,
    sender: TransactionSender,
    decoder: DecodeOrchestrator,
    store: Arc<dyn ContractStore>,
    errors: Arc<AccumulatedErrors>,
    cancel: CancellationToken,
}

impl Client {
    /// Connect to the configured network with an empty contract store and no tracer
    pub async fn new(settings: Settings) -> ClientResult<Self> {
        let mut keyring = Keyring::from_private_keys(&settings.network.private_keys)?;
        if settings.is_ephemeral() {
            if keyring.is_empty() {
                return Err(ClientError::Config(
                    "ephemeral mode needs a root private key to fund ephemeral keys".to_string(),
                ));
            }
            keyring = keyring.into_ephemeral(settings.ephemeral_addresses);
        }

        let rpc = Arc::new(EthersRpc::new(&settings.network)?);
        let store = Arc::new(InMemoryContractStore::new());

        Self::with_components(settings, keyring, rpc, store, None).await
    }

    /// Build a client from explicit collaborators
    pub async fn with_components(
        settings: Settings,
        keyring: Keyring,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn ContractStore>,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> ClientResult<Self> {
        if settings.is_ephemeral() && (keyring.len() as u64) < settings.ephemeral_addresses + 1 {
            return Err(ClientError::Config(format!(
                "ephemeral mode needs a root key and {} ephemeral keys, got {} keys",
                settings.ephemeral_addresses,
                keyring.len()
            )));
        }

        let chain_id = rpc.chain_id().await?;
        let keys = Arc::new(keyring.with_chain_id(chain_id));
        let network = settings.network.clone();

        let nonce_manager = Arc::new(NonceManager::new(
            rpc.clone(),
            network.name.clone(),
            keys.addresses(),
            settings.key_sync.clone(),
        ));
        if !keys.is_empty() {
            nonce_manager.update_nonces().await?;
        }

        let gas_estimator = Arc::new(GasEstimator::new(rpc.clone(), network.clone()));
        let sender = TransactionSender::new(
            rpc.clone(),
            keys.clone(),
            nonce_manager.clone(),
            gas_estimator.clone(),
            network.clone(),
            chain_id,
        );

        let cancel = CancellationToken::new();
        let errors = Arc::new(AccumulatedErrors::new());
        let reverted_file = format!(
            "reverted_transactions_{}_{}.json",
            network.name,
            chrono::Local::now().format("%Y-%m-%d-%H-%M-%S")
        );
        let decoder = DecodeOrchestrator::new(
            rpc.clone(),
            store.clone(),
            tracer,
            errors.clone(),
            &settings,
            reverted_file,
            cancel.clone(),
        );

        let client = Self {
            settings,
            rpc,
            keys,
            chain_id,
            nonce_manager,
            gas_estimator,
            sender,
            decoder,
            store,
            errors,
            cancel,
        };

        if client.settings.check_rpc_health_on_start {
            client.check_rpc_health().await?;
        }

        info!(
            network = %network.name,
            chain_id,
            keys = client.keys.len(),
            ephemeral_keys = client.settings.ephemeral_addresses,
            "Created new client"
        );

        if client.settings.is_ephemeral() {
            client.fund_ephemeral_keys().await?;
        }

        if network.gas_price_estimation_enabled && network.eip1559_dynamic_fees {
            debug!("Checking if EIP-1559 is supported by the network");
            client
                .calculate_gas_estimations(&GasEstimationRequest {
                    gas_estimation_enabled: true,
                    fallback_gas_price: U256::from(network.gas_price),
                    fallback_gas_fee_cap: U256::from(network.gas_fee_cap),
                    fallback_gas_tip_cap: U256::from(network.gas_tip_cap),
                    priority: Priority::Standard,
                })
                .await;
        }

        Ok(client)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn keys(&self) -> &Keyring {
        &self.keys
    }

    pub fn nonce_manager(&self) -> &NonceManager {
        &self.nonce_manager
    }

    pub fn gas_estimator(&self) -> &GasEstimator {
        &self.gas_estimator
    }

    pub fn decoder(&self) -> &DecodeOrchestrator {
        &self.decoder
    }

    pub fn contract_store(&self) -> &Arc<dyn ContractStore> {
        &self.store
    }

    /// Errors collected while preparing transaction options
    pub async fn errors(&self) -> Vec<ClientError> {
        self.errors.snapshot().await
    }

    /// Transaction options for the root key
    pub async fn new_tx_opts(&self, options: &[TxOption]) -> PreparedOpts {
        self.new_tx_key_opts(0, options).await
    }

    /// Transaction options for `key_num`, priced for the next transaction
    ///
    /// Never fails outright. Failures are added to the accumulated errors
    /// and carried by poisoned options, which [`Client::send_transaction`]
    /// refuses.
    pub async fn new_tx_key_opts(&self, key_num: usize, options: &[TxOption]) -> PreparedOpts {
        let Some(key) = self.keys.get(key_num) else {
            let hint = if key_num == TIMEOUT_KEY_NUM {
                " (no synced key was found before the timeout)"
            } else {
                ""
            };
            let err = ClientError::KeyOutOfRange {
                key_num,
                max: self.keys.len().saturating_sub(1),
                hint,
            };
            return self.poisoned(TransactOpts::default(), err).await;
        };

        let mut opts = TransactOpts {
            key_num,
            from: key.address,
            gas_limit: self.settings.network.gas_limit,
            ..Default::default()
        };
        debug!(key_num, address = ?key.address, "Estimating transaction");

        let status = match self.nonce_manager.refresh(key.address).await {
            Ok(status) => status,
            Err(e) => {
                error!(key_num, error = %e, "Failed to get nonce status");
                return self.poisoned(opts, e).await;
            }
        };

        let mut poison = None;
        if self.settings.pending_nonce_protection_enabled {
            if status.pending > status.last_confirmed {
                let err = ClientError::PendingNonce {
                    key_num,
                    pending: status.in_flight(),
                };
                self.errors.push(err.clone()).await;
                poison = Some(err);
            } else {
                debug!(key_num, "Pending nonce protection is enabled. Nonce status is OK");
            }
        }

        let estimations = self
            .gas_estimator
            .calculate_gas_estimations(&self.gas_estimator.default_request())
            .await;

        // local allocations the node has not seen yet are already taken
        let next = self
            .nonce_manager
            .record(key.address)
            .map_or(status.pending, |record| record.pending.max(status.pending));
        opts.nonce = Some(U256::from(next));
        opts = opts.with_estimations(&estimations, self.gas_estimator.dynamic_fees_enabled());
        for option in options {
            opts.apply(*option);
        }

        debug!(
            key_num,
            nonce = ?opts.nonce,
            value = ?opts.value,
            gas_price = ?opts.gas_price,
            gas_fee_cap = ?opts.gas_fee_cap,
            gas_tip_cap = ?opts.gas_tip_cap,
            gas_limit = opts.gas_limit,
            "New transaction options"
        );

        match poison {
            Some(err) => PreparedOpts::Poisoned(opts, err),
            None => PreparedOpts::Ready(opts),
        }
    }

    async fn poisoned(&self, opts: TransactOpts, err: ClientError) -> PreparedOpts {
        self.errors.push(err.clone()).await;
        PreparedOpts::Poisoned(opts, err)
    }

    /// Read-only call options from the root key
    pub fn new_call_opts(&self) -> CallOpts {
        CallOpts {
            from: self.keys.root().map(|k| k.address).unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn new_call_key_opts(&self, key_num: usize) -> ClientResult<CallOpts> {
        let key = self.keys.get(key_num).ok_or(ClientError::KeyOutOfRange {
            key_num,
            max: self.keys.len().saturating_sub(1),
            hint: "",
        })?;
        Ok(CallOpts {
            from: key.address,
            ..Default::default()
        })
    }

    /// Run a read-only call against `to` at the block of `opts`
    pub async fn call(&self, opts: &CallOpts, to: Address, data: Bytes) -> ClientResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(opts.from)
            .to(to)
            .data(data)
            .into();
        Ok(self.rpc.call(&tx, opts.block_number).await?)
    }

    /// Deploy a contract and register it for decoding
    ///
    /// Waits until the deployment is mined. Later transactions to the new
    /// address decode against `abi`, stored under `name`.
    pub async fn deploy_contract(
        &self,
        prepared: PreparedOpts,
        name: &str,
        abi: Abi,
        bytecode: Bytes,
        args: &[Token],
    ) -> ClientResult<DeploymentData> {
        info!(contract = name, "Started deploying contract");

        let data = match abi.constructor() {
            Some(constructor) => constructor
                .encode_input(bytecode.to_vec(), args)
                .map(Bytes::from)
                .map_err(|e| {
                    ClientError::Transaction(format!(
                        "Failed to encode constructor arguments of {}: {}",
                        name, e
                    ))
                })?,
            None if args.is_empty() => bytecode,
            None => {
                return Err(ClientError::Transaction(format!(
                    "{} has no constructor, got {} arguments",
                    name,
                    args.len()
                )))
            }
        };

        let transaction = self.send_transaction(prepared, None, data).await?;
        info!(
            contract = name,
            tx_hash = ?transaction.hash,
            "Waiting for contract deployment to finish"
        );

        let receipt = self.wait_mined(transaction.hash).await?;
        if receipt.status == Some(U64::zero()) {
            return Err(ClientError::ExecutionReverted {
                tx_hash: transaction.hash,
                reason: format!("deployment of {} was reverted", name),
            });
        }

        let address = receipt
            .contract_address
            .unwrap_or_else(|| get_contract_address(transaction.from, transaction.nonce));
        self.store.register_contract(address, name, Arc::new(abi));

        info!(contract = name, ?address, tx_hash = ?transaction.hash, "Deployed contract");
        Ok(DeploymentData {
            address,
            transaction,
            receipt,
        })
    }

    /// Register a contract deployed elsewhere so its transactions decode
    pub fn load_contract(&self, name: &str, address: Address, abi: Abi) {
        self.store.register_contract(address, name, Arc::new(abi));
        debug!(contract = name, ?address, "Loaded contract");
    }

    /// Sign and submit a call with prepared options
    pub async fn send_transaction(
        &self,
        prepared: PreparedOpts,
        to: Option<Address>,
        data: Bytes,
    ) -> ClientResult<Transaction> {
        let opts = prepared.into_ready()?;
        self.sender.send(&opts, to, data).await
    }

    /// Wait for a submitted transaction and decode it
    ///
    /// The outcome can carry a decoded transaction and an error at once.
    pub async fn decode(&self, submitted: ClientResult<Option<Transaction>>) -> DecodeOutcome {
        self.decoder.decode(submitted).await
    }

    pub async fn transfer_eth_from_key(
        &self,
        key_num: usize,
        to: Address,
        value: U256,
        gas_price: U256,
        cancel: &CancellationToken,
    ) -> ClientResult<TransactionReceipt> {
        self.sender
            .transfer_eth_from_key(key_num, to, value, gas_price, cancel)
            .await
    }

    pub async fn wait_mined(&self, tx_hash: H256) -> ClientResult<TransactionReceipt> {
        self.sender.wait_mined(tx_hash, &self.cancel).await
    }

    /// A key with no transactions in flight, or [`TIMEOUT_KEY_NUM`]
    pub async fn any_synced_key(&self) -> usize {
        self.nonce_manager
            .any_synced_key(self.nonce_manager.sync_timeout())
            .await
    }

    pub async fn stats(&self, block_count: u64, tip_percentile: f64) -> ClientResult<GasStats> {
        self.gas_estimator.stats(block_count, tip_percentile).await
    }

    pub fn new_default_gas_estimation_request(&self) -> GasEstimationRequest {
        self.gas_estimator.default_request()
    }

    pub async fn calculate_gas_estimations(
        &self,
        request: &GasEstimationRequest,
    ) -> GasEstimations {
        self.gas_estimator.calculate_gas_estimations(request).await
    }

    /// Split the root key balance between `addresses` keys
    ///
    /// `root_key_buffer_eth` ether stay on the root key on top of the gas
    /// needed for the transfers.
    pub async fn calculate_sub_key_funding(
        &self,
        addresses: u64,
        gas_price: U256,
        root_key_buffer_eth: u64,
    ) -> ClientResult<FundingPlan> {
        if addresses == 0 {
            return Err(ClientError::Funding("no addresses to fund".to_string()));
        }
        let root = self
            .keys
            .root()
            .ok_or_else(|| ClientError::Config("no root key configured".to_string()))?;

        let root_balance = self.rpc.balance_at(root.address).await?;
        let total_fee =
            gas_price * U256::from(self.settings.network.transfer_gas_fee) * U256::from(addresses);
        let root_buffer = U256::from(root_key_buffer_eth) * WEI_IN_ETHER;

        let free_balance = root_balance
            .checked_sub(total_fee + root_buffer)
            .unwrap_or_default();
        let per_address = free_balance / U256::from(addresses);
        if per_address.is_zero() {
            return Err(ClientError::Funding(format!(
                "insufficient root key balance {} to fund {} addresses (transfer fees {}, buffer {})",
                root_balance, addresses, total_fee, root_buffer
            )));
        }

        let plan = FundingPlan {
            root_balance,
            total_fee,
            root_buffer,
            free_balance,
            per_address,
        };
        info!(?plan, "Calculated sub-key funding");
        Ok(plan)
    }

    /// Fund the ephemeral keys, the last keys of the keyring, from the root key concurrently
    ///
    /// The first failing transfer cancels the others. Transfers already
    /// mined are not rolled back.
    async fn fund_ephemeral_keys(&self) -> ClientResult<()> {
        let gas_price = match self
            .gas_estimator
            .suggest_legacy_fees(Priority::Standard)
            .await
        {
            Ok(gas_price) => gas_price,
            Err(e) => {
                warn!(error = %e, "Using configured gas price for funding");
                U256::from(self.settings.network.gas_price)
            }
        };

        let plan = self
            .calculate_sub_key_funding(
                self.settings.ephemeral_addresses,
                gas_price,
                self.settings.root_key_funds_buffer,
            )
            .await?;
        warn!("Ephemeral mode, all funds will be lost!");

        let group = self.cancel.child_token();
        let sender = &self.sender;
        let first_ephemeral = self.keys.len() - self.settings.ephemeral_addresses as usize;
        let mut transfers: FuturesUnordered<_> = self
            .keys
            .addresses()
            .into_iter()
            .skip(first_ephemeral)
            .map(|address| {
                let group = group.clone();
                async move {
                    sender
                        .transfer_eth_from_key(0, address, plan.per_address, gas_price, &group)
                        .await
                        .map(|_| address)
                }
            })
            .collect();

        let mut first_error = None;
        while let Some(result) = transfers.next().await {
            match result {
                Ok(address) => debug!(?address, "Funded ephemeral key"),
                Err(e) if first_error.is_none() => {
                    error!(error = %e, "Failed to fund ephemeral key, cancelling remaining transfers");
                    group.cancel();
                    first_error = Some(e);
                }
                Err(e) => debug!(error = %e, "Funding transfer stopped"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(keys = self.settings.ephemeral_addresses, per_address = %plan.per_address, "Funded ephemeral keys");
                Ok(())
            }
        }
    }

    /// Send a tiny transfer from the root key to itself
    async fn check_rpc_health(&self) -> ClientResult<()> {
        let Some(root) = self.keys.root() else {
            warn!("No keys configured, skipping RPC health check");
            return Ok(());
        };
        info!(network = %self.settings.network.name, "Checking RPC health");

        let gas_price = self
            .gas_estimator
            .suggest_legacy_fees(Priority::Standard)
            .await
            .unwrap_or_else(|_| U256::from(self.settings.network.gas_price));

        self.sender
            .transfer_eth_from_key(
                0,
                root.address,
                U256::from(HEALTH_CHECK_TRANSFER_WEI),
                gas_price,
                &self.cancel,
            )
            .await
            .map_err(|e| ClientError::HealthCheck(Box::new(e)))?;

        info!("RPC health check passed");
        Ok(())
    }

    /// Cancel every wait in progress
    pub fn shutdown(&self) {
        self.cancel.cancel();
        info!("Client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainRpc;
    use crate::config::test_settings;
    use crate::error::{RpcError, RpcErrorKind};
    use crate::decode::abi::tests::{vault_abi, withdraw_input};
    use crate::keys::{SECOND_TEST_PRIVATE_KEY, TEST_PRIVATE_KEY};
    use ethers::utils::{keccak256, rlp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keyring() -> Keyring {
        Keyring::from_private_keys(&[TEST_PRIVATE_KEY.to_string()]).unwrap()
    }

    fn rpc_with_nonces(pending: u64, confirmed: u64) -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_chain_id().returning(|| Ok(31337));
        rpc.expect_pending_nonce_at().returning(move |_| Ok(pending));
        rpc.expect_nonce_at().returning(move |_| Ok(confirmed));
        rpc
    }

    async fn client(rpc: MockChainRpc, settings: Settings, keys: Keyring) -> Client {
        Client::with_components(
            settings,
            keys,
            Arc::new(rpc),
            Arc::new(InMemoryContractStore::new()),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_pending_nonce_protection_poisons_opts() {
        let mut settings = test_settings();
        settings.pending_nonce_protection_enabled = true;
        let client = client(rpc_with_nonces(7, 5), settings, keyring()).await;

        let prepared = client.new_tx_key_opts(0, &[]).await;
        assert!(prepared.is_poisoned());
        assert!(matches!(
            prepared.error(),
            Some(ClientError::PendingNonce { key_num: 0, pending: 2 })
        ));
        assert_eq!(prepared.opts().nonce, Some(U256::from(7)));
        assert_eq!(client.errors().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_nonce_ignored_without_protection() {
        let client = client(rpc_with_nonces(7, 5), test_settings(), keyring()).await;

        let prepared = client
            .new_tx_key_opts(0, &[TxOption::Value(U256::from(5)), TxOption::GasLimit(30_000)])
            .await;
        assert!(prepared.error().is_none());
        let opts = prepared.into_ready().unwrap();
        assert_eq!(opts.nonce, Some(U256::from(7)));
        assert_eq!(opts.gas_price, Some(U256::from(1_000_000_000u64)));
        assert_eq!(opts.value, Some(U256::from(5)));
        assert_eq!(opts.gas_limit, 30_000);
        assert!(client.errors().await.is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_fee_opts_clear_gas_price() {
        let mut settings = test_settings();
        settings.network.eip1559_dynamic_fees = true;
        let client = client(rpc_with_nonces(0, 0), settings, keyring()).await;

        let opts = client.new_tx_opts(&[]).await.into_ready().unwrap();
        assert_eq!(opts.gas_price, None);
        assert_eq!(opts.gas_fee_cap, Some(U256::from(30_000_000_000u64)));
        assert_eq!(opts.gas_tip_cap, Some(U256::from(1_800_000_000u64)));
        assert!(opts.is_dynamic_fee());
    }

    #[tokio::test]
    async fn test_timeout_key_is_out_of_range() {
        let client = client(rpc_with_nonces(0, 0), test_settings(), keyring()).await;

        let prepared = client.new_tx_key_opts(TIMEOUT_KEY_NUM, &[]).await;
        let err = prepared.error().unwrap();
        assert!(err.to_string().contains("no synced key was found"));
        assert_eq!(prepared.opts(), &TransactOpts::default());

        let other = client.new_tx_key_opts(1, &[]).await;
        assert!(matches!(
            other.error(),
            Some(ClientError::KeyOutOfRange { key_num: 1, max: 0, .. })
        ));
        assert_eq!(client.errors().await.len(), 2);
    }

    #[tokio::test]
    async fn test_nonce_read_failure_poisons_opts() {
        let mut rpc = MockChainRpc::new();
        rpc.expect_chain_id().returning(|| Ok(31337));
        rpc.expect_nonce_at().returning(|_| Ok(0));
        // construction refresh succeeds, later reads fail
        let reads = AtomicUsize::new(0);
        rpc.expect_pending_nonce_at().returning(move |_| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(0)
            } else {
                Err(RpcError::new("eth_getTransactionCount", RpcErrorKind::Transport, "down"))
            }
        });
        let client = client(rpc, test_settings(), keyring()).await;

        let prepared = client.new_tx_opts(&[]).await;
        assert!(matches!(prepared.error(), Some(ClientError::NonceRefresh { .. })));
        assert_eq!(prepared.opts().from, client.keys().root().unwrap().address);
        assert_eq!(client.errors().await.len(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_opts_are_never_sent() {
        let mut settings = test_settings();
        settings.pending_nonce_protection_enabled = true;
        let client = client(rpc_with_nonces(3, 1), settings, keyring()).await;

        let prepared = client.new_tx_opts(&[]).await;
        let submitted = client
            .send_transaction(prepared, Some(Address::zero()), Bytes::default())
            .await;
        assert!(matches!(submitted, Err(ClientError::PendingNonce { .. })));

        let outcome = client.decode(submitted.map(Some)).await;
        assert!(outcome.decoded.is_none());
        assert!(matches!(outcome.error, Some(ClientError::Accumulated(_))));
    }

    #[tokio::test]
    async fn test_call_opts() {
        let client = client(rpc_with_nonces(0, 0), test_settings(), keyring()).await;
        let root = client.keys().root().unwrap().address;

        assert_eq!(client.new_call_opts().from, root);
        assert_eq!(client.new_call_key_opts(0).unwrap().from, root);
        assert!(client.new_call_key_opts(3).is_err());
    }

    #[tokio::test]
    async fn test_call_runs_at_requested_block() {
        let mut rpc = rpc_with_nonces(0, 0);
        rpc.expect_call().times(1).returning(|tx, block| {
            assert_eq!(tx.to_addr(), Some(&Address::from_low_u64_be(0xfeed)));
            assert_eq!(block, Some(12));
            Ok(Bytes::from(vec![0x01]))
        });
        let client = client(rpc, test_settings(), keyring()).await;

        let opts = CallOpts {
            block_number: Some(12),
            ..client.new_call_opts()
        };
        let out = client
            .call(&opts, Address::from_low_u64_be(0xfeed), Bytes::default())
            .await
            .unwrap();
        assert_eq!(out, Bytes::from(vec![0x01]));
    }

    fn mined_receipt(hash: H256, contract_address: Option<Address>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: hash,
            status: Some(U64::one()),
            block_number: Some(U64::from(3)),
            contract_address,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deployed_contract_is_decoded() {
        let deployed = Address::from_low_u64_be(0xc0de);
        let mut rpc = rpc_with_nonces(0, 0);
        rpc.expect_estimate_gas().returning(|_| Ok(U256::from(500_000)));
        rpc.expect_send_raw_transaction().times(1).returning(|raw| {
            let (tx, _) = TypedTransaction::decode_signed(&rlp::Rlp::new(&raw)).unwrap();
            assert!(tx.to().is_none());
            Ok(H256::from(keccak256(&raw)))
        });
        rpc.expect_transaction_receipt()
            .returning(move |hash| Ok(Some(mined_receipt(hash, Some(deployed)))));
        let client = client(rpc, test_settings(), keyring()).await;

        let prepared = client.new_tx_opts(&[]).await;
        let deployment = client
            .deploy_contract(
                prepared,
                "Vault",
                (*vault_abi()).clone(),
                Bytes::from(vec![0x60, 0x80]),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(deployment.address, deployed);

        let call = Transaction {
            hash: H256::repeat_byte(9),
            from: client.keys().root().unwrap().address,
            to: Some(deployed),
            input: Bytes::from(withdraw_input(10)),
            ..Default::default()
        };
        let outcome = client.decode(Ok(Some(call))).await;
        let decoded = outcome.decoded.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(decoded.contract_name.as_deref(), Some("Vault"));
        assert_eq!(decoded.method.as_deref(), Some("withdraw"));
    }

    #[tokio::test]
    async fn test_reverted_deployment_is_not_registered() {
        let mut rpc = rpc_with_nonces(0, 0);
        rpc.expect_estimate_gas().returning(|_| Ok(U256::from(500_000)));
        rpc.expect_send_raw_transaction()
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        rpc.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                status: Some(U64::zero()),
                ..mined_receipt(hash, None)
            }))
        });
        let client = client(rpc, test_settings(), keyring()).await;

        let prepared = client.new_tx_opts(&[]).await;
        let err = client
            .deploy_contract(prepared, "Vault", (*vault_abi()).clone(), Bytes::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ExecutionReverted { .. }));
        assert!(client.contract_store().abis().is_empty());
    }

    #[tokio::test]
    async fn test_sub_key_funding() {
        let mut rpc = rpc_with_nonces(0, 0);
        rpc.expect_balance_at()
            .returning(|_| Ok(U256::from(10u64) * WEI_IN_ETHER));
        let client = client(rpc, test_settings(), keyring()).await;

        let gas_price = U256::from(1_000_000_000u64);
        let plan = client
            .calculate_sub_key_funding(2, gas_price, 1)
            .await
            .unwrap();
        let fee = gas_price * U256::from(21_000u64) * U256::from(2u64);
        assert_eq!(plan.total_fee, fee);
        assert_eq!(plan.root_buffer, WEI_IN_ETHER);
        assert_eq!(
            plan.per_address,
            (U256::from(9u64) * WEI_IN_ETHER - fee) / U256::from(2u64)
        );

        let err = client
            .calculate_sub_key_funding(2, gas_price, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Funding(_)));
    }

    fn funding_rpc() -> MockChainRpc {
        let mut rpc = rpc_with_nonces(0, 0);
        rpc.expect_suggest_gas_price()
            .returning(|| Ok(U256::from(1_000_000_000u64)));
        rpc.expect_balance_at()
            .returning(|_| Ok(U256::from(10u64) * WEI_IN_ETHER));
        rpc.expect_estimate_gas().returning(|_| Ok(U256::from(21_000)));
        rpc
    }

    fn ephemeral_settings(keys: u64) -> Settings {
        let mut settings = test_settings();
        settings.ephemeral_addresses = keys;
        settings.root_key_funds_buffer = 1;
        settings
    }

    fn ephemeral_keyring(keys: u64) -> Keyring {
        let mut keyring = keyring();
        keyring.generate_ephemeral(keys);
        keyring
    }

    #[tokio::test]
    async fn test_ephemeral_keys_are_funded() {
        let mut rpc = funding_rpc();
        rpc.expect_send_raw_transaction()
            .times(3)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        rpc.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                status: Some(U64::one()),
                ..Default::default()
            }))
        });

        let client = client(rpc, ephemeral_settings(3), ephemeral_keyring(3)).await;
        assert_eq!(client.keys().len(), 4);
        // root nonce advanced once per funding transfer
        let root = client.keys().root().unwrap().address;
        assert_eq!(client.nonce_manager().next_nonce(root).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_only_ephemeral_keys_are_funded() {
        let recipients = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = funding_rpc();
        let seen = recipients.clone();
        rpc.expect_send_raw_transaction().returning(move |raw| {
            let (tx, _) = TypedTransaction::decode_signed(&rlp::Rlp::new(&raw)).unwrap();
            seen.lock()
                .unwrap()
                .push((*tx.to_addr().unwrap(), *tx.value().unwrap()));
            Ok(H256::from(keccak256(&raw)))
        });
        rpc.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                status: Some(U64::one()),
                ..Default::default()
            }))
        });

        let mut keys = Keyring::from_private_keys(&[
            TEST_PRIVATE_KEY.to_string(),
            SECOND_TEST_PRIVATE_KEY.to_string(),
        ])
        .unwrap();
        keys.generate_ephemeral(2);
        let client = client(rpc, ephemeral_settings(2), keys).await;
        let configured = client.keys().get(1).unwrap().address;

        let sent = recipients.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(to, _)| *to != configured));
        let total = sent.iter().fold(U256::zero(), |acc, (_, value)| acc + *value);
        assert!(total <= U256::from(10u64) * WEI_IN_ETHER);
    }

    #[tokio::test]
    async fn test_ephemeral_mode_needs_generated_keys() {
        let result = Client::with_components(
            ephemeral_settings(2),
            keyring(),
            Arc::new(funding_rpc()),
            Arc::new(InMemoryContractStore::new()),
            None,
        )
        .await;
        assert!(matches!(result.err(), Some(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_prepared_nonce_is_not_reused() {
        let mut rpc = rpc_with_nonces(5, 5);
        rpc.expect_estimate_gas().returning(|_| Ok(U256::from(21_000)));
        rpc.expect_send_raw_transaction()
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        let client = client(rpc, test_settings(), keyring()).await;
        let root = client.keys().root().unwrap().address;

        let prepared = client.new_tx_key_opts(0, &[]).await;
        let tx = client
            .send_transaction(prepared, Some(Address::zero()), Bytes::default())
            .await
            .unwrap();
        assert_eq!(tx.nonce, U256::from(5));
        assert_eq!(client.nonce_manager().next_nonce(root).unwrap(), 6);

        // the node still reports 5 as pending, the next options skip past local allocations
        let next = client.new_tx_key_opts(0, &[]).await.into_ready().unwrap();
        assert_eq!(next.nonce, Some(U256::from(7)));
    }

    #[tokio::test]
    async fn test_funding_failure_fails_construction() {
        let mut rpc = funding_rpc();
        rpc.expect_send_raw_transaction().returning(|_| {
            Err(RpcError::new(
                "eth_sendRawTransaction",
                RpcErrorKind::Rejected,
                "insufficient funds for gas * price + value",
            ))
        });

        let result = Client::with_components(
            ephemeral_settings(2),
            ephemeral_keyring(2),
            Arc::new(rpc),
            Arc::new(InMemoryContractStore::new()),
            None,
        )
        .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_failed_health_check_fails_construction() {
        let mut rpc = funding_rpc();
        rpc.expect_send_raw_transaction().returning(|_| {
            Err(RpcError::new("eth_sendRawTransaction", RpcErrorKind::Transport, "connection refused"))
        });
        let mut settings = test_settings();
        settings.check_rpc_health_on_start = true;

        let result = Client::with_components(
            settings,
            keyring(),
            Arc::new(rpc),
            Arc::new(InMemoryContractStore::new()),
            None,
        )
        .await;
        let err = result.err().unwrap();
        assert!(matches!(err, ClientError::HealthCheck(_)));
        assert!(err.to_string().contains("RPC health check failed"));
    }

    #[tokio::test]
    async fn test_gas_estimations_use_fallbacks_when_disabled() {
        let client = client(rpc_with_nonces(0, 0), test_settings(), keyring()).await;

        let request = client.new_default_gas_estimation_request();
        assert!(!request.gas_estimation_enabled);
        let estimations = client.calculate_gas_estimations(&request).await;
        assert_eq!(estimations.gas_price, Some(U256::from(1_000_000_000u64)));
        assert_eq!(estimations.gas_fee_cap, Some(U256::from(30_000_000_000u64)));
    }
}
