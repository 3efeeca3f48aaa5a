//! Contract metadata used by the decoder

use dashmap::DashMap;
use ethers::abi::Abi;
use ethers::types::Address;
use std::sync::Arc;

/// Lookup of deployed contracts and their ABIs
#[cfg_attr(test, mockall::automock)]
pub trait ContractStore: Send + Sync {
    /// Name and ABI of the contract deployed at `address`
    fn find_abi(&self, address: &Address) -> Option<(String, Arc<Abi>)>;

    /// Every known ABI, used when a log is emitted by an unmapped address
    fn abis(&self) -> Vec<(String, Arc<Abi>)>;

    /// Map `address` to `name`, keeping an ABI already stored under that name
    fn register_contract(&self, address: Address, name: &str, abi: Arc<Abi>);
}

/// Contract store backed by concurrent maps
#[derive(Default)]
pub struct InMemoryContractStore {
    /// contract name -> ABI
    abis: DashMap<String, Arc<Abi>>,
    /// address -> contract name
    contracts: DashMap<Address, String>,
}

impl InMemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_abi(&self, name: impl Into<String>, abi: Abi) {
        self.abis.insert(name.into(), Arc::new(abi));
    }

    pub fn add_contract(&self, address: Address, name: impl Into<String>) {
        self.contracts.insert(address, name.into());
    }
}

impl ContractStore for InMemoryContractStore {
    fn find_abi(&self, address: &Address) -> Option<(String, Arc<Abi>)> {
        let name = self.contracts.get(address)?.clone();
        let abi = self.abis.get(&name)?.clone();
        Some((name, abi))
    }

    fn abis(&self) -> Vec<(String, Arc<Abi>)> {
        self.abis
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn register_contract(&self, address: Address, name: &str, abi: Arc<Abi>) {
        self.abis.entry(name.to_string()).or_insert(abi);
        self.contracts.insert(address, name.to_string());
    }
}
