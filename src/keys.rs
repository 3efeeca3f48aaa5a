//! Signing keys managed by the client
//!
//! Key 0 is the root key. Ephemeral keys are generated on startup and funded
//! from the root key when `ephemeral_addresses` is set.

use crate::error::{ClientError, ClientResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use tracing::{debug, info, warn};

/// A single signing key
#[derive(Debug, Clone)]
pub struct Key {
    pub address: Address,
    pub wallet: LocalWallet,
}

impl Key {
    fn from_wallet(wallet: LocalWallet) -> Self {
        Self {
            address: wallet.address(),
            wallet,
        }
    }
}

/// Ordered set of keys, indexed by key number
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: Vec<Key>,
}

impl Keyring {
    /// Parse hex private keys, with or without the 0x prefix
    pub fn from_private_keys(private_keys: &[String]) -> ClientResult<Self> {
        let keys = private_keys
            .iter()
            .enumerate()
            .map(|(i, pk)| {
                pk.trim()
                    .trim_start_matches("0x")
                    .parse::<LocalWallet>()
                    .map(Key::from_wallet)
                    .map_err(|e| ClientError::Config(format!("Invalid private key #{}: {}", i, e)))
            })
            .collect::<ClientResult<Vec<_>>>()?;

        debug!("Loaded {} keys", keys.len());
        Ok(Self { keys })
    }

    /// Append `count` freshly generated keys
    pub fn generate_ephemeral(&mut self, count: u64) {
        let mut rng = ethers::core::rand::thread_rng();
        for _ in 0..count {
            self.keys.push(Key::from_wallet(LocalWallet::new(&mut rng)));
        }
        info!("Generated {} ephemeral keys", count);
    }

    /// Keep only the root key and append `count` ephemeral keys
    ///
    /// Ephemeral funding splits the root balance between generated keys only,
    /// so other configured keys are dropped.
    pub fn into_ephemeral(mut self, count: u64) -> Self {
        if self.keys.len() > 1 {
            warn!(
                loaded = self.keys.len(),
                "Ephemeral mode is enabled, but more than 1 key is loaded. Only the first key will be used"
            );
            self.keys.truncate(1);
        }
        self.generate_ephemeral(count);
        self
    }

    /// Bind every wallet to `chain_id` so signatures carry replay protection
    pub fn with_chain_id(self, chain_id: u64) -> Self {
        let keys = self
            .keys
            .into_iter()
            .map(|key| Key {
                address: key.address,
                wallet: key.wallet.with_chain_id(chain_id),
            })
            .collect();
        Self { keys }
    }

    pub fn get(&self, key_num: usize) -> Option<&Key> {
        self.keys.get(key_num)
    }

    pub fn root(&self) -> Option<&Key> {
        self.keys.first()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.iter().map(|k| k.address).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
pub(crate) const TEST_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

#[cfg(test)]
pub(crate) const SECOND_TEST_PRIVATE_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
