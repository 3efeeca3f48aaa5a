//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local per-address nonce allocation
//! - Refreshing pending and confirmed nonces from the node
//! - Finding a key with no transactions in flight

use crate::chain::ChainRpc;
use crate::config::KeySyncConfig;
use crate::error::{ClientError, ClientResult};
use crate::metrics;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, trace, warn};

/// Returned by [`NonceManager::any_synced_key`] when no key synced in time.
/// It is never a valid key number.
pub const TIMEOUT_KEY_NUM: usize = usize::MAX;

/// Per-address nonce state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceRecord {
    /// Next nonce according to the latest mined block
    pub last_confirmed: u64,
    /// Next nonce to hand out, including transactions still in flight
    pub pending: u64,
}

impl NonceRecord {
    fn new(last_confirmed: u64, pending: u64) -> Self {
        Self {
            last_confirmed,
            pending: pending.max(last_confirmed),
        }
    }

    /// Transactions sent but not yet mined
    pub fn in_flight(&self) -> u64 {
        self.pending - self.last_confirmed
    }

    pub fn is_synced(&self) -> bool {
        self.pending == self.last_confirmed
    }
}

/// Manages nonces for every key of a client
///
/// Allocation for different addresses is race free. Calls for the same
/// address are expected to come from the single task owning that key.
pub struct NonceManager {
    rpc: Arc<dyn ChainRpc>,
    network: String,
    /// Managed addresses, index is the key number
    addresses: Vec<Address>,
    records: DashMap<Address, NonceRecord>,
    sync: KeySyncConfig,
    /// Round-robin start for synced key lookups
    cursor: AtomicUsize,
}

impl NonceManager {
    /// Create a new nonce manager, records start at zero until refreshed
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        network: impl Into<String>,
        addresses: Vec<Address>,
        sync: KeySyncConfig,
    ) -> Self {
        let records = addresses
            .iter()
            .map(|address| (*address, NonceRecord::default()))
            .collect();

        Self {
            rpc,
            network: network.into(),
            addresses,
            records,
            sync,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Get the next nonce for `address` and advance the local counter
    pub fn next_nonce(&self, address: Address) -> ClientResult<u64> {
        let mut record = self
            .records
            .get_mut(&address)
            .ok_or(ClientError::UnknownAddress { address })?;

        let nonce = record.pending;
        record.pending += 1;

        trace!(?address, nonce, "Allocated nonce");
        metrics::record_nonce_allocated(&self.network);
        Ok(nonce)
    }

    /// Refresh every managed address from the node
    ///
    /// Stops at the first failing address, records refreshed before it are kept.
    pub async fn update_nonces(&self) -> ClientResult<()> {
        for address in &self.addresses {
            self.refresh(*address).await?;
        }
        debug!(keys = self.addresses.len(), "Updated nonces");
        Ok(())
    }

    /// Fetch pending and confirmed nonce of `address` and store them
    pub async fn refresh(&self, address: Address) -> ClientResult<NonceRecord> {
        if !self.records.contains_key(&address) {
            return Err(ClientError::UnknownAddress { address });
        }

        let pending = self.rpc.pending_nonce_at(address).await;
        let confirmed = self.rpc.nonce_at(address).await;
        let (pending, confirmed) = match (pending, confirmed) {
            (Ok(p), Ok(c)) => (p, c),
            (Err(source), _) | (_, Err(source)) => {
                metrics::record_nonce_refresh_failure(&self.network);
                return Err(ClientError::NonceRefresh { address, source });
            }
        };

        let record = NonceRecord::new(confirmed, pending);
        if let Some(mut stored) = self.records.get_mut(&address) {
            // local allocations the node has not seen yet stay reserved
            let local_pending = stored.pending;
            *stored = NonceRecord::new(confirmed, pending.max(local_pending));
        }
        trace!(?address, ?record, "Refreshed nonce");
        Ok(record)
    }

    /// Record that `nonce` was used for `address` outside of [`Self::next_nonce`]
    ///
    /// The local counter never moves backwards.
    pub fn mark_used(&self, address: Address, nonce: u64) -> ClientResult<()> {
        let mut record = self
            .records
            .get_mut(&address)
            .ok_or(ClientError::UnknownAddress { address })?;

        if nonce >= record.pending {
            record.pending = nonce + 1;
            trace!(?address, nonce, "Advanced nonce past explicitly used value");
        }
        Ok(())
    }

    /// Give back a nonce that was allocated but never submitted
    ///
    /// Only the most recent allocation can be returned. Older nonces stay
    /// consumed since later ones may already be on their way.
    pub fn release_nonce(&self, address: Address, nonce: u64) -> ClientResult<()> {
        let mut record = self
            .records
            .get_mut(&address)
            .ok_or(ClientError::UnknownAddress { address })?;

        if record.pending == nonce + 1 && nonce >= record.last_confirmed {
            record.pending = nonce;
            debug!(?address, nonce, "Released nonce");
        }
        Ok(())
    }

    /// Last stored record of `address`
    pub fn record(&self, address: Address) -> Option<NonceRecord> {
        self.records.get(&address).map(|r| *r)
    }

    /// Poll until some key has no transactions in flight
    ///
    /// Every round refreshes candidates from the node, so the answer reflects
    /// the chain rather than local bookkeeping. The root key is only a
    /// candidate when it is the only key. Returns [`TIMEOUT_KEY_NUM`] when no
    /// key synced within `deadline`.
    pub async fn any_synced_key(&self, deadline: Duration) -> usize {
        let candidates: Vec<usize> = if self.addresses.len() > 1 {
            (1..self.addresses.len()).collect()
        } else {
            (0..self.addresses.len()).collect()
        };
        if candidates.is_empty() {
            error!("No keys are managed, cannot find a synced key");
            return TIMEOUT_KEY_NUM;
        }

        let retry_delay = Duration::from_millis(self.sync.retry_delay_ms);
        let search = async {
            loop {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                for offset in 0..candidates.len() {
                    let key_num = candidates[(start + offset) % candidates.len()];
                    match self.refresh(self.addresses[key_num]).await {
                        Ok(record) if record.is_synced() => return key_num,
                        Ok(record) => {
                            trace!(key_num, in_flight = record.in_flight(), "Key is not synced")
                        }
                        Err(e) => warn!(key_num, error = %e, "Failed to check key sync status"),
                    }
                }
                sleep(retry_delay).await;
            }
        };

        match timeout(deadline, search).await {
            Ok(key_num) => {
                debug!(key_num, "Found synced key");
                key_num
            }
            Err(_) => {
                error!(?deadline, "No synced key found before timeout");
                TIMEOUT_KEY_NUM
            }
        }
    }

    /// Default deadline for synced key lookups
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs)
    }
}
