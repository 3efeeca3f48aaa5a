//! Bounded block header cache with least-frequently-used eviction

use ethers::types::U256;
use std::collections::HashMap;

/// Fee data of one block as fetched for gas statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderCacheEntry {
    pub block_number: u64,
    pub base_fee: U256,
    pub priority_fee_sample: U256,
    /// Percentile the priority fee was sampled at, in basis points
    pub sample_bps: u32,
    pub access_count: u64,
}

/// Fixed-capacity header store
///
/// Blocks that keep falling inside a sliding statistics window accumulate
/// accesses and stay resident, one-off blocks are evicted first. Ties on
/// access count evict the oldest block.
#[derive(Debug)]
pub struct HeaderCache {
    capacity: usize,
    entries: HashMap<u64, HeaderCacheEntry>,
}

pub(crate) fn percentile_bps(percentile: f64) -> u32 {
    (percentile * 100.0).round() as u32
}

impl HeaderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.entries.contains_key(&block_number)
    }

    /// Look up a block sampled at `percentile`, counting the access on a hit
    pub fn get(&mut self, block_number: u64, percentile: f64) -> Option<HeaderCacheEntry> {
        let entry = self.entries.get_mut(&block_number)?;
        if entry.sample_bps != percentile_bps(percentile) {
            return None;
        }
        entry.access_count += 1;
        Some(*entry)
    }

    /// Admit a freshly fetched block, evicting the least used entry when full
    pub fn insert(&mut self, block_number: u64, base_fee: U256, priority_fee: U256, percentile: f64) {
        if self.capacity == 0 {
            return;
        }

        if let Some(entry) = self.entries.get_mut(&block_number) {
            // re-sampled at another percentile
            entry.base_fee = base_fee;
            entry.priority_fee_sample = priority_fee;
            entry.sample_bps = percentile_bps(percentile);
            entry.access_count += 1;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict();
        }

        self.entries.insert(
            block_number,
            HeaderCacheEntry {
                block_number,
                base_fee,
                priority_fee_sample: priority_fee,
                sample_bps: percentile_bps(percentile),
                access_count: 1,
            },
        );
    }

    fn evict(&mut self) {
        let victim = self
            .entries
            .values()
            .min_by_key(|e| (e.access_count, e.block_number))
            .map(|e| e.block_number);

        if let Some(block_number) = victim {
            self.entries.remove(&block_number);
        }
    }
}
