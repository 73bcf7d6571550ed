//! Spatial locality: how far each reference lands from recent ones.

use std::collections::{BTreeMap, VecDeque};

use super::{ReuseAnalyzer, ReuseEntry, ReuseStats};
use crate::Address;

/// Window size used when none is configured.
pub const DEFAULT_SPATIAL_WINDOW: u64 = 64;

/// The distance of a reference is the smallest absolute difference between
/// its address and any address among the last `capacity` references.
#[derive(Debug, Clone)]
pub struct SpatialLocality {
    capacity: u64,
    bin_individual: u64,
    max_tracking: u64,
    /// Resident addresses with their multiplicity
    resident: BTreeMap<Address, u32>,
    recent: VecDeque<Address>,
    stats: BTreeMap<u64, ReuseStats>,
}

impl SpatialLocality {
    pub fn new(capacity: u64, bin_individual: u64, max_tracking: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            bin_individual,
            max_tracking,
            resident: BTreeMap::new(),
            recent: VecDeque::new(),
            stats: BTreeMap::new(),
        }
    }

    fn nearest(&self, address: Address) -> Option<u64> {
        let below = self
            .resident
            .range(..=address)
            .next_back()
            .map(|(&a, _)| address - a);
        let above = self
            .resident
            .range(address..)
            .next()
            .map(|(&a, _)| a - address);
        match (below, above) {
            (Some(b), Some(a)) => Some(b.min(a)),
            (b, a) => b.or(a),
        }
    }

    fn evict_oldest(&mut self) {
        let Some(a) = self.recent.pop_front() else {
            return;
        };
        if let Some(count) = self.resident.get_mut(&a) {
            *count -= 1;
            if *count == 0 {
                self.resident.remove(&a);
            }
        }
    }
}

impl Default for SpatialLocality {
    fn default() -> Self {
        Self::new(DEFAULT_SPATIAL_WINDOW, super::DEFAULT_BIN_INDIVIDUAL, super::UNBOUNDED)
    }
}

impl ReuseAnalyzer for SpatialLocality {
    fn describe(&self) -> &'static str {
        "SPATIAL"
    }

    fn process(&mut self, entry: &ReuseEntry) {
        let distance = self.nearest(entry.address);
        let (bin, max) = (self.bin_individual, self.max_tracking);
        self.stats
            .entry(entry.id)
            .or_insert_with(|| ReuseStats::new(entry.id, bin, max))
            .update(distance);

        if self.recent.len() as u64 >= self.capacity {
            self.evict_oldest();
        }
        *self.resident.entry(entry.address).or_insert(0) += 1;
        self.recent.push_back(entry.address);
    }

    fn skip_addresses(&mut self, _amount: u64) {
        self.recent.clear();
        self.resident.clear();
    }

    fn active_addresses(&self) -> Vec<Address> {
        self.resident.keys().copied().collect()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn bin_individual(&self) -> u64 {
        self.bin_individual
    }

    fn max_tracking(&self) -> u64 {
        self.max_tracking
    }

    fn all_stats(&self) -> &BTreeMap<u64, ReuseStats> {
        &self.stats
    }
}
