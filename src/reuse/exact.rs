//! Exact LRU reuse distance over a bounded window.

use std::collections::{BTreeMap, HashMap};

use super::tree::SplayTree;
use super::{ReuseAnalyzer, ReuseEntry, ReuseStats, UNBOUNDED};
use crate::Address;

/// Distance of a reference is the number of distinct addresses referenced
/// since the previous reference to the same address. The window keeps the
/// `capacity` most recently used addresses; anything older is cold.
#[derive(Debug, Clone)]
pub struct ReuseDistance {
    capacity: u64,
    bin_individual: u64,
    max_tracking: u64,
    sequence: u64,
    /// Last sequence number of each resident address
    window: HashMap<Address, u64>,
    /// Resident sequence numbers, payload is the address
    order: SplayTree<Address>,
    stats: BTreeMap<u64, ReuseStats>,
}

impl ReuseDistance {
    pub fn new(capacity: u64, bin_individual: u64) -> Self {
        Self {
            capacity,
            bin_individual,
            max_tracking: capacity,
            sequence: 1,
            window: HashMap::new(),
            order: SplayTree::new(),
            stats: BTreeMap::new(),
        }
    }

    fn flush(&mut self) {
        self.window.clear();
        self.order.clear();
    }

    fn stats_mut(&mut self, id: u64) -> &mut ReuseStats {
        let (bin, max) = (self.bin_individual, self.max_tracking);
        self.stats
            .entry(id)
            .or_insert_with(|| ReuseStats::new(id, bin, max))
    }

    /// Number of addresses resident in the window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

impl ReuseAnalyzer for ReuseDistance {
    fn describe(&self) -> &'static str {
        "REUSE"
    }

    fn process(&mut self, entry: &ReuseEntry) {
        let distance = match self.window.get(&entry.address).copied() {
            Some(seq) => {
                let d = self.order.weight_above(seq);
                self.order.remove(seq);
                Some(d)
            }
            None => {
                if self.capacity != UNBOUNDED && self.window.len() as u64 >= self.capacity {
                    if let Some(oldest) = self.order.min_key() {
                        if let Some((_, evicted)) = self.order.remove(oldest) {
                            self.window.remove(&evicted);
                        }
                    }
                }
                None
            }
        };
        self.stats_mut(entry.id).update(distance);

        self.window.insert(entry.address, self.sequence);
        self.order.insert(self.sequence, entry.address, 1);
        self.sequence += 1;
    }

    fn skip_addresses(&mut self, amount: u64) {
        self.sequence += amount;
        self.flush();
    }

    fn active_addresses(&self) -> Vec<Address> {
        self.order.entries().into_iter().map(|(_, _, a)| a).collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const A: Address = 0x1000;
    const B: Address = 0x2000;
    const C: Address = 0x3000;

    fn run(capacity: u64, stream: &[Address]) -> ReuseDistance {
        let mut rd = ReuseDistance::new(capacity, 32);
        let entries: Vec<ReuseEntry> = stream.iter().map(|&a| ReuseEntry::new(0, a)).collect();
        rd.process_batch(&entries);
        rd
    }

    #[rstest]
    #[case(&[A, B, A], 2, vec![1])]
    #[case(&[A, B, C, A], 3, vec![2])]
    #[case(&[A, A], 1, vec![0])]
    #[case(&[A, B, B, A], 2, vec![0, 1])]
    fn test_distance_scenarios(
        #[case] stream: &[Address],
        #[case] misses: u64,
        #[case] distances: Vec<u64>,
    ) {
        let rd = run(UNBOUNDED, stream);
        let stats = rd.stats(0).unwrap();
        assert_eq!(stats.accesses(), stream.len() as u64);
        assert_eq!(stats.miss_count(), misses);
        assert_eq!(stats.sorted_distances(), distances);
    }

    #[test]
    fn test_a_b_a_per_access() {
        let mut rd = ReuseDistance::new(UNBOUNDED, 32);
        let mut seen = Vec::new();
        for a in [A, B, A] {
            rd.process(&ReuseEntry::new(0, a));
            let s = rd.stats(0).unwrap();
            seen.push((s.miss_count(), s.sorted_distances()));
        }
        assert_eq!(
            seen,
            vec![(1, vec![]), (2, vec![]), (2, vec![1])]
        );
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let rd = run(1, &[A, B, A]);
        let stats = rd.stats(0).unwrap();
        assert_eq!(stats.miss_count(), 3);
        assert_eq!(rd.active_addresses(), vec![A]);
        assert_eq!(rd.window_len(), 1);
    }

    #[test]
    fn test_capacity_keeps_recent() {
        let rd = run(2, &[A, B, C, B, A]);
        let stats = rd.stats(0).unwrap();
        // B reused at distance 1; A was evicted by C
        assert_eq!(stats.miss_count(), 4);
        assert_eq!(stats.count_distance(1), 1);
        assert_eq!(rd.active_addresses(), vec![B, A]);
    }

    #[test]
    fn test_skip_flushes_window() {
        let mut rd = run(UNBOUNDED, &[A, B]);
        rd.skip_addresses(10);
        assert!(rd.active_addresses().is_empty());
        rd.process(&ReuseEntry::new(0, A));
        assert_eq!(rd.stats(0).unwrap().miss_count(), 3);
    }

    #[test]
    fn test_stats_per_id() {
        let mut rd = ReuseDistance::new(UNBOUNDED, 32);
        rd.process(&ReuseEntry::new(1, A));
        rd.process(&ReuseEntry::new(2, B));
        rd.process(&ReuseEntry::new(2, A));
        assert_eq!(rd.indices(), vec![1, 2]);
        assert_eq!(rd.stats(1).unwrap().miss_count(), 1);
        assert_eq!(rd.stats(2).unwrap().count_distance(1), 1);
    }
}
