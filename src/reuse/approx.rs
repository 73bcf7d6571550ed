//! Approximate reuse distance in bounded memory.
//!
//! Instead of one tree node per resident address, a node stands for a run
//! of consecutive access times and is weighted by the number of addresses
//! whose last access falls in that run. Nodes are merged while the error a
//! merge introduces stays within `error_rate` of the distance to the nodes
//! after it, so the relative error of any reported distance is bounded.

use std::collections::{BTreeMap, HashMap};

use super::tree::SplayTree;
use super::{ReuseAnalyzer, ReuseEntry, ReuseStats, DEFAULT_BIN_INDIVIDUAL, UNBOUNDED};
use crate::Address;

#[derive(Debug, Clone)]
pub struct ApproxReuseDistance {
    error_rate: f64,
    bin_individual: u64,
    time: u64,
    distinct: u64,
    last_access: HashMap<Address, u64>,
    /// Keyed by the latest access time a node covers
    scale: SplayTree<()>,
    compactions: u64,
    stats: BTreeMap<u64, ReuseStats>,
}

impl ApproxReuseDistance {
    pub fn new(error_rate: f64) -> Self {
        Self::with_bins(error_rate, DEFAULT_BIN_INDIVIDUAL)
    }

    pub fn with_bins(error_rate: f64, bin_individual: u64) -> Self {
        Self {
            error_rate: error_rate.clamp(f64::EPSILON, 0.5),
            bin_individual,
            time: 1,
            distinct: 0,
            last_access: HashMap::new(),
            scale: SplayTree::new(),
            compactions: 0,
            stats: BTreeMap::new(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    /// Nodes currently in the scale tree.
    pub fn node_count(&self) -> usize {
        self.scale.len()
    }

    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    fn max_size(&self, weight_after: u64) -> u64 {
        ((weight_after as f64 * self.error_rate) as u64).max(1)
    }

    /// Node count above which the tree is compacted.
    fn compaction_limit(&self) -> f64 {
        let distinct = self.distinct.max(1) as f64;
        4.0 * distinct.ln() / (1.0 / (1.0 - self.error_rate)).ln() + 4.0
    }

    /// Estimate the distance of a reference last made at `old`, and take
    /// that reference out of the tree.
    fn query(&mut self, old: u64) -> Option<u64> {
        let key = self.scale.ceiling(old)?;
        let after = self.scale.weight_above(key);
        let weight = self.scale.weight(key)?;
        let distance = weight / 2 + after;

        let max = self.max_size(after);
        let remaining = self.scale.adjust(key, -1)?;
        if remaining == 0 {
            self.scale.remove(key);
            return Some(distance);
        }
        if remaining > max / 2 {
            return Some(distance);
        }

        let mut key = key;
        if let Some(prev) = self.scale.predecessor(key) {
            let prev_weight = self.scale.weight(prev).unwrap_or(0);
            if prev_weight + remaining <= max {
                self.scale.remove(prev);
                self.scale.adjust(key, prev_weight as i64);
            }
        }
        let remaining = self.scale.weight(key).unwrap_or(0);
        if let Some(next) = self.scale.successor(key) {
            let next_weight = self.scale.weight(next).unwrap_or(0);
            let next_max = self.max_size(after.saturating_sub(next_weight));
            if next_weight + remaining <= next_max {
                self.scale.remove(key);
                self.scale.adjust(next, remaining as i64);
                key = next;
            }
        }
        log::trace!("merged scale node 0x{:x}", key);
        Some(distance)
    }

    /// Walk from the newest node to the oldest, folding each older neighbour
    /// into the current node while the merged weight stays within bounds.
    pub fn compact(&mut self) {
        let mut nodes = self.scale.entries();
        nodes.reverse();
        let before = nodes.len();

        let mut kept: Vec<(u64, u64)> = Vec::with_capacity(nodes.len());
        let mut newer = 0u64;
        let mut iter = nodes.into_iter();
        if let Some((k, w, _)) = iter.next() {
            let mut cur = (k, w);
            for (k, w, _) in iter {
                if cur.1 + w <= self.max_size(newer) {
                    cur.1 += w;
                } else {
                    newer += cur.1;
                    kept.push(cur);
                    cur = (k, w);
                }
            }
            kept.push(cur);
        }

        self.scale.clear();
        for &(k, w) in kept.iter().rev() {
            self.scale.insert(k, (), w);
        }
        self.compactions += 1;
        log::debug!(
            "Compacted scale tree from {} to {} nodes ({} distinct addresses)",
            before,
            kept.len(),
            self.distinct
        );
    }

    fn stats_mut(&mut self, id: u64) -> &mut ReuseStats {
        let bin = self.bin_individual;
        self.stats
            .entry(id)
            .or_insert_with(|| ReuseStats::new(id, bin, UNBOUNDED))
    }
}

impl ReuseAnalyzer for ApproxReuseDistance {
    fn describe(&self) -> &'static str {
        "REUSE"
    }

    fn process(&mut self, entry: &ReuseEntry) {
        let now = self.time;
        let distance = match self.last_access.insert(entry.address, now) {
            Some(old) => self.query(old),
            None => {
                self.distinct += 1;
                None
            }
        };
        self.stats_mut(entry.id).update(distance);
        self.scale.insert(now, (), 1);
        self.time += 1;

        if self.scale.len() as f64 > self.compaction_limit() {
            self.compact();
        }
    }

    fn skip_addresses(&mut self, amount: u64) {
        self.time += amount;
        self.last_access.clear();
        self.scale.clear();
    }

    fn active_addresses(&self) -> Vec<Address> {
        let mut addrs: Vec<(u64, Address)> = self.last_access.iter().map(|(&a, &t)| (t, a)).collect();
        addrs.sort_unstable();
        addrs.into_iter().map(|(_, a)| a).collect()
    }

    fn capacity(&self) -> u64 {
        UNBOUNDED
    }

    fn bin_individual(&self) -> u64 {
        self.bin_individual
    }

    fn max_tracking(&self) -> u64 {
        UNBOUNDED
    }

    fn all_stats(&self) -> &BTreeMap<u64, ReuseStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reuse::ReuseDistance;

    fn feed(analyzer: &mut dyn ReuseAnalyzer, stream: &[Address]) {
        for &a in stream {
            analyzer.process(&ReuseEntry::new(0, a));
        }
    }

    #[test]
    fn test_small_streams_are_exact() {
        let stream = [1, 2, 3, 1, 2, 2, 4, 3, 1];
        let mut approx = ApproxReuseDistance::new(0.001);
        let mut exact = ReuseDistance::new(UNBOUNDED, DEFAULT_BIN_INDIVIDUAL);
        feed(&mut approx, &stream);
        feed(&mut exact, &stream);
        assert_eq!(approx.stats(0), exact.stats(0));
    }

    #[test]
    fn test_compaction_limit_bounds_nodes() {
        let mut approx = ApproxReuseDistance::new(0.5);
        let stream: Vec<Address> = (0..2000).map(|i| (i % 300) * 64).collect();
        feed(&mut approx, &stream);
        assert!(approx.compactions() > 0);
        assert!(approx.node_count() as f64 <= approx.compaction_limit());
        let stats = approx.stats(0).unwrap();
        assert_eq!(stats.accesses(), 2000);
        assert_eq!(stats.miss_count(), 300);
    }

    #[test]
    fn test_cyclic_distance_within_error() {
        // every reuse in a cycle over n addresses has distance n - 1
        let n = 200u64;
        let mut approx = ApproxReuseDistance::with_bins(0.1, UNBOUNDED);
        let stream: Vec<Address> = (0..n * 10).map(|i| i % n).collect();
        feed(&mut approx, &stream);
        let stats = approx.stats(0).unwrap();
        let exact = (n - 1) as f64;
        for d in stats.sorted_distances() {
            let err = (d as f64 - exact).abs() / exact;
            assert!(err <= 0.2, "distance {} too far from {}", d, exact);
        }
    }

    #[test]
    fn test_active_addresses_in_recency_order() {
        let mut approx = ApproxReuseDistance::new(0.01);
        feed(&mut approx, &[5, 6, 5]);
        assert_eq!(approx.active_addresses(), vec![6, 5]);
        approx.skip_addresses(3);
        assert!(approx.active_addresses().is_empty());
        assert_eq!(approx.node_count(), 0);
    }
}
