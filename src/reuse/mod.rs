//! Online reuse-distance and spatial-locality analysis of address streams.
//!
//! Every analyzer consumes [`ReuseEntry`] values one at a time and keeps a
//! [`ReuseStats`] histogram per entry id. Capacities and thresholds use
//! [`UNBOUNDED`] (zero) for "no limit".

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::Address;

mod approx;
mod exact;
mod spatial;
pub mod tree;

pub use approx::ApproxReuseDistance;
pub use exact::ReuseDistance;
pub use spatial::{SpatialLocality, DEFAULT_SPATIAL_WINDOW};

/// Capacity or threshold value meaning "no limit".
pub const UNBOUNDED: u64 = 0;

/// Distances up to this value are counted individually unless configured.
pub const DEFAULT_BIN_INDIVIDUAL: u64 = 32;

/// One observed memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReuseEntry {
    pub id: u64,
    pub address: Address,
}

impl ReuseEntry {
    pub fn new(id: u64, address: Address) -> Self {
        Self { id, address }
    }
}

/// Distance histogram of one id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReuseStats {
    id: u64,
    bin_individual: u64,
    max_tracking: u64,
    accesses: u64,
    misses: u64,
    bins: BTreeMap<u64, u64>,
}

impl ReuseStats {
    pub fn new(id: u64, bin_individual: u64, max_tracking: u64) -> Self {
        Self {
            id,
            bin_individual,
            max_tracking,
            accesses: 0,
            misses: 0,
            bins: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Histogram bin for `distance`, or `None` when it counts as a miss.
    pub fn bin(&self, distance: u64) -> Option<u64> {
        if self.max_tracking != UNBOUNDED && distance > self.max_tracking {
            None
        } else if self.bin_individual != UNBOUNDED && distance > self.bin_individual {
            Some(distance.checked_next_power_of_two().unwrap_or(u64::MAX))
        } else {
            Some(distance)
        }
    }

    /// Record one access; `None` is a cold reference.
    pub fn update(&mut self, distance: Option<u64>) {
        self.accesses += 1;
        match distance.and_then(|d| self.bin(d)) {
            Some(bin) => *self.bins.entry(bin).or_insert(0) += 1,
            None => self.misses += 1,
        }
    }

    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    pub fn miss_count(&self) -> u64 {
        self.misses
    }

    /// Largest bin holding any access.
    pub fn maximum_distance(&self) -> u64 {
        self.bins.keys().next_back().copied().unwrap_or(0)
    }

    /// Accesses that landed in bin `distance`.
    pub fn count_distance(&self, distance: u64) -> u64 {
        self.bins.get(&distance).copied().unwrap_or(0)
    }

    pub fn sorted_distances(&self) -> Vec<u64> {
        self.bins.keys().copied().collect()
    }

    /// Lower bound of the distances collected in `bin`.
    fn lower_bound(&self, bin: u64) -> u64 {
        if self.bin_individual == UNBOUNDED || bin <= self.bin_individual {
            bin
        } else {
            bin / 2 + 1
        }
    }

    /// `(lower, upper, count)` for every non-empty bin.
    pub fn histogram(&self) -> Vec<(u64, u64, u64)> {
        self.bins
            .iter()
            .filter(|&(_, &c)| c > 0)
            .map(|(&b, &c)| (self.lower_bound(b), b, c))
            .collect()
    }

    pub fn write_bins(&self, out: &mut dyn Write) -> io::Result<()> {
        for (lower, upper, count) in self.histogram() {
            writeln!(out, "\t\t{}\t{}\t{}", lower, upper, count)?;
        }
        Ok(())
    }
}

/// Common surface of the stream analyzers.
pub trait ReuseAnalyzer: Send {
    /// Report tag, `REUSE` or `SPATIAL`.
    fn describe(&self) -> &'static str;

    fn process(&mut self, entry: &ReuseEntry);

    fn process_batch(&mut self, entries: &[ReuseEntry]) {
        for e in entries {
            self.process(e);
        }
    }

    /// Account for `amount` references that were not observed. The window
    /// is flushed.
    fn skip_addresses(&mut self, amount: u64);

    /// Addresses currently held in the window.
    fn active_addresses(&self) -> Vec<Address>;

    fn capacity(&self) -> u64;

    fn bin_individual(&self) -> u64;

    fn max_tracking(&self) -> u64;

    /// Per-id statistics, keyed by id.
    fn all_stats(&self) -> &BTreeMap<u64, ReuseStats>;

    fn stats(&self, id: u64) -> Option<&ReuseStats> {
        self.all_stats().get(&id)
    }

    fn indices(&self) -> Vec<u64> {
        self.all_stats().keys().copied().collect()
    }

    /// Write the tab separated report; `annotate` adds a column legend.
    fn write_report(&self, out: &mut dyn Write, annotate: bool) -> io::Result<()> {
        write_stats_report(
            out,
            self.describe(),
            [self.capacity(), self.bin_individual(), self.max_tracking()],
            self.all_stats().values(),
            annotate,
        )
    }
}

/// Tab separated layout shared by live analyzers and report snapshots.
/// `limits` holds the capacity, individual-bin and max-tracking settings.
pub fn write_stats_report<'a, I>(
    out: &mut dyn Write,
    tag: &str,
    limits: [u64; 3],
    stats: I,
    annotate: bool,
) -> io::Result<()>
where
    I: Iterator<Item = &'a ReuseStats> + Clone,
{
    let ids = stats.clone().count();
    let total: u64 = stats.clone().map(|s| s.accesses()).sum();
    let misses: u64 = stats.clone().map(|s| s.miss_count()).sum();

    if annotate {
        writeln!(
            out,
            "# {}STATS\t<window_size>\t<bin_indiv>\t<max_track>\t<id_count>\t<tot_access>\t<tot_miss>",
            tag
        )?;
        writeln!(out, "# \t{}ID\t<id>\t<id_access>\t<id_miss>", tag)?;
        writeln!(out, "# \t\t<bin_lower_bound>\t<bin_upper_bound>\t<bin_count>")?;
    }
    writeln!(
        out,
        "{}STATS\t{}\t{}\t{}\t{}\t{}\t{}",
        tag, limits[0], limits[1], limits[2], ids, total, misses
    )?;
    for s in stats {
        writeln!(out, "\t{}ID\t{}\t{}\t{}", tag, s.id(), s.accesses(), s.miss_count())?;
        s.write_bins(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, Some(0))]
    #[case(4, Some(4))]
    #[case(5, Some(8))]
    #[case(8, Some(8))]
    #[case(9, Some(16))]
    #[case(100, Some(128))]
    #[case(1000, None)]
    fn test_binning(#[case] distance: u64, #[case] expected: Option<u64>) {
        let stats = ReuseStats::new(0, 4, 512);
        assert_eq!(stats.bin(distance), expected);
    }

    #[test]
    fn test_unbounded_bins() {
        let stats = ReuseStats::new(0, UNBOUNDED, UNBOUNDED);
        assert_eq!(stats.bin(1 << 40), Some(1 << 40));
    }

    #[test]
    fn test_stats_queries() {
        let mut stats = ReuseStats::new(3, 2, UNBOUNDED);
        for d in [None, Some(1), Some(1), Some(3), Some(4), None] {
            stats.update(d);
        }
        assert_eq!(stats.accesses(), 6);
        assert_eq!(stats.miss_count(), 2);
        assert_eq!(stats.count_distance(1), 2);
        assert_eq!(stats.count_distance(4), 2);
        assert_eq!(stats.count_distance(3), 0);
        assert_eq!(stats.sorted_distances(), vec![1, 4]);
        assert_eq!(stats.maximum_distance(), 4);
        assert_eq!(stats.histogram(), vec![(1, 1, 2), (3, 4, 2)]);
    }

    #[test]
    fn test_report_layout() {
        let mut rd = ReuseDistance::new(8, 4);
        for a in [0x10, 0x20, 0x10] {
            rd.process(&ReuseEntry::new(7, a));
        }
        let mut out = Vec::new();
        rd.write_report(&mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "REUSESTATS\t8\t4\t8\t1\t3\t2");
        assert_eq!(lines[1], "\tREUSEID\t7\t3\t2");
        assert_eq!(lines[2], "\t\t1\t1\t1");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_annotated_report() {
        let sl = SpatialLocality::new(4, 4, 64);
        let mut out = Vec::new();
        sl.write_report(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# SPATIALSTATS\t<window_size>"));
        assert!(text.contains("\nSPATIALSTATS\t4\t4\t64\t0\t0\t0\n"));
    }
}
