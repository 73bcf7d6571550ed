//! Replaying traced memory references through the analysis engines.
//!
//! Instrumented code fills a buffer of `(block, address)` pairs and hands it
//! to a [`SimulationContext`] when full. Every monitored stream (thread,
//! rank) owns its own context, so independent streams can be drained in
//! parallel with [`simulate_streams`].

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::{summary_line, ConfigError, LevelStats, MemoryHierarchy};
use crate::reuse::{
    write_stats_report, ApproxReuseDistance, ReuseAnalyzer, ReuseDistance, ReuseEntry, ReuseStats, SpatialLocality,
    DEFAULT_BIN_INDIVIDUAL, DEFAULT_SPATIAL_WINDOW, UNBOUNDED,
};
use crate::Address;

/// Entries buffered before the context drains itself.
pub const DEFAULT_BUFFER_CAPACITY: usize = 0x10000;

/// Deterministic on/off sampling over the cumulative access count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingMethod {
    /// Visits after which a block stops being simulated, 0 for never
    pub access_limit: u64,
    pub sample_on: u64,
    pub sample_off: u64,
}

impl Default for SamplingMethod {
    fn default() -> Self {
        Self {
            access_limit: 0,
            sample_on: 1,
            sample_off: 0,
        }
    }
}

impl SamplingMethod {
    pub fn new(access_limit: u64, sample_on: u64, sample_off: u64) -> Self {
        Self {
            access_limit,
            sample_on,
            sample_off,
        }
    }

    /// Whether the reference after `count` earlier ones is sampled.
    pub fn currently_sampling(&self, count: u64) -> bool {
        if self.sample_on == 0 {
            return false;
        }
        match self.sample_on.checked_add(self.sample_off) {
            Some(period) => count % period < self.sample_on,
            // a period past u64::MAX never leaves its first on window
            None => count < self.sample_on,
        }
    }

    pub fn exceeds_access_limit(&self, count: u64) -> bool {
        self.access_limit > 0 && count > self.access_limit
    }
}

/// Which engines run and how they are sized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub sampling: SamplingMethod,
    pub reuse: bool,
    /// Reuse window in addresses, 0 for unbounded
    pub reuse_capacity: u64,
    pub reuse_bin_individual: u64,
    /// Switches the reuse engine to the approximate one
    pub approx_error_rate: Option<f64>,
    pub spatial: bool,
    pub spatial_window: u64,
    pub spatial_bin_individual: u64,
    pub spatial_max_tracking: u64,
    pub buffer_capacity: usize,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingMethod::default(),
            reuse: false,
            reuse_capacity: UNBOUNDED,
            reuse_bin_individual: DEFAULT_BIN_INDIVIDUAL,
            approx_error_rate: None,
            spatial: false,
            spatial_window: DEFAULT_SPATIAL_WINDOW,
            spatial_bin_individual: DEFAULT_BIN_INDIVIDUAL,
            spatial_max_tracking: UNBOUNDED,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// One traced reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccess {
    pub block: u32,
    pub address: Address,
}

impl MemoryAccess {
    pub fn new(block: u32, address: Address) -> Self {
        Self { block, address }
    }
}

/// Counters of one instrumented block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlockCounters {
    pub visits: u64,
    pub accesses: u64,
    /// Stream accesses seen when `visits` passed the access limit
    pub saturated_at: Option<u64>,
    /// Indexed by hierarchy, then level
    pub levels: Vec<Vec<LevelStats>>,
}

impl BlockCounters {
    fn new(hierarchies: &[MemoryHierarchy]) -> Self {
        Self {
            levels: hierarchies
                .iter()
                .map(|h| vec![LevelStats::default(); h.level_count()])
                .collect(),
            ..Self::default()
        }
    }

    /// Share of the stream elapsed before this block saturated, in percent.
    pub fn saturation(&self, total: u64) -> f64 {
        match self.saturated_at {
            Some(at) if total > 0 => at as f64 * 100.0 / total as f64,
            _ => 100.0,
        }
    }
}

/// All simulation state of one stream.
pub struct SimulationContext {
    stream: u64,
    config: SimulationConfig,
    hierarchies: Vec<MemoryHierarchy>,
    reuse: Option<Box<dyn ReuseAnalyzer>>,
    spatial: Option<SpatialLocality>,
    /// Ids below the configured block count
    blocks: Vec<BlockCounters>,
    /// Ids nobody announced, kept sparse
    extra_blocks: BTreeMap<u32, BlockCounters>,
    buffer: Vec<MemoryAccess>,
    total: u64,
    sampled: u64,
    skipped: u64,
}

impl SimulationContext {
    pub fn new(stream: u64, config: SimulationConfig, hierarchies: Vec<MemoryHierarchy>, block_count: usize) -> Self {
        let hierarchies: Vec<MemoryHierarchy> = match config.seed {
            Some(seed) => hierarchies.into_iter().map(|h| h.with_seed(seed)).collect(),
            None => hierarchies,
        };
        let reuse: Option<Box<dyn ReuseAnalyzer>> = match (config.reuse, config.approx_error_rate) {
            (false, _) => None,
            (true, Some(err)) => Some(Box::new(ApproxReuseDistance::with_bins(err, config.reuse_bin_individual))),
            (true, None) => Some(Box::new(ReuseDistance::new(
                config.reuse_capacity,
                config.reuse_bin_individual,
            ))),
        };
        let spatial = config.spatial.then(|| {
            SpatialLocality::new(
                config.spatial_window,
                config.spatial_bin_individual,
                config.spatial_max_tracking,
            )
        });
        let blocks = (0..block_count).map(|_| BlockCounters::new(&hierarchies)).collect();
        Self {
            stream,
            buffer: Vec::with_capacity(config.buffer_capacity.min(DEFAULT_BUFFER_CAPACITY)),
            config,
            hierarchies,
            reuse,
            spatial,
            blocks,
            extra_blocks: BTreeMap::new(),
            total: 0,
            sampled: 0,
            skipped: 0,
        }
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn hierarchies(&self) -> &[MemoryHierarchy] {
        &self.hierarchies
    }

    /// Counters of the blocks announced at construction.
    pub fn blocks(&self) -> &[BlockCounters] {
        &self.blocks
    }

    pub fn block(&self, block: u32) -> Option<&BlockCounters> {
        self.blocks
            .get(block as usize)
            .or_else(|| self.extra_blocks.get(&block))
    }

    /// Every block with counters, announced or not, by id.
    pub fn all_blocks(&self) -> impl Iterator<Item = (u32, &BlockCounters)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(id, b)| (id as u32, b))
            .chain(self.extra_blocks.iter().map(|(&id, b)| (id, b)))
    }

    pub fn reuse(&self) -> Option<&dyn ReuseAnalyzer> {
        self.reuse.as_deref()
    }

    pub fn spatial(&self) -> Option<&SpatialLocality> {
        self.spatial.as_ref()
    }

    /// References seen, sampled or not.
    pub fn total_accesses(&self) -> u64 {
        self.total
    }

    pub fn sampled_accesses(&self) -> u64 {
        self.sampled
    }

    fn block_mut(&mut self, block: u32) -> &mut BlockCounters {
        let i = block as usize;
        if i < self.blocks.len() {
            return &mut self.blocks[i];
        }
        let hierarchies = &self.hierarchies;
        let stream = self.stream;
        self.extra_blocks.entry(block).or_insert_with(|| {
            log::debug!("stream {}: block {} is past the block table", stream, block);
            BlockCounters::new(hierarchies)
        })
    }

    /// Count one execution of `block`.
    pub fn visit_block(&mut self, block: u32) {
        let total = self.total;
        let sampling = self.config.sampling;
        let counters = self.block_mut(block);
        counters.visits += 1;
        if counters.saturated_at.is_none() && sampling.exceeds_access_limit(counters.visits) {
            counters.saturated_at = Some(total);
        }
    }

    /// Buffer one reference, draining when the buffer is full.
    pub fn record(&mut self, access: MemoryAccess) {
        self.buffer.push(access);
        if self.buffer.len() >= self.config.buffer_capacity.max(1) {
            self.drain();
        }
    }

    /// Run every buffered reference through the engines.
    pub fn drain(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        for access in &buffer {
            self.simulate(*access);
        }
        log::trace!("stream {}: drained {} references", self.stream, buffer.len());
        self.buffer = buffer;
        self.buffer.clear();
    }

    /// Record and drain a whole trace.
    pub fn process_trace(&mut self, trace: &[MemoryAccess]) {
        for &access in trace {
            self.record(access);
        }
        self.drain();
    }

    fn simulate(&mut self, access: MemoryAccess) {
        let count = self.total;
        self.total += 1;
        let sampling = self.config.sampling;
        let saturated = self.block_mut(access.block).saturated_at.is_some();
        self.block_mut(access.block).accesses += 1;
        if saturated || !sampling.currently_sampling(count) {
            self.skipped += 1;
            return;
        }
        self.sampled += 1;

        if self.skipped > 0 {
            if let Some(r) = self.reuse.as_mut() {
                r.skip_addresses(self.skipped);
            }
            if let Some(s) = self.spatial.as_mut() {
                s.skip_addresses(self.skipped);
            }
            self.skipped = 0;
        }

        let hits: Vec<Option<usize>> = self
            .hierarchies
            .iter_mut()
            .map(|h| h.process(access.address))
            .collect();
        let counters = self.block_mut(access.block);
        for (stats, hit) in counters.levels.iter_mut().zip(hits) {
            LevelStats::record(stats, hit);
        }

        let entry = ReuseEntry::new(access.block as u64, access.address);
        if let Some(r) = self.reuse.as_mut() {
            r.process(&entry);
        }
        if let Some(s) = self.spatial.as_mut() {
            s.process(&entry);
        }
    }

    /// Write the cache report: one summary line per hierarchy, a legend, and
    /// one line per block that was visited or referenced memory.
    pub fn write_cache_report(&self, out: &mut dyn Write) -> io::Result<()> {
        self.report().write_cache_text(out)
    }

    /// Write the reuse-distance report, if that engine runs.
    pub fn write_reuse_report(&self, out: &mut dyn Write, annotate: bool) -> io::Result<()> {
        match &self.reuse {
            Some(r) => r.write_report(out, annotate),
            None => Ok(()),
        }
    }

    pub fn write_spatial_report(&self, out: &mut dyn Write, annotate: bool) -> io::Result<()> {
        match &self.spatial {
            Some(s) => s.write_report(out, annotate),
            None => Ok(()),
        }
    }

    /// Snapshot of everything the context measured.
    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            stream: self.stream,
            total_accesses: self.total,
            sampled_accesses: self.sampled,
            sampling: self.config.sampling,
            hierarchies: self
                .hierarchies
                .iter()
                .map(|h| HierarchyReport {
                    sysid: h.sysid(),
                    levels: h.totals().to_vec(),
                })
                .collect(),
            blocks: self
                .all_blocks()
                .filter(|(_, b)| b.visits > 0 || b.accesses > 0)
                .map(|(id, b)| BlockReport {
                    id,
                    visits: b.visits,
                    accesses: b.accesses,
                    saturation: b.saturation(self.total),
                    levels: b.levels.clone(),
                })
                .collect(),
            reuse: self.reuse.as_deref().map(ReuseReport::of),
            spatial: self.spatial.as_ref().map(|s| ReuseReport::of(s)),
        }
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("stream", &self.stream)
            .field("hierarchies", &self.hierarchies.len())
            .field("blocks", &(self.blocks.len() + self.extra_blocks.len()))
            .field("total", &self.total)
            .field("sampled", &self.sampled)
            .finish()
    }
}

/// Drain every context against its trace, one stream per worker.
pub fn simulate_streams(contexts: &mut [SimulationContext], traces: &[Vec<MemoryAccess>]) {
    if contexts.len() != traces.len() {
        log::warn!(
            "{} simulation contexts but {} traces; extra entries are ignored",
            contexts.len(),
            traces.len()
        );
    }
    contexts
        .par_iter_mut()
        .zip(traces.par_iter())
        .for_each(|(ctx, trace)| ctx.process_trace(trace));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HierarchyReport {
    pub sysid: u32,
    pub levels: Vec<LevelStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockReport {
    pub id: u32,
    pub visits: u64,
    pub accesses: u64,
    pub saturation: f64,
    pub levels: Vec<Vec<LevelStats>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReuseReport {
    pub kind: &'static str,
    pub capacity: u64,
    pub bin_individual: u64,
    pub max_tracking: u64,
    pub stats: Vec<ReuseStats>,
}

impl ReuseReport {
    pub fn of(analyzer: &dyn ReuseAnalyzer) -> Self {
        Self {
            kind: analyzer.describe(),
            capacity: analyzer.capacity(),
            bin_individual: analyzer.bin_individual(),
            max_tracking: analyzer.max_tracking(),
            stats: analyzer.all_stats().values().cloned().collect(),
        }
    }

    pub fn write_text(&self, out: &mut dyn Write, annotate: bool) -> io::Result<()> {
        write_stats_report(
            out,
            self.kind,
            [self.capacity, self.bin_individual, self.max_tracking],
            self.stats.iter(),
            annotate,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub stream: u64,
    pub total_accesses: u64,
    pub sampled_accesses: u64,
    pub sampling: SamplingMethod,
    pub hierarchies: Vec<HierarchyReport>,
    pub blocks: Vec<BlockReport>,
    pub reuse: Option<ReuseReport>,
    pub spatial: Option<ReuseReport>,
}

impl SimulationReport {
    /// Summary lines, a column legend and one `BLK` line per block.
    pub fn write_cache_text(&self, out: &mut dyn Write) -> io::Result<()> {
        for h in &self.hierarchies {
            writeln!(out, "{}", summary_line(h.sysid, &h.levels))?;
        }
        write!(out, "# BLK\t<id>\t<visits>\t<saturation>")?;
        for h in &self.hierarchies {
            for lvl in 0..h.levels.len() {
                write!(out, "\t<sys{0}_l{1}_hits>\t<sys{0}_l{1}_misses>", h.sysid, lvl)?;
            }
        }
        writeln!(out)?;

        for b in &self.blocks {
            write!(out, "BLK\t{}\t{}\t{:.3}", b.id, b.visits, b.saturation)?;
            for level in b.levels.iter().flatten() {
                write!(out, "\t{}\t{}", level.hits, level.misses)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Cache report followed by the reuse and spatial reports that ran.
    pub fn write_text(&self, out: &mut dyn Write, annotate: bool) -> io::Result<()> {
        self.write_cache_text(out)?;
        for r in self.reuse.iter().chain(self.spatial.iter()) {
            r.write_text(out, annotate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::parse_hierarchies;
    use rstest::rstest;

    fn direct_mapped() -> Vec<MemoryHierarchy> {
        parse_hierarchies("0 1 256 1 64 dir").unwrap()
    }

    #[rstest]
    #[case(SamplingMethod::new(0, 1, 0), vec![true, true, true, true])]
    #[case(SamplingMethod::new(0, 2, 2), vec![true, true, false, false])]
    #[case(SamplingMethod::new(0, 0, 5), vec![false, false, false, false])]
    #[case(SamplingMethod::new(0, 1, 1), vec![true, false, true, false])]
    fn test_sampling_pattern(#[case] method: SamplingMethod, #[case] expected: Vec<bool>) {
        let got: Vec<bool> = (0..4).map(|c| method.currently_sampling(c)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_sampling_period_past_u64() {
        let m = SamplingMethod::new(0, u64::MAX, 1);
        assert!(m.currently_sampling(5));
        assert!(m.currently_sampling(u64::MAX - 1));
        assert!(!m.currently_sampling(u64::MAX));
        let m = SamplingMethod::new(0, 1, u64::MAX);
        assert!(m.currently_sampling(0));
        assert!(!m.currently_sampling(1));
        assert!(!m.currently_sampling(u64::MAX));
    }

    #[test]
    fn test_access_limit() {
        let m = SamplingMethod::new(3, 1, 0);
        assert!(!m.exceeds_access_limit(3));
        assert!(m.exceeds_access_limit(4));
        assert!(!SamplingMethod::default().exceeds_access_limit(u64::MAX));
    }

    #[test]
    fn test_config_from_json() {
        let config = SimulationConfig::from_json(
            r#"{"sampling": {"access_limit": 10, "sample_on": 100, "sample_off": 900},
                "reuse": true, "approx_error_rate": 0.01}"#,
        )
        .unwrap();
        assert_eq!(config.sampling, SamplingMethod::new(10, 100, 900));
        assert!(config.reuse);
        assert_eq!(config.approx_error_rate, Some(0.01));
        assert_eq!(config.spatial_window, 64);
        assert!(matches!(
            SimulationConfig::from_json("{\"reuse\": 3}"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_cache_counters_per_block() {
        let mut ctx = SimulationContext::new(0, SimulationConfig::default(), direct_mapped(), 2);
        let trace = [
            MemoryAccess::new(0, 0),
            MemoryAccess::new(1, 256),
            MemoryAccess::new(0, 0),
            MemoryAccess::new(0, 8),
        ];
        ctx.process_trace(&trace);
        assert_eq!(ctx.total_accesses(), 4);
        let b0 = &ctx.blocks()[0].levels[0][0];
        assert_eq!((b0.hits, b0.misses), (1, 2));
        let b1 = &ctx.blocks()[1].levels[0][0];
        assert_eq!((b1.hits, b1.misses), (0, 1));
        assert_eq!(ctx.hierarchies()[0].totals()[0], LevelStats { hits: 1, misses: 3 });
    }

    #[test]
    fn test_sampling_skips_and_flushes_reuse() {
        let config = SimulationConfig {
            sampling: SamplingMethod::new(0, 2, 1),
            reuse: true,
            ..SimulationConfig::default()
        };
        let mut ctx = SimulationContext::new(0, config, Vec::new(), 1);
        // the third reference is skipped, so the fourth sees an empty window
        let trace: Vec<MemoryAccess> = [0x10, 0x20, 0x30, 0x10]
            .iter()
            .map(|&a| MemoryAccess::new(0, a))
            .collect();
        ctx.process_trace(&trace);
        assert_eq!(ctx.sampled_accesses(), 3);
        let stats = ctx.reuse().unwrap().stats(0).unwrap();
        assert_eq!(stats.accesses(), 3);
        assert_eq!(stats.miss_count(), 3);
    }

    #[test]
    fn test_saturation() {
        let config = SimulationConfig {
            sampling: SamplingMethod::new(1, 1, 0),
            ..SimulationConfig::default()
        };
        let mut ctx = SimulationContext::new(0, config, direct_mapped(), 2);
        ctx.visit_block(0);
        ctx.process_trace(&[MemoryAccess::new(0, 0), MemoryAccess::new(1, 64)]);
        // second visit passes the limit after two of four references
        ctx.visit_block(0);
        ctx.process_trace(&[MemoryAccess::new(0, 0), MemoryAccess::new(1, 64)]);
        let b0 = &ctx.blocks()[0];
        assert_eq!(b0.saturated_at, Some(2));
        assert_eq!(b0.accesses, 2);
        assert_eq!(b0.levels[0][0].accesses(), 1);
        assert!((b0.saturation(ctx.total_accesses()) - 50.0).abs() < 1e-9);
        assert_eq!(ctx.blocks()[1].saturation(4), 100.0);
    }

    #[test]
    fn test_cache_report_layout() {
        let mut ctx = SimulationContext::new(0, SimulationConfig::default(), direct_mapped(), 3);
        ctx.visit_block(2);
        ctx.process_trace(&[MemoryAccess::new(2, 0), MemoryAccess::new(2, 256), MemoryAccess::new(2, 0)]);
        let mut out = Vec::new();
        ctx.write_cache_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# sysid0 l0[0/3(0.000)]");
        assert!(lines[1].starts_with("# BLK\t<id>"));
        assert_eq!(lines[2], "BLK\t2\t1\t100.000\t0\t3");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_unannounced_block_ids_stay_sparse() {
        let mut ctx = SimulationContext::new(0, SimulationConfig::default(), direct_mapped(), 2);
        ctx.visit_block(20_000_000);
        ctx.process_trace(&[MemoryAccess::new(u32::MAX, 0), MemoryAccess::new(1, 256)]);
        assert_eq!(ctx.blocks().len(), 2);
        assert_eq!(ctx.block(20_000_000).unwrap().visits, 1);
        assert_eq!(ctx.block(u32::MAX).unwrap().levels[0][0].misses, 1);
        assert!(ctx.block(7).is_none());

        let ids: Vec<u32> = ctx.report().blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 20_000_000, u32::MAX]);
    }

    #[test]
    fn test_streams_in_parallel() {
        let mut contexts: Vec<SimulationContext> = (0..4)
            .map(|s| SimulationContext::new(s, SimulationConfig::default(), direct_mapped(), 1))
            .collect();
        let traces: Vec<Vec<MemoryAccess>> = (0..4u64)
            .map(|s| (0..=s).map(|i| MemoryAccess::new(0, i * 256)).collect())
            .collect();
        simulate_streams(&mut contexts, &traces);
        for (s, ctx) in contexts.iter().enumerate() {
            assert_eq!(ctx.stream(), s as u64);
            assert_eq!(ctx.total_accesses(), s as u64 + 1);
        }
    }

    #[test]
    fn test_report_snapshot() {
        let config = SimulationConfig {
            reuse: true,
            spatial: true,
            ..SimulationConfig::default()
        };
        let mut ctx = SimulationContext::new(5, config, direct_mapped(), 1);
        ctx.process_trace(&[MemoryAccess::new(0, 0x40), MemoryAccess::new(0, 0x40)]);
        let report = ctx.report();
        assert_eq!(report.stream, 5);
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.reuse.as_ref().unwrap().kind, "REUSE");
        assert_eq!(report.spatial.as_ref().unwrap().kind, "SPATIAL");
        assert_eq!(report.hierarchies[0].levels[0], LevelStats { hits: 1, misses: 1 });

        let mut live = Vec::new();
        ctx.write_cache_report(&mut live).unwrap();
        ctx.write_reuse_report(&mut live, true).unwrap();
        ctx.write_spatial_report(&mut live, true).unwrap();
        let mut snapshot = Vec::new();
        report.write_text(&mut snapshot, true).unwrap();
        assert_eq!(live, snapshot);
        let text = String::from_utf8(snapshot).unwrap();
        assert!(text.contains("REUSESTATS\t0\t32\t0\t1\t2\t1\n"));
        assert!(text.contains("\tSPATIALID\t0\t2\t1\n"));
    }
}
