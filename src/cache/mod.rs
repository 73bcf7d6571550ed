//! N-way set-associative cache simulation.
//!
//! A [`MemoryHierarchy`] is an ordered list of [`CacheLevel`]s. An address
//! walks down the levels until one of them holds its line. Inclusive levels
//! simply fill on a miss. Victim levels (a suffix of the hierarchy) hold
//! lines evicted from the level above them: a hit in a victim level moves
//! the line back to the first victim level and every displaced line rotates
//! one level down.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

pub mod config;

pub use config::{parse_hierarchies, ConfigError};

/// Levels at least this associative look lines up through a per-set map.
pub const HIGH_ASSOCIATIVITY: u32 = 256;

/// Seed of the random replacement generator unless one is given.
pub const DEFAULT_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
pub enum ReplacementPolicy {
    /// Exact least-recently-used order
    TrueLru,
    /// Replace the line after the most recently used one
    Nmru,
    Random,
    /// Always the first line of the set
    Direct,
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplacementPolicy::TrueLru => write!(f, "truelru"),
            ReplacementPolicy::Nmru => write!(f, "nmru"),
            ReplacementPolicy::Random => write!(f, "random"),
            ReplacementPolicy::Direct => write!(f, "direct"),
        }
    }
}

impl FromStr for ReplacementPolicy {
    type Err = String;

    /// Accepts the cache description tokens as well as the display names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        let s = s.strip_suffix("_vc").unwrap_or(&s);
        if s.starts_with("trulru") || s.starts_with("truelru") {
            Ok(ReplacementPolicy::TrueLru)
        } else if s.starts_with("lru") || s.starts_with("nmru") {
            Ok(ReplacementPolicy::Nmru)
        } else if s.starts_with("rand") {
            Ok(ReplacementPolicy::Random)
        } else if s.starts_with("dir") {
            Ok(ReplacementPolicy::Direct)
        } else {
            Err(format!("Unknown replacement policy: {}", s))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheKind {
    Inclusive,
    Victim,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Inclusive => write!(f, "inclusive"),
            CacheKind::Victim => write!(f, "victim"),
        }
    }
}

/// Hit and miss counts of one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    pub hits: u64,
    pub misses: u64,
}

impl LevelStats {
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit percentage, zero when there were no accesses.
    pub fn hit_rate(&self) -> f64 {
        if self.accesses() == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / self.accesses() as f64
        }
    }

    /// Count one access satisfied at level `hit` (`None` for memory). Every
    /// level before it missed.
    pub fn record(stats: &mut [LevelStats], hit: Option<usize>) {
        let reached = hit.map_or(stats.len(), |h| h + 1).min(stats.len());
        for (i, s) in stats.iter_mut().enumerate().take(reached) {
            if Some(i) == hit {
                s.hits += 1;
            } else {
                s.misses += 1;
            }
        }
    }
}

/// Neighbours of a line in the circular recency list of its set.
#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone)]
pub struct CacheLevel {
    level: usize,
    size: u32,
    associativity: u32,
    line_size: u32,
    policy: ReplacementPolicy,
    kind: CacheKind,
    sets: u32,
    line_bits: u32,
    /// `sets * associativity` resident line tags
    contents: Vec<Option<u64>>,
    /// Per set: the most recent line (nmru) or the next victim (truelru)
    recent: Vec<u32>,
    history: Vec<Link>,
    fast: Option<Vec<HashMap<u64, u32>>>,
    rng: StdRng,
}

impl CacheLevel {
    /// `size` and `line_size` in bytes. `line_size` must be a power of two
    /// and `size` a multiple of `line_size * associativity`.
    pub fn new(
        level: usize,
        size: u32,
        associativity: u32,
        line_size: u32,
        policy: ReplacementPolicy,
        kind: CacheKind,
    ) -> Self {
        let associativity = associativity.max(1);
        let line_size = line_size.max(1);
        let sets = (size / (line_size * associativity)).max(1);
        let ways = associativity as usize;

        let mut history = Vec::new();
        if policy == ReplacementPolicy::TrueLru {
            history.reserve(sets as usize * ways);
            for _ in 0..sets {
                for a in 0..associativity {
                    history.push(Link {
                        prev: (a + associativity - 1) % associativity,
                        next: (a + 1) % associativity,
                    });
                }
            }
        }
        let fast = (associativity >= HIGH_ASSOCIATIVITY)
            .then(|| (0..sets).map(|_| HashMap::new()).collect());

        Self {
            level,
            size,
            associativity,
            line_size,
            policy,
            kind,
            sets,
            line_bits: line_size.trailing_zeros(),
            contents: vec![None; sets as usize * ways],
            recent: vec![0; sets as usize],
            history,
            fast,
            rng: StdRng::seed_from_u64(DEFAULT_SEED ^ level as u64),
        }
    }

    /// Reseed the random replacement generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed ^ self.level as u64);
        self
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn associativity(&self) -> u32 {
        self.associativity
    }

    pub fn line_size(&self) -> u32 {
        self.line_size
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn set_count(&self) -> u32 {
        self.sets
    }

    /// Line tag of `address`.
    pub fn line_of(&self, address: u64) -> u64 {
        address >> self.line_bits
    }

    pub fn set_of(&self, line: u64) -> u32 {
        (line % self.sets as u64) as u32
    }

    fn slot(&self, set: u32, way: u32) -> usize {
        (set * self.associativity + way) as usize
    }

    /// Set of `line` and, when resident, its way.
    pub fn search(&self, line: u64) -> (u32, Option<u32>) {
        let set = self.set_of(line);
        let way = match &self.fast {
            Some(maps) => maps[set as usize].get(&line).copied(),
            None => (0..self.associativity).find(|&w| self.contents[self.slot(set, w)] == Some(line)),
        };
        (set, way)
    }

    pub fn line_to_replace(&mut self, set: u32) -> u32 {
        match self.policy {
            ReplacementPolicy::Nmru => (self.recent[set as usize] + 1) % self.associativity,
            ReplacementPolicy::TrueLru => self.recent[set as usize],
            ReplacementPolicy::Random => self.rng.gen_range(0..self.associativity),
            ReplacementPolicy::Direct => 0,
        }
    }

    fn link(&mut self, set: u32, way: u32) -> &mut Link {
        let i = self.slot(set, way);
        &mut self.history[i]
    }

    pub fn mark_used(&mut self, set: u32, way: u32) {
        match self.policy {
            ReplacementPolicy::Nmru => self.recent[set as usize] = way,
            ReplacementPolicy::TrueLru => {
                let head = self.recent[set as usize];
                if head == way {
                    // the oldest line becomes the newest by advancing the head
                    self.recent[set as usize] = self.link(set, way).next;
                    return;
                }
                let Link { prev, next } = *self.link(set, way);
                self.link(set, next).prev = prev;
                self.link(set, prev).next = next;

                let before_head = self.link(set, head).prev;
                *self.link(set, way) = Link {
                    prev: before_head,
                    next: head,
                };
                self.link(set, head).prev = way;
                self.link(set, before_head).next = way;
            }
            ReplacementPolicy::Random | ReplacementPolicy::Direct => {}
        }
    }

    /// Store `line` (or nothing) in a way of `set`, returning what was there.
    pub fn replace(&mut self, line: Option<u64>, set: u32, way: u32) -> Option<u64> {
        let slot = self.slot(set, way);
        let prev = std::mem::replace(&mut self.contents[slot], line);
        if let Some(maps) = self.fast.as_mut() {
            let map = &mut maps[set as usize];
            if let Some(p) = prev {
                map.remove(&p);
            }
            if let Some(l) = line {
                map.insert(l, way);
            }
        }
        if line.is_some() {
            self.mark_used(set, way);
        }
        prev
    }

    /// Lines currently resident.
    pub fn resident_lines(&self) -> usize {
        self.contents.iter().filter(|c| c.is_some()).count()
    }

    pub fn describe(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.level, self.size, self.associativity, self.line_size, self.policy, self.kind
        )
    }
}

/// A line in flight between victim levels.
#[derive(Debug, Clone, Copy)]
struct Eviction {
    /// Level the rotation ends at
    level: usize,
    line: Option<u64>,
    set: u32,
    way: u32,
}

#[derive(Debug, Clone)]
pub struct MemoryHierarchy {
    sysid: u32,
    levels: Vec<CacheLevel>,
    first_victim: Option<usize>,
    totals: Vec<LevelStats>,
}

impl MemoryHierarchy {
    /// Levels in order, starting at level 0. Every level from the first
    /// victim level on is treated as a victim level.
    pub fn new(sysid: u32, levels: Vec<CacheLevel>) -> Self {
        let first_victim = levels.iter().position(|l| l.kind() == CacheKind::Victim);
        let totals = vec![LevelStats::default(); levels.len()];
        Self {
            sysid,
            levels,
            first_victim,
            totals,
        }
    }

    /// Reseed the random replacement of every level.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.levels = self.levels.into_iter().map(|l| l.with_seed(seed)).collect();
        self
    }

    pub fn sysid(&self) -> u32 {
        self.sysid
    }

    pub fn levels(&self) -> &[CacheLevel] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Totals per level since creation.
    pub fn totals(&self) -> &[LevelStats] {
        &self.totals
    }

    /// Structural problems of the hierarchy, empty when it is sound.
    pub fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.levels.is_empty() {
            problems.push(format!("sysid {} has no levels", self.sysid));
        }
        if let Some(first) = self.first_victim {
            let sets = self.levels[first].set_count();
            for l in &self.levels[first..] {
                if l.kind() != CacheKind::Victim {
                    problems.push(format!(
                        "sysid {} level {} follows a victim level but is not one",
                        self.sysid,
                        l.level()
                    ));
                }
                if l.set_count() != sets {
                    problems.push(format!(
                        "sysid {} has victim levels with different set counts",
                        self.sysid
                    ));
                }
            }
        }
        problems
    }

    /// Simulate one reference. Returns the level that held the line, or
    /// `None` when it came from memory.
    pub fn process(&mut self, address: u64) -> Option<usize> {
        let hit = self.lookup(address);
        LevelStats::record(&mut self.totals, hit);
        hit
    }

    fn lookup(&mut self, address: u64) -> Option<usize> {
        let count = self.levels.len();
        let first_victim = self.first_victim.unwrap_or(count);

        for i in 0..first_victim {
            let level = &mut self.levels[i];
            let line = level.line_of(address);
            let (set, way) = level.search(line);
            if let Some(way) = way {
                level.mark_used(set, way);
                return Some(i);
            }
            let victim = level.line_to_replace(set);
            level.replace(Some(line), set, victim);
        }
        if first_victim == count {
            return None;
        }

        let mut hit = None;
        let mut eviction = Eviction {
            level: count,
            line: None,
            set: 0,
            way: 0,
        };
        for i in first_victim..count {
            let level = &mut self.levels[i];
            let line = level.line_of(address);
            let (set, way) = level.search(line);
            if let Some(way) = way {
                level.mark_used(set, way);
                hit = Some(i);
                eviction = Eviction {
                    level: i,
                    line: Some(line),
                    set,
                    way,
                };
                break;
            }
        }
        if hit == Some(first_victim) {
            return hit;
        }
        if hit.is_none() {
            eviction.line = Some(self.levels[first_victim].line_of(address));
        }
        self.rotate(first_victim, eviction);
        hit
    }

    /// Push the line in flight into `from` and every displaced line one level
    /// further, until the level the rotation ends at takes the last of them.
    fn rotate(&mut self, from: usize, mut e: Eviction) {
        let end = e.level;
        for i in from..self.levels.len() {
            let level = &mut self.levels[i];
            if i == end {
                let way = match e.line {
                    Some(line) if level.set_of(line) != e.set => level.line_to_replace(level.set_of(line)),
                    _ => e.way,
                };
                let set = e.line.map_or(e.set, |l| level.set_of(l));
                level.replace(e.line, set, way);
                return;
            }
            if let Some(line) = e.line {
                let set = level.set_of(line);
                let way = level.line_to_replace(set);
                e.line = level.replace(Some(line), set, way);
            }
        }
    }

    /// Summary line of the cache report.
    pub fn summary(&self) -> String {
        summary_line(self.sysid, &self.totals)
    }
}

/// `# sysid{n}` followed by ` l{lvl}[{hits}/{accesses}({hit%})]` per level.
pub fn summary_line(sysid: u32, totals: &[LevelStats]) -> String {
    let mut s = format!("# sysid{}", sysid);
    for (lvl, t) in totals.iter().enumerate() {
        s.push_str(&format!(" l{}[{}/{}({:.3})]", lvl, t.hits, t.accesses(), t.hit_rate()));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn single(size: u32, assoc: u32, policy: ReplacementPolicy) -> MemoryHierarchy {
        MemoryHierarchy::new(0, vec![CacheLevel::new(0, size, assoc, 64, policy, CacheKind::Inclusive)])
    }

    fn outcomes(h: &mut MemoryHierarchy, stream: &[u64]) -> Vec<bool> {
        stream.iter().map(|&a| h.process(a).is_some()).collect()
    }

    #[test]
    fn test_direct_mapped_conflict() {
        // 4 sets of 64-byte lines: 0 and 256 share set 0
        let mut h = single(256, 1, ReplacementPolicy::Direct);
        assert_eq!(h.levels()[0].set_count(), 4);
        assert_eq!(outcomes(&mut h, &[0, 256, 0]), vec![false, false, false]);
    }

    #[rstest]
    #[case(ReplacementPolicy::Nmru)]
    #[case(ReplacementPolicy::TrueLru)]
    fn test_two_way_keeps_both(#[case] policy: ReplacementPolicy) {
        let mut h = single(512, 2, policy);
        let (x, y) = (0x0, 0x100);
        assert_eq!(h.levels()[0].set_of(h.levels()[0].line_of(x)), h.levels()[0].set_of(h.levels()[0].line_of(y)));
        assert_eq!(outcomes(&mut h, &[x, y, x, y]), vec![false, false, true, true]);
        assert_eq!(h.totals()[0], LevelStats { hits: 2, misses: 2 });
    }

    #[test]
    fn test_true_lru_evicts_oldest() {
        // one set, four ways
        let mut h = single(256, 4, ReplacementPolicy::TrueLru);
        let lines: Vec<u64> = (0..5).map(|i| i * 64).collect();
        outcomes(&mut h, &lines[..4]);
        // touch 0 so 64 becomes the oldest
        assert_eq!(outcomes(&mut h, &[0]), vec![true]);
        assert_eq!(outcomes(&mut h, &[lines[4]]), vec![false]);
        assert_eq!(outcomes(&mut h, &[0, 128, 192, 256, 64]), vec![true, true, true, true, false]);
    }

    #[test]
    fn test_nmru_replaces_after_recent() {
        let mut h = single(192, 3, ReplacementPolicy::Nmru);
        // fills ways 1, 2, 0
        outcomes(&mut h, &[0, 64, 128]);
        // most recent is way 0 (address 128), so way 1 (address 0) goes
        assert_eq!(outcomes(&mut h, &[192, 64, 0]), vec![false, true, false]);
    }

    #[test]
    fn test_random_is_reproducible() {
        let stream: Vec<u64> = (0..400).map(|i| (i * 7 % 23) * 64).collect();
        let mut a = single(1024, 4, ReplacementPolicy::Random);
        let mut b = single(1024, 4, ReplacementPolicy::Random);
        assert_eq!(outcomes(&mut a, &stream), outcomes(&mut b, &stream));
    }

    #[test]
    fn test_high_associativity_lookup() {
        let mut h = single(256 * 64, 256, ReplacementPolicy::TrueLru);
        let stream: Vec<u64> = (0..256).map(|i| i * 64).collect();
        assert!(outcomes(&mut h, &stream).iter().all(|&hit| !hit));
        assert!(outcomes(&mut h, &stream).iter().all(|&hit| hit));
        assert_eq!(h.levels()[0].resident_lines(), 256);
    }

    #[test]
    fn test_inclusive_two_levels() {
        let mut h = MemoryHierarchy::new(
            1,
            vec![
                CacheLevel::new(0, 64, 1, 64, ReplacementPolicy::Direct, CacheKind::Inclusive),
                CacheLevel::new(1, 256, 4, 64, ReplacementPolicy::TrueLru, CacheKind::Inclusive),
            ],
        );
        assert_eq!(h.process(0), None);
        assert_eq!(h.process(64), None);
        assert_eq!(h.process(0), Some(1));
        assert_eq!(h.process(0), Some(0));
        assert_eq!(h.totals()[0], LevelStats { hits: 1, misses: 3 });
        assert_eq!(h.totals()[1], LevelStats { hits: 1, misses: 2 });
        assert_eq!(h.summary(), "# sysid1 l0[1/4(25.000)] l1[1/3(33.333)]");
    }

    #[test]
    fn test_victim_level_holds_evicted_lines() {
        // direct-mapped L1 of one line backed by a 2-line victim cache
        let mut h = MemoryHierarchy::new(
            0,
            vec![
                CacheLevel::new(0, 64, 1, 64, ReplacementPolicy::Direct, CacheKind::Victim),
                CacheLevel::new(1, 128, 2, 64, ReplacementPolicy::TrueLru, CacheKind::Victim),
            ],
        );
        assert!(h.verify().is_empty());
        assert_eq!(h.process(0), None);
        assert_eq!(h.process(64), None);
        // 0 was pushed into the victim level
        assert_eq!(h.process(0), Some(1));
        // and swapped back into L1, sending 64 down
        assert_eq!(h.process(0), Some(0));
        assert_eq!(h.process(64), Some(1));
        assert_eq!(h.levels()[0].resident_lines() + h.levels()[1].resident_lines(), 2);
    }

    #[test]
    fn test_verify_reports_inclusive_after_victim() {
        let h = MemoryHierarchy::new(
            0,
            vec![
                CacheLevel::new(0, 64, 1, 64, ReplacementPolicy::Direct, CacheKind::Victim),
                CacheLevel::new(1, 4096, 4, 64, ReplacementPolicy::Nmru, CacheKind::Inclusive),
            ],
        );
        let problems = h.verify();
        assert!(problems.iter().any(|p| p.contains("not one")));
        assert!(problems.iter().any(|p| p.contains("different set counts")));
    }

    #[rstest]
    #[case("lru", ReplacementPolicy::Nmru)]
    #[case("trulru", ReplacementPolicy::TrueLru)]
    #[case("rand_vc", ReplacementPolicy::Random)]
    #[case("dir", ReplacementPolicy::Direct)]
    #[case("truelru", ReplacementPolicy::TrueLru)]
    fn test_policy_tokens(#[case] token: &str, #[case] expected: ReplacementPolicy) {
        assert_eq!(token.parse::<ReplacementPolicy>().unwrap(), expected);
    }
}
