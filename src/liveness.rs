//! Register and flag liveness over a function's flow graph.
//!
//! Sets are [`RegSet`]s covering the 16 general-purpose registers and the
//! nine tracked flags. Blocks that leave the function other than through a
//! return are treated as if everything were live afterwards; a return's own
//! use set already carries the values the caller may read.

use std::collections::BTreeMap;

use crate::cfg::{FlowGraph, Loop};
use crate::insn::{Gpr, RegSet};
use crate::instrument::Location;
use crate::Address;

/// Per-instruction live-in and live-out sets, in flow-graph order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    addresses: Vec<Address>,
    live_in: Vec<RegSet>,
    live_out: Vec<RegSet>,
    index: BTreeMap<Address, usize>,
    iterations: usize,
}

impl Liveness {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Passes needed to reach the fixpoint.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn live_in(&self, addr: Address) -> Option<RegSet> {
        self.index.get(&addr).map(|&i| self.live_in[i])
    }

    pub fn live_out(&self, addr: Address) -> Option<RegSet> {
        self.index.get(&addr).map(|&i| self.live_out[i])
    }

    /// Live set seen by code inserted at `location` relative to `addr`.
    pub fn live_at(&self, addr: Address, location: Location) -> Option<RegSet> {
        match location {
            Location::Before | Location::Replace => self.live_in(addr),
            Location::After => self.live_out(addr),
        }
    }

    /// What inserted code defining `inserted_defs` must preserve.
    /// Unknown addresses are treated as having everything live.
    pub fn protect_set(&self, addr: Address, location: Location, inserted_defs: RegSet) -> RegSet {
        self.live_at(addr, location).unwrap_or_else(RegSet::all) & inserted_defs
    }

    /// `(address, live_in, live_out)` for every instruction.
    pub fn iter(&self) -> impl Iterator<Item = (Address, RegSet, RegSet)> + '_ {
        self.addresses
            .iter()
            .zip(self.live_in.iter().zip(self.live_out.iter()))
            .map(|(&a, (&i, &o))| (a, i, o))
    }
}

/// Backward dataflow to a fixpoint.
pub struct LivenessAnalyzer;

impl LivenessAnalyzer {
    pub fn analyze(graph: &FlowGraph) -> Liveness {
        let insns: Vec<_> = graph.instructions().collect();
        let n = insns.len();

        let mut first = vec![0usize; graph.blocks().len()];
        let mut at = 0;
        for block in graph.blocks() {
            first[block.index.index()] = at;
            at += block.instructions.len();
        }

        // successor indices, and the boundary value for blocks that leave
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut boundary = vec![RegSet::EMPTY; n];
        for block in graph.blocks() {
            let start = first[block.index.index()];
            let len = block.instructions.len();
            for k in 0..len.saturating_sub(1) {
                succs[start + k].push(start + k + 1);
            }
            if len == 0 {
                continue;
            }
            let last = start + len - 1;
            for s in &block.succs {
                succs[last].push(first[s.index()]);
            }
            let returns = block.exit_instruction().map(|i| i.is_return()).unwrap_or(false);
            if !returns && (block.flags.exit || block.succs.is_empty()) {
                boundary[last] = RegSet::all();
            }
        }

        let mut live_in = vec![RegSet::EMPTY; n];
        let mut live_out = boundary.clone();
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut changed = false;
            for i in (0..n).rev() {
                let out = succs[i]
                    .iter()
                    .fold(boundary[i], |acc, &s| acc | live_in[s]);
                let inn = insns[i].uses | (out - insns[i].defs);
                if out != live_out[i] || inn != live_in[i] {
                    live_out[i] = out;
                    live_in[i] = inn;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        log::debug!(
            "Liveness for 0x{:x}: {} instructions, {} passes",
            graph.base(),
            n,
            iterations
        );

        let addresses: Vec<Address> = insns.iter().map(|i| i.address).collect();
        let mut index = BTreeMap::new();
        for (i, &a) in addresses.iter().enumerate() {
            index.entry(a).or_insert(i);
        }
        Liveness {
            addresses,
            live_in,
            live_out,
            index,
            iterations,
        }
    }
}

/// For each instruction of `lp` that defines a general-purpose register
/// other than the stack pointer, the number of instructions to the nearest
/// later use of a value it defined. The walk follows the loop body in
/// address order and wraps from its last instruction to its first.
/// Definitions overwritten before any use are left out.
pub fn def_use_distances(graph: &FlowGraph, lp: &Loop) -> BTreeMap<Address, usize> {
    let body: Vec<_> = lp
        .blocks
        .iter()
        .flat_map(|&id| graph.block(id).instructions.iter())
        .collect();
    let len = body.len();
    let mut out = BTreeMap::new();

    for (p, insn) in body.iter().enumerate() {
        let mut pending = insn.defs.gprs_only();
        pending.remove_gpr(Gpr::Sp);
        if pending.is_empty() {
            continue;
        }
        for step in 1..=len {
            let next = body[(p + step) % len];
            if !(next.uses & pending).is_empty() {
                out.insert(insn.address, step);
                break;
            }
            pending = pending - next.defs;
            if pending.is_empty() {
                break;
            }
        }
    }
    out
}
