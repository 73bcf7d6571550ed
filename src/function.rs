//! A named function: its bytes, the strategy that digested them and the
//! resulting flow graph.

use crate::cfg::{BlockId, FlowGraph};
use crate::encoder::Encoder;
use crate::insn::Instruction;
use crate::instrument::Location;
use crate::strategy::{DisassemblyContext, Strategy};
use crate::{Address, Decoder, DisassemblyError};

/// Padding requested at an instruction by [`Function::bloat_basic_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    pub address: Address,
    pub location: Location,
    /// Bytes of padding
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    base: Address,
    bytes: Vec<u8>,
    graph: Option<FlowGraph>,
    strategy: Option<Strategy>,
    /// First address recursive descent could not handle
    bad_instruction: Option<Address>,
}

impl Function {
    pub fn new(name: &str, base: Address, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            base,
            bytes,
            graph: None,
            strategy: None,
            bad_instruction: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Current size in bytes, which grows when blocks are bloated.
    pub fn size(&self) -> usize {
        self.graph.as_ref().map(|g| g.size()).unwrap_or(self.bytes.len())
    }

    pub fn end(&self) -> Address {
        self.base + self.size() as Address
    }

    pub fn in_range(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// The bytes the function was created with.
    pub fn original_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn graph(&self) -> Option<&FlowGraph> {
        self.graph.as_ref()
    }

    pub fn graph_mut(&mut self) -> Option<&mut FlowGraph> {
        self.graph.as_mut()
    }

    pub fn is_digested(&self) -> bool {
        self.graph.is_some()
    }

    /// Strategy whose output the flow graph was built from.
    pub fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    pub fn bad_instruction(&self) -> Option<Address> {
        self.bad_instruction
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.graph.iter().flat_map(|g| g.instructions())
    }

    /// Disassemble and build the flow graph and loops.
    ///
    /// Recursive descent is tried first. If it fails the offending address
    /// is recorded and a linear sweep is used instead. Returns the number of
    /// instructions decoded.
    pub fn digest(
        &mut self,
        decoder: &dyn Decoder,
        ctx: &mut DisassemblyContext<'_>,
    ) -> Result<usize, DisassemblyError> {
        let size = self.bytes.len();
        let recursive = Strategy::Recursive
            .disassemble_function(&self.bytes, self.base, decoder, ctx)
            .and_then(|insns| {
                FlowGraph::build_with_tables(insns, self.base, size, &self.bytes, &ctx.jump_tables)
            });

        let (mut graph, strategy) = match recursive {
            Ok(graph) => (graph, Strategy::Recursive),
            Err(e) => {
                let bad = match &e {
                    DisassemblyError::Decode(d) => d.address(),
                    DisassemblyError::Overlap { address }
                    | DisassemblyError::DuplicateAddress { address } => *address,
                    _ => self.base,
                };
                log::warn!(
                    "{}: recursive descent failed at 0x{:x} ({}), using linear sweep",
                    self.name,
                    bad,
                    e
                );
                self.bad_instruction = Some(bad);
                let insns = Strategy::Linear.disassemble_function(&self.bytes, self.base, decoder, ctx)?;
                (FlowGraph::build(insns, self.base, size, &self.bytes)?, Strategy::Linear)
            }
        };
        graph.build_loops();

        let count = graph.instruction_count();
        log::debug!(
            "Digested {} at 0x{:x}: {} instructions, {} blocks, {} loops ({})",
            self.name,
            self.base,
            count,
            graph.blocks().len(),
            graph.loops().len(),
            strategy
        );
        self.graph = Some(graph);
        self.strategy = Some(strategy);
        Ok(count)
    }

    /// Bytes of the function as currently laid out.
    pub fn dump(&self) -> Vec<u8> {
        match &self.graph {
            Some(graph) => graph.dump(),
            None => self.bytes.clone(),
        }
    }

    pub fn verify(&self) -> Result<(), DisassemblyError> {
        let Some(graph) = &self.graph else {
            return Ok(());
        };
        if graph.base() != self.base {
            return Err(DisassemblyError::Verify(format!(
                "{}: graph based at 0x{:x}, function at 0x{:x}",
                self.name,
                graph.base(),
                self.base
            )));
        }
        graph.verify()
    }

    /// No calls anywhere in the body.
    pub fn has_leaf_optimization(&self) -> bool {
        !self.instructions().any(|i| i.is_call())
    }

    pub fn contains_call_to_range(&self, low: Address, high: Address) -> bool {
        self.graph
            .iter()
            .flat_map(|g| g.blocks())
            .any(|b| b.contains_call_to_range(low, high))
    }

    /// Safe to move and rewrite: disassembly succeeded, no call lands inside
    /// the body, and no data reference points into it.
    pub fn has_complete_disassembly(&self) -> bool {
        if self.graph.is_none() || self.bad_instruction.is_some() {
            return false;
        }
        if self.contains_call_to_range(self.base + 1, self.end()) {
            return false;
        }
        for insn in self.instructions() {
            if insn.is_invalid() {
                return false;
            }
            if !insn.is_control() {
                if let Some(t) = insn.relative_target() {
                    if self.in_range(t) {
                        log::debug!(
                            "{}: instruction at 0x{:x} references its own body at 0x{:x}",
                            self.name,
                            insn.address,
                            t
                        );
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn find_instrumentation_point(
        &self,
        addr: Address,
        size: usize,
        location: Location,
    ) -> Option<Address> {
        let graph = self.graph.as_ref()?;
        let block = graph.block(graph.block_containing(addr)?);
        block.find_instrumentation_point(addr, size, location)
    }

    /// Insert no-op padding at each expansion, widen every short branch and
    /// lay the function out again. Returns the new size.
    pub fn bloat_basic_blocks(
        &mut self,
        encoder: &Encoder,
        expansions: &[Expansion],
    ) -> Result<usize, DisassemblyError> {
        let Some(graph) = self.graph.as_mut() else {
            return Ok(self.bytes.len());
        };

        let mut sorted = expansions.to_vec();
        sorted.sort_by_key(|e| (e.address, e.location == Location::After));
        sorted.dedup_by_key(|e| (e.address, e.location));

        let mut by_block: Vec<(BlockId, Vec<Expansion>)> = Vec::new();
        for e in sorted {
            let Some(id) = graph.block_containing(e.address) else {
                log::warn!("{}: no block holds expansion at 0x{:x}", self.name, e.address);
                continue;
            };
            match by_block.last_mut() {
                Some((last, list)) if *last == id => list.push(e),
                _ => by_block.push((id, vec![e])),
            }
        }

        for (id, list) in by_block {
            let block = graph.block_mut(id);
            // back to front so earlier indices stay valid
            for e in list.iter().rev() {
                let Some((idx, _)) = block.instruction_at(e.address) else {
                    log::warn!("{}: expansion at 0x{:x} splits an instruction", self.name, e.address);
                    continue;
                };
                let at = match e.location {
                    Location::After => idx + 1,
                    Location::Before | Location::Replace => idx,
                };
                let mut pad = encoder.nops(e.size);
                for p in pad.iter_mut() {
                    p.address = e.address;
                }
                block.instructions.splice(at..at, pad);
            }
        }

        for block in graph.blocks().iter().map(|b| b.index).collect::<Vec<_>>() {
            for insn in graph.block_mut(block).instructions.iter_mut() {
                if insn.is_control() && !insn.is_return() && insn.is_relocatable() {
                    insn.widen_target_operand()?;
                }
            }
        }
        graph.relayout()?;
        log::debug!("{}: bloated to {} bytes", self.name, graph.size());
        Ok(graph.size())
    }

    /// Replace the whole instructions at `addr` covering the replacements'
    /// size. The remainder is filled with no-ops. Returns what was removed.
    pub fn swap_instructions(
        &mut self,
        encoder: &Encoder,
        addr: Address,
        replacements: Vec<Instruction>,
    ) -> Result<Vec<Instruction>, DisassemblyError> {
        let name = &self.name;
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| DisassemblyError::Generic(format!("{} is not digested", name)))?;
        let id = graph.block_containing(addr).ok_or_else(|| {
            DisassemblyError::Generic(format!("{}: no block holds 0x{:x}", name, addr))
        })?;
        let block = graph.block_mut(id);
        let (start, _) = block.instruction_at(addr).ok_or_else(|| {
            DisassemblyError::Generic(format!("{}: 0x{:x} splits an instruction", name, addr))
        })?;

        let needed: usize = replacements.iter().map(|i| i.size()).sum();
        let mut covered = 0;
        let mut stop = start;
        while covered < needed && stop < block.instructions.len() {
            covered += block.instructions[stop].size();
            stop += 1;
        }
        if covered < needed {
            return Err(DisassemblyError::Generic(format!(
                "{}: only {} bytes available at 0x{:x}, {} needed",
                name, covered, addr, needed
            )));
        }

        let mut incoming = replacements;
        incoming.extend(encoder.nops(covered - needed));
        let mut at = addr;
        for insn in incoming.iter_mut() {
            insn.address = at;
            at += insn.size() as Address;
        }
        Ok(block.instructions.splice(start..stop, incoming).collect())
    }
}
