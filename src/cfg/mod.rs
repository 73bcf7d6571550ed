//! Per-function control-flow graphs: basic blocks, raw blocks and their layout.
//!
//! A [`FlowGraph`] owns every block of one function. Basic blocks live in an
//! arena addressed by [`BlockId`]; byte ranges that were never decoded are
//! kept as [`RawBlock`]s and dumped verbatim. The layout interleaves both
//! kinds in address order and always tiles the function exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::encoder::EncodeError;
use crate::insn::{ByteSource, Instruction};
use crate::instrument::Location;
use crate::strategy::JumpTable;
use crate::{Address, DisassemblyError};

mod dominators;
mod loops;

pub use loops::Loop;

/// Index of a basic block inside its [`FlowGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Properties of a basic block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    /// Function entry
    pub entry: bool,
    /// Returns or leaves the function
    pub exit: bool,
    /// Holds only no-ops
    pub padding: bool,
    /// Not reachable from the entry block
    pub unreachable: bool,
    /// Holds only control transfers and no-ops
    pub only_control: bool,
}

/// A straight-line run of instructions with a single entry at its first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub index: BlockId,
    pub address: Address,
    pub instructions: Vec<Instruction>,
    pub flags: BlockFlags,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Immediate dominator, unset for the entry and unreachable blocks
    pub idom: Option<BlockId>,
}

impl BasicBlock {
    fn new(index: BlockId, instructions: Vec<Instruction>) -> Self {
        let address = instructions.first().map(|i| i.address).unwrap_or(0);
        Self {
            index,
            address,
            instructions,
            flags: BlockFlags::default(),
            preds: Vec::new(),
            succs: Vec::new(),
            idom: None,
        }
    }

    /// Byte size, summed from the instructions.
    pub fn size(&self) -> usize {
        self.instructions.iter().map(|i| i.size()).sum()
    }

    pub fn end(&self) -> Address {
        self.address + self.size() as Address
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.end()
    }

    pub fn leader(&self) -> Option<&Instruction> {
        self.instructions.first()
    }

    pub fn exit_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Position and instruction starting exactly at `addr`.
    pub fn instruction_at(&self, addr: Address) -> Option<(usize, &Instruction)> {
        self.instructions
            .iter()
            .enumerate()
            .find(|(_, i)| i.address == addr)
    }

    /// Execution may continue past the last instruction.
    pub fn falls_through(&self) -> bool {
        self.exit_instruction().map(|i| i.falls_through()).unwrap_or(true)
    }

    pub fn contains_only_control(&self) -> bool {
        self.instructions.iter().all(|i| i.is_control() || i.is_nop())
    }

    /// Some call in the block targets `[low, high)`.
    pub fn contains_call_to_range(&self, low: Address, high: Address) -> bool {
        self.instructions.iter().any(|i| {
            i.is_call()
                && i.control_target()
                    .map(|t| t >= low && t < high)
                    .unwrap_or(false)
        })
    }

    /// Raw bytes of the block.
    pub fn bytes(&self) -> Vec<u8> {
        self.instructions
            .iter()
            .flat_map(|i| i.bytes.iter().copied())
            .collect()
    }

    /// Check instruction contiguity and that at most one original control
    /// transfer is present, as the final instruction.
    pub fn verify(&self) -> Result<(), DisassemblyError> {
        if self.instructions.is_empty() {
            return Err(DisassemblyError::Verify(format!("{} has no instructions", self.index)));
        }
        let mut at = self.address;
        for insn in &self.instructions {
            if insn.address != at {
                return Err(DisassemblyError::Verify(format!(
                    "{}: instruction at 0x{:x} expected at 0x{:x}",
                    self.index, insn.address, at
                )));
            }
            at = insn.end();
        }

        let control: Vec<usize> = self
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_control() && i.source == ByteSource::Application)
            .map(|(n, _)| n)
            .collect();
        if control.len() > 1 {
            return Err(DisassemblyError::Verify(format!(
                "Block at 0x{:x} should only have 1 branch ({} found)",
                self.address,
                control.len()
            )));
        }
        if let Some(&n) = control.first() {
            if n + 1 != self.instructions.len() {
                return Err(DisassemblyError::Verify(format!(
                    "Block at 0x{:x} has a control transfer before its end",
                    self.address
                )));
            }
        }
        Ok(())
    }

    /// Where `size` bytes of patch can start for a point at `addr`.
    ///
    /// `Before` and `Replace` start at `addr`, `After` at the next
    /// instruction. Whole relocatable instructions from there to the end of
    /// the block must cover `size` bytes.
    pub fn find_instrumentation_point(
        &self,
        addr: Address,
        size: usize,
        location: Location,
    ) -> Option<Address> {
        let (idx, insn) = self.instruction_at(addr)?;
        let start = match location {
            Location::Before | Location::Replace => idx,
            Location::After => {
                if insn.end() >= self.end() {
                    return None;
                }
                idx + 1
            }
        };
        let mut covered = 0;
        for insn in &self.instructions[start..] {
            if covered >= size || !insn.is_relocatable() {
                break;
            }
            covered += insn.size();
        }
        (covered >= size).then(|| self.instructions[start].address)
    }
}

/// Bytes inside a function that were not decoded as code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub address: Address,
    pub bytes: Vec<u8>,
}

impl RawBlock {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn end(&self) -> Address {
        self.address + self.bytes.len() as Address
    }
}

/// One entry of the function layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Basic(BlockId),
    /// Index into [`FlowGraph::raw_blocks`]
    Raw(usize),
}

/// All blocks and loops of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowGraph {
    base: Address,
    size: usize,
    blocks: Vec<BasicBlock>,
    raw: Vec<RawBlock>,
    layout: Vec<BlockRef>,
    loops: Vec<Loop>,
}

impl FlowGraph {
    /// Build the graph for the function `[base, base + size)`.
    ///
    /// `instructions` may come from either strategy; `bytes` supplies the
    /// contents of any gaps between them.
    pub fn build(
        instructions: Vec<Instruction>,
        base: Address,
        size: usize,
        bytes: &[u8],
    ) -> Result<Self, DisassemblyError> {
        Self::build_with_tables(instructions, base, size, bytes, &BTreeMap::new())
    }

    /// [`FlowGraph::build`] with jump tables keyed by branch address.
    pub fn build_with_tables(
        mut instructions: Vec<Instruction>,
        base: Address,
        size: usize,
        bytes: &[u8],
        tables: &BTreeMap<Address, JumpTable>,
    ) -> Result<Self, DisassemblyError> {
        let end = base + size as Address;
        let in_range = |a: Address| a >= base && a < end;

        instructions.sort_by_key(|i| i.address);
        for pair in instructions.windows(2) {
            if pair[0].address == pair[1].address {
                return Err(DisassemblyError::DuplicateAddress {
                    address: pair[1].address,
                });
            }
            if pair[0].end() > pair[1].address {
                return Err(DisassemblyError::Overlap {
                    address: pair[1].address,
                });
            }
        }
        if let Some(stray) = instructions
            .iter()
            .find(|i| i.address < base || i.end() > end)
        {
            return Err(DisassemblyError::Verify(format!(
                "instruction at 0x{:x} lies outside function 0x{:x}..0x{:x}",
                stray.address, base, end
            )));
        }

        let starts: BTreeSet<Address> = instructions.iter().map(|i| i.address).collect();
        let mut leaders = BTreeSet::new();
        if let Some(first) = instructions.first() {
            leaders.insert(first.address);
        }
        for (n, insn) in instructions.iter().enumerate() {
            if n > 0 && instructions[n - 1].end() != insn.address {
                leaders.insert(insn.address);
            }
            if insn.is_control() || !insn.falls_through() {
                leaders.insert(insn.end());
            }
            if let Some(t) = insn.control_target() {
                if in_range(t) {
                    leaders.insert(t);
                }
            }
            if let Some(table) = tables.get(&insn.address) {
                leaders.extend(table.targets.iter().copied().filter(|&t| in_range(t)));
            }
        }
        leaders.retain(|a| starts.contains(a));

        // split into blocks
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut current: Vec<Instruction> = Vec::new();
        for insn in instructions {
            if leaders.contains(&insn.address) && !current.is_empty() {
                let id = BlockId(blocks.len() as u32);
                blocks.push(BasicBlock::new(id, std::mem::take(&mut current)));
            }
            current.push(insn);
        }
        if !current.is_empty() {
            let id = BlockId(blocks.len() as u32);
            blocks.push(BasicBlock::new(id, current));
        }

        let by_address: BTreeMap<Address, BlockId> =
            blocks.iter().map(|b| (b.address, b.index)).collect();

        // edges
        for block in blocks.iter_mut() {
            let Some(last) = block.instructions.last() else {
                continue;
            };
            let mut succs = Vec::new();
            let mut exit = last.is_return();
            if last.falls_through() {
                if let Some(&next) = by_address.get(&last.end()) {
                    succs.push(next);
                }
            }
            if let Some(table) = tables.get(&last.address) {
                for t in &table.targets {
                    match by_address.get(t) {
                        Some(&id) => succs.push(id),
                        None => exit = true,
                    }
                }
            } else if last.is_branch() {
                match last.control_target() {
                    Some(t) if in_range(t) => match by_address.get(&t) {
                        Some(&id) => succs.push(id),
                        None => log::warn!(
                            "Branch at 0x{:x} targets 0x{:x}, which starts no block",
                            last.address,
                            t
                        ),
                    },
                    Some(t) => {
                        log::warn!(
                            "Branch at 0x{:x} leaves the function for 0x{:x}",
                            last.address,
                            t
                        );
                        exit = true;
                    }
                    // unresolved indirect branch
                    None => exit = true,
                }
            } else if last.is_call() {
                // calls back into the function also reach their target
                if let Some(&id) = last.control_target().filter(|&t| in_range(t)).and_then(|t| by_address.get(&t)) {
                    succs.push(id);
                }
            }
            succs.sort();
            succs.dedup();
            block.succs = succs;
            block.flags.exit = exit;
            block.flags.padding = block.instructions.iter().all(|i| i.is_nop());
            block.flags.only_control = !block.flags.padding && block.contains_only_control();
        }
        let edges: Vec<(BlockId, BlockId)> = blocks
            .iter()
            .flat_map(|b| b.succs.iter().map(move |&s| (b.index, s)))
            .collect();
        for (from, to) in edges {
            blocks[to.index()].preds.push(from);
        }

        // raw blocks fill the gaps
        let mut raw = Vec::new();
        let mut layout = Vec::new();
        let mut at = base;
        let gap = |from: Address, to: Address| -> RawBlock {
            let lo = (from - base) as usize;
            let hi = ((to - base) as usize).min(bytes.len());
            RawBlock {
                address: from,
                bytes: bytes.get(lo..hi).map(|b| b.to_vec()).unwrap_or_default(),
            }
        };
        for block in &blocks {
            if block.address > at {
                layout.push(BlockRef::Raw(raw.len()));
                raw.push(gap(at, block.address));
            }
            layout.push(BlockRef::Basic(block.index));
            at = block.end();
        }
        if at < end {
            layout.push(BlockRef::Raw(raw.len()));
            raw.push(gap(at, end));
        }

        let mut graph = FlowGraph {
            base,
            size,
            blocks,
            raw,
            layout,
            loops: Vec::new(),
        };
        graph.mark_reachability();
        log::debug!(
            "Flow graph for 0x{:x}: {} basic blocks, {} raw blocks",
            base,
            graph.blocks.len(),
            graph.raw.len()
        );
        Ok(graph)
    }

    fn mark_reachability(&mut self) {
        let Some(entry) = self.entry() else {
            return;
        };
        self.blocks[entry.index()].flags.entry = true;
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![entry];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            stack.extend(self.blocks[id.index()].succs.iter().copied());
        }
        for (block, seen) in self.blocks.iter_mut().zip(seen) {
            block.flags.unreachable = !seen;
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Byte size of the function.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_range(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.size as Address
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn raw_blocks(&self) -> &[RawBlock] {
        &self.raw
    }

    /// Blocks of both kinds in address order.
    pub fn layout(&self) -> &[BlockRef] {
        &self.layout
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Block holding the function's first byte, else the first basic block.
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|b| b.address == self.base)
            .or_else(|| self.blocks.first())
            .map(|b| b.index)
    }

    pub fn exit_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| b.flags.exit)
            .map(|b| b.index)
            .collect()
    }

    /// Instructions in address order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// Basic block whose bytes include `addr`.
    pub fn block_containing(&self, addr: Address) -> Option<BlockId> {
        let idx = self.blocks.partition_point(|b| b.address <= addr);
        let block = self.blocks.get(idx.checked_sub(1)?)?;
        block.contains(addr).then_some(block.index)
    }

    pub fn instruction_at(&self, addr: Address) -> Option<&Instruction> {
        let block = self.block(self.block_containing(addr)?);
        block.instruction_at(addr).map(|(_, i)| i)
    }

    /// Address and size of every layout entry.
    pub fn spans(&self) -> impl Iterator<Item = (Address, usize)> + '_ {
        self.layout.iter().map(move |r| match *r {
            BlockRef::Basic(id) => (self.blocks[id.index()].address, self.blocks[id.index()].size()),
            BlockRef::Raw(n) => (self.raw[n].address, self.raw[n].size()),
        })
    }

    /// Function bytes in layout order.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for r in &self.layout {
            match *r {
                BlockRef::Basic(id) => {
                    for insn in &self.blocks[id.index()].instructions {
                        out.extend_from_slice(&insn.bytes);
                    }
                }
                BlockRef::Raw(n) => out.extend_from_slice(&self.raw[n].bytes),
            }
        }
        out
    }

    /// Check that the layout tiles the function and that edges are symmetric.
    pub fn verify(&self) -> Result<(), DisassemblyError> {
        let mut at = self.base;
        for (addr, size) in self.spans() {
            if addr != at {
                return Err(DisassemblyError::Verify(format!(
                    "block at 0x{:x} expected at 0x{:x}",
                    addr, at
                )));
            }
            at += size as Address;
        }
        if at != self.base + self.size as Address {
            return Err(DisassemblyError::Verify(format!(
                "blocks cover 0x{:x}..0x{:x}, function is {} bytes",
                self.base, at, self.size
            )));
        }
        for (n, block) in self.blocks.iter().enumerate() {
            if block.index.index() != n {
                return Err(DisassemblyError::Verify(format!(
                    "block {} stored at index {}",
                    block.index, n
                )));
            }
            block.verify()?;
            for s in &block.succs {
                if !self.blocks[s.index()].preds.contains(&block.index) {
                    return Err(DisassemblyError::Verify(format!(
                        "edge {} -> {} has no matching predecessor",
                        block.index, s
                    )));
                }
            }
        }
        Ok(())
    }

    /// Lay every block out again from the function base, in layout order.
    ///
    /// Instructions keep what their relative operands refer to: targets
    /// inside the function follow the code they pointed at, targets outside
    /// stay fixed. Data inside jump tables is not rewritten.
    pub fn relayout(&mut self) -> Result<(), EncodeError> {
        let old_base = self.base;
        let old_end = self.base + self.size as Address;
        let mut moves: BTreeMap<Address, Address> = BTreeMap::new();
        let mut placed: Vec<(usize, usize, Address, Option<Address>)> = Vec::new();

        let mut at = self.base;
        for r in &self.layout {
            match *r {
                BlockRef::Raw(n) => {
                    let raw = &mut self.raw[n];
                    moves.entry(raw.address).or_insert(at);
                    raw.address = at;
                    at += raw.size() as Address;
                }
                BlockRef::Basic(id) => {
                    let block = &mut self.blocks[id.index()];
                    block.address = at;
                    for (k, insn) in block.instructions.iter().enumerate() {
                        // padding inserted ahead of an instruction carries its address
                        moves.entry(insn.address).or_insert(at);
                        placed.push((id.index(), k, at, insn.relative_target()));
                        at += insn.size() as Address;
                    }
                }
            }
        }

        let remap = |t: Address| -> Address {
            if t < old_base || t >= old_end {
                return t;
            }
            match moves.range(..=t).next_back() {
                Some((&from, &to)) => to + (t - from),
                None => t,
            }
        };
        for (b, k, new_address, target) in placed {
            let insn = &mut self.blocks[b].instructions[k];
            insn.address = new_address;
            if let Some(t) = target {
                insn.set_relative_target(remap(t))?;
            }
        }
        self.size = (at - self.base) as usize;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::strategy::{linear, JumpTableMode};
    use crate::TargetWidth;

    pub(crate) fn graph_of(bytes: &[u8], base: Address) -> FlowGraph {
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let insns = linear::run(bytes, base, &decoder).unwrap();
        FlowGraph::build(insns, base, bytes.len(), bytes).unwrap()
    }

    // 0: test edi, edi
    // 2: je +5 (-> 9)
    // 4: mov eax, 1
    // 9: ret
    const DIAMOND: [u8; 10] = [0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];

    #[test]
    fn test_blocks_and_edges() {
        let g = graph_of(&DIAMOND, 0x1000);
        assert_eq!(g.blocks().len(), 3);
        let addrs: Vec<_> = g.blocks().iter().map(|b| b.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x1004, 0x1009]);
        assert_eq!(g.block(BlockId(0)).succs, vec![BlockId(1), BlockId(2)]);
        assert_eq!(g.block(BlockId(1)).succs, vec![BlockId(2)]);
        assert_eq!(g.block(BlockId(2)).preds, vec![BlockId(0), BlockId(1)]);
        assert!(g.block(BlockId(0)).flags.entry);
        assert!(g.block(BlockId(2)).flags.exit);
        g.verify().unwrap();
    }

    #[test]
    fn test_raw_blocks_fill_gaps() {
        // jmp +2 ; two data bytes ; ret, decoded recursively
        let bytes = [0xeb, 0x02, 0xde, 0xad, 0xc3];
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let mut ctx = crate::strategy::DisassemblyContext::new();
        let insns = crate::strategy::Strategy::Recursive
            .disassemble_function(&bytes, 0x10, &decoder, &mut ctx)
            .unwrap();
        let g = FlowGraph::build(insns, 0x10, bytes.len(), &bytes).unwrap();
        assert_eq!(g.raw_blocks().len(), 1);
        assert_eq!(g.raw_blocks()[0].address, 0x12);
        assert_eq!(g.layout().len(), 3);
        assert_eq!(g.dump(), bytes.to_vec());
        g.verify().unwrap();
    }

    #[test]
    fn test_local_call_edge() {
        // call +1 (-> 6) ; ret ; ret
        let g = graph_of(&[0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3], 0);
        assert_eq!(g.blocks().len(), 3);
        assert_eq!(g.block(BlockId(0)).succs, vec![BlockId(1), BlockId(2)]);
        assert!(!g.block(BlockId(2)).flags.unreachable);

        // a call leaving the function only falls through
        let g = graph_of(&[0xe8, 0x00, 0x10, 0x00, 0x00, 0xc3], 0);
        assert_eq!(g.block(BlockId(0)).succs, vec![BlockId(1)]);
        assert!(!g.block(BlockId(0)).flags.exit);
    }

    #[test]
    fn test_unreachable_marking() {
        // ret ; nop ; ret
        let g = graph_of(&[0xc3, 0x90, 0xc3], 0);
        assert_eq!(g.blocks().len(), 2);
        assert!(!g.block(BlockId(0)).flags.unreachable);
        assert!(g.block(BlockId(1)).flags.unreachable);
    }

    #[test]
    fn test_out_of_range_branch_marks_exit() {
        let g = graph_of(&[0x90, 0xe9, 0x00, 0x10, 0x00, 0x00], 0);
        assert_eq!(g.blocks().len(), 1);
        assert!(g.block(BlockId(0)).flags.exit);
        assert!(g.block(BlockId(0)).succs.is_empty());
    }

    #[test]
    fn test_jump_table_edges() {
        // jmp rax ; ret ; ret
        let bytes = [0xff, 0xe0, 0xc3, 0xc3];
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let insns = linear::run(&bytes, 0, &decoder).unwrap();
        let mut tables = BTreeMap::new();
        tables.insert(
            0,
            JumpTable {
                branch: 0,
                base: 0x100,
                mode: JumpTableMode::Direct,
                targets: vec![2, 3],
            },
        );
        let g = FlowGraph::build_with_tables(insns, 0, 4, &bytes, &tables).unwrap();
        assert_eq!(g.block(BlockId(0)).succs, vec![BlockId(1), BlockId(2)]);
        assert!(!g.block(BlockId(2)).flags.unreachable);
    }

    #[test]
    fn test_duplicate_and_overlap_rejected() {
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let a = decoder.decode(&[0x90], 0).unwrap().0;
        let err = FlowGraph::build(vec![a.clone(), a], 0, 1, &[0x90]).unwrap_err();
        assert!(matches!(err, DisassemblyError::DuplicateAddress { address: 0 }));

        let mov = decoder.decode(&[0xb8, 0, 0, 0, 0], 0).unwrap().0;
        let nop = decoder.decode(&[0x90], 2).unwrap().0;
        let err = FlowGraph::build(vec![mov, nop], 0, 5, &[0xb8, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DisassemblyError::Overlap { address: 2 }));
    }

    #[test]
    fn test_block_lookup() {
        let g = graph_of(&DIAMOND, 0x1000);
        assert_eq!(g.block_containing(0x1005), Some(BlockId(1)));
        assert_eq!(g.block_containing(0x100a), None);
        assert_eq!(g.instruction_at(0x1004).map(|i| i.mnemonic), Some("mov"));
        assert!(g.instruction_at(0x1005).is_none());
    }

    #[test]
    fn test_find_instrumentation_point() {
        let g = graph_of(&DIAMOND, 0x1000);
        let b1 = g.block(BlockId(1));
        // the mov alone covers a 5-byte jump
        assert_eq!(b1.find_instrumentation_point(0x1004, 5, Location::Before), Some(0x1004));
        // nothing follows the mov inside its block
        assert_eq!(b1.find_instrumentation_point(0x1004, 5, Location::After), None);
        let b0 = g.block(BlockId(0));
        // test + je = 4 bytes
        assert_eq!(b0.find_instrumentation_point(0x1000, 5, Location::Before), None);
        assert_eq!(b0.find_instrumentation_point(0x1000, 4, Location::Before), Some(0x1000));
        assert_eq!(b0.find_instrumentation_point(0x1000, 2, Location::After), Some(0x1002));
    }

    #[test]
    fn test_block_verify_rejects_two_branches() {
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let ret = decoder.decode(&[0xc3], 0).unwrap().0;
        let ret2 = decoder.decode(&[0xc3], 1).unwrap().0;
        let block = BasicBlock::new(BlockId(0), vec![ret, ret2]);
        assert!(matches!(block.verify(), Err(DisassemblyError::Verify(_))));
    }

    #[test]
    fn test_relayout_keeps_targets() {
        let mut g = graph_of(&DIAMOND, 0x1000);
        // grow the fallthrough block by two bytes of padding
        let block = g.block_mut(BlockId(1));
        let mut pad = crate::encoder::Encoder::new(TargetWidth::Bits64).nops(2);
        for n in pad.iter_mut() {
            n.address = 0x1004;
        }
        block.instructions.splice(0..0, pad);
        g.relayout().unwrap();

        assert_eq!(g.size(), DIAMOND.len() + 2);
        let je = g.instruction_at(0x1002).unwrap();
        assert_eq!(je.control_target(), Some(0x100b));
        assert_eq!(g.block(BlockId(2)).address, 0x100b);
        g.verify().unwrap();
    }
}
