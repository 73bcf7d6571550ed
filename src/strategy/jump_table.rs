//! Jump-table discovery for indirect unconditional branches.

use std::fmt;

use crate::insn::{Instruction, OperandKind};
use crate::{Address, ImageReader, TargetWidth};

/// How many instructions before the branch are searched for the table base.
const LOOKBACK: usize = 8;

/// Upper bound on entries walked in one table.
const MAX_ENTRIES: usize = 4096;

/// Smallest immediate taken as a plausible table address.
const MIN_TABLE_ADDRESS: i64 = 0x10000;

/// What the first table entry says about the table's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTableMode {
    /// Entries are absolute addresses inside the function
    Direct,
    /// Entries are signed 32-bit offsets from an anchor address
    Offset,
    /// The "table" is itself code
    Instructions,
}

impl fmt::Display for JumpTableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpTableMode::Direct => write!(f, "direct"),
            JumpTableMode::Offset => write!(f, "offset"),
            JumpTableMode::Instructions => write!(f, "instructions"),
        }
    }
}

/// A resolved jump table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// Address of the indirect branch
    pub branch: Address,
    /// Address of the first entry
    pub base: Address,
    pub mode: JumpTableMode,
    /// Branch targets in table order
    pub targets: Vec<Address>,
}

/// Address range of the function a table belongs to.
#[derive(Debug, Clone, Copy)]
pub struct FunctionRange {
    pub base: Address,
    pub size: usize,
}

impl FunctionRange {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.size as Address
    }
}

fn as_address(value: i64, width: TargetWidth) -> Address {
    match width {
        TargetWidth::Bits32 => value as u32 as Address,
        TargetWidth::Bits64 => value as Address,
    }
}

/// Find the table base for `branch`.
///
/// A memory operand without a base register names the table directly.
/// Otherwise `preceding` (nearest first) is searched for the instruction that
/// materialised the base: a RIP-relative reference, an absolute displacement
/// or an address-sized immediate. The search stops at the previous control
/// transfer.
pub fn find_base<'a>(
    branch: &Instruction,
    preceding: impl IntoIterator<Item = &'a Instruction>,
    width: TargetWidth,
) -> Option<Address> {
    let jump_op = branch.operands.first()?;
    if let OperandKind::Memory(mem) = jump_op.kind {
        if mem.rip_relative {
            return branch.relative_target();
        }
        if mem.base.is_none() && jump_op.value != 0 {
            return Some(as_address(jump_op.value, width));
        }
    }

    for insn in preceding.into_iter().take(LOOKBACK) {
        if insn.is_control() {
            break;
        }
        if let Some(target) = insn.relative_target() {
            return Some(target);
        }
        for op in &insn.operands {
            match op.kind {
                OperandKind::Memory(mem) if mem.base.is_none() && op.value >= MIN_TABLE_ADDRESS => {
                    return Some(as_address(op.value, width));
                }
                OperandKind::Immediate if op.value >= MIN_TABLE_ADDRESS => {
                    return Some(as_address(op.value, width));
                }
                _ => {}
            }
        }
    }
    None
}

/// Classify the table at `base` and collect its targets.
///
/// Returns `None` when the first entry cannot be read.
pub fn resolve(
    branch: Address,
    base: Address,
    function: FunctionRange,
    image: &dyn ImageReader,
    width: TargetWidth,
    reaches: u64,
) -> Option<JumpTable> {
    let instructions = |base: Address| JumpTable {
        branch,
        base,
        mode: JumpTableMode::Instructions,
        targets: vec![base],
    };
    if function.contains(base) {
        return Some(instructions(base));
    }

    let word = width.word_size();
    let first = image.read_word(base, word)?;
    if function.contains(first) {
        let mut targets = Vec::new();
        for i in 0..MAX_ENTRIES {
            match image.read_word(base + (i * word) as Address, word) {
                Some(entry) if function.contains(entry) => targets.push(entry),
                _ => break,
            }
        }
        log::debug!("Jump table at 0x{:x}: direct, {} entries", base, targets.len());
        return Some(JumpTable {
            branch,
            base,
            mode: JumpTableMode::Direct,
            targets,
        });
    }

    let first = image.read_word(base, 4)? as u32 as i32 as i64;
    let from_table = base.wrapping_add(first as u64);
    let from_function = function.base.wrapping_add(first as u64);
    if !(function.contains(from_table)
        || function.contains(from_function)
        || first.unsigned_abs() < reaches)
    {
        log::debug!("Jump table at 0x{:x}: instructions", base);
        return Some(instructions(base));
    }

    let anchor = if !function.contains(from_table) && function.contains(from_function) {
        function.base
    } else {
        base
    };
    let mut targets = Vec::new();
    for i in 0..MAX_ENTRIES {
        let Some(raw) = image.read_word(base + (i * 4) as Address, 4) else {
            break;
        };
        let target = anchor.wrapping_add(raw as u32 as i32 as i64 as u64);
        if !function.contains(target) {
            break;
        }
        targets.push(target);
    }
    log::debug!("Jump table at 0x{:x}: offset, {} entries", base, targets.len());
    Some(JumpTable {
        branch,
        base,
        mode: JumpTableMode::Offset,
        targets,
    })
}
