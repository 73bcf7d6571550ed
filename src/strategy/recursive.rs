//! Recursive descent disassembly strategy

use std::collections::BTreeMap;

use super::jump_table::{self, FunctionRange};
use super::DisassemblyContext;
use crate::insn::Instruction;
use crate::{Address, Decoder, DisassemblyError};

/// Recursive descent over one function.
///
/// Follows fallthrough edges, direct branches, calls and jump tables whose
/// targets lie inside `[base, base + bytes.len())`, starting at `base`.
/// Bytes no path reaches are left undecoded.
///
/// # Errors
/// * [`DisassemblyError::Decode`] when a reached address does not decode
/// * [`DisassemblyError::Overlap`] when a path lands inside an instruction
///   decoded along another path
pub fn run(
    bytes: &[u8],
    base: Address,
    decoder: &dyn Decoder,
    ctx: &mut DisassemblyContext<'_>,
) -> Result<Vec<Instruction>, DisassemblyError> {
    log::debug!("Starting recursive descent at 0x{:x} ({} bytes)", base, bytes.len());

    let range = FunctionRange {
        base,
        size: bytes.len(),
    };
    let mut decoded: BTreeMap<Address, Instruction> = BTreeMap::new();
    let mut work = Vec::new();
    if !bytes.is_empty() {
        work.push(base);
    }

    while let Some(addr) = work.pop() {
        if decoded.contains_key(&addr) {
            continue;
        }
        if let Some((_, prev)) = decoded.range(..addr).next_back() {
            if prev.contains(addr) {
                return Err(DisassemblyError::Overlap { address: addr });
            }
        }

        let offset = (addr - base) as usize;
        let (insn, len) = decoder.decode(&bytes[offset..], addr)?;
        let end = addr + len as Address;
        if let Some((&next, _)) = decoded.range(addr + 1..).next() {
            if next < end {
                return Err(DisassemblyError::Overlap { address: next });
            }
        }

        // targets go on the stack first so the fallthrough is decoded next
        if insn.is_jump_table_base() {
            push_jump_table(&insn, &decoded, range, decoder, ctx, &mut work);
        } else if let Some(target) = insn.control_target() {
            if range.contains(target) {
                work.push(target);
            } else if insn.is_branch() {
                log::warn!(
                    "Branch at 0x{:x} leaves the function for 0x{:x}; treating it as an exit",
                    addr,
                    target
                );
            }
        }
        if insn.falls_through() && range.contains(end) {
            work.push(end);
        }

        decoded.insert(addr, insn);
    }

    log::debug!("Recursive descent complete: {} instructions", decoded.len());
    Ok(decoded.into_values().collect())
}

fn push_jump_table(
    branch: &Instruction,
    decoded: &BTreeMap<Address, Instruction>,
    range: FunctionRange,
    decoder: &dyn Decoder,
    ctx: &mut DisassemblyContext<'_>,
    work: &mut Vec<Address>,
) {
    let width = decoder.width();
    let preceding = decoded.range(..branch.address).rev().map(|(_, insn)| insn);
    let Some(base) = jump_table::find_base(branch, preceding, width) else {
        log::warn!(
            "Cannot determine indirect jump target for instruction at 0x{:x}",
            branch.address
        );
        return;
    };
    let Some(image) = ctx.image else {
        log::warn!(
            "No image to read the jump table at 0x{:x} for 0x{:x}",
            base,
            branch.address
        );
        return;
    };
    let Some(table) = jump_table::resolve(branch.address, base, range, image, width, ctx.reaches) else {
        log::warn!("Jump table base 0x{:x} is not readable", base);
        return;
    };

    for &target in &table.targets {
        if range.contains(target) {
            work.push(target);
        } else {
            log::warn!(
                "Jump table target 0x{:x} for 0x{:x} is outside the function",
                target,
                branch.address
            );
        }
    }
    ctx.jump_tables.insert(branch.address, table);
}
