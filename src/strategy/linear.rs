//! Linear sweep disassembly strategy

use crate::insn::{Instruction, OpcodeClass};
use crate::{Address, Decoder, DisassemblyError};

/// Linear sweep over one function.
///
/// Decodes sequentially from `base` to `base + bytes.len()`. Bytes that do not
/// decode become one-byte `Invalid` instructions so the sweep always advances;
/// a final instruction that would run past the end is truncated the same way.
pub fn run(bytes: &[u8], base: Address, decoder: &dyn Decoder) -> Result<Vec<Instruction>, DisassemblyError> {
    log::debug!("Starting linear sweep of {} bytes at 0x{:x}", bytes.len(), base);

    let mut insns = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let at = base + offset as Address;
        let (insn, len) = match decoder.decode(&bytes[offset..], at) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::debug!("Linear sweep: {}", e);
                let len = e.length().clamp(1, bytes.len() - offset);
                let raw = bytes[offset..offset + len].to_vec();
                (Instruction::new(at, raw, OpcodeClass::Invalid, "(bad)"), len)
            }
        };
        insns.push(insn);
        offset += len;
    }

    log::debug!("Linear sweep complete: {} instructions", insns.len());
    Ok(insns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::TargetWidth;

    #[test]
    fn test_invalid_bytes_become_placeholders() {
        // nop; (bad) in 64-bit mode; ret
        let bytes = [0x90, 0x06, 0xc3];
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let insns = run(&bytes, 0x10, &decoder).unwrap();
        assert_eq!(insns.len(), 3);
        assert!(insns[1].is_invalid());
        assert_eq!(insns[1].size(), 1);
        assert!(insns[2].is_return());
        assert_eq!(insns[2].address, 0x12);
    }

    #[test]
    fn test_truncated_tail_covers_remaining_bytes() {
        // call rel32 cut short, then an add missing its ModRM
        let bytes = [0x90, 0xe8, 0x01];
        let decoder = X86Decoder::new(TargetWidth::Bits32);
        let insns = run(&bytes, 0, &decoder).unwrap();
        let covered: usize = insns.iter().map(|i| i.size()).sum();
        assert_eq!(covered, bytes.len());
        assert!(insns.last().unwrap().is_invalid());
    }

    #[test]
    fn test_empty_input() {
        let decoder = X86Decoder::new(TargetWidth::Bits32);
        assert!(run(&[], 0, &decoder).unwrap().is_empty());
    }
}
