//! Byte cursor plus ModRM / SIB / displacement parsing.

use crate::insn::{Gpr, MemRef, Operand, RegClass, Register};
use crate::Address;

use super::DecodeError;

/// Architectural limit on instruction length.
pub(crate) const MAX_INSN_LEN: usize = 15;

/// Reads instruction bytes and remembers how far decoding got.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    available: usize,
    pub(crate) pos: usize,
    address: Address,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8], address: Address) -> Self {
        let available = bytes.len();
        Self {
            bytes: &bytes[..available.min(MAX_INSN_LEN)],
            available,
            pos: 0,
            address,
        }
    }

    fn exhausted(&self) -> DecodeError {
        if self.available > self.bytes.len() {
            // ran past the 15-byte limit with input to spare
            DecodeError::InvalidEncoding {
                address: self.address,
                length: 1,
            }
        } else {
            DecodeError::Truncated {
                address: self.address,
                available: self.available,
            }
        }
    }

    pub(crate) fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes.get(self.pos).copied().ok_or_else(|| self.exhausted())
    }

    pub(crate) fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    pub(crate) fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// Read an `n`-byte little-endian field, sign-extended. Returns the value
    /// and the field's offset inside the instruction.
    pub(crate) fn signed(&mut self, n: u8) -> Result<(i64, u8), DecodeError> {
        let offset = self.pos as u8;
        let end = self.pos + n as usize;
        if end > self.bytes.len() {
            self.pos = self.bytes.len();
            return Err(self.exhausted());
        }
        let mut raw = [0u8; 8];
        raw[..n as usize].copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        let value = match n {
            1 => raw[0] as i8 as i64,
            2 => i16::from_le_bytes([raw[0], raw[1]]) as i64,
            4 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            _ => i64::from_le_bytes(raw),
        };
        Ok((value, offset))
    }

    /// Like `signed` but zero-extended.
    pub(crate) fn unsigned(&mut self, n: u8) -> Result<(i64, u8), DecodeError> {
        let (v, offset) = self.signed(n)?;
        let value = match n {
            1 => v as u8 as i64,
            2 => v as u16 as i64,
            4 => v as u32 as i64,
            _ => v,
        };
        Ok((value, offset))
    }

    pub(crate) fn consumed(&self) -> &'a [u8] {
        &self.bytes[..self.pos]
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }
}

/// REX prefix bits (or their VEX / EVEX equivalents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Rex {
    pub present: bool,
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    pub(crate) fn from_byte(b: u8) -> Self {
        Self {
            present: true,
            w: b & 8 != 0,
            r: b & 4 != 0,
            x: b & 2 != 0,
            b: b & 1 != 0,
        }
    }

    fn bit(set: bool) -> u8 {
        if set {
            8
        } else {
            0
        }
    }

    pub(crate) fn ext_r(&self) -> u8 {
        Self::bit(self.r)
    }

    pub(crate) fn ext_x(&self) -> u8 {
        Self::bit(self.x)
    }

    pub(crate) fn ext_b(&self) -> u8 {
        Self::bit(self.b)
    }
}

/// A parsed ModRM byte with its memory operand, if any.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ModRm {
    pub byte: u8,
    pub md: u8,
    /// reg field extended by REX.R
    pub reg: u8,
    /// r/m field extended by REX.B (register form only)
    pub rm: u8,
    pub mem: Option<Operand>,
}

impl ModRm {
    pub(crate) fn is_register(&self) -> bool {
        self.mem.is_none()
    }

    pub(crate) fn reg_low(&self) -> u8 {
        (self.byte >> 3) & 7
    }

    pub(crate) fn rm_low(&self) -> u8 {
        self.byte & 7
    }
}

fn addr_reg(num: u8, addr_size: u8) -> Register {
    let class = if addr_size == 8 {
        RegClass::Gpr64
    } else {
        RegClass::Gpr32
    };
    Register::new(class, num)
}

/// Parse ModRM, SIB and displacement.
///
/// `addr_size` is 2, 4 or 8. `force_register` treats any mod value as the
/// register form (mov to/from control and debug registers).
pub(crate) fn parse(
    cur: &mut Cursor<'_>,
    rex: Rex,
    addr_size: u8,
    rip_mode: bool,
    force_register: bool,
) -> Result<ModRm, DecodeError> {
    let byte = cur.byte()?;
    let md = byte >> 6;
    let reg = ((byte >> 3) & 7) | rex.ext_r();
    let rm_low = byte & 7;

    if md == 3 || force_register {
        return Ok(ModRm {
            byte,
            md,
            reg,
            rm: rm_low | rex.ext_b(),
            mem: None,
        });
    }

    if addr_size == 2 {
        return parse_16(cur, byte, md, reg);
    }

    let mut mem = MemRef {
        scale: 1,
        ..Default::default()
    };
    let mut disp_len = match md {
        1 => 1,
        2 => 4,
        _ => 0,
    };

    if rm_low == 4 {
        let sib = cur.byte()?;
        let scale = 1u8 << (sib >> 6);
        let index = ((sib >> 3) & 7) | rex.ext_x();
        let base = (sib & 7) | rex.ext_b();
        if index != 4 {
            mem.index = Some(addr_reg(index, addr_size));
            mem.scale = scale;
        }
        if sib & 7 == 5 && md == 0 {
            disp_len = 4;
        } else {
            mem.base = Some(addr_reg(base, addr_size));
        }
    } else if rm_low == 5 && md == 0 {
        disp_len = 4;
        mem.rip_relative = rip_mode;
    } else {
        mem.base = Some(addr_reg(rm_low | rex.ext_b(), addr_size));
    }

    let (disp, offset) = if disp_len > 0 {
        cur.signed(disp_len)?
    } else {
        (0, 0)
    };

    Ok(ModRm {
        byte,
        md,
        reg,
        rm: rm_low | rex.ext_b(),
        mem: Some(Operand::memory(mem, disp, offset, disp_len)),
    })
}

fn parse_16(cur: &mut Cursor<'_>, byte: u8, md: u8, reg: u8) -> Result<ModRm, DecodeError> {
    let r16 = |g: Gpr| Some(Register::new(RegClass::Gpr16, g as u8));
    let rm_low = byte & 7;
    let (base, index) = match rm_low {
        0 => (r16(Gpr::Bx), r16(Gpr::Si)),
        1 => (r16(Gpr::Bx), r16(Gpr::Di)),
        2 => (r16(Gpr::Bp), r16(Gpr::Si)),
        3 => (r16(Gpr::Bp), r16(Gpr::Di)),
        4 => (r16(Gpr::Si), None),
        5 => (r16(Gpr::Di), None),
        6 if md == 0 => (None, None),
        6 => (r16(Gpr::Bp), None),
        _ => (r16(Gpr::Bx), None),
    };
    let disp_len = match (md, rm_low) {
        (0, 6) => 2,
        (1, _) => 1,
        (2, _) => 2,
        _ => 0,
    };
    let (disp, offset) = if disp_len > 0 {
        cur.signed(disp_len)?
    } else {
        (0, 0)
    };
    let mem = MemRef {
        base,
        index,
        scale: 1,
        rip_relative: false,
    };
    Ok(ModRm {
        byte,
        md,
        reg,
        rm: rm_low,
        mem: Some(Operand::memory(mem, disp, offset, disp_len)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_bytes(bytes: &[u8], rex: Rex, addr_size: u8) -> (ModRm, usize) {
        let mut cur = Cursor::new(bytes, 0);
        let m = parse(&mut cur, rex, addr_size, addr_size == 8, false).unwrap();
        (m, cur.pos)
    }

    #[test]
    fn test_register_form() {
        let (m, len) = parse_bytes(&[0xc1], Rex::default(), 8);
        assert!(m.is_register());
        assert_eq!(m.reg, 0);
        assert_eq!(m.rm, 1);
        assert_eq!(len, 1);

        let (m, _) = parse_bytes(&[0xc1], Rex::from_byte(0x45), 8);
        assert_eq!(m.reg, 8);
        assert_eq!(m.rm, 9);
    }

    #[test]
    fn test_sib_with_disp8() {
        // [rax+rcx*4+0x10]
        let (m, len) = parse_bytes(&[0x44, 0x88, 0x10], Rex::default(), 8);
        let op = m.mem.unwrap();
        let mem = op.mem().unwrap();
        assert_eq!(mem.base.unwrap().name(), "rax");
        assert_eq!(mem.index.unwrap().name(), "rcx");
        assert_eq!(mem.scale, 4);
        assert_eq!(op.value, 0x10);
        assert_eq!((op.offset, op.width), (2, 1));
        assert_eq!(len, 3);
    }

    #[test]
    fn test_rip_relative() {
        let (m, len) = parse_bytes(&[0x05, 0x78, 0x56, 0x34, 0x12], Rex::default(), 8);
        let op = m.mem.unwrap();
        assert!(op.is_relative());
        assert_eq!(op.value, 0x12345678);
        assert_eq!(len, 5);

        // 32-bit mode: absolute disp32
        let mut cur = Cursor::new(&[0x05, 0, 0x10, 0, 0], 0);
        let m = parse(&mut cur, Rex::default(), 4, false, false).unwrap();
        assert!(!m.mem.unwrap().is_relative());
    }

    #[test]
    fn test_sixteen_bit_addressing() {
        let mut cur = Cursor::new(&[0x46, 0xfe], 0);
        let m = parse(&mut cur, Rex::default(), 2, false, false).unwrap();
        let op = m.mem.unwrap();
        assert_eq!(op.mem().unwrap().base.unwrap().name(), "bp");
        assert_eq!(op.value, -2);
    }

    #[test]
    fn test_truncated_displacement() {
        let mut cur = Cursor::new(&[0x80, 0x00], 0);
        assert!(matches!(
            parse(&mut cur, Rex::default(), 8, true, false),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
