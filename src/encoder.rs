//! Instruction encoder for the handful of forms instrumentation needs.
//!
//! Every constructor returns a fresh [`Instruction`] tagged
//! [`ByteSource::Instrumentation`], with operands and use/def sets filled in
//! the same way the decoder fills them, so generated code can be relocated,
//! listed and analyzed like application code.

use crate::decoder::tables::{condition_flags, jcc_mnemonic};
use crate::insn::flags::{AH_FLAGS, ALL as ALL_FLAGS, STATUS};
use crate::insn::{
    call_effects, ByteSource, Gpr, Instruction, MemRef, OpcodeClass, Operand, RegClass, RegSet,
    Register,
};
use crate::{Address, TargetWidth};

/// Errors raised while building or patching an encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// An immediate or displacement does not fit the chosen form.
    #[error("value {value:#x} does not fit in {bytes} bytes")]
    Overflow { value: i64, bytes: u8 },

    /// Asked to retarget an instruction with nothing to retarget.
    #[error("instruction at 0x{address:x} has no relative operand")]
    NoRelativeOperand { address: Address },

    /// Only jmp and jcc short forms have rel32 equivalents.
    #[error("cannot widen {mnemonic} at 0x{address:x} to a 32-bit displacement")]
    Unwidenable {
        address: Address,
        mnemonic: &'static str,
    },

    /// Register not available in the target width, or an unsupported pairing.
    #[error("cannot encode {mnemonic} with register {register}")]
    UnsupportedRegister {
        mnemonic: &'static str,
        register: Register,
    },
}

/// Recommended multi-byte no-op sequences, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Length of `jmp rel32` / `call rel32`.
pub const JUMP_SIZE: usize = 5;

fn fits_i8(v: i64) -> bool {
    i8::try_from(v).is_ok()
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

fn gprs(regs: &[Gpr]) -> RegSet {
    RegSet::from_masks(regs.iter().fold(0, |m, r| m | r.mask()), 0)
}

/// Encoder for one target width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoder {
    width: TargetWidth,
}

impl Encoder {
    pub fn new(width: TargetWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> TargetWidth {
        self.width
    }

    fn is_64(&self) -> bool {
        self.width == TargetWidth::Bits64
    }

    /// Native register width in bytes.
    pub fn word_size(&self) -> u8 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    fn insn(
        &self,
        bytes: Vec<u8>,
        class: OpcodeClass,
        mnemonic: &'static str,
        uses: RegSet,
        defs: RegSet,
    ) -> Instruction {
        let mut insn = Instruction::new(0, bytes, class, mnemonic);
        insn.source = ByteSource::Instrumentation;
        insn.uses = uses;
        insn.defs = defs;
        insn
    }

    fn check(&self, mnemonic: &'static str, r: Gpr) -> Result<(), EncodeError> {
        if r.is_extended() && !self.is_64() {
            return Err(EncodeError::UnsupportedRegister {
                mnemonic,
                register: Register::gpr64(r),
            });
        }
        Ok(())
    }

    /// REX byte for the given fields, `None` if no REX is needed.
    fn rex(&self, w: bool, reg: u8, index: u8, base: u8) -> Option<u8> {
        let v = 0x40
            | if w { 8 } else { 0 }
            | if reg >= 8 { 4 } else { 0 }
            | if index >= 8 { 2 } else { 0 }
            | if base >= 8 { 1 } else { 0 };
        (v != 0x40 && self.is_64()).then_some(v)
    }

    fn reg(&self, r: Gpr) -> Register {
        Register::gpr_sized(r, self.word_size())
    }

    pub fn nop(&self) -> Instruction {
        self.insn(vec![0x90], OpcodeClass::Nop, "nop", RegSet::EMPTY, RegSet::EMPTY)
    }

    /// No-ops covering exactly `len` bytes, longest forms first.
    pub fn nops(&self, len: usize) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut left = len;
        while left > 0 {
            let n = left.min(NOPS.len());
            out.push(self.insn(
                NOPS[n - 1].to_vec(),
                OpcodeClass::Nop,
                "nop",
                RegSet::EMPTY,
                RegSet::EMPTY,
            ));
            left -= n;
        }
        out
    }

    pub fn push(&self, r: Gpr) -> Result<Instruction, EncodeError> {
        self.check("push", r)?;
        let mut bytes = Vec::new();
        if r.is_extended() {
            bytes.push(0x41);
        }
        bytes.push(0x50 + r.low3());
        let mut insn = self.insn(
            bytes,
            OpcodeClass::Int,
            "push",
            gprs(&[r, Gpr::Sp]),
            gprs(&[Gpr::Sp]),
        );
        insn.operands.push(Operand::register(self.reg(r)));
        Ok(insn)
    }

    pub fn pop(&self, r: Gpr) -> Result<Instruction, EncodeError> {
        self.check("pop", r)?;
        let mut bytes = Vec::new();
        if r.is_extended() {
            bytes.push(0x41);
        }
        bytes.push(0x58 + r.low3());
        let mut insn = self.insn(
            bytes,
            OpcodeClass::Int,
            "pop",
            gprs(&[Gpr::Sp]),
            gprs(&[r, Gpr::Sp]),
        );
        insn.operands.push(Operand::register(self.reg(r)));
        Ok(insn)
    }

    pub fn pushf(&self) -> Instruction {
        self.insn(
            vec![0x9c],
            OpcodeClass::Int,
            "pushf",
            gprs(&[Gpr::Sp]) | RegSet::from_masks(0, ALL_FLAGS),
            gprs(&[Gpr::Sp]),
        )
    }

    pub fn popf(&self) -> Instruction {
        self.insn(
            vec![0x9d],
            OpcodeClass::Int,
            "popf",
            gprs(&[Gpr::Sp]),
            gprs(&[Gpr::Sp]) | RegSet::from_masks(0, ALL_FLAGS),
        )
    }

    /// AH <- SF:ZF:0:AF:0:PF:1:CF
    pub fn lahf(&self) -> Instruction {
        self.insn(
            vec![0x9f],
            OpcodeClass::Int,
            "lahf",
            gprs(&[Gpr::Ax]) | RegSet::from_masks(0, AH_FLAGS),
            gprs(&[Gpr::Ax]),
        )
    }

    pub fn sahf(&self) -> Instruction {
        self.insn(
            vec![0x9e],
            OpcodeClass::Int,
            "sahf",
            gprs(&[Gpr::Ax]),
            RegSet::from_masks(0, AH_FLAGS),
        )
    }

    pub fn ret(&self) -> Instruction {
        self.insn(
            vec![0xc3],
            OpcodeClass::Return,
            "ret",
            gprs(&[Gpr::Sp]),
            gprs(&[Gpr::Sp]),
        )
    }

    pub fn int3(&self) -> Instruction {
        self.insn(vec![0xcc], OpcodeClass::Trap, "int3", RegSet::EMPTY, RegSet::EMPTY)
    }

    /// Load an immediate into a full-width register using the shortest form.
    pub fn mov_imm(&self, r: Gpr, imm: i64) -> Result<Instruction, EncodeError> {
        self.check("mov", r)?;
        let mut bytes = Vec::new();
        let imm_offset;
        let imm_width;
        if self.is_64() && !(0..=u32::MAX as i64).contains(&imm) {
            if fits_i32(imm) {
                // REX.W C7 /0, sign-extended imm32
                bytes.push(0x48 | if r.is_extended() { 1 } else { 0 });
                bytes.extend_from_slice(&[0xc7, 0xc0 | r.low3()]);
                imm_offset = bytes.len();
                imm_width = 4;
                bytes.extend_from_slice(&(imm as i32).to_le_bytes());
            } else {
                bytes.push(0x48 | if r.is_extended() { 1 } else { 0 });
                bytes.push(0xb8 + r.low3());
                imm_offset = bytes.len();
                imm_width = 8;
                bytes.extend_from_slice(&imm.to_le_bytes());
            }
        } else {
            if !self.is_64() && !fits_i32(imm) && !(0..=u32::MAX as i64).contains(&imm) {
                return Err(EncodeError::Overflow { value: imm, bytes: 4 });
            }
            if r.is_extended() {
                bytes.push(0x41);
            }
            bytes.push(0xb8 + r.low3());
            imm_offset = bytes.len();
            imm_width = 4;
            bytes.extend_from_slice(&(imm as u32).to_le_bytes());
        }
        let mut insn = self.insn(bytes, OpcodeClass::Int, "mov", RegSet::EMPTY, gprs(&[r]));
        insn.operands.push(Operand::register(self.reg(r)));
        insn.operands
            .push(Operand::immediate(imm, imm_offset as u8, imm_width));
        Ok(insn)
    }

    /// Register to register move: GPRs of equal width, segment registers to or
    /// from a GPR, MMX and XMM registers within their own file.
    pub fn mov_reg(&self, dst: Register, src: Register) -> Result<Instruction, EncodeError> {
        let unsupported = |register| EncodeError::UnsupportedRegister {
            mnemonic: "mov",
            register,
        };
        let ext_ok = |r: Register| self.is_64() || r.num < 8;
        if !ext_ok(dst) {
            return Err(unsupported(dst));
        }
        if !ext_ok(src) {
            return Err(unsupported(src));
        }

        let mut bytes = Vec::new();
        let modrm = |reg: u8, rm: u8| 0xc0 | ((reg & 7) << 3) | (rm & 7);
        let mut uses = RegSet::EMPTY;
        let mut defs = RegSet::EMPTY;
        let (mnemonic, class) = match (dst.gpr(), src.gpr(), dst.class, src.class) {
            (Some(d), Some(s), _, _) => {
                let width = dst.width();
                if width != src.width()
                    || dst.class == RegClass::Gpr8High
                    || src.class == RegClass::Gpr8High
                {
                    return Err(unsupported(src));
                }
                if width == 2 {
                    bytes.push(0x66);
                }
                let byte_regs_need_rex = width == 1 && (dst.num >= 4 || src.num >= 4);
                match self.rex(width == 8, src.num, 0, dst.num) {
                    Some(rex) => bytes.push(rex),
                    None if byte_regs_need_rex && self.is_64() => bytes.push(0x40),
                    None if byte_regs_need_rex => return Err(unsupported(src)),
                    None => {}
                }
                bytes.push(if width == 1 { 0x88 } else { 0x89 });
                bytes.push(modrm(src.num, dst.num));
                uses.insert_gpr(s);
                defs.insert_gpr(d);
                if dst.is_partial_gpr() {
                    uses.insert_gpr(d);
                }
                ("mov", OpcodeClass::Int)
            }
            (None, Some(s), RegClass::Segment, _) => {
                if let Some(rex) = self.rex(false, 0, 0, src.num) {
                    bytes.push(rex);
                }
                bytes.extend_from_slice(&[0x8e, modrm(dst.num, src.num)]);
                uses.insert_gpr(s);
                ("mov", OpcodeClass::Int)
            }
            (Some(d), None, _, RegClass::Segment) => {
                if let Some(rex) = self.rex(false, 0, 0, dst.num) {
                    bytes.push(rex);
                }
                bytes.extend_from_slice(&[0x8c, modrm(src.num, dst.num)]);
                defs.insert_gpr(d);
                ("mov", OpcodeClass::Int)
            }
            (None, None, RegClass::Xmm, RegClass::Xmm) => {
                if let Some(rex) = self.rex(false, dst.num, 0, src.num) {
                    bytes.push(rex);
                }
                bytes.extend_from_slice(&[0x0f, 0x28, modrm(dst.num, src.num)]);
                ("movaps", OpcodeClass::Simd)
            }
            (None, None, RegClass::Mmx, RegClass::Mmx) => {
                bytes.extend_from_slice(&[0x0f, 0x6f, modrm(dst.num, src.num)]);
                ("movq", OpcodeClass::Simd)
            }
            _ => return Err(unsupported(dst)),
        };
        let mut insn = self.insn(bytes, class, mnemonic, uses, defs);
        insn.operands.push(Operand::register(dst));
        insn.operands.push(Operand::register(src));
        Ok(insn)
    }

    /// ModRM (+SIB) and displacement for `[base+disp]`.
    fn base_disp(&self, bytes: &mut Vec<u8>, reg: u8, base: Gpr, disp: i64) -> Result<Operand, EncodeError> {
        if !fits_i32(disp) {
            return Err(EncodeError::Overflow { value: disp, bytes: 4 });
        }
        let low = base.low3();
        let (md, disp_len) = if disp == 0 && low != 5 {
            (0u8, 0u8)
        } else if fits_i8(disp) {
            (1, 1)
        } else {
            (2, 4)
        };
        bytes.push((md << 6) | ((reg & 7) << 3) | low);
        if low == 4 {
            bytes.push(0x24);
        }
        let offset = bytes.len() as u8;
        match disp_len {
            1 => bytes.push(disp as i8 as u8),
            4 => bytes.extend_from_slice(&(disp as i32).to_le_bytes()),
            _ => {}
        }
        let mem = MemRef {
            base: Some(self.reg(base)),
            index: None,
            scale: 1,
            rip_relative: false,
        };
        Ok(Operand::memory(
            mem,
            disp,
            if disp_len == 0 { 0 } else { offset },
            disp_len,
        ))
    }

    /// ModRM for an absolute address: `[disp32]` in 32-bit mode, SIB with no
    /// base or index in 64-bit mode.
    fn absolute(&self, bytes: &mut Vec<u8>, reg: u8, addr: Address) -> Result<Operand, EncodeError> {
        let value = addr as i64;
        let representable = if self.is_64() {
            fits_i32(value)
        } else {
            addr <= u32::MAX as u64
        };
        if !representable {
            return Err(EncodeError::Overflow { value, bytes: 4 });
        }
        if self.is_64() {
            bytes.extend_from_slice(&[0x04 | ((reg & 7) << 3), 0x25]);
        } else {
            bytes.push(0x05 | ((reg & 7) << 3));
        }
        let offset = bytes.len() as u8;
        bytes.extend_from_slice(&(addr as u32).to_le_bytes());
        Ok(Operand::memory(MemRef::default(), value, offset, 4))
    }

    /// `mov [addr], r`
    pub fn mov_reg_to_abs(&self, src: Gpr, addr: Address) -> Result<Instruction, EncodeError> {
        self.check("mov", src)?;
        let mut bytes = Vec::new();
        if let Some(rex) = self.rex(self.is_64(), src.index(), 0, 0) {
            bytes.push(rex);
        }
        bytes.push(0x89);
        let mem = self.absolute(&mut bytes, src.low3(), addr)?;
        let mut insn = self.insn(bytes, OpcodeClass::Int, "mov", gprs(&[src]), RegSet::EMPTY);
        insn.operands.push(mem);
        insn.operands.push(Operand::register(self.reg(src)));
        Ok(insn)
    }

    /// `mov r, [addr]`
    pub fn mov_abs_to_reg(&self, dst: Gpr, addr: Address) -> Result<Instruction, EncodeError> {
        self.check("mov", dst)?;
        let mut bytes = Vec::new();
        if let Some(rex) = self.rex(self.is_64(), dst.index(), 0, 0) {
            bytes.push(rex);
        }
        bytes.push(0x8b);
        let mem = self.absolute(&mut bytes, dst.low3(), addr)?;
        let mut insn = self.insn(bytes, OpcodeClass::Int, "mov", RegSet::EMPTY, gprs(&[dst]));
        insn.operands.push(Operand::register(self.reg(dst)));
        insn.operands.push(mem);
        Ok(insn)
    }

    /// `mov [base+disp], r`
    pub fn mov_reg_to_mem(&self, src: Gpr, base: Gpr, disp: i64) -> Result<Instruction, EncodeError> {
        self.check("mov", src)?;
        self.check("mov", base)?;
        let mut bytes = Vec::new();
        if let Some(rex) = self.rex(self.is_64(), src.index(), 0, base.index()) {
            bytes.push(rex);
        }
        bytes.push(0x89);
        let mem = self.base_disp(&mut bytes, src.low3(), base, disp)?;
        let mut insn = self.insn(bytes, OpcodeClass::Int, "mov", gprs(&[src, base]), RegSet::EMPTY);
        insn.operands.push(mem);
        insn.operands.push(Operand::register(self.reg(src)));
        Ok(insn)
    }

    /// `mov r, [base+disp]`
    pub fn mov_mem_to_reg(&self, dst: Gpr, base: Gpr, disp: i64) -> Result<Instruction, EncodeError> {
        self.check("mov", dst)?;
        self.check("mov", base)?;
        let mut bytes = Vec::new();
        if let Some(rex) = self.rex(self.is_64(), dst.index(), 0, base.index()) {
            bytes.push(rex);
        }
        bytes.push(0x8b);
        let mem = self.base_disp(&mut bytes, dst.low3(), base, disp)?;
        let mut insn = self.insn(bytes, OpcodeClass::Int, "mov", gprs(&[base]), gprs(&[dst]));
        insn.operands.push(Operand::register(self.reg(dst)));
        insn.operands.push(mem);
        Ok(insn)
    }

    /// `lea r, [base+disp]`; adjusts a register without touching flags.
    pub fn lea(&self, dst: Gpr, base: Gpr, disp: i64) -> Result<Instruction, EncodeError> {
        self.check("lea", dst)?;
        self.check("lea", base)?;
        let mut bytes = Vec::new();
        if let Some(rex) = self.rex(self.is_64(), dst.index(), 0, base.index()) {
            bytes.push(rex);
        }
        bytes.push(0x8d);
        let mem = self.base_disp(&mut bytes, dst.low3(), base, disp)?;
        let mut insn = self.insn(bytes, OpcodeClass::Int, "lea", gprs(&[base]), gprs(&[dst]));
        insn.operands.push(Operand::register(self.reg(dst)));
        insn.operands.push(mem);
        Ok(insn)
    }

    /// Stack pointer adjustment by `delta` bytes through lea.
    pub fn adjust_stack(&self, delta: i64) -> Result<Instruction, EncodeError> {
        self.lea(Gpr::Sp, Gpr::Sp, delta)
    }

    /// `add word-sized [addr], imm8`. In 64-bit mode the address is reached
    /// RIP-relative from `at`, the address the instruction will occupy.
    pub fn add_imm8_abs(&self, at: Address, addr: Address, imm: i8) -> Result<Instruction, EncodeError> {
        let mut bytes = Vec::new();
        let mem = if self.is_64() {
            bytes.extend_from_slice(&[0x48, 0x83, 0x05]);
            let offset = bytes.len() as u8;
            bytes.extend_from_slice(&[0; 4]);
            Operand::memory(
                MemRef {
                    rip_relative: true,
                    ..Default::default()
                },
                0,
                offset,
                4,
            )
        } else {
            bytes.push(0x83);
            self.absolute(&mut bytes, 0, addr)?
        };
        let imm_offset = bytes.len() as u8;
        bytes.push(imm as u8);
        let mut insn = self.insn(
            bytes,
            OpcodeClass::Int,
            "add",
            RegSet::EMPTY,
            RegSet::from_masks(0, STATUS),
        );
        insn.operands.push(mem);
        insn.operands
            .push(Operand::immediate(imm as i64, imm_offset, 1));
        insn.address = at;
        if self.is_64() {
            insn.set_relative_target(addr)?;
        }
        Ok(insn)
    }

    #[allow(clippy::too_many_arguments)]
    fn relative(
        &self,
        mut bytes: Vec<u8>,
        width: u8,
        at: Address,
        target: Address,
        class: OpcodeClass,
        mnemonic: &'static str,
        uses: RegSet,
        defs: RegSet,
    ) -> Result<Instruction, EncodeError> {
        let offset = bytes.len() as u8;
        bytes.extend(std::iter::repeat(0).take(width as usize));
        let mut insn = self.insn(bytes, class, mnemonic, uses, defs);
        insn.address = at;
        insn.operands.push(Operand::relative(0, offset, width));
        insn.set_relative_target(target)?;
        Ok(insn)
    }

    /// `jmp rel32` placed at `at`, reaching `target`.
    pub fn jmp_near(&self, at: Address, target: Address) -> Result<Instruction, EncodeError> {
        self.relative(
            vec![0xe9],
            4,
            at,
            target,
            OpcodeClass::UncondBranch,
            "jmp",
            RegSet::EMPTY,
            RegSet::EMPTY,
        )
    }

    /// Shortest `jmp` from `at` to `target`.
    pub fn jmp(&self, at: Address, target: Address) -> Result<Instruction, EncodeError> {
        let short = target.wrapping_sub(at + 2) as i64;
        if fits_i8(short) {
            self.relative(
                vec![0xeb],
                1,
                at,
                target,
                OpcodeClass::UncondBranch,
                "jmp",
                RegSet::EMPTY,
                RegSet::EMPTY,
            )
        } else {
            self.jmp_near(at, target)
        }
    }

    /// `call rel32` placed at `at`, reaching `target`.
    pub fn call(&self, at: Address, target: Address) -> Result<Instruction, EncodeError> {
        let (uses, defs) = call_effects(self.width);
        self.relative(vec![0xe8], 4, at, target, OpcodeClass::Call, "call", uses, defs)
    }

    /// Conditional jump on condition code `cc` (0..16), shortest form.
    pub fn jcc(&self, cc: u8, at: Address, target: Address) -> Result<Instruction, EncodeError> {
        let cc = cc & 0xf;
        let uses = RegSet::from_masks(0, condition_flags(cc));
        let short = target.wrapping_sub(at + 2) as i64;
        let mnemonic = jcc_mnemonic(cc);
        if fits_i8(short) {
            self.relative(
                vec![0x70 + cc],
                1,
                at,
                target,
                OpcodeClass::CondBranch,
                mnemonic,
                uses,
                RegSet::EMPTY,
            )
        } else {
            self.relative(
                vec![0x0f, 0x80 + cc],
                4,
                at,
                target,
                OpcodeClass::CondBranch,
                mnemonic,
                uses,
                RegSet::EMPTY,
            )
        }
    }
}
