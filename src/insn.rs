//! Decoded instruction model shared by the decoder, encoder, CFG and rewriter.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

use crate::encoder::EncodeError;
use crate::{Address, TargetWidth};

/// Maximum number of explicit operands recorded per instruction.
pub const MAX_OPERANDS: usize = 3;

/// Opcode class taxonomy used for control-flow and instrumentation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeClass {
    /// Integer / general purpose
    Int,
    /// x87 floating point
    Float,
    /// MMX / SSE / AVX
    Simd,
    /// Conditional branch (jcc, loop, jcxz)
    CondBranch,
    /// Unconditional branch (direct or indirect)
    UncondBranch,
    /// Call
    Call,
    /// Return
    Return,
    /// System call (syscall, sysenter, int imm8)
    Syscall,
    /// Trap (int3, into, ud2, int1)
    Trap,
    /// Halt
    Halt,
    /// No-op (including hint no-ops)
    Nop,
    /// Byte sequence that matches no opcode
    Invalid,
    /// Known but unclassified (system and privileged instructions)
    Unknown,
}

impl fmt::Display for OpcodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpcodeClass::Int => "int",
            OpcodeClass::Float => "float",
            OpcodeClass::Simd => "simd",
            OpcodeClass::CondBranch => "cond_branch",
            OpcodeClass::UncondBranch => "uncond_branch",
            OpcodeClass::Call => "call",
            OpcodeClass::Return => "return",
            OpcodeClass::Syscall => "syscall",
            OpcodeClass::Trap => "trap",
            OpcodeClass::Halt => "halt",
            OpcodeClass::Nop => "nop",
            OpcodeClass::Invalid => "invalid",
            OpcodeClass::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Where the bytes of an instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteSource {
    /// Decoded from the original program text
    #[default]
    Application,
    /// Original bytes that were not decoded as code (padding, embedded data)
    ApplicationFreeText,
    /// Generated by the encoder for instrumentation
    Instrumentation,
}

/// General purpose registers, numbered as in the ModRM encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Gpr {
    Ax = 0,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Ax,
        Gpr::Cx,
        Gpr::Dx,
        Gpr::Bx,
        Gpr::Sp,
        Gpr::Bp,
        Gpr::Si,
        Gpr::Di,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Register with the given encoding number (0..16).
    pub fn from_index(n: u8) -> Option<Gpr> {
        Self::ALL.get(n as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Low three bits of the encoding.
    pub fn low3(self) -> u8 {
        self as u8 & 7
    }

    /// True for r8..r15, which need a REX prefix.
    pub fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    /// Single-bit mask used by the decoder tables.
    pub const fn mask(self) -> u16 {
        1 << self as u8
    }
}

/// Arithmetic status and control flags, numbered by their EFLAGS bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Flag {
    Cf = 0,
    Pf = 2,
    Af = 4,
    Zf = 6,
    Sf = 7,
    Tf = 8,
    If = 9,
    Df = 10,
    Of = 11,
}

impl Flag {
    pub const ALL: [Flag; 9] = [
        Flag::Cf,
        Flag::Pf,
        Flag::Af,
        Flag::Zf,
        Flag::Sf,
        Flag::Tf,
        Flag::If,
        Flag::Df,
        Flag::Of,
    ];

    pub const fn mask(self) -> u16 {
        1 << self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::Cf => "CF",
            Flag::Pf => "PF",
            Flag::Af => "AF",
            Flag::Zf => "ZF",
            Flag::Sf => "SF",
            Flag::Tf => "TF",
            Flag::If => "IF",
            Flag::Df => "DF",
            Flag::Of => "OF",
        }
    }
}

/// EFLAGS masks.
pub mod flags {
    use super::Flag;

    pub const CF: u16 = Flag::Cf.mask();
    pub const PF: u16 = Flag::Pf.mask();
    pub const AF: u16 = Flag::Af.mask();
    pub const ZF: u16 = Flag::Zf.mask();
    pub const SF: u16 = Flag::Sf.mask();
    pub const TF: u16 = Flag::Tf.mask();
    pub const IF: u16 = Flag::If.mask();
    pub const DF: u16 = Flag::Df.mask();
    pub const OF: u16 = Flag::Of.mask();
    /// The six arithmetic status flags.
    pub const STATUS: u16 = CF | PF | AF | ZF | SF | OF;
    /// Flags transferred by lahf / sahf.
    pub const AH_FLAGS: u16 = CF | PF | AF | ZF | SF;
    /// Every tracked flag.
    pub const ALL: u16 = STATUS | TF | IF | DF;
}

/// A set of general purpose registers and flags.
///
/// Bits 0..16 hold GPRs by encoding number, bits 16..28 hold EFLAGS bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u32);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub const fn from_masks(gprs: u16, flag_bits: u16) -> Self {
        RegSet(gprs as u32 | (((flag_bits & flags::ALL) as u32) << 16))
    }

    /// Every GPR and every tracked flag.
    pub const fn all() -> Self {
        Self::from_masks(0xffff, flags::ALL)
    }

    pub fn gpr_mask(self) -> u16 {
        self.0 as u16
    }

    pub fn flag_mask(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn insert_gpr(&mut self, r: Gpr) {
        self.0 |= 1 << r as u32;
    }

    pub fn insert_flag(&mut self, f: Flag) {
        self.0 |= 1 << (16 + f as u32);
    }

    pub fn remove_gpr(&mut self, r: Gpr) {
        self.0 &= !(1 << r as u32);
    }

    pub fn remove_flag(&mut self, f: Flag) {
        self.0 &= !(1 << (16 + f as u32));
    }

    pub fn contains_gpr(self, r: Gpr) -> bool {
        self.0 & (1 << r as u32) != 0
    }

    pub fn contains_flag(self, f: Flag) -> bool {
        self.0 & (1 << (16 + f as u32)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn gprs(self) -> impl Iterator<Item = Gpr> {
        Gpr::ALL.into_iter().filter(move |r| self.contains_gpr(*r))
    }

    pub fn flags(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.into_iter().filter(move |f| self.contains_flag(*f))
    }

    /// Only the GPR half of the set.
    pub fn gprs_only(self) -> RegSet {
        RegSet(self.0 & 0xffff)
    }

    /// Only the flags half of the set.
    pub fn flags_only(self) -> RegSet {
        RegSet(self.0 & !0xffff)
    }

    pub fn has_flags(self) -> bool {
        self.flag_mask() != 0
    }
}

impl BitOr for RegSet {
    type Output = RegSet;
    fn bitor(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegSet {
    fn bitor_assign(&mut self, rhs: RegSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegSet {
    type Output = RegSet;
    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & rhs.0)
    }
}

impl Sub for RegSet {
    type Output = RegSet;
    fn sub(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & !rhs.0)
    }
}

impl Not for RegSet {
    type Output = RegSet;
    fn not(self) -> RegSet {
        RegSet(!self.0) & RegSet::all()
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for r in self.gprs() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", Register::gpr64(r))?;
            first = false;
        }
        for fl in self.flags() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", fl.name())?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// Registers and flags a call reads and clobbers under the platform calling
/// convention (SysV for 64-bit, cdecl / regparm for 32-bit).
pub fn call_effects(width: TargetWidth) -> (RegSet, RegSet) {
    let mask = |regs: &[Gpr]| regs.iter().fold(0u16, |m, r| m | r.mask());
    match width {
        TargetWidth::Bits64 => (
            RegSet::from_masks(
                mask(&[Gpr::Di, Gpr::Si, Gpr::Dx, Gpr::Cx, Gpr::R8, Gpr::R9, Gpr::Ax, Gpr::Sp]),
                0,
            ),
            RegSet::from_masks(
                mask(&[
                    Gpr::Ax,
                    Gpr::Cx,
                    Gpr::Dx,
                    Gpr::Si,
                    Gpr::Di,
                    Gpr::R8,
                    Gpr::R9,
                    Gpr::R10,
                    Gpr::R11,
                    Gpr::Sp,
                ]),
                flags::STATUS,
            ),
        ),
        TargetWidth::Bits32 => (
            RegSet::from_masks(mask(&[Gpr::Ax, Gpr::Cx, Gpr::Dx, Gpr::Sp]), 0),
            RegSet::from_masks(mask(&[Gpr::Ax, Gpr::Cx, Gpr::Dx, Gpr::Sp]), flags::STATUS),
        ),
    }
}

/// Register file a register operand belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr8,
    /// ah, ch, dh, bh
    Gpr8High,
    Gpr16,
    Gpr32,
    Gpr64,
    Segment,
    Mmx,
    Xmm,
}

/// One architectural register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub class: RegClass,
    pub num: u8,
}

const GPR64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];
const GPR32_NAMES: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const GPR16_NAMES: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const GPR8_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const GPR8_HIGH_NAMES: [&str; 4] = ["ah", "ch", "dh", "bh"];
const SEGMENT_NAMES: [&str; 8] = ["es", "cs", "ss", "ds", "fs", "gs", "?s6", "?s7"];
const MMX_NAMES: [&str; 8] = ["mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7"];
const XMM_NAMES: [&str; 32] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15", "xmm16", "xmm17", "xmm18", "xmm19", "xmm20",
    "xmm21", "xmm22", "xmm23", "xmm24", "xmm25", "xmm26", "xmm27", "xmm28", "xmm29", "xmm30",
    "xmm31",
];

impl Register {
    pub const fn new(class: RegClass, num: u8) -> Self {
        Self { class, num }
    }

    pub const fn gpr64(r: Gpr) -> Self {
        Self::new(RegClass::Gpr64, r as u8)
    }

    pub const fn gpr32(r: Gpr) -> Self {
        Self::new(RegClass::Gpr32, r as u8)
    }

    /// GPR of the given width in bytes (1, 2, 4, 8).
    pub fn gpr_sized(r: Gpr, bytes: u8) -> Self {
        let class = match bytes {
            1 => RegClass::Gpr8,
            2 => RegClass::Gpr16,
            4 => RegClass::Gpr32,
            _ => RegClass::Gpr64,
        };
        Self::new(class, r as u8)
    }

    /// The general purpose register this operand reads or writes, if any.
    pub fn gpr(self) -> Option<Gpr> {
        match self.class {
            RegClass::Gpr8 | RegClass::Gpr16 | RegClass::Gpr32 | RegClass::Gpr64 => {
                Gpr::from_index(self.num)
            }
            RegClass::Gpr8High => Gpr::from_index(self.num),
            _ => None,
        }
    }

    /// Width in bytes for GPRs, zero otherwise.
    pub fn width(self) -> u8 {
        match self.class {
            RegClass::Gpr8 | RegClass::Gpr8High => 1,
            RegClass::Gpr16 | RegClass::Segment => 2,
            RegClass::Gpr32 => 4,
            RegClass::Gpr64 | RegClass::Mmx => 8,
            RegClass::Xmm => 16,
        }
    }

    /// Writes to this register leave part of the containing GPR intact.
    pub fn is_partial_gpr(self) -> bool {
        matches!(
            self.class,
            RegClass::Gpr8 | RegClass::Gpr8High | RegClass::Gpr16
        )
    }

    pub fn name(self) -> &'static str {
        let n = self.num as usize;
        match self.class {
            RegClass::Gpr64 => GPR64_NAMES.get(n),
            RegClass::Gpr32 => GPR32_NAMES.get(n),
            RegClass::Gpr16 => GPR16_NAMES.get(n),
            RegClass::Gpr8 => GPR8_NAMES.get(n),
            RegClass::Gpr8High => GPR8_HIGH_NAMES.get(n),
            RegClass::Segment => SEGMENT_NAMES.get(n),
            RegClass::Mmx => MMX_NAMES.get(n),
            RegClass::Xmm => XMM_NAMES.get(n),
        }
        .copied()
        .unwrap_or("?")
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Address computation of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemRef {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    /// Displacement is relative to the next instruction's address.
    pub rip_relative: bool,
}

impl MemRef {
    /// GPRs read to form the address.
    pub fn address_regs(&self) -> RegSet {
        let mut set = RegSet::EMPTY;
        for r in [self.base, self.index].into_iter().flatten() {
            if let Some(g) = r.gpr() {
                set.insert_gpr(g);
            }
        }
        set
    }
}

/// What an operand denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Register(Register),
    Immediate,
    Memory(MemRef),
    /// Branch displacement relative to the end of the instruction
    Relative,
}

/// One explicit operand.
///
/// `offset` and `width` locate the encoded immediate or displacement inside the
/// instruction bytes (both zero for pure register operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    pub value: i64,
    pub offset: u8,
    pub width: u8,
}

impl Operand {
    pub fn register(reg: Register) -> Self {
        Self {
            kind: OperandKind::Register(reg),
            value: 0,
            offset: 0,
            width: 0,
        }
    }

    pub fn immediate(value: i64, offset: u8, width: u8) -> Self {
        Self {
            kind: OperandKind::Immediate,
            value,
            offset,
            width,
        }
    }

    pub fn memory(mem: MemRef, disp: i64, offset: u8, width: u8) -> Self {
        Self {
            kind: OperandKind::Memory(mem),
            value: disp,
            offset,
            width,
        }
    }

    pub fn relative(disp: i64, offset: u8, width: u8) -> Self {
        Self {
            kind: OperandKind::Relative,
            value: disp,
            offset,
            width,
        }
    }

    /// Carries a displacement measured from the end of the instruction.
    pub fn is_relative(&self) -> bool {
        match self.kind {
            OperandKind::Relative => true,
            OperandKind::Memory(m) => m.rip_relative,
            _ => false,
        }
    }

    pub fn reg(&self) -> Option<Register> {
        match self.kind {
            OperandKind::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn mem(&self) -> Option<&MemRef> {
        match &self.kind {
            OperandKind::Memory(m) => Some(m),
            _ => None,
        }
    }
}

fn fmt_signed_hex(f: &mut fmt::Formatter<'_>, v: i64) -> fmt::Result {
    if v < 0 {
        write!(f, "-0x{:x}", v.unsigned_abs())
    } else {
        write!(f, "0x{:x}", v)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OperandKind::Register(r) => write!(f, "{}", r),
            OperandKind::Immediate | OperandKind::Relative => fmt_signed_hex(f, self.value),
            OperandKind::Memory(m) => {
                write!(f, "[")?;
                let mut wrote = false;
                if m.rip_relative {
                    write!(f, "rip")?;
                    wrote = true;
                }
                if let Some(b) = m.base {
                    write!(f, "{}", b)?;
                    wrote = true;
                }
                if let Some(i) = m.index {
                    if wrote {
                        write!(f, "+")?;
                    }
                    write!(f, "{}*{}", i, m.scale)?;
                    wrote = true;
                }
                if self.value != 0 || !wrote {
                    if wrote && self.value >= 0 {
                        write!(f, "+")?;
                    }
                    fmt_signed_hex(f, self.value)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One x86 instruction with its bytes, classification and dataflow summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: Address,
    pub bytes: Vec<u8>,
    pub class: OpcodeClass,
    pub mnemonic: &'static str,
    pub operands: Vec<Operand>,
    pub source: ByteSource,
    /// Registers and flags read
    pub uses: RegSet,
    /// Registers and flags written
    pub defs: RegSet,
}

impl Instruction {
    /// A bare instruction; operands and dataflow sets are filled by the caller.
    pub fn new(address: Address, bytes: Vec<u8>, class: OpcodeClass, mnemonic: &'static str) -> Self {
        Self {
            address,
            bytes,
            class,
            mnemonic,
            operands: Vec::new(),
            source: ByteSource::Application,
            uses: RegSet::EMPTY,
            defs: RegSet::EMPTY,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Address of the next sequential instruction.
    pub fn end(&self) -> Address {
        self.address + self.bytes.len() as Address
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.end()
    }

    pub fn is_cond_branch(&self) -> bool {
        self.class == OpcodeClass::CondBranch
    }

    pub fn is_uncond_branch(&self) -> bool {
        self.class == OpcodeClass::UncondBranch
    }

    pub fn is_branch(&self) -> bool {
        self.is_cond_branch() || self.is_uncond_branch()
    }

    pub fn is_call(&self) -> bool {
        self.class == OpcodeClass::Call
    }

    pub fn is_return(&self) -> bool {
        self.class == OpcodeClass::Return
    }

    pub fn is_nop(&self) -> bool {
        self.class == OpcodeClass::Nop
    }

    pub fn is_invalid(&self) -> bool {
        self.class == OpcodeClass::Invalid
    }

    /// Transfers control: branches, calls, returns and system calls.
    pub fn is_control(&self) -> bool {
        matches!(
            self.class,
            OpcodeClass::CondBranch
                | OpcodeClass::UncondBranch
                | OpcodeClass::Call
                | OpcodeClass::Return
                | OpcodeClass::Syscall
        )
    }

    /// Execution may continue at `end()`.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.class,
            OpcodeClass::UncondBranch | OpcodeClass::Return | OpcodeClass::Halt | OpcodeClass::Invalid
        ) && self.mnemonic != "ud2"
    }

    /// Index of the operand holding a relative or RIP-relative displacement.
    pub fn relative_operand_index(&self) -> Option<usize> {
        self.operands.iter().position(|op| op.is_relative())
    }

    pub fn relative_operand(&self) -> Option<&Operand> {
        self.operands.iter().find(|op| op.is_relative())
    }

    pub fn uses_relative_address(&self) -> bool {
        self.relative_operand().is_some()
    }

    /// Width in bytes of the relative displacement, zero if none.
    pub fn bytes_used_for_target(&self) -> u8 {
        self.relative_operand().map(|op| op.width).unwrap_or(0)
    }

    /// Absolute address referenced through the relative operand.
    pub fn relative_target(&self) -> Option<Address> {
        self.relative_operand()
            .map(|op| self.end().wrapping_add(op.value as u64))
    }

    /// Target of a direct branch or call.
    pub fn control_target(&self) -> Option<Address> {
        if !(self.is_branch() || self.is_call()) {
            return None;
        }
        self.operands
            .iter()
            .find(|op| op.kind == OperandKind::Relative)
            .map(|op| self.end().wrapping_add(op.value as u64))
    }

    /// Branch through a register or memory operand.
    pub fn is_indirect_branch(&self) -> bool {
        self.is_branch()
            && self.operands.iter().any(|op| {
                matches!(op.kind, OperandKind::Register(_) | OperandKind::Memory(_))
            })
    }

    /// Can be moved to another address. Short branches without a rel32 form
    /// (loop, jcxz) and undecodable bytes cannot.
    pub fn is_relocatable(&self) -> bool {
        if self.is_invalid() {
            return false;
        }
        match self.relative_operand() {
            Some(op) if op.kind == OperandKind::Relative && op.width < 4 => {
                let opcode = op
                    .offset
                    .checked_sub(1)
                    .and_then(|at| self.bytes.get(at as usize).copied());
                matches!(opcode, Some(0xeb | 0x70..=0x7f))
            }
            _ => true,
        }
    }

    /// Candidate for jump-table resolution.
    pub fn is_jump_table_base(&self) -> bool {
        self.is_uncond_branch() && self.is_indirect_branch()
    }

    /// Re-encode the relative displacement so that it reaches `target`
    /// from the instruction's current address.
    pub fn set_relative_target(&mut self, target: Address) -> Result<(), EncodeError> {
        let end = self.end();
        let address = self.address;
        let Some(idx) = self.relative_operand_index() else {
            return Err(EncodeError::NoRelativeOperand { address });
        };
        let op = self.operands[idx];
        let disp = target.wrapping_sub(end) as i64;
        let fits = match op.width {
            1 => i8::try_from(disp).is_ok(),
            2 => i16::try_from(disp).is_ok(),
            4 => i32::try_from(disp).is_ok(),
            _ => true,
        };
        if !fits {
            return Err(EncodeError::Overflow {
                value: disp,
                bytes: op.width,
            });
        }
        let start = op.offset as usize;
        let le = disp.to_le_bytes();
        self.bytes[start..start + op.width as usize].copy_from_slice(&le[..op.width as usize]);
        self.operands[idx].value = disp;
        Ok(())
    }

    /// Move the instruction without changing what its relative operand refers to.
    pub fn relocate(&mut self, new_address: Address) -> Result<(), EncodeError> {
        match self.relative_target() {
            Some(target) => {
                self.address = new_address;
                self.set_relative_target(target)
            }
            None => {
                self.address = new_address;
                Ok(())
            }
        }
    }

    /// Convert a short (rel8) branch into its rel32 form, keeping its target.
    pub fn widen_target_operand(&mut self) -> Result<(), EncodeError> {
        let Some(idx) = self.relative_operand_index() else {
            return Ok(());
        };
        let op = self.operands[idx];
        if op.width >= 4 || op.kind != OperandKind::Relative {
            return Ok(());
        }
        let target = self.end().wrapping_add(op.value as u64);
        let opcode_at = op.offset as usize - 1;
        let prefixes = self.bytes[..opcode_at].to_vec();
        let opcode = self.bytes[opcode_at];
        let mut bytes = prefixes;
        match opcode {
            0xeb => bytes.push(0xe9),
            0x70..=0x7f => bytes.extend_from_slice(&[0x0f, 0x80 + (opcode - 0x70)]),
            _ => {
                return Err(EncodeError::Unwidenable {
                    address: self.address,
                    mnemonic: self.mnemonic,
                })
            }
        }
        let offset = bytes.len() as u8;
        bytes.extend_from_slice(&[0; 4]);
        self.bytes = bytes;
        self.operands[idx] = Operand::relative(0, offset, 4);
        self.set_relative_target(target)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}", if i == 0 { " " } else { ", " })?;
            match op.kind {
                OperandKind::Relative => write!(f, "0x{:x}", self.end().wrapping_add(op.value as u64))?,
                _ => write!(f, "{}", op)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_jmp(at: Address, disp: i8) -> Instruction {
        let mut insn = Instruction::new(at, vec![0xeb, disp as u8], OpcodeClass::UncondBranch, "jmp");
        insn.operands.push(Operand::relative(disp as i64, 1, 1));
        insn
    }

    #[test]
    fn test_regset_operations() {
        let mut a = RegSet::EMPTY;
        a.insert_gpr(Gpr::Ax);
        a.insert_flag(Flag::Zf);
        let mut b = RegSet::EMPTY;
        b.insert_gpr(Gpr::Ax);
        b.insert_gpr(Gpr::R12);

        assert_eq!((a & b).gprs().collect::<Vec<_>>(), vec![Gpr::Ax]);
        assert!((a - b).contains_flag(Flag::Zf));
        assert!(!(a - b).contains_gpr(Gpr::Ax));
        assert!((a | b).contains_gpr(Gpr::R12));
        assert_eq!(a.flags_only().flag_mask(), flags::ZF);
        assert!(RegSet::all().contains_flag(Flag::Of));
        assert!((!RegSet::all()).is_empty());
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Register::gpr64(Gpr::R9).name(), "r9");
        assert_eq!(Register::new(RegClass::Gpr8High, 0).name(), "ah");
        assert_eq!(Register::new(RegClass::Gpr8High, 0).gpr(), Some(Gpr::Ax));
        assert_eq!(Register::gpr_sized(Gpr::Si, 1).name(), "sil");
        assert!(Register::gpr_sized(Gpr::Si, 2).is_partial_gpr());
        assert!(!Register::gpr32(Gpr::Si).is_partial_gpr());
    }

    #[test]
    fn test_control_target_and_relocate() {
        let mut jmp = short_jmp(0x1000, 0x10);
        assert_eq!(jmp.control_target(), Some(0x1012));
        assert!(!jmp.falls_through());

        jmp.relocate(0x1008).unwrap();
        assert_eq!(jmp.control_target(), Some(0x1012));
        assert_eq!(jmp.bytes, vec![0xeb, 0x08]);

        // too far for a rel8 displacement
        assert!(matches!(
            jmp.relocate(0x9000),
            Err(EncodeError::Overflow { bytes: 1, .. })
        ));
    }

    #[test]
    fn test_widen_short_branches() {
        let mut jmp = short_jmp(0x1000, -2);
        jmp.widen_target_operand().unwrap();
        assert_eq!(jmp.size(), 5);
        assert_eq!(jmp.bytes[0], 0xe9);
        assert_eq!(jmp.control_target(), Some(0x1000));
        assert_eq!(jmp.bytes_used_for_target(), 4);

        let mut jne = Instruction::new(0x2000, vec![0x75, 0x05], OpcodeClass::CondBranch, "jne");
        jne.operands.push(Operand::relative(5, 1, 1));
        jne.widen_target_operand().unwrap();
        assert_eq!(&jne.bytes[..2], &[0x0f, 0x85]);
        assert_eq!(jne.control_target(), Some(0x2007));

        let mut lp = Instruction::new(0x3000, vec![0xe2, 0xfe], OpcodeClass::CondBranch, "loop");
        lp.operands.push(Operand::relative(-2, 1, 1));
        assert!(matches!(
            lp.widen_target_operand(),
            Err(EncodeError::Unwidenable { .. })
        ));
    }

    #[test]
    fn test_display() {
        let jmp = short_jmp(0x1000, 0x10);
        assert_eq!(jmp.to_string(), "jmp 0x1012");

        let mut mov = Instruction::new(0, vec![0x8b, 0x45, 0xf8], OpcodeClass::Int, "mov");
        mov.operands.push(Operand::register(Register::gpr32(Gpr::Ax)));
        mov.operands.push(Operand::memory(
            MemRef {
                base: Some(Register::gpr64(Gpr::Bp)),
                ..Default::default()
            },
            -8,
            2,
            1,
        ));
        assert_eq!(mov.to_string(), "mov eax, [rbp-0x8]");
    }
}
