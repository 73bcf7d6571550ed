//! Opcode tables: one-byte map, 0F map, ModRM.reg groups, x87 and
//! mandatory-prefix SIMD names.

use std::sync::OnceLock;

use crate::insn::flags::{AF, AH_FLAGS, ALL as ALL_FLAGS, CF, DF, IF, OF, PF, SF, STATUS, ZF};
use crate::insn::{Gpr, OpcodeClass};

use OpcodeClass::*;

/// Operand templates, named after the addressing-method codes of the
/// Intel opcode map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opnd {
    /// ModRM r/m, byte
    Eb,
    /// ModRM r/m, operand size
    Ev,
    /// ModRM r/m, word
    Ew,
    /// ModRM r/m, dword
    Ed,
    /// ModRM r/m, dword or qword with REX.W
    Ey,
    /// ModRM reg, byte
    Gb,
    /// ModRM reg, operand size
    Gv,
    /// ModRM reg, word
    Gw,
    /// ModRM reg, dword or qword with REX.W
    Gy,
    /// ModRM r/m, memory only
    M,
    /// Immediate byte
    Ib,
    /// Immediate word
    Iw,
    /// Immediate, 16 or 32 bits
    Iz,
    /// Immediate, full operand size (mov r, imm64)
    Iv,
    /// rel8
    Jb,
    /// rel16 / rel32
    Jz,
    /// Register in opcode low bits, byte
    Zb,
    /// Register in opcode low bits, operand size
    Zv,
    Al,
    /// rAX at operand size
    Ax,
    Cl,
    /// Port number register
    Dx,
    /// Implicit constant 1 (shift by one)
    One,
    /// Direct memory offset, byte
    Ob,
    /// Direct memory offset, operand size
    Ov,
    /// Segment register in ModRM reg
    Sw,
    /// Far pointer immediate
    Ap,
    /// SIMD register in ModRM reg
    Vx,
    /// SIMD register or memory in ModRM r/m
    Wx,
}

impl Opnd {
    pub(crate) fn needs_modrm(self) -> bool {
        matches!(
            self,
            Opnd::Eb
                | Opnd::Ev
                | Opnd::Ew
                | Opnd::Ed
                | Opnd::Ey
                | Opnd::Gb
                | Opnd::Gv
                | Opnd::Gw
                | Opnd::Gy
                | Opnd::M
                | Opnd::Sw
                | Opnd::Vx
                | Opnd::Wx
        )
    }
}

/// How explicit operands are accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// All operands read
    R,
    /// First operand written, the rest read
    W,
    /// First operand read and written, the rest read
    Rw,
    /// First two operands read and written
    Xchg,
    /// Operands are not accessed (lea-like hints, nop Ev)
    N,
}

/// ModRM.reg opcode extension groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Group {
    G1,
    G1a,
    G2,
    G3b,
    G3v,
    G4,
    G5,
    G6,
    G7,
    G8,
    G9,
    G11,
    G12,
    G15,
    G16,
}

/// Invalid in 64-bit mode.
pub(crate) const INV64: u8 = 1;
/// Default operand size is 64 bits in 64-bit mode.
pub(crate) const D64: u8 = 2;
/// Operand size forced to 64 bits in 64-bit mode.
pub(crate) const F64: u8 = 4;
/// Only valid in 64-bit mode.
pub(crate) const O64: u8 = 8;
/// ModRM r/m always names a register (mov to/from control registers).
pub(crate) const REG_ONLY: u8 = 16;
/// Mnemonic depends on the mandatory prefix.
pub(crate) const PREFIXED: u8 = 32;

/// One opcode table entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpSpec {
    pub mnemonic: &'static str,
    pub class: OpcodeClass,
    pub operands: &'static [Opnd],
    pub access: Access,
    pub flags_def: u16,
    pub flags_use: u16,
    pub regs_use: u16,
    pub regs_def: u16,
    pub attrs: u8,
    pub group: Option<Group>,
}

impl OpSpec {
    pub(crate) const INVALID: OpSpec = op("(bad)", Invalid, &[], Access::N);

    pub(crate) const fn fdef(mut self, f: u16) -> Self {
        self.flags_def |= f;
        self
    }

    pub(crate) const fn fuse(mut self, f: u16) -> Self {
        self.flags_use |= f;
        self
    }

    pub(crate) const fn uses(mut self, r: u16) -> Self {
        self.regs_use |= r;
        self
    }

    pub(crate) const fn defs(mut self, r: u16) -> Self {
        self.regs_def |= r;
        self
    }

    pub(crate) const fn attr(mut self, a: u8) -> Self {
        self.attrs |= a;
        self
    }

    pub(crate) const fn grp(mut self, g: Group) -> Self {
        self.group = Some(g);
        self
    }

    pub(crate) fn has(&self, a: u8) -> bool {
        self.attrs & a != 0
    }

    pub(crate) fn needs_modrm(&self) -> bool {
        self.group.is_some() || self.operands.iter().any(|o| o.needs_modrm())
    }
}

pub(crate) const fn op(
    mnemonic: &'static str,
    class: OpcodeClass,
    operands: &'static [Opnd],
    access: Access,
) -> OpSpec {
    OpSpec {
        mnemonic,
        class,
        operands,
        access,
        flags_def: 0,
        flags_use: 0,
        regs_use: 0,
        regs_def: 0,
        attrs: 0,
        group: None,
    }
}

const AX: u16 = Gpr::Ax.mask();
const CX: u16 = Gpr::Cx.mask();
const DX: u16 = Gpr::Dx.mask();
const BX: u16 = Gpr::Bx.mask();
const SP: u16 = Gpr::Sp.mask();
const BP: u16 = Gpr::Bp.mask();
const SI: u16 = Gpr::Si.mask();
const DI: u16 = Gpr::Di.mask();
const R8: u16 = Gpr::R8.mask();
const R9: u16 = Gpr::R9.mask();
const R10: u16 = Gpr::R10.mask();
const R11: u16 = Gpr::R11.mask();
const LEGACY8: u16 = AX | CX | DX | BX | SP | BP | SI | DI;

/// Flags read by a condition code (low nibble of jcc / setcc / cmovcc).
pub(crate) const fn condition_flags(cc: u8) -> u16 {
    match cc & 0xf {
        0x0 | 0x1 => OF,
        0x2 | 0x3 => CF,
        0x4 | 0x5 => ZF,
        0x6 | 0x7 => CF | ZF,
        0x8 | 0x9 => SF,
        0xa | 0xb => PF,
        0xc | 0xd => SF | OF,
        _ => ZF | SF | OF,
    }
}

const CC_NAMES: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

const JCC: [&str; 16] = [
    "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge",
    "jle", "jg",
];
const SETCC: [&str; 16] = [
    "seto", "setno", "setb", "setae", "sete", "setne", "setbe", "seta", "sets", "setns", "setp",
    "setnp", "setl", "setge", "setle", "setg",
];
const CMOVCC: [&str; 16] = [
    "cmovo", "cmovno", "cmovb", "cmovae", "cmove", "cmovne", "cmovbe", "cmova", "cmovs", "cmovns",
    "cmovp", "cmovnp", "cmovl", "cmovge", "cmovle", "cmovg",
];

/// Conditional jump mnemonic for a condition code.
pub(crate) fn jcc_mnemonic(cc: u8) -> &'static str {
    JCC[(cc & 0xf) as usize]
}

/// Short condition-code name, e.g. "ne".
pub(crate) fn condition_name(cc: u8) -> &'static str {
    CC_NAMES[(cc & 0xf) as usize]
}

pub(crate) fn one_byte(opcode: u8) -> &'static OpSpec {
    static TABLE: OnceLock<Vec<OpSpec>> = OnceLock::new();
    &TABLE.get_or_init(build_one_byte)[opcode as usize]
}

pub(crate) fn two_byte(opcode: u8) -> &'static OpSpec {
    static TABLE: OnceLock<Vec<OpSpec>> = OnceLock::new();
    &TABLE.get_or_init(build_two_byte)[opcode as usize]
}

fn build_one_byte() -> Vec<OpSpec> {
    use Access::*;
    use Opnd::*;

    let mut t = vec![OpSpec::INVALID; 256];

    let alu: [(&'static str, u16); 8] = [
        ("add", 0),
        ("or", 0),
        ("adc", CF),
        ("sbb", CF),
        ("and", 0),
        ("sub", 0),
        ("xor", 0),
        ("cmp", 0),
    ];
    for (i, (m, fu)) in alu.into_iter().enumerate() {
        let base = i * 8;
        let acc = if m == "cmp" { R } else { Rw };
        t[base] = op(m, Int, &[Eb, Gb], acc).fdef(STATUS).fuse(fu);
        t[base + 1] = op(m, Int, &[Ev, Gv], acc).fdef(STATUS).fuse(fu);
        t[base + 2] = op(m, Int, &[Gb, Eb], acc).fdef(STATUS).fuse(fu);
        t[base + 3] = op(m, Int, &[Gv, Ev], acc).fdef(STATUS).fuse(fu);
        t[base + 4] = op(m, Int, &[Al, Ib], acc).fdef(STATUS).fuse(fu);
        t[base + 5] = op(m, Int, &[Ax, Iz], acc).fdef(STATUS).fuse(fu);
    }

    t[0x06] = op("push", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x07] = op("pop", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x0e] = op("push", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x16] = op("push", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x17] = op("pop", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x1e] = op("push", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x1f] = op("pop", Int, &[], R).uses(SP).defs(SP).attr(INV64);
    t[0x27] = op("daa", Int, &[], R).uses(AX).defs(AX).fuse(CF | AF).fdef(STATUS).attr(INV64);
    t[0x2f] = op("das", Int, &[], R).uses(AX).defs(AX).fuse(CF | AF).fdef(STATUS).attr(INV64);
    t[0x37] = op("aaa", Int, &[], R).uses(AX).defs(AX).fuse(AF).fdef(STATUS).attr(INV64);
    t[0x3f] = op("aas", Int, &[], R).uses(AX).defs(AX).fuse(AF).fdef(STATUS).attr(INV64);

    for r in 0..8 {
        t[0x40 + r] = op("inc", Int, &[Zv], Rw).fdef(STATUS & !CF).attr(INV64);
        t[0x48 + r] = op("dec", Int, &[Zv], Rw).fdef(STATUS & !CF).attr(INV64);
        t[0x50 + r] = op("push", Int, &[Zv], R).uses(SP).defs(SP).attr(D64);
        t[0x58 + r] = op("pop", Int, &[Zv], W).uses(SP).defs(SP).attr(D64);
    }

    t[0x60] = op("pusha", Int, &[], R).uses(LEGACY8).defs(SP).attr(INV64);
    t[0x61] = op("popa", Int, &[], R).uses(SP).defs(LEGACY8).attr(INV64);
    t[0x62] = op("bound", Int, &[Gv, M], R).attr(INV64);
    t[0x63] = op("movsxd", Int, &[Gv, Ed], W);
    t[0x68] = op("push", Int, &[Iz], R).uses(SP).defs(SP).attr(D64);
    t[0x69] = op("imul", Int, &[Gv, Ev, Iz], W).fdef(STATUS);
    t[0x6a] = op("push", Int, &[Ib], R).uses(SP).defs(SP).attr(D64);
    t[0x6b] = op("imul", Int, &[Gv, Ev, Ib], W).fdef(STATUS);
    t[0x6c] = op("insb", Int, &[], R).uses(DX | DI).defs(DI).fuse(DF);
    t[0x6d] = op("insd", Int, &[], R).uses(DX | DI).defs(DI).fuse(DF);
    t[0x6e] = op("outsb", Int, &[], R).uses(DX | SI).defs(SI).fuse(DF);
    t[0x6f] = op("outsd", Int, &[], R).uses(DX | SI).defs(SI).fuse(DF);

    for cc in 0..16u8 {
        t[0x70 + cc as usize] = op(JCC[cc as usize], CondBranch, &[Jb], R)
            .fuse(condition_flags(cc))
            .attr(F64);
    }

    t[0x80] = op("", Int, &[Eb, Ib], Rw).grp(Group::G1);
    t[0x81] = op("", Int, &[Ev, Iz], Rw).grp(Group::G1);
    t[0x82] = op("", Int, &[Eb, Ib], Rw).grp(Group::G1).attr(INV64);
    t[0x83] = op("", Int, &[Ev, Ib], Rw).grp(Group::G1);
    t[0x84] = op("test", Int, &[Eb, Gb], R).fdef(STATUS);
    t[0x85] = op("test", Int, &[Ev, Gv], R).fdef(STATUS);
    t[0x86] = op("xchg", Int, &[Eb, Gb], Xchg);
    t[0x87] = op("xchg", Int, &[Ev, Gv], Xchg);
    t[0x88] = op("mov", Int, &[Eb, Gb], W);
    t[0x89] = op("mov", Int, &[Ev, Gv], W);
    t[0x8a] = op("mov", Int, &[Gb, Eb], W);
    t[0x8b] = op("mov", Int, &[Gv, Ev], W);
    t[0x8c] = op("mov", Int, &[Ev, Sw], W);
    t[0x8d] = op("lea", Int, &[Gv, M], W);
    t[0x8e] = op("mov", Int, &[Sw, Ew], W);
    t[0x8f] = op("", Int, &[Ev], W).grp(Group::G1a).attr(D64);

    t[0x90] = op("nop", Nop, &[], N);
    for r in 1..8 {
        t[0x90 + r] = op("xchg", Int, &[Zv, Ax], Xchg);
    }
    t[0x98] = op("cwde", Int, &[], R).uses(AX).defs(AX);
    t[0x99] = op("cdq", Int, &[], R).uses(AX).defs(DX);
    t[0x9a] = op("callf", Call, &[Ap], R).uses(SP).defs(SP).attr(INV64);
    t[0x9b] = op("fwait", Float, &[], N);
    t[0x9c] = op("pushf", Int, &[], R).uses(SP).defs(SP).fuse(ALL_FLAGS).attr(D64);
    t[0x9d] = op("popf", Int, &[], R).uses(SP).defs(SP).fdef(ALL_FLAGS).attr(D64);
    t[0x9e] = op("sahf", Int, &[], R).uses(AX).fdef(AH_FLAGS);
    t[0x9f] = op("lahf", Int, &[], R).uses(AX).defs(AX).fuse(AH_FLAGS);

    t[0xa0] = op("mov", Int, &[Al, Ob], W);
    t[0xa1] = op("mov", Int, &[Ax, Ov], W);
    t[0xa2] = op("mov", Int, &[Ob, Al], W);
    t[0xa3] = op("mov", Int, &[Ov, Ax], W);
    t[0xa4] = op("movsb", Int, &[], R).uses(SI | DI).defs(SI | DI).fuse(DF);
    t[0xa5] = op("movsd", Int, &[], R).uses(SI | DI).defs(SI | DI).fuse(DF);
    t[0xa6] = op("cmpsb", Int, &[], R).uses(SI | DI).defs(SI | DI).fuse(DF).fdef(STATUS);
    t[0xa7] = op("cmpsd", Int, &[], R).uses(SI | DI).defs(SI | DI).fuse(DF).fdef(STATUS);
    t[0xa8] = op("test", Int, &[Al, Ib], R).fdef(STATUS);
    t[0xa9] = op("test", Int, &[Ax, Iz], R).fdef(STATUS);
    t[0xaa] = op("stosb", Int, &[], R).uses(AX | DI).defs(DI).fuse(DF);
    t[0xab] = op("stosd", Int, &[], R).uses(AX | DI).defs(DI).fuse(DF);
    t[0xac] = op("lodsb", Int, &[], R).uses(AX | SI).defs(AX | SI).fuse(DF);
    t[0xad] = op("lodsd", Int, &[], R).uses(SI).defs(AX | SI).fuse(DF);
    t[0xae] = op("scasb", Int, &[], R).uses(AX | DI).defs(DI).fuse(DF).fdef(STATUS);
    t[0xaf] = op("scasd", Int, &[], R).uses(AX | DI).defs(DI).fuse(DF).fdef(STATUS);

    for r in 0..8 {
        t[0xb0 + r] = op("mov", Int, &[Zb, Ib], W);
        t[0xb8 + r] = op("mov", Int, &[Zv, Iv], W);
    }

    t[0xc0] = op("", Int, &[Eb, Ib], Rw).grp(Group::G2);
    t[0xc1] = op("", Int, &[Ev, Ib], Rw).grp(Group::G2);
    t[0xc2] = op("ret", Return, &[Iw], R).uses(SP).defs(SP).attr(F64);
    t[0xc3] = op("ret", Return, &[], R).uses(SP).defs(SP).attr(F64);
    t[0xc4] = op("les", Int, &[Gv, M], W).attr(INV64);
    t[0xc5] = op("lds", Int, &[Gv, M], W).attr(INV64);
    t[0xc6] = op("", Int, &[Eb, Ib], W).grp(Group::G11);
    t[0xc7] = op("", Int, &[Ev, Iz], W).grp(Group::G11);
    t[0xc8] = op("enter", Int, &[Iw, Ib], R).uses(SP | BP).defs(SP | BP);
    t[0xc9] = op("leave", Int, &[], R).uses(BP).defs(SP | BP).attr(D64);
    t[0xca] = op("retf", Return, &[Iw], R).uses(SP).defs(SP);
    t[0xcb] = op("retf", Return, &[], R).uses(SP).defs(SP);
    t[0xcc] = op("int3", Trap, &[], N);
    t[0xcd] = op("int", Syscall, &[Ib], R)
        .uses(AX | BX | CX | DX | SI | DI | BP)
        .defs(AX);
    t[0xce] = op("into", Trap, &[], N).fuse(OF).attr(INV64);
    t[0xcf] = op("iret", Return, &[], R).uses(SP).defs(SP).fdef(ALL_FLAGS);

    t[0xd0] = op("", Int, &[Eb, One], Rw).grp(Group::G2);
    t[0xd1] = op("", Int, &[Ev, One], Rw).grp(Group::G2);
    t[0xd2] = op("", Int, &[Eb, Cl], Rw).grp(Group::G2).fuse(STATUS);
    t[0xd3] = op("", Int, &[Ev, Cl], Rw).grp(Group::G2).fuse(STATUS);
    t[0xd4] = op("aam", Int, &[Ib], R).uses(AX).defs(AX).fdef(STATUS).attr(INV64);
    t[0xd5] = op("aad", Int, &[Ib], R).uses(AX).defs(AX).fdef(STATUS).attr(INV64);
    t[0xd7] = op("xlat", Int, &[], R).uses(AX | BX).defs(AX);
    // d8..df are dispatched to `x87`

    t[0xe0] = op("loopne", CondBranch, &[Jb], R).uses(CX).defs(CX).fuse(ZF).attr(F64);
    t[0xe1] = op("loope", CondBranch, &[Jb], R).uses(CX).defs(CX).fuse(ZF).attr(F64);
    t[0xe2] = op("loop", CondBranch, &[Jb], R).uses(CX).defs(CX).attr(F64);
    t[0xe3] = op("jecxz", CondBranch, &[Jb], R).uses(CX).attr(F64);
    t[0xe4] = op("in", Unknown, &[Al, Ib], W);
    t[0xe5] = op("in", Unknown, &[Ax, Ib], W);
    t[0xe6] = op("out", Unknown, &[Ib, Al], R);
    t[0xe7] = op("out", Unknown, &[Ib, Ax], R);
    t[0xe8] = op("call", Call, &[Jz], R).uses(SP).defs(SP).attr(F64);
    t[0xe9] = op("jmp", UncondBranch, &[Jz], R).attr(F64);
    t[0xea] = op("jmpf", UncondBranch, &[Ap], R).attr(INV64);
    t[0xeb] = op("jmp", UncondBranch, &[Jb], R).attr(F64);
    t[0xec] = op("in", Unknown, &[Al, Dx], W);
    t[0xed] = op("in", Unknown, &[Ax, Dx], W);
    t[0xee] = op("out", Unknown, &[Dx, Al], R);
    t[0xef] = op("out", Unknown, &[Dx, Ax], R);

    t[0xf1] = op("int1", Trap, &[], N);
    t[0xf4] = op("hlt", Halt, &[], N);
    t[0xf5] = op("cmc", Int, &[], N).fuse(CF).fdef(CF);
    t[0xf6] = op("", Int, &[Eb], Rw).grp(Group::G3b);
    t[0xf7] = op("", Int, &[Ev], Rw).grp(Group::G3v);
    t[0xf8] = op("clc", Int, &[], N).fdef(CF);
    t[0xf9] = op("stc", Int, &[], N).fdef(CF);
    t[0xfa] = op("cli", Unknown, &[], N).fdef(IF);
    t[0xfb] = op("sti", Unknown, &[], N).fdef(IF);
    t[0xfc] = op("cld", Int, &[], N).fdef(DF);
    t[0xfd] = op("std", Int, &[], N).fdef(DF);
    t[0xfe] = op("", Int, &[Eb], Rw).grp(Group::G4);
    t[0xff] = op("", Int, &[Ev], Rw).grp(Group::G5);

    t
}

fn build_two_byte() -> Vec<OpSpec> {
    use Access::*;
    use Opnd::*;

    // Anything left unset is a SIMD operation on V, W.
    let mut t = vec![op("simd", Simd, &[Vx, Wx], Rw).attr(PREFIXED); 256];

    t[0x00] = op("", Unknown, &[Ew], R).grp(Group::G6);
    t[0x01] = op("", Unknown, &[Ev], R).grp(Group::G7);
    t[0x02] = op("lar", Unknown, &[Gv, Ew], W).fdef(ZF);
    t[0x03] = op("lsl", Unknown, &[Gv, Ew], W).fdef(ZF);
    t[0x04] = OpSpec::INVALID;
    t[0x05] = op("syscall", Syscall, &[], R)
        .uses(AX | DI | SI | DX | R10 | R8 | R9)
        .defs(AX | CX | R11);
    t[0x06] = op("clts", Unknown, &[], N);
    t[0x07] = op("sysret", Return, &[], R).uses(CX | R11).fdef(ALL_FLAGS);
    t[0x08] = op("invd", Unknown, &[], N);
    t[0x09] = op("wbinvd", Unknown, &[], N);
    t[0x0a] = OpSpec::INVALID;
    t[0x0b] = op("ud2", Trap, &[], N);
    t[0x0c] = OpSpec::INVALID;
    t[0x0d] = op("prefetchw", Int, &[M], N);
    t[0x0e] = op("femms", Simd, &[], N);
    t[0x0f] = OpSpec::INVALID;
    t[0x11] = op("simd", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0x13] = op("movlps", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0x17] = op("movhps", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0x18] = op("", Int, &[M], N).grp(Group::G16);
    for o in 0x19..=0x1f {
        t[o] = op("nop", Nop, &[Ev], N);
    }
    t[0x20] = op("mov", Unknown, &[Ey, Gy], W).attr(REG_ONLY | F64);
    t[0x21] = op("mov", Unknown, &[Ey, Gy], W).attr(REG_ONLY | F64);
    t[0x22] = op("mov", Unknown, &[Gy, Ey], R).attr(REG_ONLY | F64);
    t[0x23] = op("mov", Unknown, &[Gy, Ey], R).attr(REG_ONLY | F64);
    for o in 0x24..=0x27 {
        t[o] = OpSpec::INVALID;
    }
    t[0x28] = op("simd", Simd, &[Vx, Wx], W).attr(PREFIXED);
    t[0x29] = op("simd", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0x2a] = op("simd", Simd, &[Vx, Ey], Rw).attr(PREFIXED);
    t[0x2b] = op("simd", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0x2c] = op("simd", Simd, &[Gy, Wx], W).attr(PREFIXED);
    t[0x2d] = op("simd", Simd, &[Gy, Wx], W).attr(PREFIXED);
    t[0x2e] = op("simd", Simd, &[Vx, Wx], R).fdef(STATUS).attr(PREFIXED);
    t[0x2f] = op("simd", Simd, &[Vx, Wx], R).fdef(STATUS).attr(PREFIXED);
    t[0x30] = op("wrmsr", Unknown, &[], N).uses(AX | CX | DX);
    t[0x31] = op("rdtsc", Unknown, &[], N).defs(AX | DX);
    t[0x32] = op("rdmsr", Unknown, &[], N).uses(CX).defs(AX | DX);
    t[0x33] = op("rdpmc", Unknown, &[], N).uses(CX).defs(AX | DX);
    t[0x34] = op("sysenter", Syscall, &[], R).uses(AX | BX | CX | DX | SI | DI | BP).defs(AX);
    t[0x35] = op("sysexit", Return, &[], R).uses(CX | DX);
    t[0x36] = OpSpec::INVALID;
    t[0x37] = op("getsec", Unknown, &[], N).uses(AX | BX).defs(AX | BX | CX | DX);
    // 0x38 and 0x3a escape to the three-byte maps
    for o in [0x39, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f] {
        t[o] = OpSpec::INVALID;
    }
    for cc in 0..16u8 {
        let o = cc as usize;
        t[0x40 + o] = op(CMOVCC[o], Int, &[Gv, Ev], Rw).fuse(condition_flags(cc));
        t[0x80 + o] = op(JCC[o], CondBranch, &[Jz], R)
            .fuse(condition_flags(cc))
            .attr(F64);
        t[0x90 + o] = op(SETCC[o], Int, &[Eb], W).fuse(condition_flags(cc));
    }
    t[0x50] = op("simd", Simd, &[Gy, Wx], W).attr(PREFIXED);
    t[0x6e] = op("simd", Simd, &[Vx, Ey], W).attr(PREFIXED);
    t[0x6f] = op("simd", Simd, &[Vx, Wx], W).attr(PREFIXED);
    t[0x70] = op("simd", Simd, &[Vx, Wx, Ib], W).attr(PREFIXED);
    t[0x71] = op("", Simd, &[Wx, Ib], Rw).grp(Group::G12);
    t[0x72] = op("", Simd, &[Wx, Ib], Rw).grp(Group::G12);
    t[0x73] = op("", Simd, &[Wx, Ib], Rw).grp(Group::G12);
    t[0x77] = op("emms", Simd, &[], N);
    t[0x78] = op("vmread", Unknown, &[Ey, Gy], W).attr(F64);
    t[0x79] = op("vmwrite", Unknown, &[Gy, Ey], R).attr(F64);
    t[0x7a] = OpSpec::INVALID;
    t[0x7b] = OpSpec::INVALID;
    t[0x7e] = op("simd", Simd, &[Ey, Vx], W).attr(PREFIXED);
    t[0x7f] = op("simd", Simd, &[Wx, Vx], W).attr(PREFIXED);

    t[0xa0] = op("push", Int, &[], R).uses(SP).defs(SP).attr(D64);
    t[0xa1] = op("pop", Int, &[], R).uses(SP).defs(SP).attr(D64);
    t[0xa2] = op("cpuid", Unknown, &[], N).uses(AX | CX).defs(AX | BX | CX | DX);
    t[0xa3] = op("bt", Int, &[Ev, Gv], R).fdef(STATUS);
    t[0xa4] = op("shld", Int, &[Ev, Gv, Ib], Rw).fdef(STATUS);
    t[0xa5] = op("shld", Int, &[Ev, Gv, Cl], Rw).fdef(STATUS).fuse(STATUS);
    t[0xa6] = OpSpec::INVALID;
    t[0xa7] = OpSpec::INVALID;
    t[0xa8] = op("push", Int, &[], R).uses(SP).defs(SP).attr(D64);
    t[0xa9] = op("pop", Int, &[], R).uses(SP).defs(SP).attr(D64);
    t[0xaa] = op("rsm", Unknown, &[], N).fdef(ALL_FLAGS);
    t[0xab] = op("bts", Int, &[Ev, Gv], Rw).fdef(STATUS);
    t[0xac] = op("shrd", Int, &[Ev, Gv, Ib], Rw).fdef(STATUS);
    t[0xad] = op("shrd", Int, &[Ev, Gv, Cl], Rw).fdef(STATUS).fuse(STATUS);
    t[0xae] = op("", Unknown, &[M], R).grp(Group::G15);
    t[0xaf] = op("imul", Int, &[Gv, Ev], Rw).fdef(STATUS);
    t[0xb0] = op("cmpxchg", Int, &[Eb, Gb], Rw).uses(AX).defs(AX).fdef(STATUS);
    t[0xb1] = op("cmpxchg", Int, &[Ev, Gv], Rw).uses(AX).defs(AX).fdef(STATUS);
    t[0xb2] = op("lss", Int, &[Gv, M], W);
    t[0xb3] = op("btr", Int, &[Ev, Gv], Rw).fdef(STATUS);
    t[0xb4] = op("lfs", Int, &[Gv, M], W);
    t[0xb5] = op("lgs", Int, &[Gv, M], W);
    t[0xb6] = op("movzx", Int, &[Gv, Eb], W);
    t[0xb7] = op("movzx", Int, &[Gv, Ew], W);
    t[0xb8] = op("popcnt", Int, &[Gv, Ev], W).fdef(STATUS);
    t[0xb9] = op("ud1", Trap, &[Gv, Ev], N);
    t[0xba] = op("", Int, &[Ev, Ib], Rw).grp(Group::G8);
    t[0xbb] = op("btc", Int, &[Ev, Gv], Rw).fdef(STATUS);
    t[0xbc] = op("bsf", Int, &[Gv, Ev], Rw).fdef(STATUS);
    t[0xbd] = op("bsr", Int, &[Gv, Ev], Rw).fdef(STATUS);
    t[0xbe] = op("movsx", Int, &[Gv, Eb], W);
    t[0xbf] = op("movsx", Int, &[Gv, Ew], W);
    t[0xc0] = op("xadd", Int, &[Eb, Gb], Xchg).fdef(STATUS);
    t[0xc1] = op("xadd", Int, &[Ev, Gv], Xchg).fdef(STATUS);
    t[0xc2] = op("simd", Simd, &[Vx, Wx, Ib], Rw).attr(PREFIXED);
    t[0xc3] = op("movnti", Int, &[M, Gy], W);
    t[0xc4] = op("pinsrw", Simd, &[Vx, Ey, Ib], Rw);
    t[0xc5] = op("pextrw", Simd, &[Gy, Wx, Ib], W);
    t[0xc6] = op("simd", Simd, &[Vx, Wx, Ib], Rw).attr(PREFIXED);
    t[0xc7] = op("", Int, &[M], Rw).grp(Group::G9);
    for r in 0..8 {
        t[0xc8 + r] = op("bswap", Int, &[Zv], Rw);
    }
    t[0xd6] = op("simd", Simd, &[Wx, Vx], W).attr(PREFIXED);
    t[0xd7] = op("pmovmskb", Simd, &[Gy, Wx], W);
    t[0xe7] = op("simd", Simd, &[M, Vx], W).attr(PREFIXED);
    t[0xf7] = op("maskmovq", Simd, &[Vx, Wx], R).uses(DI);
    t[0xff] = op("ud0", Trap, &[Gv, Ev], N);

    t
}

/// Resolve a group member from ModRM.reg (and mod/rm where it matters).
pub(crate) fn group_member(group: Group, reg: u8, register_form: bool, rm: u8) -> OpSpec {
    use Access::*;
    use Opnd::*;

    let reg = reg & 7;
    match group {
        Group::G1 => {
            let (m, fu) = [
                ("add", 0),
                ("or", 0),
                ("adc", CF),
                ("sbb", CF),
                ("and", 0),
                ("sub", 0),
                ("xor", 0),
                ("cmp", 0),
            ][reg as usize];
            let acc = if reg == 7 { R } else { Rw };
            op(m, Int, &[], acc).fdef(STATUS).fuse(fu)
        }
        Group::G1a => match reg {
            0 => op("pop", Int, &[], W).uses(SP).defs(SP),
            _ => OpSpec::INVALID,
        },
        Group::G2 => match reg {
            0 => op("rol", Int, &[], Rw).fdef(CF | OF),
            1 => op("ror", Int, &[], Rw).fdef(CF | OF),
            2 => op("rcl", Int, &[], Rw).fdef(CF | OF).fuse(CF),
            3 => op("rcr", Int, &[], Rw).fdef(CF | OF).fuse(CF),
            4 | 6 => op("shl", Int, &[], Rw).fdef(STATUS),
            5 => op("shr", Int, &[], Rw).fdef(STATUS),
            _ => op("sar", Int, &[], Rw).fdef(STATUS),
        },
        Group::G3b => match reg {
            0 | 1 => op("test", Int, &[Eb, Ib], R).fdef(STATUS),
            2 => op("not", Int, &[], Rw),
            3 => op("neg", Int, &[], Rw).fdef(STATUS),
            4 => op("mul", Int, &[], R).uses(AX).defs(AX).fdef(STATUS),
            5 => op("imul", Int, &[], R).uses(AX).defs(AX).fdef(STATUS),
            6 => op("div", Int, &[], R).uses(AX).defs(AX).fdef(STATUS),
            _ => op("idiv", Int, &[], R).uses(AX).defs(AX).fdef(STATUS),
        },
        Group::G3v => match reg {
            0 | 1 => op("test", Int, &[Ev, Iz], R).fdef(STATUS),
            2 => op("not", Int, &[], Rw),
            3 => op("neg", Int, &[], Rw).fdef(STATUS),
            4 => op("mul", Int, &[], R).uses(AX).defs(AX | DX).fdef(STATUS),
            5 => op("imul", Int, &[], R).uses(AX).defs(AX | DX).fdef(STATUS),
            6 => op("div", Int, &[], R).uses(AX | DX).defs(AX | DX).fdef(STATUS),
            _ => op("idiv", Int, &[], R).uses(AX | DX).defs(AX | DX).fdef(STATUS),
        },
        Group::G4 => match reg {
            0 => op("inc", Int, &[], Rw).fdef(STATUS & !CF),
            1 => op("dec", Int, &[], Rw).fdef(STATUS & !CF),
            _ => OpSpec::INVALID,
        },
        Group::G5 => match reg {
            0 => op("inc", Int, &[], Rw).fdef(STATUS & !CF),
            1 => op("dec", Int, &[], Rw).fdef(STATUS & !CF),
            2 => op("call", Call, &[], R).uses(SP).defs(SP).attr(F64),
            3 if !register_form => op("callf", Call, &[M], R).uses(SP).defs(SP),
            4 => op("jmp", UncondBranch, &[], R).attr(F64),
            5 if !register_form => op("jmpf", UncondBranch, &[M], R),
            6 => op("push", Int, &[], R).uses(SP).defs(SP).attr(D64),
            _ => OpSpec::INVALID,
        },
        Group::G6 => match reg {
            0 => op("sldt", Unknown, &[], W),
            1 => op("str", Unknown, &[], W),
            2 => op("lldt", Unknown, &[], R),
            3 => op("ltr", Unknown, &[], R),
            4 => op("verr", Unknown, &[], R).fdef(ZF),
            5 => op("verw", Unknown, &[], R).fdef(ZF),
            _ => OpSpec::INVALID,
        },
        Group::G7 => {
            if register_form {
                match (reg, rm & 7) {
                    (2, 0) => op("xgetbv", Unknown, &[], N).uses(CX).defs(AX | DX),
                    (2, 1) => op("xsetbv", Unknown, &[], N).uses(AX | CX | DX),
                    (7, 0) => op("swapgs", Unknown, &[], N),
                    (7, 1) => op("rdtscp", Unknown, &[], N).defs(AX | CX | DX),
                    (4, _) => op("smsw", Unknown, &[], W),
                    (6, _) => op("lmsw", Unknown, &[], R),
                    _ => op("sys", Unknown, &[], N),
                }
            } else {
                let m = ["sgdt", "sidt", "lgdt", "lidt", "smsw", "(bad)", "lmsw", "invlpg"][reg as usize];
                if reg == 5 {
                    OpSpec::INVALID
                } else {
                    op(m, Unknown, &[M], R)
                }
            }
        }
        Group::G8 => match reg {
            4 => op("bt", Int, &[], R).fdef(STATUS),
            5 => op("bts", Int, &[], Rw).fdef(STATUS),
            6 => op("btr", Int, &[], Rw).fdef(STATUS),
            7 => op("btc", Int, &[], Rw).fdef(STATUS),
            _ => OpSpec::INVALID,
        },
        Group::G9 => match (reg, register_form) {
            (1, false) => op("cmpxchg8b", Int, &[M], Rw)
                .uses(AX | DX | BX | CX)
                .defs(AX | DX)
                .fdef(ZF),
            (6, true) => op("rdrand", Int, &[Ev], W).fdef(STATUS),
            (7, true) => op("rdseed", Int, &[Ev], W).fdef(STATUS),
            _ => OpSpec::INVALID,
        },
        Group::G11 => match reg {
            0 => op("mov", Int, &[], W),
            _ => OpSpec::INVALID,
        },
        Group::G12 => match reg {
            2 => op("psrl", Simd, &[], Rw),
            4 => op("psra", Simd, &[], Rw),
            6 => op("psll", Simd, &[], Rw),
            3 | 7 => op("psrldq", Simd, &[], Rw),
            _ => OpSpec::INVALID,
        },
        Group::G15 => {
            if register_form {
                match reg {
                    5 => op("lfence", Unknown, &[], N),
                    6 => op("mfence", Unknown, &[], N),
                    7 => op("sfence", Unknown, &[], N),
                    0..=3 => op("rdfsbase", Unknown, &[Ey], W),
                    _ => OpSpec::INVALID,
                }
            } else {
                let m = [
                    "fxsave", "fxrstor", "ldmxcsr", "stmxcsr", "xsave", "xrstor", "xsaveopt",
                    "clflush",
                ][reg as usize];
                let mut spec = op(m, Unknown, &[M], R);
                if matches!(reg, 4 | 5 | 6) {
                    spec = spec.uses(AX | DX);
                }
                spec
            }
        }
        Group::G16 => {
            if register_form || reg > 3 {
                op("nop", Nop, &[Ev], N)
            } else {
                let m = ["prefetchnta", "prefetcht0", "prefetcht1", "prefetcht2"][reg as usize];
                op(m, Int, &[M], N)
            }
        }
    }
}

/// x87 escape opcodes d8..df.
pub(crate) fn x87(opcode: u8, modrm: u8) -> OpSpec {
    use Access::*;
    use Opnd::*;

    let reg = ((modrm >> 3) & 7) as usize;
    if modrm < 0xc0 {
        let names: [&'static str; 8] = match opcode {
            0xd8 | 0xdc => ["fadd", "fmul", "fcom", "fcomp", "fsub", "fsubr", "fdiv", "fdivr"],
            0xd9 => ["fld", "(bad)", "fst", "fstp", "fldenv", "fldcw", "fnstenv", "fnstcw"],
            0xda | 0xde => ["fiadd", "fimul", "ficom", "ficomp", "fisub", "fisubr", "fidiv", "fidivr"],
            0xdb => ["fild", "fisttp", "fist", "fistp", "(bad)", "fld", "(bad)", "fstp"],
            0xdd => ["fld", "fisttp", "fst", "fstp", "frstor", "(bad)", "fnsave", "fnstsw"],
            _ => ["fild", "fisttp", "fist", "fistp", "fbld", "fild", "fbstp", "fistp"],
        };
        if names[reg] == "(bad)" {
            return OpSpec::INVALID;
        }
        return op(names[reg], Float, &[M], R);
    }
    match (opcode, modrm) {
        (0xdf, 0xe0) => op("fnstsw", Float, &[], N).uses(AX).defs(AX),
        (0xdb, 0xe8..=0xf7) | (0xdf, 0xe8..=0xf7) => {
            op(if opcode == 0xdb { "fucomi" } else { "fucomip" }, Float, &[], N).fdef(STATUS)
        }
        (0xda, 0xc0..=0xdf) => op("fcmov", Float, &[], N).fuse(CF | ZF | PF),
        (0xdb, 0xc0..=0xdf) => op("fcmovn", Float, &[], N).fuse(CF | ZF | PF),
        (0xd9, 0xc9) => op("fxch", Float, &[], N),
        (0xd9, 0xe0) => op("fchs", Float, &[], N),
        (0xd9, 0xe1) => op("fabs", Float, &[], N),
        (0xd9, 0xe8) => op("fld1", Float, &[], N),
        (0xd9, 0xee) => op("fldz", Float, &[], N),
        (0xdb, 0xe2) => op("fnclex", Float, &[], N),
        (0xdb, 0xe3) => op("fninit", Float, &[], N),
        (0xd9, 0xd0) => op("fnop", Nop, &[], N),
        (0xd9, 0xc0..=0xc7) => op("fld", Float, &[], N),
        (0xdd, 0xd8..=0xdf) => op("fstp", Float, &[], N),
        _ => op("fpu", Float, &[], N),
    }
}

/// Mnemonic of a prefix-dependent SIMD opcode. `prefix` is 0 (none), 0x66,
/// 0xf3 or 0xf2.
pub(crate) fn simd_mnemonic(opcode: u8, prefix: u8) -> &'static str {
    let col = match prefix {
        0x66 => 1,
        0xf3 => 2,
        0xf2 => 3,
        _ => 0,
    };
    let row: [&'static str; 4] = match opcode {
        0x10 => ["movups", "movupd", "movss", "movsd"],
        0x11 => ["movups", "movupd", "movss", "movsd"],
        0x12 => ["movlps", "movlpd", "movsldup", "movddup"],
        0x13 => ["movlps", "movlpd", "movlps", "movlps"],
        0x14 => ["unpcklps", "unpcklpd", "unpcklps", "unpcklps"],
        0x15 => ["unpckhps", "unpckhpd", "unpckhps", "unpckhps"],
        0x16 => ["movhps", "movhpd", "movshdup", "movhps"],
        0x17 => ["movhps", "movhpd", "movhps", "movhps"],
        0x28 => ["movaps", "movapd", "movaps", "movaps"],
        0x29 => ["movaps", "movapd", "movaps", "movaps"],
        0x2a => ["cvtpi2ps", "cvtpi2pd", "cvtsi2ss", "cvtsi2sd"],
        0x2b => ["movntps", "movntpd", "movntps", "movntps"],
        0x2c => ["cvttps2pi", "cvttpd2pi", "cvttss2si", "cvttsd2si"],
        0x2d => ["cvtps2pi", "cvtpd2pi", "cvtss2si", "cvtsd2si"],
        0x2e => ["ucomiss", "ucomisd", "ucomiss", "ucomiss"],
        0x2f => ["comiss", "comisd", "comiss", "comiss"],
        0x50 => ["movmskps", "movmskpd", "movmskps", "movmskps"],
        0x51 => ["sqrtps", "sqrtpd", "sqrtss", "sqrtsd"],
        0x52 => ["rsqrtps", "rsqrtps", "rsqrtss", "rsqrtss"],
        0x53 => ["rcpps", "rcpps", "rcpss", "rcpss"],
        0x54 => ["andps", "andpd", "andps", "andps"],
        0x55 => ["andnps", "andnpd", "andnps", "andnps"],
        0x56 => ["orps", "orpd", "orps", "orps"],
        0x57 => ["xorps", "xorpd", "xorps", "xorps"],
        0x58 => ["addps", "addpd", "addss", "addsd"],
        0x59 => ["mulps", "mulpd", "mulss", "mulsd"],
        0x5a => ["cvtps2pd", "cvtpd2ps", "cvtss2sd", "cvtsd2ss"],
        0x5b => ["cvtdq2ps", "cvtps2dq", "cvttps2dq", "cvtdq2ps"],
        0x5c => ["subps", "subpd", "subss", "subsd"],
        0x5d => ["minps", "minpd", "minss", "minsd"],
        0x5e => ["divps", "divpd", "divss", "divsd"],
        0x5f => ["maxps", "maxpd", "maxss", "maxsd"],
        0x6e => ["movd", "movd", "movd", "movd"],
        0x6f => ["movq", "movdqa", "movdqu", "movq"],
        0x70 => ["pshufw", "pshufd", "pshufhw", "pshuflw"],
        0x7e => ["movd", "movd", "movq", "movd"],
        0x7f => ["movq", "movdqa", "movdqu", "movq"],
        0xc2 => ["cmpps", "cmppd", "cmpss", "cmpsd"],
        0xc6 => ["shufps", "shufpd", "shufps", "shufps"],
        0xd6 => ["movq", "movq", "movq2dq", "movdq2q"],
        0xe6 => ["cvtpd2dq", "cvttpd2dq", "cvtdq2pd", "cvtpd2dq"],
        0xe7 => ["movntq", "movntdq", "movntq", "movntq"],
        0xef => ["pxor", "pxor", "pxor", "pxor"],
        0xd4 => ["paddq", "paddq", "paddq", "paddq"],
        0xfe => ["paddd", "paddd", "paddd", "paddd"],
        0xfa => ["psubd", "psubd", "psubd", "psubd"],
        0xeb => ["por", "por", "por", "por"],
        0xdb => ["pand", "pand", "pand", "pand"],
        0x74 => ["pcmpeqb", "pcmpeqb", "pcmpeqb", "pcmpeqb"],
        0x75 => ["pcmpeqw", "pcmpeqw", "pcmpeqw", "pcmpeqw"],
        0x76 => ["pcmpeqd", "pcmpeqd", "pcmpeqd", "pcmpeqd"],
        0x60..=0x6d => ["punpck", "punpck", "punpck", "punpck"],
        _ => ["simd", "simd", "simd", "simd"],
    };
    row[col]
}

/// Opcodes of the 0F map (legacy or VEX map 1) that carry an imm8.
pub(crate) fn map1_has_imm8(opcode: u8) -> bool {
    matches!(opcode, 0x70..=0x73 | 0xc2 | 0xc4..=0xc6)
}
