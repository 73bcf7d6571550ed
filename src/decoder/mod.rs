//! Table-driven x86 / x86-64 instruction decoder.
//!
//! Decodes one instruction at a time into an [`Instruction`] carrying its
//! bytes, opcode class, operands (with the byte offset and width of every
//! encoded immediate or displacement) and the registers and flags it reads
//! and writes.
//!
//! Coverage: legacy prefixes, REX, the one-byte and 0F maps, the 0F38 / 0F3A
//! maps (classified as SIMD), VEX and EVEX (length and GPR side effects),
//! x87 escapes, 16/32/64-bit addressing.

mod modrm;
pub(crate) mod tables;

use crate::insn::flags::{CF, OF, STATUS};
use crate::insn::{
    call_effects, Gpr, Instruction, OpcodeClass, Operand, OperandKind, RegClass, RegSet, Register, MAX_OPERANDS,
};
use crate::{Address, Architecture, Decoder, DisassemblyError, TargetWidth};

use modrm::{Cursor, ModRm, Rex};
use tables::{Access, OpSpec, Opnd};

/// Errors raised while decoding a single instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// No opcode matches, or the encoding is not valid in this mode.
    #[error("invalid encoding at 0x{address:x}")]
    InvalidEncoding { address: Address, length: usize },

    /// The input ended before the instruction did.
    #[error("truncated instruction at 0x{address:x} ({available} bytes available)")]
    Truncated { address: Address, available: usize },
}

impl DecodeError {
    pub fn address(&self) -> Address {
        match self {
            DecodeError::InvalidEncoding { address, .. } | DecodeError::Truncated { address, .. } => {
                *address
            }
        }
    }

    /// Bytes to skip before trying again; always at least one.
    pub fn length(&self) -> usize {
        match self {
            DecodeError::InvalidEncoding { length, .. } => (*length).max(1),
            DecodeError::Truncated { .. } => 1,
        }
    }
}

/// Legacy prefix state.
#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    opsize: bool,
    adsize: bool,
    lock: bool,
    /// Last of F2 / F3 seen, zero if none
    rep: u8,
}

impl Prefixes {
    /// Mandatory prefix selecting a SIMD form: F2/F3 win over 66.
    fn simd(&self) -> u8 {
        if self.rep != 0 {
            self.rep
        } else if self.opsize {
            0x66
        } else {
            0
        }
    }
}

/// Which opcode map the instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Map {
    OneByte,
    TwoByte,
    ThreeByte,
}

/// x86 decoder for one target width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Decoder {
    width: TargetWidth,
}

impl X86Decoder {
    pub fn new(width: TargetWidth) -> Self {
        Self { width }
    }

    /// Create a decoder for a parsed binary's architecture.
    pub fn for_architecture(arch: Architecture) -> Result<Self, DisassemblyError> {
        match arch {
            Architecture::X86_32 => Ok(Self::new(TargetWidth::Bits32)),
            Architecture::X86_64 => Ok(Self::new(TargetWidth::Bits64)),
            Architecture::Unknown => Err(DisassemblyError::UnsupportedArchitecture(arch)),
        }
    }

    pub fn width(&self) -> TargetWidth {
        self.width
    }

    fn is_64(&self) -> bool {
        self.width == TargetWidth::Bits64
    }

    /// Decode one instruction at the start of `bytes`, located at `address`.
    /// Returns the instruction and the number of bytes it occupies.
    pub fn decode(&self, bytes: &[u8], address: Address) -> Result<(Instruction, usize), DecodeError> {
        let insn = self.decode_insn(bytes, address)?;
        let len = insn.size();
        Ok((insn, len))
    }

    /// Decode, or produce a one-byte `Invalid` placeholder so that a linear
    /// sweep can always advance.
    pub fn decode_or_invalid(&self, bytes: &[u8], address: Address) -> Instruction {
        match self.decode_insn(bytes, address) {
            Ok(insn) => insn,
            Err(e) => {
                log::debug!("{}", e);
                let len = e.length().min(bytes.len()).max(1);
                let raw = bytes.get(..len).map(|b| b.to_vec()).unwrap_or_default();
                Instruction::new(address, raw, OpcodeClass::Invalid, "(bad)")
            }
        }
    }

    fn invalid(address: Address) -> DecodeError {
        DecodeError::InvalidEncoding { address, length: 1 }
    }

    fn decode_insn(&self, bytes: &[u8], address: Address) -> Result<Instruction, DecodeError> {
        let mode64 = self.is_64();
        let mut cur = Cursor::new(bytes, address);
        let mut pfx = Prefixes::default();

        loop {
            match cur.peek()? {
                0x66 => pfx.opsize = true,
                0x67 => pfx.adsize = true,
                0xf0 => pfx.lock = true,
                b @ (0xf2 | 0xf3) => pfx.rep = b,
                0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => {}
                _ => break,
            }
            cur.byte()?;
        }

        let mut rex = Rex::default();
        if mode64 {
            if let b @ 0x40..=0x4f = cur.peek()? {
                rex = Rex::from_byte(b);
                cur.byte()?;
            }
        }

        let opcode = cur.byte()?;
        match opcode {
            0xc4 | 0xc5 if mode64 || cur.peek_at(0).is_some_and(|b| b >= 0xc0) => {
                return self.decode_vex(cur, pfx, rex, opcode);
            }
            0x62 if mode64 || cur.peek_at(0).is_some_and(|b| b >= 0xc0) => {
                return self.decode_evex(cur, pfx, rex);
            }
            0xd8..=0xdf => return self.decode_x87(cur, pfx, rex, opcode),
            _ => {}
        }

        let (spec, map, op_lo) = if opcode == 0x0f {
            let op2 = cur.byte()?;
            match op2 {
                0x38 => {
                    let op3 = cur.byte()?;
                    (three_byte_38(op3, pfx), Map::ThreeByte, op3)
                }
                0x3a => {
                    let op3 = cur.byte()?;
                    (three_byte_3a(op3), Map::ThreeByte, op3)
                }
                _ => (two_byte_variant(op2, pfx), Map::TwoByte, op2),
            }
        } else {
            (one_byte_variant(opcode, pfx, rex, mode64), Map::OneByte, opcode)
        };

        self.finish(cur, pfx, rex, spec, map, op_lo)
    }

    fn addr_size(&self, pfx: &Prefixes) -> u8 {
        match (self.is_64(), pfx.adsize) {
            (true, false) => 8,
            (true, true) => 4,
            (false, false) => 4,
            (false, true) => 2,
        }
    }

    fn operand_size(&self, spec: &OpSpec, pfx: &Prefixes, rex: Rex) -> u8 {
        if self.is_64() {
            if rex.w || spec.has(tables::F64) {
                return 8;
            }
            if spec.has(tables::D64) {
                return if pfx.opsize { 2 } else { 8 };
            }
        }
        if pfx.opsize && spec.class != OpcodeClass::Simd {
            2
        } else {
            4
        }
    }

    fn finish(
        &self,
        mut cur: Cursor<'_>,
        pfx: Prefixes,
        rex: Rex,
        mut spec: OpSpec,
        map: Map,
        opcode: u8,
    ) -> Result<Instruction, DecodeError> {
        let address = cur.address();
        let mode64 = self.is_64();
        let addr_size = self.addr_size(&pfx);

        let modrm = if spec.needs_modrm() {
            Some(modrm::parse(
                &mut cur,
                rex,
                addr_size,
                mode64,
                spec.has(tables::REG_ONLY),
            )?)
        } else {
            None
        };

        if let (Some(group), Some(m)) = (spec.group, modrm.as_ref()) {
            let member = tables::group_member(group, m.reg_low(), m.is_register(), m.rm_low());
            spec = merge_group(&spec, &member);
        }

        if spec.class == OpcodeClass::Invalid
            || (mode64 && spec.has(tables::INV64))
            || (!mode64 && spec.has(tables::O64))
        {
            return Err(Self::invalid(address));
        }

        if spec.has(tables::PREFIXED) {
            spec.mnemonic = tables::simd_mnemonic(opcode, pfx.simd());
        }

        let opsize = self.operand_size(&spec, &pfx, rex);
        let ctx = OperandContext {
            mode64,
            rex,
            opsize,
            addr_size,
            opsize_prefix: pfx.opsize,
            force_64: spec.has(tables::F64),
            simd_reg: simd_register_class(map, opcode, pfx),
            opcode,
        };

        let mut operands = Vec::with_capacity(spec.operands.len());
        for template in spec.operands {
            if let Some(op) = ctx.operand(*template, modrm.as_ref(), &mut cur)? {
                operands.push(op);
            } else {
                // memory-only template with a register ModRM
                return Err(Self::invalid(address));
            }
        }

        let mnemonic = size_variant(map, opcode, opsize, addr_size, spec.mnemonic);
        let mnemonic = hint_variant(map, opcode, &pfx, modrm.as_ref(), mnemonic);

        let bytes = cur.consumed().to_vec();
        let mut insn = Instruction::new(address, bytes, spec.class, mnemonic);
        if mnemonic == "pause" || mnemonic.starts_with("endbr") {
            insn.class = OpcodeClass::Nop;
        }

        let (mut uses, mut defs) = dataflow(&spec, &operands);
        if pfx.rep != 0 && map == Map::OneByte && is_string_op(opcode) {
            uses.insert_gpr(Gpr::Cx);
            defs.insert_gpr(Gpr::Cx);
        }
        if opcode == 0xe3 && map == Map::OneByte {
            uses.insert_gpr(Gpr::Cx);
        }
        self.abi_effects(spec.class, &mut uses, &mut defs);

        operands.truncate(MAX_OPERANDS);
        insn.operands = operands;
        insn.uses = uses;
        insn.defs = defs;
        Ok(insn)
    }

    /// Calling-convention effects of calls and returns.
    fn abi_effects(&self, class: OpcodeClass, uses: &mut RegSet, defs: &mut RegSet) {
        let mask = |regs: &[Gpr]| regs.iter().fold(0u16, |m, r| m | r.mask());
        match (class, self.is_64()) {
            (OpcodeClass::Call, _) => {
                let (u, d) = call_effects(self.width);
                *uses |= u;
                *defs |= d;
            }
            (OpcodeClass::Return, true) => {
                *uses |= RegSet::from_masks(
                    mask(&[
                        Gpr::Ax,
                        Gpr::Dx,
                        Gpr::Bx,
                        Gpr::Bp,
                        Gpr::R12,
                        Gpr::R13,
                        Gpr::R14,
                        Gpr::R15,
                    ]),
                    0,
                );
            }
            (OpcodeClass::Return, false) => {
                *uses |= RegSet::from_masks(
                    mask(&[Gpr::Ax, Gpr::Dx, Gpr::Bx, Gpr::Bp, Gpr::Si, Gpr::Di]),
                    0,
                );
            }
            _ => {}
        }
    }

    fn decode_x87(
        &self,
        mut cur: Cursor<'_>,
        pfx: Prefixes,
        rex: Rex,
        opcode: u8,
    ) -> Result<Instruction, DecodeError> {
        let modrm_byte = cur.peek()?;
        let spec = tables::x87(opcode, modrm_byte);
        let address = cur.address();
        let addr_size = self.addr_size(&pfx);
        let m = modrm::parse(&mut cur, rex, addr_size, self.is_64(), false)?;
        if spec.class == OpcodeClass::Invalid {
            return Err(Self::invalid(address));
        }
        let mut insn = Instruction::new(address, cur.consumed().to_vec(), spec.class, spec.mnemonic);
        let mut uses = RegSet::from_masks(spec.regs_use, spec.flags_use);
        let defs = RegSet::from_masks(spec.regs_def, spec.flags_def);
        if let Some(mem) = m.mem {
            uses |= mem.mem().map(|r| r.address_regs()).unwrap_or_default();
            insn.operands.push(mem);
        }
        insn.uses = uses;
        insn.defs = defs;
        Ok(insn)
    }

    fn decode_vex(
        &self,
        mut cur: Cursor<'_>,
        pfx: Prefixes,
        rex: Rex,
        lead: u8,
    ) -> Result<Instruction, DecodeError> {
        let address = cur.address();
        if pfx.opsize || pfx.rep != 0 || pfx.lock || rex.present {
            return Err(Self::invalid(address));
        }
        let b1 = cur.byte()?;
        let (vrex, map, vvvv, pp) = if lead == 0xc5 {
            let vrex = Rex {
                present: true,
                r: b1 & 0x80 == 0,
                ..Default::default()
            };
            (vrex, 1u8, (!b1 >> 3) & 0xf, b1 & 3)
        } else {
            let b2 = cur.byte()?;
            let vrex = Rex {
                present: true,
                r: b1 & 0x80 == 0,
                x: b1 & 0x40 == 0,
                b: b1 & 0x20 == 0,
                w: b2 & 0x80 != 0,
            };
            (vrex, b1 & 0x1f, (!b2 >> 3) & 0xf, b2 & 3)
        };
        let vrex = if self.is_64() {
            vrex
        } else {
            Rex {
                w: vrex.w,
                ..Default::default()
            }
        };
        if !(1..=3).contains(&map) {
            return Err(Self::invalid(address));
        }
        let opcode = cur.byte()?;
        self.finish_vector(cur, vrex, map, opcode, vvvv, pp, "vex")
    }

    fn decode_evex(&self, mut cur: Cursor<'_>, pfx: Prefixes, rex: Rex) -> Result<Instruction, DecodeError> {
        let address = cur.address();
        if pfx.opsize || pfx.rep != 0 || pfx.lock || rex.present {
            return Err(Self::invalid(address));
        }
        let p0 = cur.byte()?;
        let p1 = cur.byte()?;
        let _p2 = cur.byte()?;
        if p1 & 0x04 == 0 {
            return Err(Self::invalid(address));
        }
        let map = p0 & 7;
        if !matches!(map, 1 | 2 | 3 | 5 | 6) {
            return Err(Self::invalid(address));
        }
        let erex = if self.is_64() {
            Rex {
                present: true,
                r: p0 & 0x80 == 0,
                x: p0 & 0x40 == 0,
                b: p0 & 0x20 == 0,
                w: p1 & 0x80 != 0,
            }
        } else {
            Rex::default()
        };
        let opcode = cur.byte()?;
        self.finish_vector(cur, erex, map, opcode, (!p1 >> 3) & 0xf, p1 & 3, "evex")
    }

    /// Common tail of VEX and EVEX decoding.
    #[allow(clippy::too_many_arguments)]
    fn finish_vector(
        &self,
        mut cur: Cursor<'_>,
        vrex: Rex,
        map: u8,
        opcode: u8,
        vvvv: u8,
        pp: u8,
        mnemonic: &'static str,
    ) -> Result<Instruction, DecodeError> {
        let address = cur.address();
        let addr_size = self.addr_size(&Prefixes::default());

        if map == 1 && opcode == 0x77 {
            return Ok(Instruction::new(
                address,
                cur.consumed().to_vec(),
                OpcodeClass::Simd,
                "vzeroupper",
            ));
        }

        let m = modrm::parse(&mut cur, vrex, addr_size, self.is_64(), false)?;
        let imm = map == 3 || (map == 1 && tables::map1_has_imm8(opcode));
        let mut operands = Vec::new();
        let gpr_width = if vrex.w && self.is_64() { 8 } else { 4 };
        let bmi = (map == 2 && (0xf0..=0xf7).contains(&opcode)) || (map == 3 && opcode == 0xf0);

        let mut uses = RegSet::EMPTY;
        let mut defs = RegSet::EMPTY;
        let (class, mnemonic) = if bmi {
            (OpcodeClass::Int, "bmi")
        } else {
            (OpcodeClass::Simd, mnemonic)
        };

        if bmi {
            let reg = Gpr::from_index(m.reg).ok_or_else(|| Self::invalid(address))?;
            operands.push(Operand::register(Register::gpr_sized(reg, gpr_width)));
            let vreg = Gpr::from_index(vvvv).ok_or_else(|| Self::invalid(address))?;
            uses.insert_gpr(vreg);
            if opcode == 0xf3 && map == 2 {
                // blsr / blsmsk / blsi write the vvvv register
                defs.insert_gpr(vreg);
            } else {
                defs.insert_gpr(reg);
            }
            if opcode == 0xf6 && pp == 3 {
                // mulx reads rdx and writes both destinations
                uses.insert_gpr(Gpr::Dx);
                defs.insert_gpr(vreg);
            }
            if m.is_register() {
                let rm = Gpr::from_index(m.rm).ok_or_else(|| Self::invalid(address))?;
                uses.insert_gpr(rm);
                operands.push(Operand::register(Register::gpr_sized(rm, gpr_width)));
            }
        } else {
            operands.push(Operand::register(Register::new(RegClass::Xmm, m.reg)));
            let rm_is_gpr_source = (map == 1 && matches!(opcode, 0x6e | 0x2a | 0xc4))
                || (map == 3 && matches!(opcode, 0x20 | 0x22));
            if m.is_register() {
                if rm_is_gpr_source {
                    let rm = Gpr::from_index(m.rm).ok_or_else(|| Self::invalid(address))?;
                    uses.insert_gpr(rm);
                    operands.push(Operand::register(Register::gpr_sized(rm, gpr_width)));
                } else {
                    operands.push(Operand::register(Register::new(RegClass::Xmm, m.rm)));
                }
            }
        }
        if let Some(mem) = m.mem {
            uses |= mem.mem().map(|r| r.address_regs()).unwrap_or_default();
            operands.push(mem);
        }
        if imm {
            let (v, off) = cur.signed(1)?;
            operands.push(Operand::immediate(v, off, 1));
        }
        if map == 1 && matches!(opcode, 0x2e | 0x2f) {
            defs |= RegSet::from_masks(0, STATUS);
        }

        let mut insn = Instruction::new(address, cur.consumed().to_vec(), class, mnemonic);
        operands.truncate(MAX_OPERANDS);
        insn.operands = operands;
        insn.uses = uses;
        insn.defs = defs;
        Ok(insn)
    }
}

impl Decoder for X86Decoder {
    fn width(&self) -> TargetWidth {
        self.width
    }

    fn decode(&self, bytes: &[u8], address: Address) -> Result<(Instruction, usize), DecodeError> {
        X86Decoder::decode(self, bytes, address)
    }
}

fn merge_group(base: &OpSpec, member: &OpSpec) -> OpSpec {
    OpSpec {
        mnemonic: member.mnemonic,
        class: member.class,
        operands: if member.operands.is_empty() {
            base.operands
        } else {
            member.operands
        },
        access: member.access,
        flags_def: base.flags_def | member.flags_def,
        flags_use: base.flags_use | member.flags_use,
        regs_use: base.regs_use | member.regs_use,
        regs_def: base.regs_def | member.regs_def,
        attrs: base.attrs | member.attrs,
        group: None,
    }
}

fn one_byte_variant(opcode: u8, pfx: Prefixes, rex: Rex, mode64: bool) -> OpSpec {
    use tables::Opnd::*;
    match opcode {
        0x63 if !mode64 => tables::op("arpl", OpcodeClass::Unknown, &[Ew, Gw], Access::Rw)
            .fdef(crate::insn::flags::ZF),
        0x90 if rex.b => tables::op("xchg", OpcodeClass::Int, &[Zv, Ax], Access::Xchg),
        0x90 if pfx.rep == 0xf3 => tables::op("pause", OpcodeClass::Nop, &[], Access::N),
        _ => *tables::one_byte(opcode),
    }
}

fn two_byte_variant(opcode: u8, pfx: Prefixes) -> OpSpec {
    use tables::Opnd::*;
    let spec = *tables::two_byte(opcode);
    match (opcode, pfx.rep) {
        (0xb8, 0xf3) => spec,
        (0xb8, _) => OpSpec::INVALID,
        (0xbc, 0xf3) => OpSpec { mnemonic: "tzcnt", ..spec },
        (0xbd, 0xf3) => OpSpec { mnemonic: "lzcnt", ..spec },
        (0x1e, 0xf3) => tables::op("nop", OpcodeClass::Nop, &[Ev], Access::N),
        _ => spec,
    }
}

fn three_byte_38(opcode: u8, pfx: Prefixes) -> OpSpec {
    use tables::Opnd::*;
    match (opcode, pfx.rep, pfx.opsize) {
        (0xf0, 0xf2, _) => tables::op("crc32", OpcodeClass::Int, &[Gy, Eb], Access::Rw),
        (0xf1, 0xf2, _) => tables::op("crc32", OpcodeClass::Int, &[Gy, Ev], Access::Rw),
        (0xf0, _, _) => tables::op("movbe", OpcodeClass::Int, &[Gv, M], Access::W),
        (0xf1, _, _) => tables::op("movbe", OpcodeClass::Int, &[M, Gv], Access::W),
        (0xf6, 0xf3, _) => tables::op("adox", OpcodeClass::Int, &[Gy, Ey], Access::Rw)
            .fuse(OF)
            .fdef(OF),
        (0xf6, _, true) => tables::op("adcx", OpcodeClass::Int, &[Gy, Ey], Access::Rw)
            .fuse(CF)
            .fdef(CF),
        (0x17, _, _) => tables::op("ptest", OpcodeClass::Simd, &[Vx, Wx], Access::R).fdef(STATUS),
        _ => tables::op("sse38", OpcodeClass::Simd, &[Vx, Wx], Access::Rw),
    }
}

fn three_byte_3a(opcode: u8) -> OpSpec {
    use tables::Opnd::*;
    match opcode {
        0x14..=0x17 => tables::op("pextr", OpcodeClass::Simd, &[Ey, Vx, Ib], Access::W),
        0x20 | 0x22 => tables::op("pinsr", OpcodeClass::Simd, &[Vx, Ey, Ib], Access::Rw),
        0x60..=0x63 => tables::op("pcmpstr", OpcodeClass::Simd, &[Vx, Wx, Ib], Access::R)
            .uses(Gpr::Ax.mask() | Gpr::Dx.mask())
            .defs(Gpr::Cx.mask())
            .fdef(STATUS),
        _ => tables::op("sse3a", OpcodeClass::Simd, &[Vx, Wx, Ib], Access::Rw),
    }
}

fn is_string_op(opcode: u8) -> bool {
    matches!(opcode, 0x6c..=0x6f | 0xa4..=0xa7 | 0xaa..=0xaf)
}

fn simd_register_class(map: Map, opcode: u8, pfx: Prefixes) -> RegClass {
    let mmx_opcode = matches!(opcode, 0x60..=0x7f | 0xc4..=0xc5 | 0xd0..=0xff);
    if map == Map::TwoByte && mmx_opcode && pfx.simd() == 0 {
        RegClass::Mmx
    } else {
        RegClass::Xmm
    }
}

/// Mnemonics that change with operand or address size.
fn size_variant(map: Map, opcode: u8, opsize: u8, addr_size: u8, base: &'static str) -> &'static str {
    if map != Map::OneByte {
        return base;
    }
    let pick = |w: &'static str, d: &'static str, q: &'static str| match opsize {
        2 => w,
        8 => q,
        _ => d,
    };
    match opcode {
        0x98 => pick("cbw", "cwde", "cdqe"),
        0x99 => pick("cwd", "cdq", "cqo"),
        0x6d => pick("insw", "insd", "insd"),
        0x6f => pick("outsw", "outsd", "outsd"),
        0xa5 => pick("movsw", "movsd", "movsq"),
        0xa7 => pick("cmpsw", "cmpsd", "cmpsq"),
        0xab => pick("stosw", "stosd", "stosq"),
        0xad => pick("lodsw", "lodsd", "lodsq"),
        0xaf => pick("scasw", "scasd", "scasq"),
        0xcf => pick("iretw", "iret", "iretq"),
        0xe3 => match addr_size {
            8 => "jrcxz",
            2 => "jcxz",
            _ => "jecxz",
        },
        _ => base,
    }
}

/// Hint-space no-ops with their own names.
fn hint_variant(
    map: Map,
    opcode: u8,
    pfx: &Prefixes,
    modrm: Option<&ModRm>,
    base: &'static str,
) -> &'static str {
    match (map, opcode, pfx.rep, modrm.map(|m| m.byte)) {
        (Map::TwoByte, 0x1e, 0xf3, Some(0xfa)) => "endbr64",
        (Map::TwoByte, 0x1e, 0xf3, Some(0xfb)) => "endbr32",
        _ => base,
    }
}

/// Register and flag effects of explicit operands plus the table's implicit sets.
fn dataflow(spec: &OpSpec, operands: &[Operand]) -> (RegSet, RegSet) {
    let mut uses = RegSet::from_masks(spec.regs_use, spec.flags_use);
    let mut defs = RegSet::from_masks(spec.regs_def, spec.flags_def);

    for (i, op) in operands.iter().enumerate() {
        if let Some(m) = op.mem() {
            uses |= m.address_regs();
        }
        let Some(reg) = op.reg() else { continue };
        let Some(g) = reg.gpr() else { continue };
        let (read, write) = match spec.access {
            Access::R => (true, false),
            Access::W => (i > 0, i == 0),
            Access::Rw => (true, i == 0),
            Access::Xchg => (true, i < 2),
            Access::N => (false, false),
        };
        if read {
            uses.insert_gpr(g);
        }
        if write {
            defs.insert_gpr(g);
            if reg.is_partial_gpr() {
                uses.insert_gpr(g);
            }
        }
    }

    // xor r, r / sub r, r produce zero without reading r
    if matches!(spec.mnemonic, "xor" | "sub") && operands.len() == 2 {
        if let (Some(a), Some(b)) = (operands[0].reg(), operands[1].reg()) {
            if a == b && !a.is_partial_gpr() {
                if let Some(g) = a.gpr() {
                    uses.remove_gpr(g);
                }
            }
        }
    }

    (uses, defs)
}

/// Everything operand construction needs to know about the instruction.
struct OperandContext {
    mode64: bool,
    rex: Rex,
    opsize: u8,
    addr_size: u8,
    opsize_prefix: bool,
    force_64: bool,
    simd_reg: RegClass,
    opcode: u8,
}

impl OperandContext {
    fn gpr(&self, num: u8, width: u8) -> Register {
        if width == 1 && !self.rex.present && (4..8).contains(&num) {
            return Register::new(RegClass::Gpr8High, num - 4);
        }
        match Gpr::from_index(num) {
            Some(g) => Register::gpr_sized(g, width),
            None => Register::new(RegClass::Gpr64, num),
        }
    }

    fn y_width(&self) -> u8 {
        if self.mode64 && (self.rex.w || self.force_64) {
            8
        } else {
            4
        }
    }

    fn rm_operand(&self, m: &ModRm, width: u8) -> Operand {
        match m.mem {
            Some(mem) => mem,
            None => Operand::register(self.gpr(m.rm, width)),
        }
    }

    fn immediate(&self, cur: &mut Cursor<'_>, width: u8, signed: bool) -> Result<Operand, DecodeError> {
        let (v, off) = if signed {
            cur.signed(width)?
        } else {
            cur.unsigned(width)?
        };
        Ok(Operand::immediate(v, off, width))
    }

    /// Build one operand. Returns `None` when a memory-only template meets a
    /// register ModRM.
    fn operand(
        &self,
        template: Opnd,
        modrm: Option<&ModRm>,
        cur: &mut Cursor<'_>,
    ) -> Result<Option<Operand>, DecodeError> {
        let address = cur.address();
        let need = || X86Decoder::invalid(address);
        let op = match template {
            Opnd::Eb => self.rm_operand(modrm.ok_or_else(need)?, 1),
            Opnd::Ev => self.rm_operand(modrm.ok_or_else(need)?, self.opsize),
            Opnd::Ew => self.rm_operand(modrm.ok_or_else(need)?, 2),
            Opnd::Ed => self.rm_operand(modrm.ok_or_else(need)?, 4),
            Opnd::Ey => self.rm_operand(modrm.ok_or_else(need)?, self.y_width()),
            Opnd::Gb => Operand::register(self.gpr(modrm.ok_or_else(need)?.reg, 1)),
            Opnd::Gv => Operand::register(self.gpr(modrm.ok_or_else(need)?.reg, self.opsize)),
            Opnd::Gw => Operand::register(self.gpr(modrm.ok_or_else(need)?.reg, 2)),
            Opnd::Gy => Operand::register(self.gpr(modrm.ok_or_else(need)?.reg, self.y_width())),
            Opnd::M => match modrm.ok_or_else(need)?.mem {
                Some(mem) => mem,
                None => return Ok(None),
            },
            Opnd::Ib => self.immediate(cur, 1, true)?,
            Opnd::Iw => self.immediate(cur, 2, false)?,
            Opnd::Iz => self.immediate(cur, if self.opsize == 2 { 2 } else { 4 }, true)?,
            Opnd::Iv => self.immediate(cur, self.opsize, true)?,
            Opnd::Jb => {
                let (v, off) = cur.signed(1)?;
                Operand::relative(v, off, 1)
            }
            Opnd::Jz => {
                let width = if !self.mode64 && self.opsize_prefix { 2 } else { 4 };
                let (v, off) = cur.signed(width)?;
                Operand::relative(v, off, width)
            }
            Opnd::Zb => Operand::register(self.gpr((self.opcode & 7) | self.rex.ext_b(), 1)),
            Opnd::Zv => Operand::register(self.gpr((self.opcode & 7) | self.rex.ext_b(), self.opsize)),
            Opnd::Al => Operand::register(Register::gpr_sized(Gpr::Ax, 1)),
            Opnd::Ax => Operand::register(Register::gpr_sized(Gpr::Ax, self.opsize)),
            Opnd::Cl => Operand::register(Register::gpr_sized(Gpr::Cx, 1)),
            Opnd::Dx => Operand::register(Register::gpr_sized(Gpr::Dx, 2)),
            Opnd::One => Operand::immediate(1, 0, 0),
            Opnd::Ob | Opnd::Ov => {
                let (v, off) = cur.unsigned(self.addr_size)?;
                Operand::memory(Default::default(), v, off, self.addr_size)
            }
            Opnd::Sw => Operand::register(Register::new(
                RegClass::Segment,
                modrm.ok_or_else(need)?.reg & 7,
            )),
            Opnd::Ap => {
                let width = if self.opsize == 2 { 2 } else { 4 };
                let (v, off) = cur.unsigned(width)?;
                cur.unsigned(2)?;
                Operand::immediate(v, off, width)
            }
            Opnd::Vx => Operand::register(Register::new(self.simd_reg, modrm.ok_or_else(need)?.reg)),
            Opnd::Wx => {
                let m = modrm.ok_or_else(need)?;
                match m.mem {
                    Some(mem) => mem,
                    None => Operand::register(Register::new(self.simd_reg, m.rm)),
                }
            }
        };
        Ok(Some(op))
    }
}

/// True when the operand kind is a register of the given GPR.
pub fn operand_is_gpr(op: &Operand, g: Gpr) -> bool {
    matches!(op.kind, OperandKind::Register(r) if r.gpr() == Some(g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::flags::{ZF, ALL as ALL_FLAGS};
    use crate::insn::Flag;
    use rstest::rstest;

    fn d64() -> X86Decoder {
        X86Decoder::new(TargetWidth::Bits64)
    }

    fn d32() -> X86Decoder {
        X86Decoder::new(TargetWidth::Bits32)
    }

    #[rstest]
    #[case::nop(&[0x90], 1, OpcodeClass::Nop)]
    #[case::push_rbp(&[0x55], 1, OpcodeClass::Int)]
    #[case::mov_rbp_rsp(&[0x48, 0x89, 0xe5], 3, OpcodeClass::Int)]
    #[case::sub_rsp_imm8(&[0x48, 0x83, 0xec, 0x10], 4, OpcodeClass::Int)]
    #[case::mov_imm64(&[0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8], 10, OpcodeClass::Int)]
    #[case::mov_rip(&[0x48, 0x8b, 0x05, 0x10, 0, 0, 0], 7, OpcodeClass::Int)]
    #[case::call_rel32(&[0xe8, 0, 0, 0, 0], 5, OpcodeClass::Call)]
    #[case::call_indirect(&[0xff, 0xd0], 2, OpcodeClass::Call)]
    #[case::jmp_table(&[0xff, 0x24, 0xc5, 0, 0x10, 0, 0], 7, OpcodeClass::UncondBranch)]
    #[case::je_short(&[0x74, 0x05], 2, OpcodeClass::CondBranch)]
    #[case::jne_near(&[0x0f, 0x85, 0, 1, 0, 0], 6, OpcodeClass::CondBranch)]
    #[case::ret(&[0xc3], 1, OpcodeClass::Return)]
    #[case::syscall(&[0x0f, 0x05], 2, OpcodeClass::Syscall)]
    #[case::hlt(&[0xf4], 1, OpcodeClass::Halt)]
    #[case::int3(&[0xcc], 1, OpcodeClass::Trap)]
    #[case::ud2(&[0x0f, 0x0b], 2, OpcodeClass::Trap)]
    #[case::nopw(&[0x66, 0x0f, 0x1f, 0x44, 0, 0], 6, OpcodeClass::Nop)]
    #[case::endbr64(&[0xf3, 0x0f, 0x1e, 0xfa], 4, OpcodeClass::Nop)]
    #[case::movaps(&[0x0f, 0x28, 0xc1], 3, OpcodeClass::Simd)]
    #[case::pxor(&[0x66, 0x0f, 0xef, 0xc0], 4, OpcodeClass::Simd)]
    #[case::pshufb(&[0x66, 0x0f, 0x38, 0x00, 0xc1], 5, OpcodeClass::Simd)]
    #[case::palignr(&[0x66, 0x0f, 0x3a, 0x0f, 0xc1, 0x08], 6, OpcodeClass::Simd)]
    #[case::vmovdqu(&[0xc5, 0xfe, 0x6f, 0x06], 4, OpcodeClass::Simd)]
    #[case::vpbroadcast(&[0xc4, 0xe2, 0x7d, 0x58, 0xc0], 5, OpcodeClass::Simd)]
    #[case::evex_vmovdqu64(&[0x62, 0xf1, 0xfe, 0x48, 0x6f, 0x06], 6, OpcodeClass::Simd)]
    #[case::fld(&[0xdd, 0x45, 0xf8], 3, OpcodeClass::Float)]
    #[case::fxch(&[0xd9, 0xc9], 2, OpcodeClass::Float)]
    #[case::rep_stosq(&[0xf3, 0x48, 0xab], 3, OpcodeClass::Int)]
    #[case::lock_cmpxchg(&[0xf0, 0x0f, 0xb1, 0x0a], 4, OpcodeClass::Int)]
    #[case::test_imm(&[0xf7, 0xc1, 1, 0, 0, 0], 6, OpcodeClass::Int)]
    #[case::mov_mem_imm16(&[0x66, 0xc7, 0x00, 0x34, 0x12], 5, OpcodeClass::Int)]
    #[case::enter(&[0xc8, 0x10, 0, 0], 4, OpcodeClass::Int)]
    #[case::cmov(&[0x48, 0x0f, 0x44, 0xc1], 4, OpcodeClass::Int)]
    #[case::popcnt(&[0xf3, 0x48, 0x0f, 0xb8, 0xc1], 5, OpcodeClass::Int)]
    fn test_lengths_64(#[case] bytes: &[u8], #[case] len: usize, #[case] class: OpcodeClass) {
        let (insn, n) = d64().decode(bytes, 0x1000).unwrap();
        assert_eq!(n, len, "{:x?} decoded as {}", bytes, insn);
        assert_eq!(insn.class, class, "{:x?} decoded as {}", bytes, insn);
    }

    #[rstest]
    #[case::inc_eax(&[0x40], 1, "inc")]
    #[case::push_es(&[0x06], 1, "push")]
    #[case::call_rel16(&[0x66, 0xe8, 0x10, 0x00], 4, "call")]
    #[case::mov_abs(&[0xa1, 0, 0x10, 0, 0], 5, "mov")]
    #[case::addr16(&[0x67, 0x8b, 0x46, 0x02], 4, "mov")]
    #[case::lds(&[0xc5, 0x06], 2, "lds")]
    #[case::aaa(&[0x37], 1, "aaa")]
    #[case::int80(&[0xcd, 0x80], 2, "int")]
    fn test_lengths_32(#[case] bytes: &[u8], #[case] len: usize, #[case] mnemonic: &str) {
        let (insn, n) = d32().decode(bytes, 0x8000).unwrap();
        assert_eq!(n, len);
        assert_eq!(insn.mnemonic, mnemonic);
    }

    #[rstest]
    #[case::push_es(&[0x06])]
    #[case::aaa(&[0x37])]
    #[case::into(&[0xce])]
    #[case::bad_0f04(&[0x0f, 0x04])]
    #[case::lea_reg(&[0x48, 0x8d, 0xc0])]
    #[case::g5_slot7(&[0xff, 0xf8])]
    fn test_invalid_in_64(#[case] bytes: &[u8]) {
        match d64().decode(bytes, 0x10) {
            Err(e @ DecodeError::InvalidEncoding { .. }) => {
                assert_eq!(e.address(), 0x10);
                assert!(e.length() >= 1);
            }
            other => panic!("expected invalid encoding, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            d64().decode(&[0xe8, 0x00], 0),
            Err(DecodeError::Truncated { available: 2, .. })
        ));
        assert!(matches!(d64().decode(&[], 0), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_overlong_rejected() {
        let mut bytes = vec![0x66; 15];
        bytes.push(0x90);
        assert!(matches!(
            d64().decode(&bytes, 0),
            Err(DecodeError::InvalidEncoding { .. })
        ));
    }

    #[test]
    fn test_relative_operands() {
        let (call, _) = d64().decode(&[0xe8, 0x0b, 0, 0, 0], 0x1000).unwrap();
        assert_eq!(call.control_target(), Some(0x1010));
        assert_eq!(call.bytes_used_for_target(), 4);
        assert_eq!(call.relative_operand().unwrap().offset, 1);

        let (jmp, _) = d64().decode(&[0xeb, 0xfe], 0x2000).unwrap();
        assert_eq!(jmp.control_target(), Some(0x2000));

        let (lea, _) = d64().decode(&[0x48, 0x8d, 0x05, 0xf9, 0xff, 0xff, 0xff], 0x3000).unwrap();
        assert_eq!(lea.relative_target(), Some(0x3000));
        assert_eq!(lea.control_target(), None);
        assert_eq!(lea.relative_operand().unwrap().offset, 3);

        let (mov32, _) = d32().decode(&[0x8b, 0x05, 0, 0x20, 0, 0], 0).unwrap();
        assert!(!mov32.uses_relative_address());
    }

    #[test]
    fn test_rex_inc_dec_split() {
        let (insn, n) = d64().decode(&[0x48, 0xff, 0xc0], 0).unwrap();
        assert_eq!(insn.mnemonic, "inc");
        assert_eq!(n, 3);
        assert_eq!(insn.operands[0].reg().unwrap().name(), "rax");

        let (insn, _) = d32().decode(&[0x48], 0).unwrap();
        assert_eq!(insn.mnemonic, "dec");
        assert_eq!(insn.operands[0].reg().unwrap().name(), "eax");
    }

    #[test]
    fn test_use_def_sets() {
        // add rax, rbx
        let (add, _) = d64().decode(&[0x48, 0x01, 0xd8], 0).unwrap();
        assert!(add.uses.contains_gpr(Gpr::Ax));
        assert!(add.uses.contains_gpr(Gpr::Bx));
        assert!(add.defs.contains_gpr(Gpr::Ax));
        assert_eq!(add.defs.flag_mask(), STATUS);

        // mov eax, [rbp-8]: full 32-bit def, rbp used for the address
        let (mov, _) = d64().decode(&[0x8b, 0x45, 0xf8], 0).unwrap();
        assert!(!mov.uses.contains_gpr(Gpr::Ax));
        assert!(mov.defs.contains_gpr(Gpr::Ax));
        assert!(mov.uses.contains_gpr(Gpr::Bp));

        // mov al, 1: partial write keeps the upper bits alive
        let (movb, _) = d64().decode(&[0xb0, 0x01], 0).unwrap();
        assert!(movb.uses.contains_gpr(Gpr::Ax));

        // xor eax, eax reads nothing
        let (xor, _) = d64().decode(&[0x31, 0xc0], 0).unwrap();
        assert!(!xor.uses.contains_gpr(Gpr::Ax));
        assert!(xor.defs.contains_gpr(Gpr::Ax));

        // je reads ZF
        let (je, _) = d64().decode(&[0x74, 0x00], 0).unwrap();
        assert_eq!(je.uses.flag_mask(), ZF);

        // pushf reads every flag, popf writes every flag
        let (pushf, _) = d64().decode(&[0x9c], 0).unwrap();
        assert_eq!(pushf.uses.flag_mask(), ALL_FLAGS);
        let (popf, _) = d64().decode(&[0x9d], 0).unwrap();
        assert!(popf.defs.contains_flag(Flag::Of));

        // shl eax, cl leaves flags unchanged when cl is zero
        let (shl, _) = d64().decode(&[0xd3, 0xe0], 0).unwrap();
        assert!(shl.uses.contains_gpr(Gpr::Cx));
        assert!(shl.uses.contains_flag(Flag::Zf));

        // div rcx
        let (div, _) = d64().decode(&[0x48, 0xf7, 0xf1], 0).unwrap();
        assert!(div.uses.contains_gpr(Gpr::Dx));
        assert!(div.defs.contains_gpr(Gpr::Dx));
    }

    #[test]
    fn test_abi_sets() {
        let (call, _) = d64().decode(&[0xe8, 0, 0, 0, 0], 0).unwrap();
        assert!(call.uses.contains_gpr(Gpr::Di));
        assert!(call.defs.contains_gpr(Gpr::R11));
        assert!(!call.defs.contains_gpr(Gpr::Bx));
        assert!(call.uses.contains_gpr(Gpr::Sp));

        let (ret, _) = d64().decode(&[0xc3], 0).unwrap();
        assert!(ret.uses.contains_gpr(Gpr::Ax));
        assert!(ret.uses.contains_gpr(Gpr::R15));
        assert!(!ret.uses.contains_gpr(Gpr::R11));
    }

    #[test]
    fn test_decode_or_invalid() {
        let insn = d64().decode_or_invalid(&[0x06, 0x90], 0x40);
        assert!(insn.is_invalid());
        assert_eq!(insn.size(), 1);
        assert_eq!(insn.address, 0x40);
    }

    #[test]
    fn test_display_and_mnemonics() {
        let (mov, _) = d64().decode(&[0x48, 0x89, 0xe5], 0).unwrap();
        assert_eq!(mov.to_string(), "mov rbp, rsp");
        let (movsd, _) = d64().decode(&[0xf2, 0x0f, 0x10, 0xc1], 0).unwrap();
        assert_eq!(movsd.mnemonic, "movsd");
        let (cdqe, _) = d64().decode(&[0x48, 0x98], 0).unwrap();
        assert_eq!(cdqe.mnemonic, "cdqe");
        let (ah, _) = d64().decode(&[0x88, 0xe0], 0).unwrap();
        assert_eq!(ah.to_string(), "mov al, ah");
        let (spl, _) = d64().decode(&[0x40, 0x88, 0xe0], 0).unwrap();
        assert_eq!(spl.to_string(), "mov al, spl");
        assert!(operand_is_gpr(&spl.operands[1], Gpr::Sp));
    }
}
