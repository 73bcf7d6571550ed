//! A single instrumentation request and its progress through the rewrite.

use std::fmt;

use super::trampoline::{self, Trampoline, TrampolineParts};
use super::{FlagsProtection, InstrumentError, Instrumentation, Location};
use crate::encoder::{Encoder, JUMP_SIZE};
use crate::function::Function;
use crate::insn::flags::{AH_FLAGS, OF};
use crate::insn::{call_effects, Gpr, Instruction, RegSet};
use crate::liveness::Liveness;
use crate::{Address, TargetWidth};

/// Progress of a point. Each transition requires the state before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PointState {
    Requested,
    ProtectionAnalyzed,
    TrampolineGenerated,
    Placed,
    Dumped,
}

impl fmt::Display for PointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointState::Requested => write!(f, "requested"),
            PointState::ProtectionAnalyzed => write!(f, "protection analyzed"),
            PointState::TrampolineGenerated => write!(f, "trampoline generated"),
            PointState::Placed => write!(f, "placed"),
            PointState::Dumped => write!(f, "dumped"),
        }
    }
}

/// What a trampoline saves around inserted code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Protection {
    pub flags: FlagsProtection,
    /// Pushed in order, popped in reverse
    pub saves: Vec<Gpr>,
    /// Step over the red zone before touching the stack
    pub skip_red_zone: bool,
}

impl Protection {
    pub fn uses_stack(&self) -> bool {
        !self.saves.is_empty() || self.flags != FlagsProtection::None
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentationPoint {
    address: Address,
    location: Location,
    instrumentation: Instrumentation,
    precursors: Vec<Instruction>,
    postcursors: Vec<Instruction>,
    ignore_overflow: bool,
    stack_safe: bool,
    state: PointState,
    protection: Option<Protection>,
    /// First byte the site jump overwrites
    site: Option<Address>,
    /// Original instructions covered by the site jump
    displaced: Vec<Instruction>,
    trampoline: Option<Trampoline>,
}

impl InstrumentationPoint {
    pub fn new(address: Address, location: Location, instrumentation: Instrumentation) -> Self {
        Self {
            address,
            location,
            instrumentation,
            precursors: Vec::new(),
            postcursors: Vec::new(),
            ignore_overflow: false,
            stack_safe: true,
            state: PointState::Requested,
            protection: None,
            site: None,
            displaced: Vec::new(),
            trampoline: None,
        }
    }

    /// Instructions run just before the body.
    pub fn with_precursors(mut self, precursors: Vec<Instruction>) -> Self {
        self.precursors = precursors;
        self
    }

    /// Instructions run just after the body.
    pub fn with_postcursors(mut self, postcursors: Vec<Instruction>) -> Self {
        self.postcursors = postcursors;
        self
    }

    /// The overflow flag need not survive the inserted code.
    pub fn ignore_overflow(mut self) -> Self {
        self.ignore_overflow = true;
        self
    }

    /// Nothing may be pushed below the stack pointer at this point.
    pub fn stack_unsafe(mut self) -> Self {
        self.stack_safe = false;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn state(&self) -> PointState {
        self.state
    }

    pub fn protection(&self) -> Option<&Protection> {
        self.protection.as_ref()
    }

    pub fn site(&self) -> Option<Address> {
        self.site
    }

    /// Bytes of original code covered by the site jump.
    pub fn displaced_size(&self) -> usize {
        self.displaced.iter().map(|i| i.size()).sum()
    }

    pub fn displaced(&self) -> &[Instruction] {
        &self.displaced
    }

    pub fn trampoline(&self) -> Option<&Trampoline> {
        self.trampoline.as_ref()
    }

    fn expect(&self, expected: PointState) -> Result<(), InstrumentError> {
        if self.state != expected {
            return Err(InstrumentError::InvalidState {
                address: self.address,
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    /// Registers and flags the inserted code writes.
    pub fn defined(&self, width: TargetWidth) -> RegSet {
        let body = match &self.instrumentation {
            Instrumentation::Call { .. } => call_effects(width).1,
            Instrumentation::Snippet { instructions } => instructions
                .iter()
                .fold(RegSet::EMPTY, |acc, i| acc | i.defs),
        };
        self.precursors
            .iter()
            .chain(self.postcursors.iter())
            .fold(body, |acc, i| acc | i.defs)
    }

    /// Decide flag protection and the register save set from liveness.
    pub fn analyze_protection(
        &mut self,
        function: &Function,
        liveness: &Liveness,
        width: TargetWidth,
    ) -> Result<&Protection, InstrumentError> {
        self.expect(PointState::Requested)?;
        let Some(insn) = function
            .graph()
            .and_then(|g| g.instruction_at(self.address))
        else {
            return Err(InstrumentError::NotInFunction {
                address: self.address,
            });
        };
        let misplaced = match self.location {
            Location::After => !insn.falls_through(),
            Location::Replace => insn.is_control(),
            Location::Before => false,
        };
        if misplaced {
            return Err(InstrumentError::InvalidLocation {
                address: self.address,
            });
        }

        let live = liveness
            .live_at(self.address, self.location)
            .unwrap_or_else(RegSet::all);
        let defined = self.defined(width);
        let at_risk = live & defined;

        let mut live_flags = at_risk.flag_mask();
        if self.ignore_overflow {
            live_flags &= !OF;
        }
        let flags = if live_flags == 0 {
            FlagsProtection::None
        } else if live_flags & !AH_FLAGS == 0 {
            FlagsProtection::Light
        } else {
            FlagsProtection::Full
        };

        let mut saves: Vec<Gpr> = at_risk.gprs().filter(|&r| r != Gpr::Sp).collect();
        if flags == FlagsProtection::Light && live.contains_gpr(Gpr::Ax) && !saves.contains(&Gpr::Ax) {
            saves.insert(0, Gpr::Ax);
        }
        let mut protection = Protection {
            flags,
            saves,
            skip_red_zone: false,
        };
        let calls = matches!(self.instrumentation, Instrumentation::Call { .. });
        let touches_stack = protection.uses_stack() || calls;
        if touches_stack {
            match width {
                TargetWidth::Bits64 => protection.skip_red_zone = true,
                TargetWidth::Bits32 if !self.stack_safe => {
                    return Err(InstrumentError::ProtectionInfeasible {
                        address: self.address,
                    });
                }
                TargetWidth::Bits32 => {}
            }
        }

        log::debug!(
            "Point 0x{:x} ({}): flags {}, saving {} registers",
            self.address,
            self.location,
            protection.flags,
            protection.saves.len()
        );
        self.state = PointState::ProtectionAnalyzed;
        Ok(self.protection.insert(protection))
    }

    /// Choose the displaced instructions and build the trampoline.
    pub fn generate_trampoline(
        &mut self,
        function: &Function,
        encoder: &Encoder,
    ) -> Result<&Trampoline, InstrumentError> {
        self.expect(PointState::ProtectionAnalyzed)?;
        let site = function
            .find_instrumentation_point(self.address, JUMP_SIZE, self.location)
            .ok_or(InstrumentError::NoRoom {
                address: self.address,
                needed: JUMP_SIZE,
            })?;
        let graph = function.graph().ok_or(InstrumentError::NotInFunction {
            address: self.address,
        })?;
        let block = graph
            .block_containing(site)
            .map(|id| graph.block(id))
            .ok_or(InstrumentError::NotInFunction { address: site })?;

        let mut displaced = Vec::new();
        let mut covered = 0;
        for insn in block.instructions.iter().skip_while(|i| i.address != site) {
            if covered >= JUMP_SIZE {
                break;
            }
            covered += insn.size();
            displaced.push(insn.clone());
        }
        let resume = site + covered as Address;

        let relocated: &[Instruction] = match self.location {
            Location::Replace => &displaced[1..],
            Location::Before | Location::After => &displaced,
        };
        let falls_back = relocated.last().map(|i| i.falls_through()).unwrap_or(true);
        let protection = self.protection.clone().unwrap_or_default();
        let t = trampoline::generate(
            encoder,
            &TrampolineParts {
                protection: &protection,
                precursors: &self.precursors,
                body: &self.instrumentation,
                postcursors: &self.postcursors,
                relocated,
                resume: falls_back.then_some(resume),
            },
        )?;

        self.site = Some(site);
        self.displaced = displaced;
        self.state = PointState::TrampolineGenerated;
        Ok(self.trampoline.insert(t))
    }

    /// Fix the trampoline's address in the output region.
    pub fn place(&mut self, address: Address) -> Result<usize, InstrumentError> {
        self.expect(PointState::TrampolineGenerated)?;
        let t = self.trampoline.get_or_insert_with(Trampoline::default);
        t.place(address);
        self.state = PointState::Placed;
        Ok(t.size())
    }

    /// Link the trampoline and write it into `region`, which starts at
    /// `region_base`.
    pub fn dump(
        &mut self,
        region: &mut [u8],
        region_base: Address,
        trampolines: &[Option<Address>],
    ) -> Result<(), InstrumentError> {
        self.expect(PointState::Placed)?;
        let t = self.trampoline.get_or_insert_with(Trampoline::default);
        t.link(trampolines)?;
        let address = t.address.unwrap_or(region_base);
        let bytes = t.bytes();
        let start = address
            .checked_sub(region_base)
            .map(|o| o as usize)
            .filter(|&o| o + bytes.len() <= region.len())
            .ok_or(InstrumentError::OutOfBounds {
                address,
                size: bytes.len(),
            })?;
        region[start..start + bytes.len()].copy_from_slice(&bytes);
        self.state = PointState::Dumped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::liveness::LivenessAnalyzer;
    use crate::strategy::DisassemblyContext;
    use std::collections::HashMap;

    // 0: push rbp ; 1: mov rbp,rsp ; 4: test edi,edi ; 6: je 0xd
    // 8: mov eax,1 ; d: pop rbp ; e: ret
    const SIMPLE: [u8; 15] = [
        0x55, 0x48, 0x89, 0xe5, 0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x5d, 0xc3,
    ];

    fn setup(bytes: &[u8], width: TargetWidth) -> (Function, Liveness) {
        let decoder = X86Decoder::new(width);
        let mut ctx = DisassemblyContext::new();
        let mut f = Function::new("f", 0x1000, bytes.to_vec());
        f.digest(&decoder, &mut ctx).unwrap();
        let live = LivenessAnalyzer::analyze(f.graph().unwrap());
        (f, live)
    }

    /// Abstract values flowing through a trampoline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Value {
        Original,
        Clobbered,
        FlagsCopy,
    }

    /// Walk a trampoline symbolically; returns final flags and registers.
    fn simulate(t: &Trampoline) -> (Value, HashMap<Gpr, Value>) {
        let mut flags = Value::Original;
        let mut regs: HashMap<Gpr, Value> = Gpr::ALL.iter().map(|&r| (r, Value::Original)).collect();
        let mut stack = Vec::new();
        for insn in &t.instructions {
            let reg = insn.operands.first().and_then(|o| o.reg()).and_then(|r| r.gpr());
            match insn.mnemonic {
                "push" => stack.push(regs[&reg.unwrap()]),
                "pop" => {
                    let v = stack.pop().unwrap();
                    regs.insert(reg.unwrap(), v);
                }
                "pushf" => stack.push(flags),
                "popf" => flags = stack.pop().unwrap(),
                "lahf" => {
                    let v = if flags == Value::Original { Value::FlagsCopy } else { Value::Clobbered };
                    regs.insert(Gpr::Ax, v);
                }
                "sahf" => {
                    flags = if regs[&Gpr::Ax] == Value::FlagsCopy {
                        Value::Original
                    } else {
                        Value::Clobbered
                    };
                }
                "lea" | "jmp" => {}
                _ => {
                    for r in insn.defs.gprs().filter(|&r| r != Gpr::Sp) {
                        regs.insert(r, Value::Clobbered);
                    }
                    if insn.defs.has_flags() {
                        flags = Value::Clobbered;
                    }
                }
            }
        }
        assert!(stack.is_empty());
        (flags, regs)
    }

    #[test]
    fn test_state_machine_order() {
        let (f, live) = setup(&SIMPLE, TargetWidth::Bits64);
        let encoder = Encoder::new(TargetWidth::Bits64);
        let mut p = InstrumentationPoint::new(0x1000, Location::Before, Instrumentation::Call { target: 0x9000 });
        let err = p.place(0x5000).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::InvalidState {
                expected: PointState::TrampolineGenerated,
                found: PointState::Requested,
                ..
            }
        ));
        p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        assert!(p.analyze_protection(&f, &live, TargetWidth::Bits64).is_err());
        p.generate_trampoline(&f, &encoder).unwrap();
        assert_eq!(p.site(), Some(0x1000));
        assert_eq!(p.displaced_size(), 6);
        p.place(0x5000).unwrap();
        let mut region = vec![0u8; 0x100];
        p.dump(&mut region, 0x5000, &[]).unwrap();
        assert_eq!(p.state(), PointState::Dumped);
        // lea rsp,[rsp-128] opens the trampoline
        assert_eq!(&region[..5], &[0x48, 0x8d, 0x64, 0x24, 0x80]);
    }

    // 0: test edi,edi ; 2: mov eax,1 ; 7: je 0xa ; 9: nop ; a: ret
    const ZF_LIVE: [u8; 11] = [0x85, 0xff, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x74, 0x01, 0x90, 0xc3];
    // 0: cmp edi,esi ; 2: mov eax,1 ; 7: jl 0xa ; 9: nop ; a: ret
    const OF_LIVE: [u8; 11] = [0x39, 0xf7, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x7c, 0x01, 0x90, 0xc3];

    #[test]
    fn test_flag_protection_levels() {
        let (f, live) = setup(&ZF_LIVE, TargetWidth::Bits64);
        let mut p = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0x9000 });
        let protection = p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        assert_eq!(protection.flags, FlagsProtection::Light);

        // inc writes OF too, but only ZF is live here
        let inc = X86Decoder::new(TargetWidth::Bits64).decode(&[0xff, 0xc1], 0).unwrap().0;
        let mut q = InstrumentationPoint::new(
            0x1002,
            Location::Before,
            Instrumentation::Snippet { instructions: vec![inc] },
        );
        let protection = q.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        assert_eq!(protection.flags, FlagsProtection::Light);

        let (g, live) = setup(&OF_LIVE, TargetWidth::Bits64);
        let mut r = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0x9000 });
        let protection = r.analyze_protection(&g, &live, TargetWidth::Bits64).unwrap();
        assert_eq!(protection.flags, FlagsProtection::Full);

        let mut s = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0x9000 })
            .ignore_overflow();
        let protection = s.analyze_protection(&g, &live, TargetWidth::Bits64).unwrap();
        assert_eq!(protection.flags, FlagsProtection::Light);
    }

    #[test]
    fn test_full_protection_preserves_flags() {
        let (f, live) = setup(&OF_LIVE, TargetWidth::Bits64);
        let encoder = Encoder::new(TargetWidth::Bits64);
        let mut p = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0x9000 });
        p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        let t = p.generate_trampoline(&f, &encoder).unwrap();
        assert!(t.instructions.iter().any(|i| i.mnemonic == "pushf"));
        let (flags, regs) = simulate(t);
        assert_eq!(flags, Value::Original);
        let live_in = live.live_in(0x1002).unwrap();
        for r in live_in.gprs().filter(|&r| r != Gpr::Sp) {
            assert_eq!(regs[&r], Value::Original, "{:?} clobbered", r);
        }
    }

    #[test]
    fn test_light_protection_preserves_flags() {
        let (f, live) = setup(&ZF_LIVE, TargetWidth::Bits64);
        let encoder = Encoder::new(TargetWidth::Bits64);
        let mut p = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0x9000 });
        p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        let t = p.generate_trampoline(&f, &encoder).unwrap();
        assert!(t.instructions.iter().any(|i| i.mnemonic == "lahf"));
        let (flags, regs) = simulate(t);
        assert_eq!(flags, Value::Original);
        let live_in = live.live_in(0x1002).unwrap();
        for r in live_in.gprs().filter(|&r| r != Gpr::Sp) {
            assert_eq!(regs[&r], Value::Original, "{:?} clobbered", r);
        }
    }

    #[test]
    fn test_no_protection_defines_no_flag() {
        let (f, live) = setup(&SIMPLE, TargetWidth::Bits64);
        let encoder = Encoder::new(TargetWidth::Bits64);
        // no flag is live at mov eax,1
        let mov = encoder.mov_imm(Gpr::Cx, 7).unwrap();
        let mut p = InstrumentationPoint::new(
            0x1008,
            Location::Before,
            Instrumentation::Snippet { instructions: vec![mov] },
        );
        let protection = p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap().clone();
        assert_eq!(protection.flags, FlagsProtection::None);
        assert!(protection.saves.is_empty());
        let t = p.generate_trampoline(&f, &encoder).unwrap();
        assert!(t.instructions.iter().all(|i| !i.defs.has_flags()));
        assert!(!t.instructions.iter().any(|i| i.mnemonic == "lea"));
    }

    #[test]
    fn test_unsafe_stack_without_red_zone_is_infeasible() {
        // 32-bit: push ebp ; mov ebp,esp ; test edi,edi ; je ; ...
        let bytes = [0x55, 0x89, 0xe5, 0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x5d, 0xc3];
        let (f, live) = setup(&bytes, TargetWidth::Bits32);
        let mut p = InstrumentationPoint::new(0x1005, Location::Before, Instrumentation::Call { target: 0x9000 })
            .stack_unsafe();
        let err = p.analyze_protection(&f, &live, TargetWidth::Bits32).unwrap_err();
        assert!(matches!(err, InstrumentError::ProtectionInfeasible { address: 0x1005 }));
        assert!(err.drops_point());
    }

    #[test]
    fn test_invalid_locations() {
        let (f, live) = setup(&SIMPLE, TargetWidth::Bits64);
        let mut after_ret = InstrumentationPoint::new(0x100e, Location::After, Instrumentation::Call { target: 0 });
        assert!(matches!(
            after_ret.analyze_protection(&f, &live, TargetWidth::Bits64),
            Err(InstrumentError::InvalidLocation { .. })
        ));
        let mut mid = InstrumentationPoint::new(0x1002, Location::Before, Instrumentation::Call { target: 0 });
        assert!(matches!(
            mid.analyze_protection(&f, &live, TargetWidth::Bits64),
            Err(InstrumentError::NotInFunction { .. })
        ));
    }

    #[test]
    fn test_no_room_at_block_end() {
        let (f, live) = setup(&SIMPLE, TargetWidth::Bits64);
        let encoder = Encoder::new(TargetWidth::Bits64);
        let mut p = InstrumentationPoint::new(0x100d, Location::Before, Instrumentation::Call { target: 0 });
        p.analyze_protection(&f, &live, TargetWidth::Bits64).unwrap();
        assert!(matches!(
            p.generate_trampoline(&f, &encoder),
            Err(InstrumentError::NoRoom { needed: 5, .. })
        ));
    }
}
