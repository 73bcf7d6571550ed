//! Trampoline code generation.

use super::anchor::{AddressAnchor, AnchorTarget};
use super::point::Protection;
use super::{FlagsProtection, InstrumentError, Instrumentation};
use crate::encoder::{EncodeError, Encoder};
use crate::insn::{Gpr, Instruction};
use crate::Address;

/// Bytes below the stack pointer the 64-bit ABI lets leaf code use.
pub const RED_ZONE: i64 = 128;

/// Generated code for one point, with the anchors that still need linking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trampoline {
    pub instructions: Vec<Instruction>,
    pub anchors: Vec<AddressAnchor>,
    /// Set once placed in the output region
    pub address: Option<Address>,
}

impl Trampoline {
    pub fn size(&self) -> usize {
        self.instructions.iter().map(|i| i.size()).sum()
    }

    fn emit(&mut self, insn: Instruction) {
        self.instructions.push(insn);
    }

    /// Emit a copy of `insn`, anchoring its relative operand to whatever it
    /// refers to at its current address.
    fn emit_anchored(&mut self, insn: Instruction) {
        if let Some(target) = insn.relative_target() {
            self.anchors.push(AddressAnchor::new(
                self.instructions.len(),
                AnchorTarget::Address(target),
            ));
        }
        self.emit(insn);
    }

    fn emit_to(&mut self, insn: Instruction, target: AnchorTarget) {
        self.anchors
            .push(AddressAnchor::new(self.instructions.len(), target));
        self.emit(insn);
    }

    /// Lay the instructions out from `address`.
    pub fn place(&mut self, address: Address) {
        let mut at = address;
        for insn in self.instructions.iter_mut() {
            insn.address = at;
            at += insn.size() as Address;
        }
        self.address = Some(address);
    }

    /// Resolve every anchor against final addresses.
    pub fn link(&mut self, trampolines: &[Option<Address>]) -> Result<(), InstrumentError> {
        for anchor in &self.anchors {
            let owner = &mut self.instructions[anchor.owner];
            let Some(target) = anchor.resolve(trampolines) else {
                return Err(InstrumentError::UnresolvedAnchor {
                    address: owner.address,
                });
            };
            anchor.link(owner, target)?;
        }
        Ok(())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.instructions
            .iter()
            .flat_map(|i| i.bytes.iter().copied())
            .collect()
    }
}

/// Everything a trampoline is generated from.
pub(super) struct TrampolineParts<'a> {
    pub protection: &'a Protection,
    pub precursors: &'a [Instruction],
    pub body: &'a Instrumentation,
    pub postcursors: &'a [Instruction],
    /// Original instructions displaced by the site jump, at their old addresses
    pub relocated: &'a [Instruction],
    /// Where execution continues in the original code, if it falls back
    pub resume: Option<Address>,
}

/// Emit, in order: red-zone skip, register saves, flags save, precursors,
/// body, postcursors, flags restore, register restores, stack restore,
/// relocated originals and the jump back.
pub(super) fn generate(encoder: &Encoder, parts: &TrampolineParts<'_>) -> Result<Trampoline, EncodeError> {
    let mut t = Trampoline::default();
    let protection = parts.protection;

    if protection.skip_red_zone {
        t.emit(encoder.adjust_stack(-RED_ZONE)?);
    }
    for &r in &protection.saves {
        t.emit(encoder.push(r)?);
    }
    match protection.flags {
        FlagsProtection::None => {}
        FlagsProtection::Light => {
            t.emit(encoder.lahf());
            t.emit(encoder.push(Gpr::Ax)?);
        }
        FlagsProtection::Full => t.emit(encoder.pushf()),
    }

    for insn in parts.precursors {
        t.emit_anchored(insn.clone());
    }
    match parts.body {
        Instrumentation::Call { target } => {
            t.emit_to(encoder.call(0, 0)?, AnchorTarget::Address(*target));
        }
        Instrumentation::Snippet { instructions } => {
            for insn in instructions {
                t.emit_anchored(insn.clone());
            }
        }
    }
    for insn in parts.postcursors {
        t.emit_anchored(insn.clone());
    }

    match protection.flags {
        FlagsProtection::None => {}
        FlagsProtection::Light => {
            t.emit(encoder.pop(Gpr::Ax)?);
            t.emit(encoder.sahf());
        }
        FlagsProtection::Full => t.emit(encoder.popf()),
    }
    for &r in protection.saves.iter().rev() {
        t.emit(encoder.pop(r)?);
    }
    if protection.skip_red_zone {
        t.emit(encoder.adjust_stack(RED_ZONE)?);
    }

    for insn in parts.relocated.iter().filter(|i| !i.is_nop()) {
        let mut moved = insn.clone();
        let target = moved.relative_target();
        moved.widen_target_operand()?;
        match target {
            Some(target) => t.emit_to(moved, AnchorTarget::Address(target)),
            None => t.emit(moved),
        }
    }
    if let Some(resume) = parts.resume {
        t.emit_to(encoder.jmp_near(0, 0)?, AnchorTarget::Address(resume));
    }
    Ok(t)
}
