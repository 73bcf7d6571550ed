//! Relative references that are resolved once both ends have final addresses.

use crate::encoder::EncodeError;
use crate::insn::Instruction;
use crate::Address;

/// What an anchored instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorTarget {
    /// A fixed address: original code, data or an analysis routine
    Address(Address),
    /// The first byte of the trampoline with this index
    Trampoline(usize),
}

/// Ties the relative operand of one instruction to an [`AnchorTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAnchor {
    /// Index of the owning instruction in its list
    pub owner: usize,
    pub target: AnchorTarget,
}

impl AddressAnchor {
    pub fn new(owner: usize, target: AnchorTarget) -> Self {
        Self { owner, target }
    }

    /// Final address of the target, given where each trampoline was placed.
    pub fn resolve(&self, trampolines: &[Option<Address>]) -> Option<Address> {
        match self.target {
            AnchorTarget::Address(a) => Some(a),
            AnchorTarget::Trampoline(i) => trampolines.get(i).copied().flatten(),
        }
    }

    /// Displacement the owner must encode to reach `target`.
    pub fn link_offset(owner: &Instruction, target: Address) -> i64 {
        target.wrapping_sub(owner.address).wrapping_sub(owner.size() as u64) as i64
    }

    /// Rewrite the owner's relative operand to reach `target`.
    pub fn link(&self, owner: &mut Instruction, target: Address) -> Result<(), EncodeError> {
        owner.set_relative_target(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;
    use crate::TargetWidth;

    #[test]
    fn test_link_offset() {
        let jmp = Encoder::new(TargetWidth::Bits64).jmp_near(0x1000, 0x1000).unwrap();
        assert_eq!(AddressAnchor::link_offset(&jmp, 0x2000), 0x2000 - 0x1005);
        assert_eq!(AddressAnchor::link_offset(&jmp, 0x1000), -5);
    }

    #[test]
    fn test_resolve_and_link() {
        let mut jmp = Encoder::new(TargetWidth::Bits32).jmp_near(0x400, 0x400).unwrap();
        let anchor = AddressAnchor::new(0, AnchorTarget::Trampoline(1));
        let placed = [Some(0x9000), Some(0x9040)];
        let target = anchor.resolve(&placed).unwrap();
        anchor.link(&mut jmp, target).unwrap();
        assert_eq!(jmp.control_target(), Some(0x9040));
        assert_eq!(AddressAnchor::new(0, AnchorTarget::Trampoline(5)).resolve(&placed), None);
    }
}
