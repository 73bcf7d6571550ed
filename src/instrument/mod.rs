//! Instrumentation points and the trampolines that carry them.
//!
//! A point asks for a call (or an inline snippet) at an instruction. The
//! original bytes at the point are replaced by a `jmp rel32` into a
//! trampoline placed in a new text region. The trampoline saves whatever the
//! inserted code would clobber, runs it, restores state, executes the
//! instructions the jump displaced, and jumps back.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::encoder::EncodeError;
use crate::insn::Instruction;
use crate::Address;

mod anchor;
mod point;
mod rewriter;
mod trampoline;

pub use anchor::{AddressAnchor, AnchorTarget};
pub use point::{InstrumentationPoint, PointState, Protection};
pub use rewriter::Rewriter;
pub use trampoline::Trampoline;

/// Where inserted code runs relative to the instruction at the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum Location {
    Before,
    After,
    /// Instead of the instruction
    Replace,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Before => write!(f, "before"),
            Location::After => write!(f, "after"),
            Location::Replace => write!(f, "replace"),
        }
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before" | "prior" => Ok(Location::Before),
            "after" => Ok(Location::After),
            "replace" => Ok(Location::Replace),
            _ => Err(format!("Unknown location: {}", s)),
        }
    }
}

/// What runs at a point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instrumentation {
    /// `call rel32` to an analysis routine
    Call { target: Address },
    /// Instructions copied inline into the trampoline
    Snippet { instructions: Vec<Instruction> },
}

/// How the flags are preserved around inserted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, ValueEnum)]
pub enum FlagsProtection {
    /// No live flag is clobbered
    #[default]
    None,
    /// Only flags held in AH are at risk: lahf/sahf through AX
    Light,
    /// pushf/popf
    Full,
}

impl fmt::Display for FlagsProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagsProtection::None => write!(f, "none"),
            FlagsProtection::Light => write!(f, "light"),
            FlagsProtection::Full => write!(f, "full"),
        }
    }
}

impl FromStr for FlagsProtection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(FlagsProtection::None),
            "light" => Ok(FlagsProtection::Light),
            "full" => Ok(FlagsProtection::Full),
            _ => Err(format!("Unknown flags protection: {}", s)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("point at 0x{address:x} is {found}, expected {expected}")]
    InvalidState {
        address: Address,
        expected: PointState,
        found: PointState,
    },

    #[error("cannot protect state at 0x{address:x} without touching an unsafe stack")]
    ProtectionInfeasible { address: Address },

    #[error("no room for a {needed}-byte patch at 0x{address:x}")]
    NoRoom { address: Address, needed: usize },

    #[error("instrumentation cannot be placed at 0x{address:x} in that location")]
    InvalidLocation { address: Address },

    #[error("0x{address:x} is not an instruction of the function")]
    NotInFunction { address: Address },

    #[error("patch at 0x{address:x} overlaps another point")]
    Overlap { address: Address },

    #[error("anchor in instruction at 0x{address:x} refers to an unplaced trampoline")]
    UnresolvedAnchor { address: Address },

    #[error("encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("{size} bytes at 0x{address:x} do not fit the output buffer")]
    OutOfBounds { address: Address, size: usize },
}

impl InstrumentError {
    /// The point is skipped and the run continues.
    pub fn drops_point(&self) -> bool {
        matches!(
            self,
            InstrumentError::ProtectionInfeasible { .. }
                | InstrumentError::NoRoom { .. }
                | InstrumentError::InvalidLocation { .. }
                | InstrumentError::NotInFunction { .. }
                | InstrumentError::Overlap { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("before", Location::Before)]
    #[case("Prior", Location::Before)]
    #[case("AFTER", Location::After)]
    #[case("replace", Location::Replace)]
    fn test_location_from_str(#[case] input: &str, #[case] expected: Location) {
        assert_eq!(input.parse::<Location>().unwrap(), expected);
    }

    #[test]
    fn test_flags_protection_names() {
        for p in [FlagsProtection::None, FlagsProtection::Light, FlagsProtection::Full] {
            assert_eq!(p.to_string().parse::<FlagsProtection>().unwrap(), p);
        }
        assert!("heavy".parse::<FlagsProtection>().is_err());
    }

    #[test]
    fn test_dropping_errors() {
        assert!(InstrumentError::NoRoom { address: 0, needed: 5 }.drops_point());
        assert!(!InstrumentError::Encode(EncodeError::Overflow { value: 0, bytes: 1 }).drops_point());
    }
}
