//! Disassembly strategies

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use clap::ValueEnum;

use crate::insn::Instruction;
use crate::{Address, Decoder, DisassemblyError, ImageReader};

pub mod jump_table;
pub mod linear;
pub mod recursive;

pub use jump_table::{JumpTable, JumpTableMode};

/// Default bound below which a jump-table entry is read as an offset.
pub const DEFAULT_REACHES: u64 = 0x1000;

/// Available disassembly strategies.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Linear sweep disassembly
    Linear,
    /// Recursive descent disassembly (control flow analysis)
    Recursive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Linear => write!(f, "Linear sweep"),
            Strategy::Recursive => write!(f, "Recursive descent"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Strategy::Linear),
            "recursive" => Ok(Strategy::Recursive),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// Inputs and side results shared by the strategies for one function.
pub struct DisassemblyContext<'a> {
    /// Loaded image, used to read jump tables that live outside the function.
    pub image: Option<&'a dyn ImageReader>,
    /// Entries with a magnitude below this are offsets rather than addresses.
    pub reaches: u64,
    /// Jump tables resolved during the last run, keyed by branch address.
    pub jump_tables: BTreeMap<Address, JumpTable>,
}

impl<'a> DisassemblyContext<'a> {
    pub fn new() -> Self {
        Self {
            image: None,
            reaches: DEFAULT_REACHES,
            jump_tables: BTreeMap::new(),
        }
    }

    pub fn with_image(mut self, image: &'a dyn ImageReader) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_reaches(mut self, reaches: u64) -> Self {
        self.reaches = reaches;
        self
    }
}

impl Default for DisassemblyContext<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy {
    /// Disassemble the function occupying `bytes` at `base` with the selected strategy.
    ///
    /// Returns the instructions sorted by address.
    pub fn disassemble_function(
        &self,
        bytes: &[u8],
        base: Address,
        decoder: &dyn Decoder,
        ctx: &mut DisassemblyContext<'_>,
    ) -> Result<Vec<Instruction>, DisassemblyError> {
        ctx.jump_tables.clear();
        match self {
            Strategy::Linear => linear::run(bytes, base, decoder),
            Strategy::Recursive => recursive::run(bytes, base, decoder, ctx),
        }
    }

    /// Return all available strategies
    pub fn all() -> &'static [Strategy] {
        &[Strategy::Linear, Strategy::Recursive]
    }

    /// Return the default strategy
    pub fn default() -> Self {
        Strategy::Recursive
    }
}
