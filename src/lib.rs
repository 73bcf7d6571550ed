//! Core types, traits and metadata for the gamma_probe static instrumentation toolkit.
//!
//! The crate takes x86 / x86-64 ELF executables apart, rebuilds per-function
//! control flow, works out which registers and flags are live at each
//! instruction and rewrites code so that it jumps into trampolines which call
//! analysis routines. A separate engine replays traced memory-address streams
//! through reuse-distance and cache models.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use gamma_probe::{
//!     decoder::X86Decoder,
//!     function::Function,
//!     parser::GoblinParser,
//!     strategy::DisassemblyContext,
//!     BinaryParser, // Import the trait to bring parse() method into scope
//!     ImageReader,
//! };
//!
//! let binary_data = fs::read("path/to/binary").unwrap();
//!
//! let parser = GoblinParser::new();
//! let metadata = parser.parse(&binary_data).unwrap();
//! let decoder = X86Decoder::for_architecture(metadata.architecture).unwrap();
//! let image = metadata.reader(&binary_data);
//!
//! for symbol in &metadata.functions {
//!     let Some(bytes) = image.read(symbol.address, symbol.size) else { continue };
//!     let mut ctx = DisassemblyContext::new().with_image(&image);
//!     let mut function = Function::new(&symbol.name, symbol.address, bytes.to_vec());
//!     function.digest(&decoder, &mut ctx).unwrap();
//!     // ...
//! }
//! ```

pub mod insn;
pub mod decoder;
pub mod encoder;
pub mod parser;
pub mod strategy;
pub mod cfg;
pub mod function;
pub mod liveness;
pub mod instrument;
pub mod reuse;
pub mod cache;
pub mod sim;
pub mod format;
pub mod pipeline;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

use decoder::DecodeError;
use encoder::EncodeError;
use insn::Instruction;

/// Operand and address width of the code being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetWidth {
    /// IA-32 protected mode
    Bits32,
    /// Long mode
    Bits64,
}

impl TargetWidth {
    /// Size in bytes of a pointer / stack slot.
    pub fn word_size(self) -> usize {
        match self {
            TargetWidth::Bits32 => 4,
            TargetWidth::Bits64 => 8,
        }
    }
}

impl fmt::Display for TargetWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetWidth::Bits32 => write!(f, "32-bit"),
            TargetWidth::Bits64 => write!(f, "64-bit"),
        }
    }
}

/// Decoder trait: turns bytes into instructions for one target width.
pub trait Decoder: Send + Sync {
    /// Width the decoder was built for.
    fn width(&self) -> TargetWidth;

    /// Decode a single instruction from the start of `bytes`.
    ///
    /// # Arguments
    /// * `bytes` - Code bytes beginning at `address`
    /// * `address` - Virtual address of `bytes[0]`
    ///
    /// # Returns
    /// The instruction and the number of bytes it occupies
    fn decode(&self, bytes: &[u8], address: Address) -> Result<(Instruction, usize), DecodeError>;
}

/// Read access to the loaded image by virtual address.
pub trait ImageReader {
    /// Return `len` bytes at `addr`, or `None` if any of them is unmapped.
    fn read(&self, addr: Address, len: usize) -> Option<&[u8]>;

    /// Read a little-endian word of `width` bytes (4 or 8).
    fn read_word(&self, addr: Address, width: usize) -> Option<u64> {
        let raw = self.read(addr, width)?;
        match width {
            4 => Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64),
            8 => {
                let mut word = [0u8; 8];
                word.copy_from_slice(raw);
                Some(u64::from_le_bytes(word))
            }
            _ => None,
        }
    }
}

/// A contiguous block of bytes mapped at `base`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlatImage {
    pub base: Address,
    pub bytes: Vec<u8>,
}

impl FlatImage {
    pub fn new(base: Address, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }
}

impl ImageReader for FlatImage {
    fn read(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// Anything else found in an ELF header
    Unknown,
}

impl Architecture {
    /// Target width for x86 architectures.
    pub fn width(self) -> Option<TargetWidth> {
        match self {
            Architecture::X86_32 => Some(TargetWidth::Bits32),
            Architecture::X86_64 => Some(TargetWidth::Bits64),
            Architecture::Unknown => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A section in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Starting address of the section
    pub address: Address,
    /// Offset of the section contents in the file
    pub offset: usize,
    /// Size of the section in bytes
    pub size: usize,
    /// Whether this section contains executable code
    pub executable: bool,
    /// Whether the section occupies bytes in the file (false for .bss)
    pub has_bits: bool,
}

impl Section {
    /// Create a new section whose file offset equals its address
    pub fn new(name: String, address: Address, size: usize, executable: bool) -> Self {
        Self {
            name,
            address,
            offset: address as usize,
            size,
            executable,
            has_bits: true,
        }
    }

    /// Set the file offset of the section contents
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Mark the section as occupying no file bytes
    pub fn without_bits(mut self) -> Self {
        self.has_bits = false;
        self
    }

    /// Get the end address of this section
    pub fn end_address(&self) -> Address {
        self.address + self.size as Address
    }

    /// Whether `addr` falls inside the section
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.end_address()
    }
}

/// A function symbol from the symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: Address,
    pub size: usize,
}

/// Metadata describing a parsed binary.
#[derive(Debug, Clone)]
pub struct BinaryMetadata {
    /// Detected architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// List of sections found in the binary
    pub sections: Vec<Section>,
    /// Address of the .text section, if found
    pub text_section: Option<Address>,
    /// Sized function symbols, sorted by address
    pub functions: Vec<FunctionSymbol>,
}

impl BinaryMetadata {
    /// Fallback metadata when no headers could be parsed.
    pub fn default_raw() -> Self {
        Self {
            architecture: Architecture::Unknown,
            entry_point: None,
            sections: Vec::new(),
            text_section: None,
            functions: Vec::new(),
        }
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Find the allocated section that holds `addr`
    pub fn section_containing(&self, addr: Address) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.address != 0 && s.contains(addr))
    }

    /// An [`ImageReader`] over the file contents, addressed through the section table.
    pub fn reader<'a>(&'a self, img: &'a [u8]) -> SectionReader<'a> {
        SectionReader {
            metadata: self,
            img,
        }
    }
}

/// Reads file-backed section contents by virtual address.
#[derive(Debug, Clone, Copy)]
pub struct SectionReader<'a> {
    metadata: &'a BinaryMetadata,
    img: &'a [u8],
}

impl ImageReader for SectionReader<'_> {
    fn read(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let section = self.metadata.section_containing(addr)?;
        if !section.has_bits {
            return None;
        }
        let rel = (addr - section.address) as usize;
        if rel.checked_add(len)? > section.size {
            return None;
        }
        let start = section.offset.checked_add(rel)?;
        self.img.get(start..start.checked_add(len)?)
    }
}

/// Parser trait: turn raw bytes into `BinaryMetadata`.
pub trait BinaryParser: Send + Sync {
    /// Parse binary data into metadata
    ///
    /// # Arguments
    /// * `data` - The binary data to parse
    ///
    /// # Returns
    /// Result containing BinaryMetadata if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, DisassemblyError>;
}

/// Error type for disassembly and CFG operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// An instruction could not be decoded
    #[error("Decoder error: {0}")]
    Decode(#[from] DecodeError),

    /// A control target lands inside an already decoded instruction
    #[error("Control flow reaches 0x{address:x} in the middle of an instruction")]
    Overlap { address: Address },

    /// Two instructions claim the same address
    #[error("Duplicate instruction at 0x{address:x}")]
    DuplicateAddress { address: Address },

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// A structural check on a function or flow graph failed
    #[error("Verification failed: {0}")]
    Verify(String),

    /// Re-encoding an instruction failed
    #[error("Encoder error: {0}")]
    Encode(#[from] EncodeError),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> BinaryMetadata {
        let mut meta = BinaryMetadata::default_raw();
        meta.sections.push(Section::new(".text".into(), 0x1000, 0x10, true).with_offset(0x0));
        meta.sections.push(Section::new(".rodata".into(), 0x2000, 0x8, false).with_offset(0x10));
        meta.sections.push(Section::new(".bss".into(), 0x3000, 0x100, false).without_bits());
        meta
    }

    #[test]
    fn test_flat_image_reads() {
        let image = FlatImage::new(0x400, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.read(0x402, 2), Some(&[3u8, 4][..]));
        assert_eq!(image.read(0x3ff, 1), None);
        assert_eq!(image.read(0x406, 4), None);
        assert_eq!(image.read_word(0x400, 4), Some(0x0403_0201));
        assert_eq!(image.read_word(0x400, 8), Some(0x0807_0605_0403_0201));
    }

    #[test]
    fn test_section_reader_uses_file_offsets() {
        let meta = metadata();
        let mut img = vec![0x90u8; 0x10];
        img.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0, 0, 0, 0]);
        let reader = meta.reader(&img);

        assert_eq!(reader.read(0x2000, 2), Some(&[0xaa, 0xbb][..]));
        assert_eq!(reader.read_word(0x2000, 4), Some(0xddcc_bbaa));
        // straddles the end of .rodata
        assert_eq!(reader.read(0x2006, 4), None);
        // no file bytes behind .bss
        assert_eq!(reader.read(0x3000, 1), None);
        assert_eq!(reader.read(0x5000, 1), None);
    }

    #[test]
    fn test_section_lookup() {
        let meta = metadata();
        assert_eq!(meta.section_containing(0x2004).map(|s| s.name.as_str()), Some(".rodata"));
        assert!(meta.section_containing(0x2008).is_none());
        assert!(meta.find_section(".text").unwrap().executable);
        assert_eq!(Architecture::X86_64.width(), Some(TargetWidth::Bits64));
        assert_eq!(TargetWidth::Bits32.word_size(), 4);
    }
}
