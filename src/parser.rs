//! Goblin-based ELF parser.

use std::fmt;
use goblin::{elf, Object};

use crate::{Architecture, BinaryMetadata, BinaryParser, DisassemblyError, FunctionSymbol, Section};

/// A parser that reads x86 ELF images via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: elf::Elf) -> Result<BinaryMetadata, DisassemblyError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown,
        };

        // Gather all sections
        let mut sections = Vec::new();
        for sh in &elf.section_headers {
            if let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) {
                let mut section = Section::new(
                    name.to_string(),
                    sh.sh_addr,
                    sh.sh_size as usize,
                    sh.is_executable(),
                )
                .with_offset(sh.sh_offset as usize);
                if sh.sh_type == elf::section_header::SHT_NOBITS {
                    section = section.without_bits();
                }
                sections.push(section);
            }
        }

        let text_section = sections
            .iter()
            .find(|s| s.name == ".text")
            .map(|s| s.address);

        let mut functions: Vec<FunctionSymbol> = elf
            .syms
            .iter()
            .filter(|sym| sym.is_function() && sym.st_value != 0 && sym.st_size != 0)
            .filter_map(|sym| {
                let name = elf.strtab.get_at(sym.st_name)?;
                Some(FunctionSymbol {
                    name: name.to_string(),
                    address: sym.st_value,
                    size: sym.st_size as usize,
                })
            })
            .collect();
        functions.sort_by_key(|f| f.address);
        // aliases share an address; keep the first name seen
        functions.dedup_by_key(|f| f.address);

        log::debug!(
            "ELF {}: {} sections, {} function symbols",
            arch,
            sections.len(),
            functions.len()
        );

        Ok(BinaryMetadata {
            architecture: arch,
            entry_point: Some(elf.entry),
            sections,
            text_section,
            functions,
        })
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, DisassemblyError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf),
            Ok(_) => Err(DisassemblyError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(DisassemblyError::ParsingError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageReader;

    #[test]
    fn test_default_raw() {
        let meta = BinaryMetadata::default_raw();
        assert_eq!(meta.architecture, Architecture::Unknown);
        assert!(meta.entry_point.is_none());
        assert!(meta.sections.is_empty());
        assert!(meta.text_section.is_none());
        assert!(meta.functions.is_empty());
    }

    #[test]
    fn test_rejects_non_elf() {
        let parser = GoblinParser::new();
        assert!(matches!(
            parser.parse(b"definitely not an object file"),
            Err(DisassemblyError::ParsingError(_))
        ));
    }

    #[test]
    fn test_host_binary() {
        let Ok(data) = std::fs::read("/bin/ls") else {
            return;
        };
        let Ok(meta) = GoblinParser::new().parse(&data) else {
            return;
        };
        if meta.architecture == Architecture::Unknown {
            return;
        }
        let text = meta.find_section(".text").expect(".text present");
        assert!(text.executable);
        let reader = meta.reader(&data);
        assert!(reader.read(text.address, 16).is_some());
    }
}
