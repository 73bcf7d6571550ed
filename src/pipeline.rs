//! End-to-end drivers: rewrite an ELF executable so every basic block calls
//! an analysis routine, and replay recorded address traces through the
//! simulation engines.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::cache::config::load_hierarchies;
use crate::decoder::X86Decoder;
use crate::function::Function;
use crate::instrument::{Instrumentation, InstrumentationPoint, Location, Rewriter};
use crate::liveness::LivenessAnalyzer;
use crate::parser::GoblinParser;
use crate::sim::{simulate_streams, MemoryAccess, SimulationConfig, SimulationContext, SimulationReport};
use crate::strategy::DisassemblyContext;
use crate::{Address, BinaryMetadata, BinaryParser, ImageReader};

/// Alignment of the trampoline region placed after the last section.
const REGION_ALIGN: Address = 0x1000;

/// A parsed binary with every sized function symbol digested.
#[derive(Debug)]
pub struct DigestedBinary {
    pub data: Vec<u8>,
    pub metadata: BinaryMetadata,
    pub functions: Vec<Function>,
    /// Symbols whose bytes could not be read or decoded, with the reason
    pub skipped: Vec<(String, String)>,
}

impl DigestedBinary {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name() == name)
    }

    /// First page-aligned address past every section.
    pub fn default_region_base(&self) -> Address {
        let end = self
            .metadata
            .sections
            .iter()
            .map(|s| s.end_address())
            .max()
            .unwrap_or(0);
        end.div_ceil(REGION_ALIGN) * REGION_ALIGN
    }
}

/// Options of [`instrument_blocks`].
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    /// Analysis routine each block calls
    pub call_target: Address,
    /// Start of the trampoline region, after the last section when unset
    pub region_base: Option<Address>,
    pub location: Location,
}

/// Patched text and the new trampoline region.
#[derive(Debug, Clone)]
pub struct InstrumentedImage {
    pub text_base: Address,
    pub text: Vec<u8>,
    pub region_base: Address,
    pub region: Vec<u8>,
    pub placed: usize,
    pub dropped: usize,
}

/// Parse `data` and digest every function symbol in parallel.
///
/// With `verify` set, a function whose digested form fails its structural
/// checks aborts the run.
pub fn digest_binary(data: Vec<u8>, verify: bool) -> Result<DigestedBinary> {
    let metadata = GoblinParser::new()
        .parse(&data)
        .context("Failed to parse the executable")?;
    let decoder = X86Decoder::for_architecture(metadata.architecture)
        .with_context(|| format!("Cannot decode {} code", metadata.architecture))?;
    log::info!(
        "Digesting {} functions ({})",
        metadata.functions.len(),
        metadata.architecture
    );

    let results: Vec<std::result::Result<Function, (String, String)>> = metadata
        .functions
        .par_iter()
        .map(|symbol| {
            let image = metadata.reader(&data);
            let bytes = image
                .read(symbol.address, symbol.size)
                .ok_or_else(|| (symbol.name.clone(), "bytes are not in the file".to_string()))?;
            let mut ctx = DisassemblyContext::new().with_image(&image);
            let mut function = Function::new(&symbol.name, symbol.address, bytes.to_vec());
            function
                .digest(&decoder, &mut ctx)
                .map_err(|e| (symbol.name.clone(), e.to_string()))?;
            Ok(function)
        })
        .collect();

    let mut functions = Vec::new();
    let mut skipped = Vec::new();
    for r in results {
        match r {
            Ok(f) => functions.push(f),
            Err((name, reason)) => {
                log::warn!("Skipping {}: {}", name, reason);
                skipped.push((name, reason));
            }
        }
    }

    if verify {
        for f in &functions {
            f.verify()
                .with_context(|| format!("{} at 0x{:x} failed verification", f.name(), f.base()))?;
        }
    }
    log::info!("Digested {} functions, skipped {}", functions.len(), skipped.len());
    Ok(DigestedBinary {
        data,
        metadata,
        functions,
        skipped,
    })
}

pub fn digest_file(path: impl AsRef<Path>, verify: bool) -> Result<DigestedBinary> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    digest_binary(data, verify)
}

/// Put a call to `options.call_target` at the leader of every reachable
/// basic block of every function inside `.text`.
pub fn instrument_blocks(binary: &DigestedBinary, options: &InstrumentOptions) -> Result<InstrumentedImage> {
    let width = binary
        .metadata
        .architecture
        .width()
        .with_context(|| format!("Cannot instrument {} code", binary.metadata.architecture))?;
    let Some(text_section) = binary.metadata.find_section(".text") else {
        bail!("The executable has no .text section");
    };
    let text_base = text_section.address;
    let mut text = binary
        .metadata
        .reader(&binary.data)
        .read(text_base, text_section.size)
        .context("The .text section has no file contents")?
        .to_vec();

    let region_base = options
        .region_base
        .unwrap_or_else(|| binary.default_region_base());
    let mut rewriter = Rewriter::new(width, region_base);
    let mut placed = 0;

    for function in binary.functions.iter().filter(|f| text_section.contains(f.base())) {
        let Some(graph) = function.graph() else {
            continue;
        };
        let liveness = LivenessAnalyzer::analyze(graph);
        for block in graph.blocks().iter().filter(|b| !b.flags.unreachable && !b.flags.padding) {
            rewriter.add_point(InstrumentationPoint::new(
                block.address,
                options.location,
                Instrumentation::Call {
                    target: options.call_target,
                },
            ));
        }
        placed += rewriter
            .instrument(function, &liveness)
            .with_context(|| format!("Failed to instrument {}", function.name()))?;
    }

    let region = rewriter
        .dump(&mut text, text_base)
        .context("Failed to write the trampoline region")?;
    log::info!(
        "Placed {} points ({} dropped), {} bytes of trampolines at 0x{:x}",
        placed,
        rewriter.dropped(),
        region.len(),
        region_base
    );
    Ok(InstrumentedImage {
        text_base,
        text,
        region_base,
        region,
        placed,
        dropped: rewriter.dropped(),
    })
}

/// Read a headerless `block,address` trace.
pub fn load_trace(path: impl AsRef<Path>) -> Result<Vec<MemoryAccess>> {
    let path = path.as_ref();
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(::csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("Failed to open trace {}", path.display()))?;
    let mut trace = Vec::new();
    for (i, row) in reader.deserialize::<MemoryAccess>().enumerate() {
        trace.push(row.with_context(|| format!("{}: bad trace record {}", path.display(), i + 1))?);
    }
    Ok(trace)
}

/// Inputs of [`simulate_files`].
#[derive(Debug, Clone, Default)]
pub struct SimulationInputs {
    /// JSON [`SimulationConfig`]; defaults when unset
    pub config: Option<PathBuf>,
    /// Cache description file; no cache simulation when unset
    pub caches: Option<PathBuf>,
    /// One trace per stream
    pub traces: Vec<PathBuf>,
    /// Blocks known ahead of time
    pub block_count: usize,
}

/// Replay every trace as its own stream.
pub fn simulate_files(inputs: &SimulationInputs) -> Result<Vec<SimulationReport>> {
    let config = match &inputs.config {
        Some(p) => SimulationConfig::load(p)
            .with_context(|| format!("Failed to load simulation config {}", p.display()))?,
        None => SimulationConfig::default(),
    };
    let hierarchies = match &inputs.caches {
        Some(p) => load_hierarchies(p)
            .with_context(|| format!("Failed to load cache description {}", p.display()))?,
        None => Vec::new(),
    };
    let traces = inputs
        .traces
        .iter()
        .map(load_trace)
        .collect::<Result<Vec<_>>>()?;

    let mut contexts: Vec<SimulationContext> = (0..traces.len())
        .map(|s| SimulationContext::new(s as u64, config.clone(), hierarchies.clone(), inputs.block_count))
        .collect();
    simulate_streams(&mut contexts, &traces);
    Ok(contexts.iter().map(SimulationContext::report).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rejects_non_elf() {
        let err = digest_binary(b"definitely not an executable".to_vec(), false).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_load_trace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# block,address").unwrap();
        writeln!(file, "0, 4096").unwrap();
        writeln!(file, "3,64").unwrap();
        let trace = load_trace(file.path()).unwrap();
        assert_eq!(trace, vec![MemoryAccess::new(0, 4096), MemoryAccess::new(3, 64)]);
    }

    #[test]
    fn test_bad_trace_record() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0,zz").unwrap();
        assert!(load_trace(file.path()).is_err());
    }

    #[test]
    fn test_simulate_files() {
        let dir = tempfile::tempdir().unwrap();
        let caches = dir.path().join("caches.txt");
        fs::write(&caches, "0 1 256 1 64 dir\n").unwrap();
        let config = dir.path().join("sim.json");
        fs::write(&config, r#"{"reuse": true}"#).unwrap();
        let mut traces = Vec::new();
        for (i, body) in ["0,0\n0,256\n0,0\n", "1,64\n1,64\n"].iter().enumerate() {
            let p = dir.path().join(format!("trace{}.csv", i));
            fs::write(&p, body).unwrap();
            traces.push(p);
        }

        let reports = simulate_files(&SimulationInputs {
            config: Some(config),
            caches: Some(caches),
            traces,
            block_count: 2,
        })
        .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].hierarchies[0].levels[0].misses, 3);
        assert_eq!(reports[1].hierarchies[0].levels[0].hits, 1);
        assert_eq!(reports[1].reuse.as_ref().unwrap().stats[0].miss_count(), 1);
    }

    #[test]
    fn test_missing_cache_file() {
        let inputs = SimulationInputs {
            caches: Some(PathBuf::from("/nonexistent/caches.txt")),
            ..SimulationInputs::default()
        };
        let err = simulate_files(&inputs).unwrap_err();
        assert!(err.to_string().contains("cache description"));
    }
}
