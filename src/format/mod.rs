//! Output formats for simulation reports and function listings

mod csv;
mod json;
pub mod listing;

pub use self::csv::CsvFormatter;
pub use self::json::JsonFormatter;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::function::Function;
use crate::sim::SimulationReport;

/// Supported output formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Tab separated text (default)
    #[default]
    Text,
    /// JSON (hierarchical)
    Json,
    /// CSV, one row per block or instruction
    Csv,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            _ => Err(format!("Unknown report format: {}", s)),
        }
    }
}

impl ReportFormat {
    /// All available formats
    pub fn available_formats() -> &'static [Self] {
        &[ReportFormat::Text, ReportFormat::Json, ReportFormat::Csv]
    }

    /// Get a formatter for this format
    pub fn formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            ReportFormat::Text => Box::new(TextFormatter::default()),
            ReportFormat::Json => Box::new(JsonFormatter),
            ReportFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Errors raised while rendering output
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Formatting error: {0}")]
    Fmt(#[from] std::fmt::Error),

    #[error("Output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0} has not been digested")]
    NotDigested(String),
}

/// Renders results in one output format
pub trait ReportFormatter {
    /// Render the measurements of one simulated stream
    fn format_report(&self, report: &SimulationReport) -> Result<String, ReportError>;

    /// Render the blocks and instructions of a digested function
    fn format_function(&self, function: &Function) -> Result<String, ReportError>;
}

/// Tab separated reports and a plain disassembly listing
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormatter {
    /// Add column legends to the reuse reports
    pub annotate: bool,
}

impl ReportFormatter for TextFormatter {
    fn format_report(&self, report: &SimulationReport) -> Result<String, ReportError> {
        let mut out = Vec::new();
        report.write_text(&mut out, self.annotate)?;
        Ok(String::from_utf8(out)?)
    }

    fn format_function(&self, function: &Function) -> Result<String, ReportError> {
        listing::render(function)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::config::parse_hierarchies;
    use crate::decoder::X86Decoder;
    use crate::sim::{MemoryAccess, SimulationConfig, SimulationContext};
    use crate::strategy::DisassemblyContext;
    use crate::TargetWidth;
    use rstest::rstest;

    // 0: push rbp ; 1: mov rbp,rsp ; 4: test edi,edi ; 6: je 0xd
    // 8: mov eax,1 ; d: pop rbp ; e: ret
    pub(crate) const SIMPLE: [u8; 15] = [
        0x55, 0x48, 0x89, 0xe5, 0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x5d, 0xc3,
    ];

    pub(crate) fn digested_simple() -> Function {
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let mut ctx = DisassemblyContext::new();
        let mut f = Function::new("simple", 0x1000, SIMPLE.to_vec());
        f.digest(&decoder, &mut ctx).unwrap();
        f
    }

    pub(crate) fn sample_report() -> SimulationReport {
        let config = SimulationConfig {
            reuse: true,
            ..SimulationConfig::default()
        };
        let hierarchies = parse_hierarchies("0 1 256 1 64 dir").unwrap();
        let mut ctx = SimulationContext::new(0, config, hierarchies, 2);
        ctx.visit_block(0);
        ctx.visit_block(1);
        ctx.process_trace(&[
            MemoryAccess::new(0, 0x0),
            MemoryAccess::new(1, 0x100),
            MemoryAccess::new(0, 0x0),
            MemoryAccess::new(1, 0x8),
        ]);
        ctx.report()
    }

    #[rstest]
    #[case("text", ReportFormat::Text)]
    #[case("TXT", ReportFormat::Text)]
    #[case("json", ReportFormat::Json)]
    #[case("Csv", ReportFormat::Csv)]
    fn test_format_names(#[case] name: &str, #[case] expected: ReportFormat) {
        assert_eq!(name.parse::<ReportFormat>().unwrap(), expected);
        assert_eq!(expected.to_string().parse::<ReportFormat>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_format() {
        assert!("yaml".parse::<ReportFormat>().is_err());
        assert_eq!(ReportFormat::default(), ReportFormat::Text);
    }

    #[test]
    fn test_text_report() {
        let text = TextFormatter::default().format_report(&sample_report()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# sysid0 l0[1/4(25.000)]");
        assert_eq!(lines[2], "BLK\t0\t1\t100.000\t0\t2");
        assert_eq!(lines[3], "BLK\t1\t1\t100.000\t1\t1");
        assert_eq!(lines[4], "REUSESTATS\t0\t32\t0\t2\t4\t3");
        assert_eq!(lines[5], "\tREUSEID\t0\t2\t1");
        assert_eq!(lines[6], "\t\t1\t1\t1");
    }

    #[test]
    fn test_every_format_renders() {
        let report = sample_report();
        let function = digested_simple();
        for format in ReportFormat::available_formats() {
            let formatter = format.formatter();
            assert!(!formatter.format_report(&report).unwrap().is_empty());
            assert!(!formatter.format_function(&function).unwrap().is_empty());
        }
    }

    #[test]
    fn test_undigested_function_is_rejected() {
        let f = Function::new("raw", 0x1000, SIMPLE.to_vec());
        for format in ReportFormat::available_formats() {
            assert!(matches!(
                format.formatter().format_function(&f),
                Err(ReportError::NotDigested(_))
            ));
        }
    }
}
