//! CSV output formatter

use ::csv::Writer;

use super::{ReportError, ReportFormatter};
use crate::function::Function;
use crate::sim::SimulationReport;

/// One row per (block, hierarchy, level) for reports and one row per
/// instruction for functions
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvFormatter;

fn finish(writer: Writer<Vec<u8>>) -> Result<String, ReportError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| ReportError::Io(e.into_error()))?;
    Ok(String::from_utf8(bytes)?)
}

impl ReportFormatter for CsvFormatter {
    fn format_report(&self, report: &SimulationReport) -> Result<String, ReportError> {
        let mut writer = Writer::from_writer(Vec::new());
        writer.write_record([
            "stream",
            "block",
            "visits",
            "accesses",
            "saturation",
            "sysid",
            "level",
            "hits",
            "misses",
        ])?;

        for block in &report.blocks {
            for (h, levels) in report.hierarchies.iter().zip(&block.levels) {
                for (lvl, stats) in levels.iter().enumerate() {
                    writer.write_record([
                        report.stream.to_string(),
                        block.id.to_string(),
                        block.visits.to_string(),
                        block.accesses.to_string(),
                        format!("{:.3}", block.saturation),
                        h.sysid.to_string(),
                        lvl.to_string(),
                        stats.hits.to_string(),
                        stats.misses.to_string(),
                    ])?;
                }
            }
        }
        finish(writer)
    }

    fn format_function(&self, function: &Function) -> Result<String, ReportError> {
        let graph = function
            .graph()
            .ok_or_else(|| ReportError::NotDigested(function.name().to_string()))?;

        let mut writer = Writer::from_writer(Vec::new());
        writer.write_record(["function", "block", "address", "size", "instruction", "bytes"])?;
        for block in graph.blocks() {
            for insn in &block.instructions {
                let bytes: Vec<String> = insn.bytes.iter().map(|b| format!("{:02x}", b)).collect();
                writer.write_record([
                    function.name().to_string(),
                    block.index.to_string(),
                    format!("0x{:x}", insn.address),
                    insn.size().to_string(),
                    insn.to_string(),
                    bytes.join(" "),
                ])?;
            }
        }
        finish(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::{digested_simple, sample_report};

    #[test]
    fn test_report_rows() {
        let text = CsvFormatter.format_report(&sample_report()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "stream,block,visits,accesses,saturation,sysid,level,hits,misses");
        assert_eq!(lines[1], "0,0,1,2,100.000,0,0,0,2");
        assert_eq!(lines[2], "0,1,1,2,100.000,0,0,1,1");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_function_rows_quote_operands() {
        let text = CsvFormatter.format_function(&digested_simple()).unwrap();
        let mut reader = ::csv::Reader::from_reader(text.as_bytes());
        let rows: Vec<::csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 7);
        assert_eq!(&rows[0][1], "bb0");
        assert_eq!(&rows[3][2], "0x1006");
        assert_eq!(&rows[3][4], "je 0x100d");
        assert_eq!(&rows[6][1], "bb2");
        // "mov rbp, rsp" holds a comma and survives quoting
        assert!(rows[1][4].contains(", "));
    }
}
