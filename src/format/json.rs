//! JSON output formatter

use serde::Serialize;

use super::{ReportError, ReportFormatter};
use crate::cfg::{BlockRef, FlowGraph};
use crate::function::Function;
use crate::insn::Instruction;
use crate::sim::SimulationReport;

/// Format reports and functions as pretty printed JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

/// Serializable instruction for JSON output
#[derive(Serialize)]
struct InstructionJson {
    address: String,
    size: usize,
    text: String,
    /// Bytes of the instruction as hex string
    bytes: String,
}

#[derive(Serialize)]
struct BlockJson {
    id: u32,
    start: String,
    entry: bool,
    exit: bool,
    instructions: Vec<InstructionJson>,
    successors: Vec<u32>,
}

#[derive(Serialize)]
struct RawJson {
    start: String,
    bytes: String,
}

#[derive(Serialize)]
struct LoopJson {
    head: u32,
    blocks: Vec<u32>,
}

#[derive(Serialize)]
struct FunctionJson {
    name: String,
    base: String,
    size: usize,
    strategy: Option<String>,
    blocks: Vec<BlockJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    raw: Vec<RawJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    loops: Vec<LoopJson>,
}

fn instruction_to_json(insn: &Instruction) -> InstructionJson {
    InstructionJson {
        address: format!("0x{:x}", insn.address),
        size: insn.size(),
        text: insn.to_string(),
        bytes: insn
            .bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn graph_to_json(graph: &FlowGraph) -> (Vec<BlockJson>, Vec<RawJson>) {
    let mut blocks = Vec::new();
    let mut raw = Vec::new();
    for entry in graph.layout() {
        match *entry {
            BlockRef::Basic(id) => {
                let b = graph.block(id);
                blocks.push(BlockJson {
                    id: b.index.0,
                    start: format!("0x{:x}", b.address),
                    entry: b.flags.entry,
                    exit: b.flags.exit,
                    instructions: b.instructions.iter().map(instruction_to_json).collect(),
                    successors: b.succs.iter().map(|s| s.0).collect(),
                });
            }
            BlockRef::Raw(i) => {
                if let Some(r) = graph.raw_blocks().get(i) {
                    raw.push(RawJson {
                        start: format!("0x{:x}", r.address),
                        bytes: r.bytes.iter().map(|b| format!("{:02x}", b)).collect(),
                    });
                }
            }
        }
    }
    (blocks, raw)
}

impl ReportFormatter for JsonFormatter {
    fn format_report(&self, report: &SimulationReport) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    fn format_function(&self, function: &Function) -> Result<String, ReportError> {
        let graph = function
            .graph()
            .ok_or_else(|| ReportError::NotDigested(function.name().to_string()))?;
        let (blocks, raw) = graph_to_json(graph);
        let result = FunctionJson {
            name: function.name().to_string(),
            base: format!("0x{:x}", function.base()),
            size: function.size(),
            strategy: function.strategy().map(|s| s.to_string()),
            blocks,
            raw,
            loops: graph
                .loops()
                .iter()
                .map(|l| LoopJson {
                    head: l.head.0,
                    blocks: l.blocks.iter().map(|b| b.0).collect(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::{digested_simple, sample_report};
    use serde_json::Value;

    #[test]
    fn test_report_json() {
        let text = JsonFormatter.format_report(&sample_report()).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["total_accesses"], 4);
        assert_eq!(v["hierarchies"][0]["levels"][0]["hits"], 1);
        assert_eq!(v["blocks"][1]["levels"][0][0]["misses"], 1);
        assert_eq!(v["reuse"]["kind"], "REUSE");
        assert!(v["spatial"].is_null());
    }

    #[test]
    fn test_function_json() {
        let text = JsonFormatter.format_function(&digested_simple()).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["name"], "simple");
        assert_eq!(v["base"], "0x1000");
        assert_eq!(v["blocks"].as_array().unwrap().len(), 3);
        assert_eq!(v["blocks"][0]["successors"], serde_json::json!([1, 2]));
        assert_eq!(v["blocks"][0]["instructions"][3]["bytes"], "74 05");
        assert!(v.get("loops").is_none());
    }
}
