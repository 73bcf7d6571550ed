//! Plain text listing of a digested function, in layout order.

use std::fmt::Write;

use super::ReportError;
use crate::cfg::{BasicBlock, BlockRef, FlowGraph};
use crate::function::Function;
use crate::insn::Instruction;

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn block_header(graph: &FlowGraph, block: &BasicBlock) -> String {
    let mut tags = Vec::new();
    if block.flags.entry {
        tags.push("entry");
    }
    if block.flags.exit {
        tags.push("exit");
    }
    if block.flags.padding {
        tags.push("padding");
    }
    if block.flags.unreachable {
        tags.push("unreachable");
    }
    if graph.loops().iter().any(|l| l.head == block.index) {
        tags.push("loop head");
    }

    let mut header = format!("{} 0x{:x} ({} bytes)", block.index, block.address, block.size());
    if !tags.is_empty() {
        header.push_str(&format!(" [{}]", tags.join(", ")));
    }
    header
}

fn instruction_line(out: &mut String, insn: &Instruction) -> std::fmt::Result {
    writeln!(out, "  0x{:08x}: {:<40} ; {}", insn.address, insn.to_string(), hex_bytes(&insn.bytes))
}

/// Render `function` block by block, with successors and loop membership.
pub fn render(function: &Function) -> Result<String, ReportError> {
    let graph = function
        .graph()
        .ok_or_else(|| ReportError::NotDigested(function.name().to_string()))?;

    let mut out = String::new();
    let strategy = function
        .strategy()
        .map(|s| s.to_string())
        .unwrap_or_default();
    writeln!(
        out,
        "{} at 0x{:x} ({} bytes, {} blocks, {} loops, {})\n",
        function.name(),
        function.base(),
        function.size(),
        graph.blocks().len(),
        graph.loops().len(),
        strategy
    )?;

    for entry in graph.layout() {
        let written = match *entry {
            BlockRef::Basic(id) => {
                let block = graph.block(id);
                render_block(&mut out, graph, block)
            }
            BlockRef::Raw(i) => match graph.raw_blocks().get(i) {
                Some(raw) => writeln!(
                    out,
                    "raw 0x{:x} ({} bytes)\n  ; {}\n",
                    raw.address,
                    raw.size(),
                    hex_bytes(&raw.bytes)
                ),
                None => Ok(()),
            },
        };
        written?;
    }
    Ok(out)
}

fn render_block(out: &mut String, graph: &FlowGraph, block: &BasicBlock) -> std::fmt::Result {
    writeln!(out, "{}", block_header(graph, block))?;
    for insn in &block.instructions {
        instruction_line(out, insn)?;
    }
    if block.succs.is_empty() {
        writeln!(out, "  no successors")?;
    } else {
        let succs: Vec<String> = block.succs.iter().map(|s| s.to_string()).collect();
        writeln!(out, "  successors: {}", succs.join(", "))?;
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::digested_simple;

    #[test]
    fn test_listing_blocks() {
        let text = render(&digested_simple()).unwrap();
        assert!(text.starts_with("simple at 0x1000 (15 bytes, 3 blocks, 0 loops, Recursive descent)"));
        assert!(text.contains("bb0 0x1000 (8 bytes) [entry]"));
        assert!(text.contains("bb2 0x100d (2 bytes) [exit]"));
        assert!(text.contains("  0x00001006: je 0x100d"));
        assert!(text.contains("; 74 05"));
        assert!(text.contains("  successors: bb1, bb2"));
        assert!(text.contains("  no successors"));
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(hex_bytes(&[0x0f, 0x1f, 0x00]), "0f 1f 00");
        assert_eq!(hex_bytes(&[]), "");
    }
}
