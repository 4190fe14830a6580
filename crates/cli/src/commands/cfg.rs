use super::load_proto;
use clap::Args;
use lunaris_core::cfg_ir::{identify_blocks, BlockSet, EdgeType};
use lunaris_core::Instruction;
use lunaris_utils::log::DebugLog;
use petgraph::visit::EdgeRef;
use std::error::Error;
use std::fmt::Write as _;
use std::fs;

/// Arguments for the `cfg` subcommand.
#[derive(Args, Debug)]
pub struct CfgArgs {
    /// Output file for Graphviz .dot (default: stdout)
    #[arg(short, long)]
    output: Option<String>,
}

impl super::Command for CfgArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let proto = load_proto(input)?;
        let blocks = identify_blocks(&proto.code, &mut DebugLog::disabled())?;

        let dot = generate_dot(&blocks, &proto.code);
        if let Some(out_path) = self.output {
            fs::write(out_path, &dot)?;
        } else {
            println!("{dot}");
        }
        Ok(())
    }
}

/// Renders the block graph, one node per block labelled with its listing.
pub fn generate_dot(blocks: &BlockSet, code: &[Instruction]) -> String {
    let graph = blocks.to_graph();
    let mut dot = String::from("digraph CFG {\n");

    for node in graph.node_indices() {
        let index = graph[node];
        let Some(block) = blocks.get(index) else {
            continue;
        };
        let listing: Vec<String> = blocks
            .instructions(index, code)
            .iter()
            .zip(block.start_pc..)
            .map(|(inst, pc)| format!("{pc}: {inst}"))
            .collect();
        let _ = writeln!(
            dot,
            "    {} [shape=box, label=\"Block_{} (state {})\\l{}\\l\"];",
            node.index(),
            block.start_pc,
            block.state_id,
            listing.join("\\l")
        );
    }

    for edge in graph.edge_references() {
        let label = match edge.weight() {
            EdgeType::Fallthrough => "Fallthrough",
            EdgeType::Jump => "Jump",
            EdgeType::BranchTrue => "BranchTrue",
            EdgeType::BranchFalse => "BranchFalse",
        };
        let _ = writeln!(
            dot,
            "    {} -> {} [label=\"{}\"];",
            edge.source().index(),
            edge.target().index(),
            label
        );
    }

    dot.push_str("}\n");
    dot
}
