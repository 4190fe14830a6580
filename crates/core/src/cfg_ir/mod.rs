//! Basic-block partition of a function and its control-flow graph view.
//!
//! [`identify_blocks`] splits an instruction stream into maximal straight-line
//! runs and records, for each block, where control goes next. The resulting
//! [`BlockSet`] is the input of every control-flow transform; blocks are
//! addressed by index everywhere so the indices stay valid while the output
//! code grows.

use crate::decoder::Instruction;
use crate::opcode::Opcode;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

pub use self::builder::identify_blocks;

mod builder;

/// One maximal straight-line run of instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// First pc of the block.
    pub start_pc: usize,
    /// One past the last pc of the block.
    pub end_pc: usize,
    /// Value the dispatcher compares against to select this block.
    pub state_id: usize,
    /// Block the terminating jump goes to.
    pub original_target: Option<usize>,
    /// Sequential successor.
    pub fall_through: Option<usize>,
    /// Successor reached when a test skips its jump.
    pub cond_target: Option<usize>,
    /// Whether the block starts at pc 0.
    pub is_entry: bool,
    /// Whether the block leaves the function.
    pub is_exit: bool,
}

impl BasicBlock {
    /// Pc of the final instruction.
    pub const fn last_pc(&self) -> usize {
        self.end_pc - 1
    }

    /// Number of instructions.
    pub const fn len(&self) -> usize {
        self.end_pc - self.start_pc
    }

    /// Whether the block is empty (never true for identified blocks).
    pub const fn is_empty(&self) -> bool {
        self.end_pc == self.start_pc
    }
}

/// How a block hands control onward, derived from its last instruction(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockExit {
    /// Ends with a return-family instruction.
    Return,
    /// Ends with a conditional test directly followed by its `JMP`.
    TestJump {
        /// Pc of the test.
        test_pc: usize,
    },
    /// Ends with a conditional test whose jump starts the next block.
    Test {
        /// Pc of the test.
        test_pc: usize,
    },
    /// Ends with an instruction that always skips the next one.
    SkipNext {
        /// Pc of the skipping instruction.
        pc: usize,
    },
    /// Ends with an unconditional `JMP`.
    Jump {
        /// Pc of the jump.
        jump_pc: usize,
    },
    /// Ends with a loop-control instruction.
    Loop {
        /// Pc of the loop instruction.
        pc: usize,
        /// The loop opcode.
        opcode: Opcode,
    },
    /// Runs into the next block.
    FallThrough,
    /// Runs off the end of the function.
    End,
}

/// Type of edge connecting blocks in the graph view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeType {
    /// Sequential execution into the next block.
    Fallthrough,
    /// Unconditional jump.
    Jump,
    /// Path taken when a test skips its jump.
    BranchTrue,
    /// Path taken when a test executes its jump.
    BranchFalse,
}

/// The block partition of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSet {
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) exits: Vec<BlockExit>,
    pub(crate) code_len: usize,
}

impl BlockSet {
    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Length of the partitioned code.
    pub const fn code_len(&self) -> usize {
        self.code_len
    }

    /// All blocks in pc order.
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Mutable access for transforms that relabel states.
    pub fn blocks_mut(&mut self) -> &mut [BasicBlock] {
        &mut self.blocks
    }

    /// Block at `index`.
    pub fn get(&self, index: usize) -> Option<&BasicBlock> {
        self.blocks.get(index)
    }

    /// How block `index` ends.
    pub fn exit(&self, index: usize) -> Option<BlockExit> {
        self.exits.get(index).copied()
    }

    /// The entry block (always index 0).
    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    /// Index of the block starting exactly at `pc`.
    pub fn block_starting_at(&self, pc: usize) -> Option<usize> {
        self.blocks.binary_search_by_key(&pc, |b| b.start_pc).ok()
    }

    /// Index of the block containing `pc`.
    pub fn block_containing(&self, pc: usize) -> Option<usize> {
        if pc >= self.code_len {
            return None;
        }
        match self.blocks.binary_search_by_key(&pc, |b| b.start_pc) {
            Ok(index) => Some(index),
            Err(insert) => insert.checked_sub(1),
        }
    }

    /// Instructions of block `index`.
    pub fn instructions<'c>(&self, index: usize, code: &'c [Instruction]) -> &'c [Instruction] {
        self.blocks
            .get(index)
            .and_then(|b| code.get(b.start_pc..b.end_pc))
            .unwrap_or(&[])
    }

    /// Builds a graph whose node weights are block indices.
    ///
    /// Node `i` corresponds to block `i`.
    pub fn to_graph(&self) -> DiGraph<usize, EdgeType> {
        let mut graph = DiGraph::with_capacity(self.blocks.len(), self.blocks.len() * 2);
        let nodes: Vec<NodeIndex> = (0..self.blocks.len()).map(|i| graph.add_node(i)).collect();

        for (index, block) in self.blocks.iter().enumerate() {
            let from = nodes[index];
            let conditional = block.cond_target.is_some();
            if let Some(target) = block.cond_target {
                graph.add_edge(from, nodes[target], EdgeType::BranchTrue);
            }
            if let Some(target) = block.original_target {
                let kind = if conditional {
                    EdgeType::BranchFalse
                } else {
                    EdgeType::Jump
                };
                graph.add_edge(from, nodes[target], kind);
            }
            if let Some(target) = block.fall_through {
                let kind = if conditional {
                    EdgeType::BranchFalse
                } else {
                    EdgeType::Fallthrough
                };
                graph.add_edge(from, nodes[target], kind);
            }
        }
        graph
    }
}
