//! Leader detection, block slicing and successor analysis.

use super::{BasicBlock, BlockExit, BlockSet};
use crate::decoder::Instruction;
use crate::opcode::Opcode;
use lunaris_utils::cff_log;
use lunaris_utils::errors::CfgError;
use lunaris_utils::log::DebugLog;

fn opcode_at(code: &[Instruction], pc: usize) -> Result<Opcode, CfgError> {
    code[pc]
        .opcode()
        .map_err(|source| CfgError::Instruction { pc, source })
}

fn checked_target(code: &[Instruction], pc: usize) -> Result<Option<usize>, CfgError> {
    let target = code[pc]
        .jump_target(pc)
        .map_err(|source| CfgError::Instruction { pc, source })?;
    match target {
        None => Ok(None),
        Some(t) if t >= 0 && (t as usize) < code.len() => Ok(Some(t as usize)),
        Some(t) => Err(CfgError::InvalidJumpTarget {
            pc,
            target: t,
            len: code.len(),
        }),
    }
}

/// Partitions `code` into basic blocks and resolves their successors.
///
/// Leaders are pc 0, every jump target, the instruction after every jump, the
/// instruction two slots after every conditional test (the test guards the
/// jump that follows it), the instruction after every return, and both
/// instructions after `LFALSESKIP`. Each leader starts a block that extends to
/// the next leader.
///
/// Unconditional `JMP`s also end their block. Code after one is only reachable
/// as a jump target, and keeping it in the same block would copy the `JMP`
/// into the middle of a re-emitted body.
///
/// # Arguments
/// * `code` - The function's instruction stream.
/// * `log` - Debug log receiving one line per block.
///
/// # Returns
/// The [`BlockSet`], with `state_id` equal to each block's index, or a
/// [`CfgError`] for empty functions, undecodable words and jumps leaving the
/// function.
pub fn identify_blocks(code: &[Instruction], log: &mut DebugLog) -> Result<BlockSet, CfgError> {
    if code.is_empty() {
        return Err(CfgError::EmptyFunction);
    }
    let len = code.len();
    tracing::debug!("Identifying basic blocks over {} instructions", len);

    // Pass 1: leaders
    let mut leader = vec![false; len];
    leader[0] = true;
    let mut mark = |pc: usize| {
        if pc < len {
            leader[pc] = true;
        }
    };
    for pc in 0..len {
        let op = opcode_at(code, pc)?;
        if op.is_jump() {
            if let Some(target) = checked_target(code, pc)? {
                mark(target);
            }
            mark(pc + 1);
        }
        if op.is_conditional_test() {
            mark(pc + 2);
        }
        if op.is_return() {
            mark(pc + 1);
        }
        if op.skips_next() {
            mark(pc + 1);
            mark(pc + 2);
        }
    }

    // Pass 2: slicing
    let starts: Vec<usize> = (0..len).filter(|&pc| leader[pc]).collect();
    let mut blocks: Vec<BasicBlock> = starts
        .iter()
        .enumerate()
        .map(|(index, &start_pc)| BasicBlock {
            start_pc,
            end_pc: starts.get(index + 1).copied().unwrap_or(len),
            state_id: index,
            original_target: None,
            fall_through: None,
            cond_target: None,
            is_entry: start_pc == 0,
            is_exit: false,
        })
        .collect();
    tracing::debug!("Split into {} blocks", blocks.len());

    // Pass 3: successors
    let block_at = |pc: usize| starts.binary_search(&pc).ok();
    let mut exits = Vec::with_capacity(blocks.len());
    for block in &mut blocks {
        let exit = classify_exit(code, block.start_pc, block.end_pc)?;
        let last = block.last_pc();
        match exit {
            BlockExit::Return => block.is_exit = true,
            BlockExit::TestJump { .. } => {
                block.original_target = checked_target(code, last)?.and_then(block_at);
                block.cond_target = block_at(last + 1);
            }
            BlockExit::Jump { .. } => {
                block.original_target = checked_target(code, last)?.and_then(block_at);
            }
            BlockExit::Loop { .. } => {
                block.original_target = checked_target(code, last)?.and_then(block_at);
                block.fall_through = block_at(block.end_pc);
            }
            BlockExit::Test { .. } => {
                block.cond_target = block_at(last + 2);
                block.fall_through = block_at(block.end_pc);
            }
            BlockExit::SkipNext { .. } => block.cond_target = block_at(last + 2),
            BlockExit::FallThrough => block.fall_through = block_at(block.end_pc),
            BlockExit::End => {}
        }
        exits.push(exit);
    }

    for (index, (block, exit)) in blocks.iter().zip(&exits).enumerate() {
        cff_log!(
            *log,
            "Block {}: pc [{}, {}) exit={:?} target={:?} fall={:?} cond={:?}",
            index,
            block.start_pc,
            block.end_pc,
            exit,
            block.original_target,
            block.fall_through,
            block.cond_target
        );
    }

    Ok(BlockSet {
        blocks,
        exits,
        code_len: len,
    })
}

/// Classifies how the block `[start, end)` hands control onward.
fn classify_exit(code: &[Instruction], start: usize, end: usize) -> Result<BlockExit, CfgError> {
    let last = end - 1;
    let op = opcode_at(code, last)?;
    let exit = if op.is_return() {
        BlockExit::Return
    } else if op == Opcode::JMP {
        if last > start && opcode_at(code, last - 1)?.is_conditional_test() {
            BlockExit::TestJump { test_pc: last - 1 }
        } else {
            BlockExit::Jump { jump_pc: last }
        }
    } else if op.is_loop() {
        BlockExit::Loop { pc: last, opcode: op }
    } else if op.is_conditional_test() {
        BlockExit::Test { test_pc: last }
    } else if op.skips_next() {
        BlockExit::SkipNext { pc: last }
    } else if end < code.len() {
        BlockExit::FallThrough
    } else {
        BlockExit::End
    };
    Ok(exit)
}
