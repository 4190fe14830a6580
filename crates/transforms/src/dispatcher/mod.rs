//! Dispatcher code generators.
//!
//! Both variants share the block re-emission below and differ only in how a
//! target state is loaded into registers ([`StateLayout`]). Every block body is
//! copied up to its control transfer, which is replaced by a state load and a
//! jump back to the dispatcher head:
//!
//! ```text
//! exit block         body ... RETURN
//! jump / fallthrough body ; <load target> ; JMP dispatcher
//! test + jump        body ; TEST ; JMP +n ; <load then> ; JMP dispatcher ; <load else> ; JMP dispatcher
//! ```
//!
//! where `n` is the length of one load-and-jump sequence.

mod flat;
mod nested;

pub use flat::FlatDispatcher;
pub use nested::{group_starts, NestedDispatcher, INNER_STATE_SALT};

use crate::context::{CffContext, Label};
use crate::{bogus, interleave, ObfuscationFlags};
use lunaris_core::cfg_ir::BlockExit;
use lunaris_core::opcode::Opcode;
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;

/// Maximum number of blocks per nested group.
pub const GROUP_SIZE: usize = 4;

/// What a state load selects on the next dispatcher pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateTarget {
    /// Real block by index.
    Block(usize),
    /// Decoy block by index.
    Bogus(usize),
    /// A raw state with no dispatch entry.
    Raw(usize),
}

/// Register-level representation of dispatch states.
pub(crate) trait StateLayout {
    /// Emits the loads that select `target`.
    fn emit_state_load(
        &self,
        ctx: &mut CffContext<'_>,
        target: StateTarget,
    ) -> Result<(), TransformError>;

    /// Number of instructions [`StateLayout::emit_state_load`] emits.
    fn state_load_len(&self) -> usize;
}

/// Raw state id of decoy block `index`.
pub(crate) fn bogus_state(ctx: &CffContext<'_>, index: usize) -> usize {
    ctx.blocks.len() + index
}

/// `<load target> ; JMP dispatcher`.
pub(crate) fn emit_transition(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
    target: StateTarget,
) -> Result<(), TransformError> {
    layout.emit_state_load(ctx, target)?;
    ctx.out.emit_jump_to(ctx.dispatcher_pc)?;
    Ok(())
}

/// Emits `VARARGPREP` ahead of the state initialisation when the function starts with it.
pub(crate) fn emit_prologue(ctx: &mut CffContext<'_>) -> Result<(), TransformError> {
    for pc in 0..ctx.prologue {
        let inst = ctx.code[pc];
        ctx.out.emit(inst)?;
        cff_log!(*ctx.log, "Hoisted prologue {}", inst);
    }
    Ok(())
}

fn successor(
    index: usize,
    target: Option<usize>,
    edge: &'static str,
) -> Result<StateTarget, TransformError> {
    target
        .map(StateTarget::Block)
        .ok_or(TransformError::MissingSuccessor { block: index, edge })
}

/// `JMP +n ; <load then> ; JMP dispatcher ; <load else> ; JMP dispatcher`,
/// placed right after a re-emitted test.
fn emit_two_way(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
    then_target: StateTarget,
    else_target: StateTarget,
) -> Result<(), TransformError> {
    let skip = layout.state_load_len() as i64 + 1;
    ctx.out.emit(Instruction::jmp(skip)?)?;
    emit_transition(ctx, layout, then_target)?;
    emit_transition(ctx, layout, else_target)
}

/// Re-emits real block `index` with its control transfer rerouted through
/// the dispatcher.
pub(crate) fn emit_block(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
    index: usize,
) -> Result<(), TransformError> {
    let block = ctx.blocks.blocks()[index].clone();
    let exit = ctx
        .blocks
        .exit(index)
        .ok_or(TransformError::MissingSuccessor {
            block: index,
            edge: "exit",
        })?;
    let start = ctx.out.pc();

    match exit {
        BlockExit::Return | BlockExit::End => {
            ctx.copy_source(block.start_pc, block.end_pc)?;
        }
        BlockExit::TestJump { test_pc } => {
            ctx.copy_source(block.start_pc, test_pc + 1)?;
            let then_target = successor(index, block.cond_target, "skip")?;
            let else_target = successor(index, block.original_target, "jump")?;
            emit_two_way(ctx, layout, then_target, else_target)?;
        }
        BlockExit::Test { test_pc } => {
            ctx.copy_source(block.start_pc, test_pc + 1)?;
            let then_target = successor(index, block.cond_target, "skip")?;
            let else_target = successor(index, block.fall_through, "fallthrough")?;
            emit_two_way(ctx, layout, then_target, else_target)?;
        }
        BlockExit::SkipNext { pc } => {
            ctx.copy_source(block.start_pc, pc + 1)?;
            // skipped by the instruction above
            ctx.out.emit(Instruction::abc(Opcode::NOP, 0, 0, 0, false)?)?;
            let target = successor(index, block.cond_target, "skip")?;
            emit_transition(ctx, layout, target)?;
        }
        BlockExit::Jump { jump_pc } => {
            ctx.copy_source(block.start_pc, jump_pc)?;
            let target = successor(index, block.original_target, "jump")?;
            emit_transition(ctx, layout, target)?;
        }
        BlockExit::FallThrough => {
            ctx.copy_source(block.start_pc, block.end_pc)?;
            let target = successor(index, block.fall_through, "fallthrough")?;
            emit_transition(ctx, layout, target)?;
        }
        BlockExit::Loop { pc, opcode } => {
            return Err(TransformError::UnsupportedTerminator {
                pc,
                opcode: opcode.name(),
            });
        }
    }

    cff_log!(
        *ctx.log,
        "Emit block {} (state {}) {:?}: source [{}, {}) -> pc [{}, {})",
        index,
        block.state_id,
        exit,
        block.start_pc,
        block.end_pc,
        start,
        ctx.out.pc()
    );
    Ok(())
}

/// Emits every real block in pc order, binding their labels.
pub(crate) fn emit_blocks(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
) -> Result<(), TransformError> {
    for index in 0..ctx.blocks.len() {
        ctx.out.bind(Label::Block(index));
        emit_block(ctx, layout, index)?;
    }
    Ok(())
}

/// Emits decoy block bodies and decoy functions after the real blocks.
pub(crate) fn emit_decoy_bodies(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
) -> Result<(), TransformError> {
    if ctx.num_bogus > 0 {
        bogus::emit_bogus_blocks(ctx, layout)?;
    }
    if ctx.flags.contains(ObfuscationFlags::FUNC_INTERLEAVE) {
        interleave::emit_fake_functions(ctx, layout)?;
    }
    Ok(())
}
