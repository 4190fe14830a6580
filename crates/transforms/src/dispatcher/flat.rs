use super::{
    bogus_state, emit_blocks, emit_decoy_bodies, emit_prologue, StateLayout, StateTarget,
};
use crate::context::{CffContext, Label};
use crate::util::emit_loadi;
use crate::{interleave, opaque_predicate, ObfuscationFlags, Transform};
use lunaris_core::opcode::Opcode;
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use tracing::debug;

/// Single-level dispatcher: one `EQI` ladder over the state register.
///
/// ```text
/// [VARARGPREP]
/// LOADI state, code(entry)
/// [LOADI func_id, code(real function)]
/// dispatcher:
///   EQI state, code(s) k=1 ; JMP block_s      (one pair per real and bogus state)
///   [EQI func_id, code(f) k=1 ; JMP fake_f]
///   JMP dispatcher
/// blocks...
/// bogus blocks... decoy functions...
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatDispatcher;

impl StateLayout for FlatDispatcher {
    fn emit_state_load(
        &self,
        ctx: &mut CffContext<'_>,
        target: StateTarget,
    ) -> Result<(), TransformError> {
        let raw = match target {
            StateTarget::Block(index) => ctx.blocks.blocks()[index].state_id,
            StateTarget::Bogus(index) => bogus_state(ctx, index),
            StateTarget::Raw(raw) => raw,
        };
        let code = ctx.state_code(raw, 0);
        let reg = ctx.regs.state;
        emit_loadi(ctx, reg, code)?;
        Ok(())
    }

    fn state_load_len(&self) -> usize {
        1
    }
}

impl Transform for FlatDispatcher {
    fn name(&self) -> &'static str {
        "FlatDispatcher"
    }

    fn apply(&self, ctx: &mut CffContext<'_>) -> Result<bool, TransformError> {
        debug!(
            "Generating flat dispatcher for {} blocks ({} bogus)",
            ctx.blocks.len(),
            ctx.num_bogus
        );

        emit_prologue(ctx)?;
        self.emit_state_load(ctx, StateTarget::Block(0))?;
        let interleave = ctx.flags.contains(ObfuscationFlags::FUNC_INTERLEAVE);
        if interleave {
            interleave::emit_function_id(ctx)?;
        }

        ctx.dispatcher_pc = ctx.out.bind(Label::Dispatcher);
        cff_log!(*ctx.log, "Dispatcher at pc {}", ctx.dispatcher_pc);

        let mut entries: Vec<(Label, usize)> = ctx
            .blocks
            .blocks()
            .iter()
            .enumerate()
            .map(|(index, block)| (Label::Block(index), block.state_id))
            .collect();
        let n = ctx.blocks.len();
        entries.extend((0..ctx.num_bogus).map(|k| (Label::Bogus(k), n + k)));

        let mut guards = opaque_predicate::Guards::new(ctx);
        for (label, raw) in entries {
            guards.before_entry(ctx)?;
            let code = ctx.state_code(raw, 0);
            ctx.out
                .emit(Instruction::a_sb_c(Opcode::EQI, ctx.regs.state, code, 0, true)?)?;
            ctx.out.emit_jump(label)?;
            cff_log!(*ctx.log, "Dispatch entry: state {} (code {}) -> {:?}", raw, code, label);
        }

        if interleave {
            interleave::emit_function_entries(ctx)?;
        }
        ctx.out.emit_jump_to(ctx.dispatcher_pc)?;

        emit_blocks(ctx, self)?;
        emit_decoy_bodies(ctx, self)?;
        Ok(true)
    }
}
