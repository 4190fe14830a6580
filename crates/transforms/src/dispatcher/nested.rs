use super::{emit_blocks, emit_decoy_bodies, emit_prologue, StateLayout, StateTarget, GROUP_SIZE};
use crate::context::{CffContext, Label};
use crate::util::emit_loadi;
use crate::{interleave, opaque_predicate, ObfuscationFlags, Transform};
use lunaris_core::opcode::Opcode;
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use tracing::debug;

/// Salt keying inner state codes, so outer and inner comparisons use
/// unrelated constants.
pub const INNER_STATE_SALT: u32 = 0x1234_5678;

/// First block index of each group when `num_blocks` blocks are split into
/// `max(2, ceil(n / GROUP_SIZE))` contiguous groups.
pub fn group_starts(num_blocks: usize) -> Vec<usize> {
    let groups = num_blocks.div_ceil(GROUP_SIZE).max(2);
    let per_group = num_blocks.div_ceil(groups).max(1);
    (0..groups)
        .map(|g| (g * per_group).min(num_blocks))
        .collect()
}

/// Two-level dispatcher: an outer ladder over group ids, each leading to an
/// inner ladder over the states of that group.
///
/// ```text
/// outer:
///   EQI outer, code(g) k=1 ; JMP inner_g       (one pair per group)
///   [EQI func_id, code(f) k=1 ; JMP fake_f]
///   JMP outer
/// inner_g:
///   EQI state, code'(s) k=1 ; JMP block_s     (one pair per member)
///   JMP outer
/// ```
///
/// Decoy blocks form their own groups after the real ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedDispatcher;

/// Group assignment of one generation.
#[derive(Debug)]
struct NestedLayout {
    block_group: Vec<usize>,
    real_groups: usize,
    total_groups: usize,
}

impl NestedLayout {
    fn new(starts: &[usize], num_blocks: usize, num_bogus: usize) -> Self {
        let block_group = (0..num_blocks)
            .map(|index| starts.iter().rposition(|&s| s <= index).unwrap_or(0))
            .collect();
        let real_groups = starts.len();
        Self {
            block_group,
            real_groups,
            total_groups: real_groups + num_bogus.div_ceil(GROUP_SIZE),
        }
    }

    /// Group of every dispatch target, with the raw inner state it answers to.
    fn members(&self, ctx: &CffContext<'_>, group: usize) -> Vec<(Label, usize)> {
        if group < self.real_groups {
            self.block_group
                .iter()
                .enumerate()
                .filter(|&(_, &g)| g == group)
                .map(|(index, _)| (Label::Block(index), ctx.blocks.blocks()[index].state_id))
                .collect()
        } else {
            let first = (group - self.real_groups) * GROUP_SIZE;
            let n = ctx.blocks.len();
            (first..(first + GROUP_SIZE).min(ctx.num_bogus))
                .map(|k| (Label::Bogus(k), n + k))
                .collect()
        }
    }
}

impl StateLayout for NestedLayout {
    fn emit_state_load(
        &self,
        ctx: &mut CffContext<'_>,
        target: StateTarget,
    ) -> Result<(), TransformError> {
        let (group, raw) = match target {
            StateTarget::Block(index) => {
                (self.block_group[index], ctx.blocks.blocks()[index].state_id)
            }
            StateTarget::Bogus(index) => (
                self.real_groups + index / GROUP_SIZE,
                ctx.blocks.len() + index,
            ),
            // no outer entry matches this group
            StateTarget::Raw(raw) => (self.total_groups, raw),
        };
        let outer_code = ctx.state_code(group, 0);
        let inner_code = ctx.state_code(raw, INNER_STATE_SALT);
        let regs = ctx.regs;
        emit_loadi(ctx, regs.outer, outer_code)?;
        emit_loadi(ctx, regs.state, inner_code)?;
        Ok(())
    }

    fn state_load_len(&self) -> usize {
        2
    }
}

impl Transform for NestedDispatcher {
    fn name(&self) -> &'static str {
        "NestedDispatcher"
    }

    fn apply(&self, ctx: &mut CffContext<'_>) -> Result<bool, TransformError> {
        let starts = group_starts(ctx.blocks.len());
        let layout = NestedLayout::new(&starts, ctx.blocks.len(), ctx.num_bogus);
        debug!(
            "Generating nested dispatcher: {} real groups, {} total",
            layout.real_groups, layout.total_groups
        );
        cff_log!(*ctx.log, "Nested groups start at {:?}", starts);
        ctx.group_starts = starts;

        emit_prologue(ctx)?;
        layout.emit_state_load(ctx, StateTarget::Block(0))?;
        let interleave = ctx.flags.contains(ObfuscationFlags::FUNC_INTERLEAVE);
        if interleave {
            interleave::emit_function_id(ctx)?;
        }

        ctx.dispatcher_pc = ctx.out.bind(Label::Dispatcher);
        cff_log!(*ctx.log, "Outer dispatcher at pc {}", ctx.dispatcher_pc);
        for group in 0..layout.total_groups {
            let code = ctx.state_code(group, 0);
            ctx.out
                .emit(Instruction::a_sb_c(Opcode::EQI, ctx.regs.outer, code, 0, true)?)?;
            ctx.out.emit_jump(Label::InnerDispatcher(group))?;
        }
        if interleave {
            interleave::emit_function_entries(ctx)?;
        }
        ctx.out.emit_jump_to(ctx.dispatcher_pc)?;

        let mut guards = opaque_predicate::Guards::new(ctx);
        for group in 0..layout.total_groups {
            let pc = ctx.out.bind(Label::InnerDispatcher(group));
            cff_log!(*ctx.log, "Inner dispatcher {} at pc {}", group, pc);
            for (label, raw) in layout.members(ctx, group) {
                guards.before_entry(ctx)?;
                let code = ctx.state_code(raw, INNER_STATE_SALT);
                ctx.out
                    .emit(Instruction::a_sb_c(Opcode::EQI, ctx.regs.state, code, 0, true)?)?;
                ctx.out.emit_jump(label)?;
            }
            ctx.out.emit_jump_to(ctx.dispatcher_pc)?;
        }

        emit_blocks(ctx, &layout)?;
        emit_decoy_bodies(ctx, &layout)?;
        Ok(true)
    }
}
