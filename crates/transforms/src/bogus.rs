//! Unreachable decoy blocks.
//!
//! Decoys are listed in the dispatcher like real blocks but no real
//! transition ever selects their states. Each body is a short run of
//! plausible register traffic that hands control to another decoy.

use crate::context::{CffContext, Label};
use crate::dispatcher::{emit_transition, StateLayout, StateTarget};
use crate::util::{emit_arith_imm, emit_loadi};
use lunaris_core::opcode::Opcode;
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

/// Filler instructions per decoy block, inclusive.
pub const BOGUS_BODY_LEN: std::ops::RangeInclusive<usize> = 3..=8;

/// Registers a decoy body may write: the function's own registers (never
/// observed, since the body is unreachable) and the opaque scratch pair.
fn pick_register(ctx: &CffContext<'_>, rng: &mut StdRng) -> u32 {
    let own = ctx.regs.state;
    let choice = rng.random_range(0..own + 2);
    if choice < own {
        choice
    } else if choice == own {
        ctx.regs.opaque1
    } else {
        ctx.regs.opaque2
    }
}

fn emit_filler(ctx: &mut CffContext<'_>, rng: &mut StdRng) -> Result<(), TransformError> {
    let dst = pick_register(ctx, rng);
    match rng.random_range(0..5) {
        0 => {
            emit_loadi(ctx, dst, rng.random_range(-1000..1000))?;
        }
        1 => {
            let src = pick_register(ctx, rng);
            emit_arith_imm(ctx, Opcode::ADDI, dst, src, rng.random_range(-100..100))?;
        }
        2 => {
            let src = pick_register(ctx, rng);
            ctx.out.emit(Instruction::abc(Opcode::MOVE, dst, src, 0, false)?)?;
        }
        3 => {
            emit_loadi(ctx, dst, rng.random_range(10_000..60_000))?;
        }
        _ => {
            ctx.out.emit(Instruction::abc(
                Opcode::NOP,
                dst,
                rng.random_range(0..256),
                rng.random_range(0..256),
                false,
            )?)?;
        }
    }
    Ok(())
}

/// Emits every decoy block body, binding [`Label::Bogus`] for each.
pub(crate) fn emit_bogus_blocks(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
) -> Result<(), TransformError> {
    let count = ctx.num_bogus;
    let mut rng = ctx.rng(0);
    debug!("Emitting {} bogus blocks", count);

    for index in 0..count {
        let start = ctx.out.bind(Label::Bogus(index));
        let len = rng.random_range(BOGUS_BODY_LEN);
        for _ in 0..len {
            emit_filler(ctx, &mut rng)?;
        }
        let next = (index + 1 + rng.random_range(0..3)) % count;
        emit_transition(ctx, layout, StateTarget::Bogus(next))?;
        cff_log!(
            *ctx.log,
            "Bogus block {} at pc {} ({} fillers) -> bogus {}",
            index,
            start,
            len,
            next
        );
    }
    Ok(())
}
