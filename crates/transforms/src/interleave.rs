//! Decoy functions woven into the dispatcher.
//!
//! A function-id register is loaded with the code of the real function before
//! the dispatcher runs. The dispatcher gets one extra entry per decoy function,
//! comparing that register against an id the real function never takes, so
//! the decoys are listed but never entered.

use crate::context::{CffContext, Label, FAKE_FUNCTION_BLOCKS};
use crate::dispatcher::{emit_transition, StateLayout, StateTarget};
use crate::util::{emit_arith, emit_arith_imm, emit_loadi};
use lunaris_core::opcode::Opcode;
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

/// Salt keying function-id codes.
pub const FUNC_ID_SALT: u32 = 0xABCD_EF00;
/// Salt keying decoy function bodies.
pub const FAKE_SALT: u32 = 0xFEED_FACE;
/// Raw id of the first decoy function; the real function is id 0.
pub const FAKE_ID_BASE: usize = 100;

/// Shape of a decoy function's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStyle {
    /// Integer arithmetic chains.
    Arithmetic,
    /// Length and concatenation traffic.
    String,
    /// Table construction and indexing.
    Table,
    /// A counted loop.
    Loop,
}

impl FakeStyle {
    const ALL: [Self; 4] = [Self::Arithmetic, Self::String, Self::Table, Self::Loop];

    fn from_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }
}

/// Code of raw function id `raw` in the function-id register.
pub fn function_code(ctx: &CffContext<'_>, raw: usize) -> i64 {
    ctx.state_code(raw, FUNC_ID_SALT)
}

/// `LOADI func_id, code(real function)`, emitted before the dispatcher head.
pub(crate) fn emit_function_id(ctx: &mut CffContext<'_>) -> Result<(), TransformError> {
    let code = function_code(ctx, 0);
    let reg = ctx.regs.func_id;
    emit_loadi(ctx, reg, code)?;
    cff_log!(*ctx.log, "Function id register {} = {}", reg, code);
    Ok(())
}

/// One `EQI func_id, code(f) k=1 ; JMP fake_f` pair per decoy function.
pub(crate) fn emit_function_entries(ctx: &mut CffContext<'_>) -> Result<(), TransformError> {
    for f in 0..ctx.num_fake_functions {
        let code = function_code(ctx, FAKE_ID_BASE + f);
        ctx.out
            .emit(Instruction::a_sb_c(Opcode::EQI, ctx.regs.func_id, code, 0, true)?)?;
        ctx.out.emit_jump(Label::FakeFunction(f))?;
        cff_log!(*ctx.log, "Fake function entry {} (id code {})", f, code);
    }
    Ok(())
}

fn emit_template(
    ctx: &mut CffContext<'_>,
    style: FakeStyle,
    rng: &mut StdRng,
) -> Result<(), TransformError> {
    let (r1, r2) = (ctx.regs.opaque1, ctx.regs.opaque2);
    match style {
        FakeStyle::Arithmetic => {
            emit_loadi(ctx, r1, rng.random_range(1..1000))?;
            emit_loadi(ctx, r2, rng.random_range(1..1000))?;
            emit_arith(ctx, Opcode::ADD, r1, r1, r2)?;
            emit_arith(ctx, Opcode::MUL, r2, r1, r2)?;
            emit_arith_imm(ctx, Opcode::ADDI, r1, r1, rng.random_range(-50..50))?;
        }
        FakeStyle::String => {
            emit_loadi(ctx, r1, rng.random_range(0..100))?;
            ctx.out.emit(Instruction::abc(Opcode::MOVE, r2, r1, 0, false)?)?;
            ctx.out.emit(Instruction::abc(Opcode::LEN, r2, r1, 0, false)?)?;
            ctx.out.emit(Instruction::abc(Opcode::CONCAT, r1, 2, 0, false)?)?;
            ctx.out.emit(Instruction::abc(Opcode::NOT, r2, r1, 0, false)?)?;
        }
        FakeStyle::Table => {
            ctx.out.emit(Instruction::abc(Opcode::NEWTABLE, r1, 0, 0, false)?)?;
            ctx.out.emit(Instruction::ax_only(Opcode::EXTRAARG, 0)?)?;
            let index = rng.random_range(1..16);
            emit_loadi(ctx, r2, rng.random_range(0..1000))?;
            ctx.out.emit(Instruction::abc(Opcode::SETI, r1, index, r2, false)?)?;
            ctx.out.emit(Instruction::abc(Opcode::GETI, r2, r1, index, false)?)?;
            ctx.out.emit(Instruction::abc(Opcode::LEN, r2, r1, 0, false)?)?;
        }
        FakeStyle::Loop => {
            emit_loadi(ctx, r1, 0)?;
            emit_loadi(ctx, r2, rng.random_range(2..20))?;
            let head = ctx.out.pc();
            emit_arith_imm(ctx, Opcode::ADDI, r1, r1, 1)?;
            ctx.out.emit(Instruction::abc(Opcode::LT, r1, r2, 0, true)?)?;
            ctx.out.emit_jump_to(head)?;
        }
    }
    Ok(())
}

/// Emits every decoy function body, binding [`Label::FakeFunction`] at each
/// function's first block.
pub(crate) fn emit_fake_functions(
    ctx: &mut CffContext<'_>,
    layout: &dyn StateLayout,
) -> Result<(), TransformError> {
    let mut rng = ctx.rng(FAKE_SALT);
    let rotation = rng.random_range(0..FakeStyle::ALL.len());
    let first_state = ctx.blocks.len() + ctx.num_bogus;
    debug!("Emitting {} fake functions", ctx.num_fake_functions);

    for f in 0..ctx.num_fake_functions {
        let style = FakeStyle::from_index(f + rotation);
        let start = ctx.out.bind(Label::FakeFunction(f));
        for b in 0..FAKE_FUNCTION_BLOCKS {
            emit_template(ctx, style, &mut rng)?;
            let target = if b + 1 < FAKE_FUNCTION_BLOCKS {
                StateTarget::Raw(first_state + f * FAKE_FUNCTION_BLOCKS + b + 1)
            } else {
                StateTarget::Block(rng.random_range(0..ctx.blocks.len()))
            };
            emit_transition(ctx, layout, target)?;
        }
        cff_log!(
            *ctx.log,
            "Fake function {} ({:?}) at pc {}",
            f,
            style,
            start
        );
    }
    Ok(())
}
