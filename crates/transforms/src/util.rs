use crate::context::CffContext;
use lunaris_core::opcode::{tm, Opcode};
use lunaris_core::Instruction;
use lunaris_utils::errors::TransformError;

/// Linear-congruential generator driving the block shuffle and the VM opcode
/// permutation. Its exact sequence is part of the output format: the same
/// seed must always produce the same permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    /// Multiplier (Numerical Recipes).
    pub const MULTIPLIER: u32 = 1_664_525;
    /// Increment (Numerical Recipes).
    pub const INCREMENT: u32 = 1_013_904_223;

    /// Generator whose first output is `lcg(seed)`.
    pub const fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Advances and returns the new state.
    pub fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(Self::INCREMENT);
        self.state
    }

    /// Current state.
    pub const fn state(&self) -> u32 {
        self.state
    }

    /// Fisher–Yates over `items[start..]`, drawing `j = start + r % (i - start + 1)`.
    ///
    /// With `start = 1` the first element never moves.
    pub fn shuffle_from<T>(&mut self, items: &mut [T], start: usize) {
        if items.len() <= start + 1 {
            return;
        }
        for i in (start + 1..items.len()).rev() {
            let span = (i - start + 1) as u32;
            let j = start + (self.next_u32() % span) as usize;
            items.swap(i, j);
        }
    }
}

/// Metamethod event passed to the fallback of a generated arithmetic opcode.
const fn event_for(op: Opcode) -> u16 {
    match op {
        Opcode::SUB => tm::SUB,
        Opcode::MUL => tm::MUL,
        Opcode::MOD => tm::MOD,
        Opcode::BAND => tm::BAND,
        Opcode::BOR => tm::BOR,
        Opcode::BXOR => tm::BXOR,
        Opcode::SHL | Opcode::SHLI => tm::SHL,
        Opcode::SHR | Opcode::SHRI => tm::SHR,
        _ => tm::ADD,
    }
}

/// Register-register arithmetic followed by its `MMBIN` fallback.
pub(crate) fn emit_arith(
    ctx: &mut CffContext<'_>,
    op: Opcode,
    a: u32,
    b: u32,
    c: u32,
) -> Result<(), TransformError> {
    ctx.out.emit(Instruction::abc(op, a, b, c, false)?)?;
    ctx.out
        .emit(Instruction::abc(Opcode::MMBIN, b, c, event_for(op).into(), false)?)?;
    Ok(())
}

/// Register-immediate arithmetic (`ADDI`, `SHRI`, ...) followed by its `MMBINI` fallback.
pub(crate) fn emit_arith_imm(
    ctx: &mut CffContext<'_>,
    op: Opcode,
    a: u32,
    b: u32,
    imm: i64,
) -> Result<(), TransformError> {
    ctx.out.emit(Instruction::ab_sc(op, a, b, imm)?)?;
    ctx.out.emit(Instruction::a_sb_c(
        Opcode::MMBINI,
        b,
        imm,
        event_for(op).into(),
        false,
    )?)?;
    Ok(())
}

/// `LOADI reg value`.
pub(crate) fn emit_loadi(
    ctx: &mut CffContext<'_>,
    reg: u32,
    value: i64,
) -> Result<usize, TransformError> {
    ctx.out.emit(Instruction::asbx(Opcode::LOADI, reg, value)?)
}
