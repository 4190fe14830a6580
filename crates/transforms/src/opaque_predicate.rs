use crate::context::CffContext;
use crate::ObfuscationFlags;
use lunaris_core::opcode::{tm, Opcode};
use lunaris_core::Instruction;
use lunaris_utils::cff_log;
use lunaris_utils::errors::{InstructionError, TransformError};
use rand::rngs::StdRng;
use rand::Rng;
use strum::{EnumCount, EnumIter, IntoEnumIterator};
use tracing::debug;

/// Salt keying the predicate generator.
pub const OPAQUE_SALT: u32 = 0xDEAD_BEEF;
/// A guard precedes every this-many-th dispatch entry (never the first).
pub const OPAQUE_INTERVAL: usize = 3;
/// Unreachable instructions placed behind every guard.
pub const DEAD_CODE_LEN: usize = 3;

/// Arithmetic identities whose outcome is fixed regardless of the loaded value.
///
/// Each predicate loads a small integer `x` into the first opaque register and
/// ends with a comparison whose `k` makes the following `JMP` always taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
#[repr(u8)]
pub enum OpaquePredicate {
    /// `x*x >= 0`
    SquareNonNegative,
    /// `x+0 == x`
    AddZero,
    /// `2x-x == x`
    DoubleMinusSelf,
    /// `x-x == 0`
    SelfMinusSelf,
    /// `x*x < 0`
    SquareNegative,
    /// `x+1 == x`
    SuccessorEqual,
    /// `x-x == 1`
    SelfMinusSelfIsOne,
}

impl OpaquePredicate {
    /// Whether the identity always holds.
    pub const fn always_true(self) -> bool {
        matches!(
            self,
            Self::SquareNonNegative | Self::AddZero | Self::DoubleMinusSelf | Self::SelfMinusSelf
        )
    }

    /// Picks one predicate uniformly.
    pub fn pick(rng: &mut StdRng) -> Self {
        let index = rng.random_range(0..Self::COUNT);
        Self::iter().nth(index).unwrap_or(Self::SelfMinusSelf)
    }

    /// The predicate's instructions over `r1`/`r2` with `x` loaded into `r1`.
    ///
    /// The last instruction is the comparison; a `JMP` placed after it is
    /// always taken.
    pub fn instructions(self, r1: u32, r2: u32, x: i64) -> Result<Vec<Instruction>, InstructionError> {
        let mmbin = |a: u32, b: u32, event: u16| {
            Instruction::abc(Opcode::MMBIN, a, b, event.into(), false)
        };
        let mmbini = |a: u32, imm: i64, event: u16| {
            Instruction::a_sb_c(Opcode::MMBINI, a, imm, event.into(), false)
        };
        // k equal to the predicate's value executes the next JMP
        let k = self.always_true();

        let mut code = vec![Instruction::asbx(Opcode::LOADI, r1, x)?];
        match self {
            Self::SquareNonNegative | Self::SquareNegative => {
                code.push(Instruction::abc(Opcode::MUL, r2, r1, r1, false)?);
                code.push(mmbin(r1, r1, tm::MUL)?);
                let op = if k { Opcode::GEI } else { Opcode::LTI };
                code.push(Instruction::a_sb_c(op, r2, 0, 0, k)?);
            }
            Self::AddZero | Self::SuccessorEqual => {
                let imm = if k { 0 } else { 1 };
                code.push(Instruction::ab_sc(Opcode::ADDI, r2, r1, imm)?);
                code.push(mmbini(r1, imm, tm::ADD)?);
                code.push(Instruction::abc(Opcode::EQ, r2, r1, 0, k)?);
            }
            Self::DoubleMinusSelf => {
                code.push(Instruction::abc(Opcode::ADD, r2, r1, r1, false)?);
                code.push(mmbin(r1, r1, tm::ADD)?);
                code.push(Instruction::abc(Opcode::SUB, r2, r2, r1, false)?);
                code.push(mmbin(r2, r1, tm::SUB)?);
                code.push(Instruction::abc(Opcode::EQ, r2, r1, 0, k)?);
            }
            Self::SelfMinusSelf | Self::SelfMinusSelfIsOne => {
                code.push(Instruction::abc(Opcode::SUB, r2, r1, r1, false)?);
                code.push(mmbin(r1, r1, tm::SUB)?);
                let expected = if k { 0 } else { 1 };
                code.push(Instruction::a_sb_c(Opcode::EQI, r2, expected, 0, k)?);
            }
        }
        Ok(code)
    }
}

/// Emits `predicate ; JMP over ; <dead code>` at the current pc.
pub(crate) fn emit_guard(ctx: &mut CffContext<'_>, rng: &mut StdRng) -> Result<(), TransformError> {
    let predicate = OpaquePredicate::pick(rng);
    let x = rng.random_range(-500..500);
    let (r1, r2) = (ctx.regs.opaque1, ctx.regs.opaque2);
    let start = ctx.out.pc();

    for inst in predicate.instructions(r1, r2, x)? {
        ctx.out.emit(inst)?;
    }
    let site = ctx.out.emit(Instruction::jmp(0)?)?;
    for _ in 0..DEAD_CODE_LEN {
        let junk = match rng.random_range(0..3) {
            0 => Instruction::asbx(Opcode::LOADI, r2, rng.random_range(-1000..1000))?,
            1 => Instruction::abc(Opcode::MOVE, r1, r2, 0, false)?,
            _ => Instruction::abc(
                Opcode::NOP,
                rng.random_range(0..256),
                rng.random_range(0..256),
                rng.random_range(0..256),
                false,
            )?,
        };
        ctx.out.emit(junk)?;
    }
    let end = ctx.out.pc();
    ctx.out.patch_jump(site, end)?;

    cff_log!(
        *ctx.log,
        "Opaque guard {:?} (x = {}) at pc [{}, {})",
        predicate,
        x,
        start,
        end
    );
    Ok(())
}

/// Places guards in front of dispatch entries, counting entries across
/// every ladder of one dispatcher.
#[derive(Debug)]
pub(crate) struct Guards {
    rng: Option<StdRng>,
    entries: usize,
}

impl Guards {
    pub(crate) fn new(ctx: &CffContext<'_>) -> Self {
        let rng = ctx
            .flags
            .contains(ObfuscationFlags::OPAQUE_PREDICATES)
            .then(|| ctx.rng(OPAQUE_SALT));
        if rng.is_none() {
            debug!("Opaque predicates disabled");
        }
        Self { rng, entries: 0 }
    }

    /// Called once before each dispatch entry is emitted.
    pub(crate) fn before_entry(&mut self, ctx: &mut CffContext<'_>) -> Result<(), TransformError> {
        let position = self.entries;
        self.entries += 1;
        match self.rng.as_mut() {
            Some(rng) if position > 0 && position % OPAQUE_INTERVAL == 0 => emit_guard(ctx, rng),
            _ => Ok(()),
        }
    }
}
