//! Checked construction of instruction words.
//!
//! Every constructor validates its operands against the field widths in
//! [`crate::decoder`] and the opcode's addressing mode, so generated code can
//! never silently truncate an operand. Branch patching rewrites the whole word
//! through [`Instruction::with_sj`].
use crate::decoder::*;
use crate::opcode::{OpMode, Opcode};
use lunaris_utils::errors::InstructionError;

fn check_unsigned(field: &'static str, value: u64, max: u64) -> Result<u64, InstructionError> {
    if value > max {
        return Err(InstructionError::OperandOutOfRange {
            field,
            value: value as i64,
            min: 0,
            max: max as i64,
        });
    }
    Ok(value)
}

fn check_signed(
    field: &'static str,
    value: i64,
    offset: i64,
    max: u64,
) -> Result<u64, InstructionError> {
    let min = -offset;
    let hi = max as i64 - offset;
    if value < min || value > hi {
        return Err(InstructionError::OperandOutOfRange {
            field,
            value,
            min,
            max: hi,
        });
    }
    Ok((value + offset) as u64)
}

/// Converts a signed immediate into its excess-K `sB`/`sC` field value.
pub fn int_to_sc(value: i64) -> Result<u32, InstructionError> {
    check_signed("sC", value, OFFSET_SC, MAXARG_C).map(|v| v as u32)
}

/// Whether `value` fits a signed 16-bit immediate.
pub const fn fits_sc(value: i64) -> bool {
    value >= MIN_SC && value <= MAX_SC
}

fn mode_mismatch(opcode: Opcode) -> InstructionError {
    InstructionError::ModeMismatch {
        opcode: opcode.name(),
        expected: opcode.mode().name(),
    }
}

impl Instruction {
    /// Encodes `opcode` with `operands`, checking the addressing mode and every field.
    pub fn encode(opcode: Opcode, operands: Operands) -> Result<Self, InstructionError> {
        if operands.mode() != opcode.mode() {
            return Err(mode_mismatch(opcode));
        }
        let op = u64::from(opcode.to_byte()) << POS_OP;
        let word = match operands {
            Operands::Abc { a, b, c, k } => {
                op | check_unsigned("A", a.into(), MAXARG_A)? << POS_A
                    | u64::from(k) << POS_K
                    | check_unsigned("B", b.into(), MAXARG_B)? << POS_B
                    | check_unsigned("C", c.into(), MAXARG_C)? << POS_C
            }
            Operands::ABx { a, bx } => {
                op | check_unsigned("A", a.into(), MAXARG_A)? << POS_A
                    | check_unsigned("Bx", bx, MAXARG_BX)? << POS_BX
            }
            Operands::AsBx { a, sbx } => {
                op | check_unsigned("A", a.into(), MAXARG_A)? << POS_A
                    | check_signed("sBx", sbx, OFFSET_SBX, MAXARG_BX)? << POS_BX
            }
            Operands::Ax { ax } => op | check_unsigned("Ax", ax, MAXARG_AX)? << POS_AX,
            Operands::SJ { sj } => op | check_signed("sJ", sj, OFFSET_SJ, MAXARG_SJ)? << POS_SJ,
        };
        Ok(Self(word))
    }

    /// `A B C k` instruction with raw `B` and `C` fields.
    pub fn abc(opcode: Opcode, a: u32, b: u32, c: u32, k: bool) -> Result<Self, InstructionError> {
        Self::encode(opcode, Operands::Abc { a, b, c, k })
    }

    /// `A sB C k` instruction, e.g. `EQI`/`GEI` with an immediate operand.
    pub fn a_sb_c(
        opcode: Opcode,
        a: u32,
        sb: i64,
        c: u32,
        k: bool,
    ) -> Result<Self, InstructionError> {
        Self::abc(opcode, a, int_to_sc(sb)?, c, k)
    }

    /// `A B sC` instruction, e.g. `ADDI`.
    pub fn ab_sc(opcode: Opcode, a: u32, b: u32, sc: i64) -> Result<Self, InstructionError> {
        Self::abc(opcode, a, b, int_to_sc(sc)?, false)
    }

    /// `A Bx` instruction.
    pub fn abx(opcode: Opcode, a: u32, bx: u64) -> Result<Self, InstructionError> {
        Self::encode(opcode, Operands::ABx { a, bx })
    }

    /// `A sBx` instruction, e.g. `LOADI`.
    pub fn asbx(opcode: Opcode, a: u32, sbx: i64) -> Result<Self, InstructionError> {
        Self::encode(opcode, Operands::AsBx { a, sbx })
    }

    /// `Ax` instruction.
    pub fn ax_only(opcode: Opcode, ax: u64) -> Result<Self, InstructionError> {
        Self::encode(opcode, Operands::Ax { ax })
    }

    /// `JMP sJ`.
    pub fn jmp(sj: i64) -> Result<Self, InstructionError> {
        Self::encode(Opcode::JMP, Operands::SJ { sj })
    }

    /// Returns a copy of this `sJ` instruction with a new offset.
    pub fn with_sj(self, sj: i64) -> Result<Self, InstructionError> {
        let opcode = self.opcode()?;
        if opcode.mode() != OpMode::SJ {
            return Err(mode_mismatch(opcode));
        }
        Self::encode(opcode, Operands::SJ { sj })
    }
}
