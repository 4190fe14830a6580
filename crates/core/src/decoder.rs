//! Instruction words and their operand decoding.
//!
//! Every instruction is a 64-bit word. The low 7 bits hold the opcode; the
//! remaining fields depend on the opcode's [`OpMode`]:
//!
//! ```text
//!  63      56 55          40 39          24 23 22          7 6     0
//! +----------+--------------+--------------+--+-------------+-------+
//! | (unused) |      C       |      B       |k |      A      |  OP   |  iABC
//! | (unused) |             Bx (33 bits)       |      A      |  OP   |  iABx / iAsBx
//! | (unused) |                 Ax / sJ (49 bits)             |  OP   |  iAx / isJ
//! +----------+--------------+--------------+--+-------------+-------+
//! ```
//!
//! Signed fields use excess-K encoding: the stored value is `v + OFFSET`.
use crate::opcode::{OpMode, Opcode};
use hex::FromHex;
use lunaris_utils::errors::InstructionError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Width of the opcode field.
pub const SIZE_OP: u32 = 7;
/// Width of the `A` field.
pub const SIZE_A: u32 = 16;
/// Width of the `B` field.
pub const SIZE_B: u32 = 16;
/// Width of the `C` field.
pub const SIZE_C: u32 = 16;
/// Width of the `Bx` field (`k`, `B` and `C` combined).
pub const SIZE_BX: u32 = SIZE_C + SIZE_B + 1;
/// Width of the `Ax` field.
pub const SIZE_AX: u32 = SIZE_BX + SIZE_A;
/// Width of the `sJ` field.
pub const SIZE_SJ: u32 = SIZE_BX + SIZE_A;

/// Bit position of the opcode field.
pub const POS_OP: u32 = 0;
/// Bit position of `A`.
pub const POS_A: u32 = POS_OP + SIZE_OP;
/// Bit position of `k`.
pub const POS_K: u32 = POS_A + SIZE_A;
/// Bit position of `B`.
pub const POS_B: u32 = POS_K + 1;
/// Bit position of `C`.
pub const POS_C: u32 = POS_B + SIZE_B;
/// Bit position of `Bx`.
pub const POS_BX: u32 = POS_K;
/// Bit position of `Ax`.
pub const POS_AX: u32 = POS_A;
/// Bit position of `sJ`.
pub const POS_SJ: u32 = POS_A;

/// Largest `A`.
pub const MAXARG_A: u64 = (1 << SIZE_A) - 1;
/// Largest `B`.
pub const MAXARG_B: u64 = (1 << SIZE_B) - 1;
/// Largest `C`.
pub const MAXARG_C: u64 = (1 << SIZE_C) - 1;
/// Largest `Bx`.
pub const MAXARG_BX: u64 = (1 << SIZE_BX) - 1;
/// Largest `Ax`.
pub const MAXARG_AX: u64 = (1 << SIZE_AX) - 1;
/// Largest raw `sJ`.
pub const MAXARG_SJ: u64 = (1 << SIZE_SJ) - 1;

/// Excess-K offset of `sBx`.
pub const OFFSET_SBX: i64 = (MAXARG_BX >> 1) as i64;
/// Excess-K offset of `sJ`.
pub const OFFSET_SJ: i64 = (MAXARG_SJ >> 1) as i64;
/// Excess-K offset of the signed `sB`/`sC` immediates.
pub const OFFSET_SC: i64 = (MAXARG_C >> 1) as i64;

/// Smallest signed 16-bit immediate.
pub const MIN_SC: i64 = -OFFSET_SC;
/// Largest signed 16-bit immediate.
pub const MAX_SC: i64 = MAXARG_C as i64 - OFFSET_SC;

const fn mask(size: u32) -> u64 {
    (1u64 << size) - 1
}

/// One encoded instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction(pub(crate) u64);

/// Operands of a decoded instruction, shaped by the opcode's addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// `A B C k`
    Abc {
        /// Register `A`.
        a: u32,
        /// Operand `B` (raw field; see [`Instruction::sb`] for immediates).
        b: u32,
        /// Operand `C` (raw field; see [`Instruction::sc`] for immediates).
        c: u32,
        /// The `k` bit.
        k: bool,
    },
    /// `A Bx`
    ABx {
        /// Register `A`.
        a: u32,
        /// Unsigned `Bx`.
        bx: u64,
    },
    /// `A sBx`
    AsBx {
        /// Register `A`.
        a: u32,
        /// Signed `sBx`.
        sbx: i64,
    },
    /// `Ax`
    Ax {
        /// Unsigned `Ax`.
        ax: u64,
    },
    /// `sJ`
    SJ {
        /// Signed jump offset, relative to the next instruction.
        sj: i64,
    },
}

impl Operands {
    /// The addressing mode this operand shape belongs to.
    pub const fn mode(&self) -> OpMode {
        match self {
            Self::Abc { .. } => OpMode::Abc,
            Self::ABx { .. } => OpMode::ABx,
            Self::AsBx { .. } => OpMode::AsBx,
            Self::Ax { .. } => OpMode::Ax,
            Self::SJ { .. } => OpMode::SJ,
        }
    }
}

/// An instruction split into opcode and typed operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// The opcode.
    pub opcode: Opcode,
    /// Its operands.
    pub operands: Operands,
}

impl Instruction {
    /// Wraps a raw word without validation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    const fn field(self, pos: u32, size: u32) -> u64 {
        (self.0 >> pos) & mask(size)
    }

    /// Raw opcode field.
    pub const fn op_byte(self) -> u8 {
        self.field(POS_OP, SIZE_OP) as u8
    }

    /// Decodes the opcode field.
    pub fn opcode(self) -> Result<Opcode, InstructionError> {
        let byte = self.op_byte();
        Opcode::from_byte(byte).ok_or(InstructionError::UnknownOpcode(byte))
    }

    /// Field `A`.
    pub const fn a(self) -> u32 {
        self.field(POS_A, SIZE_A) as u32
    }

    /// Field `B`.
    pub const fn b(self) -> u32 {
        self.field(POS_B, SIZE_B) as u32
    }

    /// Field `C`.
    pub const fn c(self) -> u32 {
        self.field(POS_C, SIZE_C) as u32
    }

    /// The `k` bit.
    pub const fn k(self) -> bool {
        self.field(POS_K, 1) != 0
    }

    /// Field `Bx`.
    pub const fn bx(self) -> u64 {
        self.field(POS_BX, SIZE_BX)
    }

    /// Field `sBx`.
    pub const fn sbx(self) -> i64 {
        self.bx() as i64 - OFFSET_SBX
    }

    /// Field `Ax`.
    pub const fn ax(self) -> u64 {
        self.field(POS_AX, SIZE_AX)
    }

    /// Field `sJ`.
    pub const fn sj(self) -> i64 {
        self.field(POS_SJ, SIZE_SJ) as i64 - OFFSET_SJ
    }

    /// Field `B` read as a signed immediate.
    pub const fn sb(self) -> i64 {
        self.b() as i64 - OFFSET_SC
    }

    /// Field `C` read as a signed immediate.
    pub const fn sc(self) -> i64 {
        self.c() as i64 - OFFSET_SC
    }

    /// Decodes the opcode and its operands according to the opcode's mode.
    pub fn decode(self) -> Result<Decoded, InstructionError> {
        let opcode = self.opcode()?;
        let operands = match opcode.mode() {
            OpMode::Abc => Operands::Abc {
                a: self.a(),
                b: self.b(),
                c: self.c(),
                k: self.k(),
            },
            OpMode::ABx => Operands::ABx {
                a: self.a(),
                bx: self.bx(),
            },
            OpMode::AsBx => Operands::AsBx {
                a: self.a(),
                sbx: self.sbx(),
            },
            OpMode::Ax => Operands::Ax { ax: self.ax() },
            OpMode::SJ => Operands::SJ { sj: self.sj() },
        };
        Ok(Decoded { opcode, operands })
    }

    /// Resolves the destination of a jump-family instruction at `pc`.
    ///
    /// Returns `None` for opcodes that are not jumps. The result may lie
    /// outside the function for malformed code; callers validate it.
    pub fn jump_target(self, pc: usize) -> Result<Option<i64>, InstructionError> {
        let next = pc as i64 + 1;
        let target = match self.opcode()? {
            Opcode::JMP => next + self.sj(),
            Opcode::FORLOOP | Opcode::TFORLOOP => next - self.bx() as i64,
            Opcode::FORPREP | Opcode::TFORPREP => next + self.bx() as i64,
            _ => return Ok(None),
        };
        Ok(Some(target))
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({:#018x} {})", self.0, self)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(Decoded { opcode, operands }) = self.decode() else {
            return write!(f, "<invalid op {}>", self.op_byte());
        };
        write!(f, "{:<12}", opcode.name())?;
        match operands {
            Operands::Abc { a, b, c, k } => {
                write!(f, " A={a}")?;
                if opcode.has_signed_b() {
                    write!(f, " sB={}", self.sb())?;
                } else {
                    write!(f, " B={b}")?;
                }
                if opcode.has_signed_c() {
                    write!(f, " sC={}", self.sc())?;
                } else {
                    write!(f, " C={c}")?;
                }
                if k {
                    write!(f, " k")?;
                }
                Ok(())
            }
            Operands::ABx { a, bx } => write!(f, " A={a} Bx={bx}"),
            Operands::AsBx { a, sbx } => write!(f, " A={a} sBx={sbx}"),
            Operands::Ax { ax } => write!(f, " Ax={ax}"),
            Operands::SJ { sj } => write!(f, " sJ={sj:+}"),
        }
    }
}

impl FromStr for Instruction {
    type Err = hex::FromHexError;

    /// Parses a 16-digit hex word, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.trim();
        let clean = clean.strip_prefix("0x").unwrap_or(clean);
        let bytes = <[u8; 8]>::from_hex(clean)?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl Serialize for Instruction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0.to_be_bytes())))
    }
}

impl<'de> Deserialize<'de> for Instruction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
