//! Opcode enumeration for the host register VM and its control-flow classification.
//!
//! The discriminant of every variant is the value stored in the instruction's
//! `OP` field, so the order below must match the host interpreter exactly. The
//! list is the stock 5.4 set plus the class/object extensions the host adds
//! (`SPACESHIP`, `GETVARG`, `ERRNNIL`, `IS`, `TESTNIL`, `NEWCLASS` .. `SLICE`, `NOP`).
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Operand layout used by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpMode {
    /// `A B C k`
    Abc,
    /// `A Bx` (unsigned)
    ABx,
    /// `A sBx` (signed)
    AsBx,
    /// `Ax`
    Ax,
    /// `sJ` (signed jump)
    SJ,
}

impl OpMode {
    /// Short mode name as used in listings.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Abc => "iABC",
            Self::ABx => "iABx",
            Self::AsBx => "iAsBx",
            Self::Ax => "iAx",
            Self::SJ => "isJ",
        }
    }

    /// Numeric tag, stable across releases (stored in VM instruction flags).
    pub const fn tag(self) -> u8 {
        match self {
            Self::Abc => 0,
            Self::ABx => 1,
            Self::AsBx => 2,
            Self::Ax => 3,
            Self::SJ => 4,
        }
    }
}

/// Host opcodes. Discriminants equal the encoded `OP` field.
#[allow(missing_docs)]
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumCount,
    EnumIter,
    FromRepr,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Opcode {
    MOVE = 0,
    LOADI,
    LOADF,
    LOADK,
    LOADKX,
    LOADFALSE,
    LFALSESKIP,
    LOADTRUE,
    LOADNIL,
    GETUPVAL,
    SETUPVAL,
    GETTABUP,
    GETTABLE,
    GETI,
    GETFIELD,
    SETTABUP,
    SETTABLE,
    SETI,
    SETFIELD,
    NEWTABLE,
    SELF,
    ADDI,
    ADDK,
    SUBK,
    MULK,
    MODK,
    POWK,
    DIVK,
    IDIVK,
    BANDK,
    BORK,
    BXORK,
    SHLI,
    SHRI,
    ADD,
    SUB,
    MUL,
    MOD,
    POW,
    DIV,
    IDIV,
    BAND,
    BOR,
    BXOR,
    SHL,
    SHR,
    SPACESHIP,
    MMBIN,
    MMBINI,
    MMBINK,
    UNM,
    BNOT,
    NOT,
    LEN,
    CONCAT,
    CLOSE,
    TBC,
    JMP,
    EQ,
    LT,
    LE,
    EQK,
    EQI,
    LTI,
    LEI,
    GTI,
    GEI,
    TEST,
    TESTSET,
    CALL,
    TAILCALL,
    RETURN,
    RETURN0,
    RETURN1,
    FORLOOP,
    FORPREP,
    TFORPREP,
    TFORCALL,
    TFORLOOP,
    SETLIST,
    CLOSURE,
    VARARG,
    GETVARG,
    ERRNNIL,
    VARARGPREP,
    IS,
    TESTNIL,
    NEWCLASS,
    INHERIT,
    GETSUPER,
    SETMETHOD,
    SETSTATIC,
    NEWOBJ,
    GETPROP,
    SETPROP,
    INSTANCEOF,
    IMPLEMENT,
    SETIFACEFLAG,
    ADDMETHOD,
    SLICE,
    NOP,
    EXTRAARG,
}

/// Number of host opcodes.
pub const NUM_OPCODES: usize = Opcode::COUNT;

/// Metamethod event numbers used as the `C` operand of `MMBIN*` fallbacks.
pub mod tm {
    /// `__add`
    pub const ADD: u16 = 6;
    /// `__sub`
    pub const SUB: u16 = 7;
    /// `__mul`
    pub const MUL: u16 = 8;
    /// `__mod`
    pub const MOD: u16 = 9;
    /// `__pow`
    pub const POW: u16 = 10;
    /// `__div`
    pub const DIV: u16 = 11;
    /// `__idiv`
    pub const IDIV: u16 = 12;
    /// `__band`
    pub const BAND: u16 = 13;
    /// `__bor`
    pub const BOR: u16 = 14;
    /// `__bxor`
    pub const BXOR: u16 = 15;
    /// `__shl`
    pub const SHL: u16 = 16;
    /// `__shr`
    pub const SHR: u16 = 17;
}

impl Opcode {
    /// Parses an opcode from the raw `OP` field.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// Raw `OP` field value.
    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    /// Mnemonic, e.g. `"EQI"`.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Addressing mode of this opcode's operands.
    pub const fn mode(self) -> OpMode {
        use Opcode::*;
        match self {
            LOADI | LOADF => OpMode::AsBx,
            LOADK | LOADKX | FORLOOP | FORPREP | TFORPREP | TFORLOOP | CLOSURE | ERRNNIL
            | NEWCLASS => OpMode::ABx,
            JMP => OpMode::SJ,
            EXTRAARG => OpMode::Ax,
            _ => OpMode::Abc,
        }
    }

    /// Whether the opcode ends a basic block.
    pub const fn is_block_terminator(self) -> bool {
        self.is_jump() || self.is_conditional_test() || self.is_return() || self.is_loop()
    }

    /// Opcodes that transfer control to a computed target.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Self::JMP | Self::FORLOOP | Self::FORPREP | Self::TFORPREP | Self::TFORLOOP
        )
    }

    /// Comparison and test opcodes: they skip the following instruction when
    /// the condition differs from `k`, otherwise they execute it as a jump.
    pub const fn is_conditional_test(self) -> bool {
        matches!(
            self,
            Self::EQ
                | Self::LT
                | Self::LE
                | Self::EQK
                | Self::EQI
                | Self::LTI
                | Self::LEI
                | Self::GTI
                | Self::GEI
                | Self::TEST
                | Self::TESTSET
                | Self::TESTNIL
        )
    }

    /// Opcodes that leave the function.
    pub const fn is_return(self) -> bool {
        matches!(
            self,
            Self::RETURN | Self::RETURN0 | Self::RETURN1 | Self::TAILCALL
        )
    }

    /// Numeric and generic `for` loop opcodes. Functions containing any of
    /// these are left alone by the flattener.
    pub const fn is_loop(self) -> bool {
        matches!(
            self,
            Self::FORLOOP | Self::FORPREP | Self::TFORPREP | Self::TFORLOOP | Self::TFORCALL
        )
    }

    /// Opcodes that unconditionally skip the next instruction.
    pub const fn skips_next(self) -> bool {
        matches!(self, Self::LFALSESKIP)
    }

    /// Comparison opcodes whose `B` operand is a signed immediate.
    pub const fn has_signed_b(self) -> bool {
        matches!(
            self,
            Self::EQI | Self::LTI | Self::LEI | Self::GTI | Self::GEI | Self::MMBINI
        )
    }

    /// Arithmetic opcodes whose `C` operand is a signed immediate.
    pub const fn has_signed_c(self) -> bool {
        matches!(self, Self::ADDI | Self::SHLI | Self::SHRI)
    }

    /// The metamethod fallback that must directly follow this opcode.
    ///
    /// Arithmetic instructions skip the next instruction when their fast path
    /// succeeds; that slot belongs to the fallback, so generated arithmetic must
    /// always be paired with it.
    pub const fn metamethod_fallback(self) -> Option<Self> {
        use Opcode::*;
        match self {
            ADD | SUB | MUL | MOD | POW | DIV | IDIV | BAND | BOR | BXOR | SHL | SHR => {
                Some(MMBIN)
            }
            ADDI | SHLI | SHRI => Some(MMBINI),
            ADDK | SUBK | MULK | MODK | POWK | DIVK | IDIVK | BANDK | BORK | BXORK => {
                Some(MMBINK)
            }
            _ => None,
        }
    }
}
