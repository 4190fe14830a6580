use std::collections::TryReserveError;
use thiserror::Error;

/// Errors raised while encoding or decoding a single instruction word.
#[derive(Debug, Error)]
pub enum InstructionError {
    /// The opcode field does not name a known opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    /// An operand does not fit its bit field.
    #[error("operand {field} = {value} outside [{min}, {max}]")]
    OperandOutOfRange {
        /// Field name (`A`, `B`, `sC`, `sJ`, ...).
        field: &'static str,
        /// Offending value.
        value: i64,
        /// Smallest encodable value.
        min: i64,
        /// Largest encodable value.
        max: i64,
    },
    /// The operand shape does not match the opcode's addressing mode.
    #[error("{opcode} expects {expected} operands")]
    ModeMismatch {
        /// Mnemonic of the opcode being encoded.
        opcode: &'static str,
        /// Name of the addressing mode the opcode uses.
        expected: &'static str,
    },
}

/// Error type for basic-block identification.
#[derive(Debug, Error)]
pub enum CfgError {
    /// The function has no instructions.
    #[error("function has no instructions")]
    EmptyFunction,
    /// A jump resolves outside the function body.
    #[error("jump at pc {pc} targets {target}, outside [0, {len})")]
    InvalidJumpTarget {
        /// PC of the jump.
        pc: usize,
        /// Resolved target (may be negative for malformed backward jumps).
        target: i64,
        /// Function length.
        len: usize,
    },
    /// An instruction could not be decoded.
    #[error("instruction at pc {pc}: {source}")]
    Instruction {
        /// PC of the instruction.
        pc: usize,
        /// Underlying decode failure.
        #[source]
        source: InstructionError,
    },
}

/// Error type for transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Scratch registers would exceed the register file.
    #[error("function needs {needed} registers, limit is {limit}")]
    RegisterExhausted {
        /// Registers required once scratch registers are added.
        needed: usize,
        /// Register file size.
        limit: usize,
    },
    /// More dispatch states than the encoder's range can hold.
    #[error("{states} dispatch states exceed the state range of {range}")]
    StateSpaceExhausted {
        /// Number of states requested.
        states: usize,
        /// Size of the state range.
        range: usize,
    },
    /// A placeholder jump was never bound to an address.
    #[error("jump at pc {site} targets unbound label {label}")]
    UnresolvedJump {
        /// PC of the placeholder jump.
        site: usize,
        /// Debug rendering of the missing label.
        label: String,
    },
    /// A block needs a successor that block identification did not find.
    #[error("block {block} has no {edge} successor")]
    MissingSuccessor {
        /// Block index.
        block: usize,
        /// Which successor was missing.
        edge: &'static str,
    },
    /// A block ends in an instruction the dispatcher cannot re-route.
    #[error("block ending at pc {pc} uses unsupported terminator {opcode}")]
    UnsupportedTerminator {
        /// PC of the terminator.
        pc: usize,
        /// Its mnemonic.
        opcode: &'static str,
    },
    /// Output buffer growth failed.
    #[error("allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
    /// Instruction encoding failed while generating code.
    #[error("instruction encoding failed: {0}")]
    Instruction(#[from] InstructionError),
    /// Block identification failed.
    #[error("block identification failed: {0}")]
    Cfg(#[from] CfgError),
}

/// Errors raised while reading a serialized metadata blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// The buffer ends before the expected payload.
    #[error("metadata truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// Header magic does not match.
    #[error("bad metadata magic {0:#010x}")]
    BadMagic(u32),
    /// Header version is not understood.
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(i32),
    /// Negative block count in the header.
    #[error("negative block count {0}")]
    NegativeBlockCount(i32),
    /// Negative state register in the header.
    #[error("negative state register {0}")]
    NegativeStateRegister(i32),
    /// A value does not fit the 32-bit field it is written to.
    #[error("{field} value {value} does not fit an i32 field")]
    FieldOverflow {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: usize,
    },
    /// A block record is internally inconsistent.
    #[error("block record {index} is invalid: {reason}")]
    InvalidBlock {
        /// Record index.
        index: usize,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Errors that can occur during obfuscation.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// Failed to decode hex string to bytes.
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// File read/write error.
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// Transform application failed.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    /// Metadata blob was rejected.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    /// Flag expression could not be parsed.
    #[error("invalid flags `{0}`")]
    InvalidFlags(String),
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
