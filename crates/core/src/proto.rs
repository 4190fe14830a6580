//! Function prototypes as handed over by the surrounding compiler.
use crate::decoder::Instruction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a function prototype, assigned by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u64);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// A compiled function.
///
/// The obfuscation passes replace `code` wholesale, may raise
/// `max_stack_size`, and record what they did in the three extension fields
/// `mode`, `magic` and `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proto {
    /// Identity used to key side tables.
    pub id: FunctionId,
    /// Instruction stream.
    pub code: Vec<Instruction>,
    /// Number of registers the function needs.
    pub max_stack_size: u8,
    /// Bitmask of applied obfuscation transforms.
    #[serde(default)]
    pub mode: u32,
    /// Marker stamped by the flattener.
    #[serde(default)]
    pub magic: u32,
    /// Transform-specific payload.
    #[serde(default)]
    pub data: u64,
    /// Nested function prototypes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protos: Vec<Proto>,
}

impl Proto {
    /// A prototype with empty extension fields and no children.
    pub const fn new(id: FunctionId, code: Vec<Instruction>, max_stack_size: u8) -> Self {
        Self {
            id,
            code,
            max_stack_size,
            mode: 0,
            magic: 0,
            data: 0,
            protos: Vec::new(),
        }
    }

    /// Number of instructions.
    pub fn size_code(&self) -> usize {
        self.code.len()
    }
}
