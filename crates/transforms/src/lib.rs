//! Control-flow flattening and VM-protection passes over host bytecode.
//!
//! The entry point is [`obfuscator::flatten`], which rewrites one function
//! prototype according to a set of [`ObfuscationFlags`]. [`obfuscator::Obfuscator`]
//! wraps it with a debug-log path and a [`vm_protect::VmCodeRegistry`].

pub mod bogus;
pub mod context;
pub mod dispatcher;
pub mod interleave;
pub mod metadata;
pub mod obfuscator;
pub mod opaque_predicate;
pub mod shuffle;
pub mod state;
pub mod util;
pub mod vm_protect;

use bitflags::bitflags;
use context::CffContext;
use lunaris_utils::errors::TransformError;
use serde::{Deserialize, Serialize};

pub use obfuscator::{flatten, FlattenOutcome, FlattenReport, ObfuscationConfig, Obfuscator};

/// A stage of the flattening pipeline operating on a [`CffContext`].
pub trait Transform: std::fmt::Debug + Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform, returning whether anything changed.
    fn apply(&self, ctx: &mut CffContext<'_>) -> Result<bool, TransformError>;
}

bitflags! {
    /// Which transformations to apply. Bit positions are part of the
    /// prototype's `mode` field format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ObfuscationFlags: u32 {
        /// Control-flow flattening.
        const CFF = 1 << 0;
        /// Permute block state ids.
        const BLOCK_SHUFFLE = 1 << 1;
        /// Add unreachable decoy blocks.
        const BOGUS_BLOCKS = 1 << 2;
        /// Disguise state ids with the keyed bijection.
        const STATE_ENCODE = 1 << 3;
        /// Two-level dispatcher.
        const NESTED_DISPATCHER = 1 << 4;
        /// Opaque predicates guarding dead code in the dispatcher.
        const OPAQUE_PREDICATES = 1 << 5;
        /// Decoy functions gated by a function-id register.
        const FUNC_INTERLEAVE = 1 << 6;
        /// Opcode remapping and encryption.
        const VM_PROTECT = 1 << 7;
    }
}

impl ObfuscationFlags {
    /// Flags belonging to the flattening pass (everything but `VM_PROTECT`).
    pub const CFF_FAMILY: Self = Self::VM_PROTECT.complement();

    /// Parses the bitflags text form, e.g. `"CFF | BLOCK_SHUFFLE"` or `"0x3"`.
    pub fn parse(text: &str) -> Result<Self, bitflags::parser::ParseError> {
        bitflags::parser::from_str(text)
    }
}

impl Default for ObfuscationFlags {
    fn default() -> Self {
        Self::CFF
    }
}
