//! Instruction model, function prototypes and basic-block analysis for the
//! host register VM's bytecode.

pub mod cfg_ir;
pub mod decoder;
pub mod encoder;
pub mod opcode;
pub mod proto;

pub use decoder::{Decoded, Instruction, Operands};
pub use opcode::{OpMode, Opcode, NUM_OPCODES};
pub use proto::{FunctionId, Proto};
