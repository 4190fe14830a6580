use clap::Subcommand;
use lunaris_core::{FunctionId, Instruction, OpMode, Proto};
use lunaris_utils::errors::ObfuscateError;
use std::error::Error;
use std::fs;

pub mod cfg;
pub mod disasm;
pub mod flatten;
pub mod metadata;
pub mod vm;

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Flatten a function and print the result
    Flatten(flatten::FlattenArgs),

    /// Write the block graph as Graphviz .dot
    Cfg(cfg::CfgArgs),

    /// Print the instruction listing
    Disasm(disasm::DisasmArgs),

    /// Decode a serialized metadata blob (input is hex or `@file`)
    Metadata(metadata::MetadataArgs),

    /// Build and list the encrypted VM table of a function
    Vm(vm::VmArgs),
}

/// A runnable subcommand.
pub trait Command {
    /// Runs the command against `input`.
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>>;
}

impl Command for Cmd {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        match self {
            Self::Flatten(args) => args.execute(input),
            Self::Cfg(args) => args.execute(input),
            Self::Disasm(args) => args.execute(input),
            Self::Metadata(args) => args.execute(input),
            Self::Vm(args) => args.execute(input),
        }
    }
}

/// Reads `@path` as a file, anything else as literal text.
pub fn read_input(input: &str) -> Result<String, ObfuscateError> {
    match input.strip_prefix('@') {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => Ok(input.to_string()),
    }
}

/// Loads a prototype from JSON, or assembles one from hex instruction words.
///
/// Hex input yields a single function with id 0 whose stack size covers the
/// highest `A` register written by the code.
pub fn load_proto(input: &str) -> Result<Proto, ObfuscateError> {
    let text = read_input(input)?;
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let code = trimmed
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|word| !word.is_empty())
        .map(str::parse::<Instruction>)
        .collect::<Result<Vec<_>, _>>()?;
    let max_stack_size = infer_stack_size(&code);
    tracing::debug!(
        "Assembled {} instructions, inferred stack size {}",
        code.len(),
        max_stack_size
    );
    Ok(Proto::new(FunctionId(0), code, max_stack_size))
}

fn infer_stack_size(code: &[Instruction]) -> u8 {
    let top = code
        .iter()
        .filter(|inst| {
            inst.opcode()
                .is_ok_and(|op| matches!(op.mode(), OpMode::Abc | OpMode::ABx | OpMode::AsBx))
        })
        .map(|inst| inst.a() + 1)
        .max()
        .unwrap_or(0);
    u8::try_from(top).unwrap_or(u8::MAX)
}
