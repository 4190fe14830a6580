use super::read_input;
use clap::Args;
use lunaris_transform::metadata::CffMetadata;
use lunaris_transform::ObfuscationFlags;
use std::error::Error;
use std::fs;

/// Arguments for the `metadata` subcommand.
#[derive(Args, Debug)]
pub struct MetadataArgs {
    /// Read the blob as raw bytes from this file instead of hex input
    #[arg(long)]
    binary: bool,

    /// Decode this dispatcher constant back to a state id
    #[arg(long, allow_hyphen_values = true)]
    decode: Option<i64>,

    /// Flags the function was flattened with, for `--decode`
    #[arg(long, default_value = "CFF")]
    flags: String,
}

impl super::Command for MetadataArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let bytes = if self.binary {
            fs::read(input.strip_prefix('@').unwrap_or(input))?
        } else {
            let text = read_input(input)?;
            let clean = text.trim();
            hex::decode(clean.strip_prefix("0x").unwrap_or(clean))?
        };

        let metadata = CffMetadata::deserialize(&bytes)?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);

        if let Some(code) = self.decode {
            let flags = ObfuscationFlags::parse(&self.flags)
                .map_err(|e| format!("invalid flags `{}`: {e}", self.flags))?;
            match metadata.decode_state(code, flags) {
                Some(state) => println!("code {code} -> state {state}"),
                None => println!("code {code} matches no block"),
            }
        }
        Ok(())
    }
}
