/// Module for the `flatten` subcommand, which runs the flattening pass over a
/// prototype and writes the transformed prototype as JSON.
use super::load_proto;
use clap::Args;
use lunaris_transform::{ObfuscationConfig, ObfuscationFlags, Obfuscator};
use lunaris_utils::errors::ObfuscateError;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

/// Seed used when neither the command line nor a config file sets one.
const DEFAULT_SEED: u32 = 42;

/// Arguments for the `flatten` subcommand.
#[derive(Args, Debug)]
pub struct FlattenArgs {
    /// Transforms to apply, e.g. "CFF | BLOCK_SHUFFLE | STATE_ENCODE"
    #[arg(long)]
    flags: Option<String>,

    /// Use a preset instead of --flags: flatten, standard or maximum
    #[arg(long, conflicts_with = "flags")]
    preset: Option<String>,

    /// Seed for every randomised choice [default: 42]
    #[arg(long)]
    seed: Option<u32>,

    /// JSON config file; the options above override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the per-pass debug log to this file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Also flatten nested functions
    #[arg(long)]
    recurse: bool,

    /// Output file for the transformed prototype (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the serialized metadata blob of the root function to this file
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Write the flatten reports as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

impl FlattenArgs {
    fn config(&self) -> Result<ObfuscationConfig, ObfuscateError> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
            None => ObfuscationConfig {
                recurse: false,
                ..ObfuscationConfig::flatten_only(DEFAULT_SEED)
            },
        };

        if let Some(preset) = self.preset.as_deref() {
            config.flags = match preset {
                "flatten" => ObfuscationConfig::flatten_only(config.seed).flags,
                "standard" => ObfuscationConfig::standard(config.seed).flags,
                "maximum" => ObfuscationConfig::maximum(config.seed).flags,
                other => {
                    return Err(ObfuscateError::InvalidFlags(format!("unknown preset {other}")))
                }
            };
        }
        if let Some(flags) = &self.flags {
            config.flags = ObfuscationFlags::parse(flags)
                .map_err(|e| ObfuscateError::InvalidFlags(format!("{flags}: {e}")))?;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.log.is_some() {
            config.log_path = self.log.clone();
        }
        config.recurse |= self.recurse;
        Ok(config)
    }
}

impl super::Command for FlattenArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let mut proto = load_proto(input)?;
        let config = self.config()?;
        tracing::debug!("Flatten config: {:?}", config);

        let mut obfuscator = Obfuscator::new(config);
        let reports = obfuscator.obfuscate_tree(&mut proto)?;
        for report in &reports {
            tracing::info!(
                "{:?}: {} -> {} instructions, {} blocks",
                report.outcome,
                report.original_size,
                report.new_size,
                report.block_count
            );
        }
        if !obfuscator.registry().is_empty() {
            tracing::info!("{} VM tables produced", obfuscator.registry().len());
        }

        if let Some(path) = &self.report {
            fs::write(path, serde_json::to_string_pretty(&reports)?)?;
        }
        if let Some(path) = &self.metadata {
            match reports.first().and_then(|r| r.metadata.as_ref()) {
                Some(meta) => fs::write(path, meta.serialize()?)?,
                None => tracing::warn!("root function was not flattened; no metadata written"),
            }
        }

        let json = serde_json::to_string_pretty(&proto)?;
        match &self.output {
            Some(path) => fs::write(path, json)?,
            None => println!("{json}"),
        }
        Ok(())
    }
}
