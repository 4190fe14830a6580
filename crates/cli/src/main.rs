/// Entry point for the lunaris CLI.
///
/// Parses command-line arguments, initializes logging and dispatches to the
/// subcommands for flattening, CFG export, disassembly, metadata inspection and
/// VM protection.
use clap::Parser;
use lunaris_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// Command-line interface for lunaris.
///
/// Input is a function prototype as JSON (`@path` or inline), or a list of
/// 16-digit hex instruction words.
#[derive(Parser)]
#[command(name = "lunaris")]
#[command(about = "Lunaris: control-flow flattening for register-VM bytecode")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Input prototype: `@file.json`, inline JSON, or hex instruction words
    input: String,

    /// Log at debug level unless `RUST_LOG` says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli.command.execute(&cli.input)
}
