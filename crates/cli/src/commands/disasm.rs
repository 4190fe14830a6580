use super::load_proto;
use clap::Args;
use lunaris_transform::obfuscator::FlattenStamp;
use std::error::Error;

/// Arguments for the `disasm` subcommand.
#[derive(Args, Debug)]
pub struct DisasmArgs {
    /// Also list nested functions
    #[arg(long)]
    tree: bool,
}

impl super::Command for DisasmArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let proto = load_proto(input)?;
        let mut stack = vec![&proto];
        while let Some(func) = stack.pop() {
            println!(
                "; {} ({} instructions, stack {})",
                func.id,
                func.size_code(),
                func.max_stack_size
            );
            if let Some(stamp) = FlattenStamp::read(func) {
                println!(
                    "; flattened: {:?}, {} blocks, low word {:#010x}",
                    stamp.flags, stamp.num_blocks, stamp.low_word
                );
            }
            for (pc, inst) in func.code.iter().enumerate() {
                println!("{pc:5}  {inst}");
            }
            if self.tree {
                stack.extend(func.protos.iter().rev());
            }
        }
        Ok(())
    }
}
