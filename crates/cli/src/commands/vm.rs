use super::load_proto;
use clap::Args;
use lunaris_core::Opcode;
use lunaris_transform::vm_protect::protect_code;
use lunaris_utils::log::DebugLog;
use std::error::Error;

/// Arguments for the `vm` subcommand.
#[derive(Args, Debug)]
pub struct VmArgs {
    /// Seed for the key and opcode map
    #[arg(long, default_value_t = 42)]
    seed: u32,

    /// Print the ciphertext words instead of the decrypted listing
    #[arg(long)]
    raw: bool,

    /// Skip the host-to-VM opcode map
    #[arg(long)]
    no_map: bool,
}

impl super::Command for VmArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let proto = load_proto(input)?;
        let table = protect_code(proto.id, &proto.code, self.seed, &mut DebugLog::disabled())?;
        println!(
            "; {}: {} entries, key {:#018x}, halt {:#04x}",
            table.function,
            table.len(),
            table.key,
            table.halt_opcode()
        );
        if !self.no_map {
            for op in (0..=u8::MAX).filter_map(Opcode::from_byte) {
                println!("; {:<10} {:#04x} -> {:#04x}", op.name(), op as u8, table.map.map(op as u8));
            }
        }
        if self.raw {
            for (pc, word) in table.code.iter().enumerate() {
                println!("{pc:04}  {word:#018x}");
            }
        } else {
            for line in table.disassemble() {
                println!("{line}");
            }
        }
        Ok(())
    }
}
