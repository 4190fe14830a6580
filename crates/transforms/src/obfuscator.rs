use crate::context::{CffContext, FlattenLayout};
use crate::dispatcher::{FlatDispatcher, NestedDispatcher};
use crate::metadata::{CffMetadata, METADATA_MAGIC};
use crate::shuffle::Shuffle;
use crate::vm_protect::{self, VmCodeRegistry, VmCodeTable, VM_SEED_SALT};
use crate::{ObfuscationFlags, Transform};
use lunaris_core::cfg_ir::identify_blocks;
use lunaris_core::{Opcode, Proto};
use lunaris_utils::cff_log;
use lunaris_utils::errors::{ObfuscateError, TransformError};
use lunaris_utils::log::DebugLog;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Value stamped into `Proto::magic` by a successful flattening.
pub const CFF_MAGIC: u32 = METADATA_MAGIC;
/// Functions shorter than this are not flattened.
pub const MIN_FLATTEN_SIZE: usize = 4;
/// Functions with fewer blocks than this are not flattened.
pub const MIN_BLOCKS: usize = 2;
/// Per-child seed stride used by [`Obfuscator::obfuscate_tree`].
pub const CHILD_SEED_STRIDE: u32 = 0x9E37_79B9;

/// Why a function was left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Fewer than [`MIN_FLATTEN_SIZE`] instructions.
    TooShort {
        /// Instruction count.
        size: usize,
    },
    /// The function contains a numeric or generic `for` loop.
    LoopOpcode {
        /// First loop opcode found.
        opcode: Opcode,
        /// Its pc.
        pc: usize,
    },
    /// Fewer than [`MIN_BLOCKS`] basic blocks.
    TooFewBlocks {
        /// Block count.
        blocks: usize,
    },
}

/// What [`flatten`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlattenOutcome {
    /// The code was replaced by a flattened version.
    Flattened,
    /// Only VM protection ran.
    ProtectedOnly,
    /// Nothing was requested that applies.
    Untouched,
    /// Flattening was requested but a skip condition held; nothing changed.
    Skipped(SkipReason),
}

/// Summary of one [`flatten`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenReport {
    /// What happened.
    pub outcome: FlattenOutcome,
    /// Instruction count before.
    pub original_size: usize,
    /// Instruction count after.
    pub new_size: usize,
    /// Number of real blocks.
    pub block_count: usize,
    /// Number of decoy blocks emitted.
    pub bogus_count: usize,
    /// Number of decoy functions emitted.
    pub fake_function_count: usize,
    /// Stack size after the call.
    pub max_stack_size: u8,
    /// Transforms recorded in the prototype's `mode` field by this call.
    pub applied: ObfuscationFlags,
    /// Placement of generated code.
    pub layout: Option<FlattenLayout>,
    /// Block table and keys.
    pub metadata: Option<CffMetadata>,
    /// Encrypted VM image, when protection ran.
    #[serde(skip)]
    pub vm_code: Option<VmCodeTable>,
}

impl FlattenReport {
    fn unchanged(proto: &Proto, outcome: FlattenOutcome) -> Self {
        Self {
            outcome,
            original_size: proto.size_code(),
            new_size: proto.size_code(),
            block_count: 0,
            bogus_count: 0,
            fake_function_count: 0,
            max_stack_size: proto.max_stack_size,
            applied: ObfuscationFlags::empty(),
            layout: None,
            metadata: None,
            vm_code: None,
        }
    }

    /// Whether the prototype was modified.
    pub const fn changed(&self) -> bool {
        matches!(
            self.outcome,
            FlattenOutcome::Flattened | FlattenOutcome::ProtectedOnly
        )
    }
}

/// What a flattened prototype's extension fields say about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenStamp {
    /// Applied transforms.
    pub flags: ObfuscationFlags,
    /// Real block count.
    pub num_blocks: u32,
    /// Effective seed, or the low key bits when VM protection ran afterwards.
    pub low_word: u32,
}

impl FlattenStamp {
    /// Reads the stamp; `None` unless the prototype carries [`CFF_MAGIC`].
    pub fn read(proto: &Proto) -> Option<Self> {
        (proto.magic == CFF_MAGIC).then(|| Self {
            flags: ObfuscationFlags::from_bits_truncate(proto.mode),
            num_blocks: (proto.data >> 32) as u32,
            low_word: proto.data as u32,
        })
    }

    /// Removes the flattening stamp: clears [`CFF_MAGIC`] and the CFF-family
    /// mode bits. The code itself is not restored. A `VM_PROTECT` bit and the
    /// `data` word are kept. Returns whether a stamp was present.
    pub fn clear(proto: &mut Proto) -> bool {
        if proto.magic != CFF_MAGIC {
            return false;
        }
        proto.mode &= !ObfuscationFlags::CFF_FAMILY.bits();
        proto.magic = 0;
        true
    }
}

fn find_skip(proto: &Proto) -> Option<SkipReason> {
    if proto.size_code() < MIN_FLATTEN_SIZE {
        return Some(SkipReason::TooShort {
            size: proto.size_code(),
        });
    }
    proto.code.iter().enumerate().find_map(|(pc, inst)| {
        inst.opcode()
            .ok()
            .filter(|op| op.is_loop())
            .map(|opcode| SkipReason::LoopOpcode { opcode, pc })
    })
}

/// Pipeline stages, each paired with the flag it is reported under.
fn build_pipeline(flags: ObfuscationFlags) -> Vec<(ObfuscationFlags, Box<dyn Transform>)> {
    let mut pipeline: Vec<(ObfuscationFlags, Box<dyn Transform>)> = Vec::new();
    if flags.contains(ObfuscationFlags::BLOCK_SHUFFLE) {
        pipeline.push((ObfuscationFlags::BLOCK_SHUFFLE, Box::new(Shuffle)));
    }
    if flags.contains(ObfuscationFlags::NESTED_DISPATCHER) {
        pipeline.push((ObfuscationFlags::NESTED_DISPATCHER, Box::new(NestedDispatcher)));
    } else {
        pipeline.push((ObfuscationFlags::CFF, Box::new(FlatDispatcher)));
    }
    pipeline
}

/// Flattens `proto` in place according to `flags`.
///
/// Skip conditions (short functions, loop opcodes, fewer than two blocks) are
/// reported through [`FlattenOutcome::Skipped`] and leave the prototype
/// untouched, including its extension fields. On error the prototype is
/// untouched as well: the new code is spliced in only after generation,
/// PatchBack and the optional VM table have all succeeded.
pub fn flatten(
    proto: &mut Proto,
    flags: ObfuscationFlags,
    seed: u32,
    log: &mut DebugLog,
) -> Result<FlattenReport, TransformError> {
    cff_log!(
        *log,
        "Flatten {}: {} instructions, max stack {}, flags {:?}, seed {:#x}",
        proto.id,
        proto.size_code(),
        proto.max_stack_size,
        flags,
        seed
    );

    if !flags.contains(ObfuscationFlags::CFF) {
        if !flags.contains(ObfuscationFlags::VM_PROTECT) {
            return Ok(FlattenReport::unchanged(proto, FlattenOutcome::Untouched));
        }
        let table = vm_protect::vm_protect(proto, seed ^ VM_SEED_SALT, log)?;
        let outcome = if table.is_some() {
            FlattenOutcome::ProtectedOnly
        } else {
            FlattenOutcome::Untouched
        };
        let mut report = FlattenReport::unchanged(proto, outcome);
        if table.is_some() {
            report.applied = ObfuscationFlags::VM_PROTECT;
        }
        report.vm_code = table;
        return Ok(report);
    }

    if let Some(reason) = find_skip(proto) {
        debug!("Skipping {}: {:?}", proto.id, reason);
        cff_log!(*log, "Skip: {:?}", reason);
        return Ok(FlattenReport::unchanged(
            proto,
            FlattenOutcome::Skipped(reason),
        ));
    }

    let blocks = identify_blocks(&proto.code, log)?;
    if blocks.len() < MIN_BLOCKS {
        let reason = SkipReason::TooFewBlocks {
            blocks: blocks.len(),
        };
        cff_log!(*log, "Skip: {:?}", reason);
        return Ok(FlattenReport::unchanged(
            proto,
            FlattenOutcome::Skipped(reason),
        ));
    }
    let block_count = blocks.len();

    let mut applied = (flags & ObfuscationFlags::CFF_FAMILY) | ObfuscationFlags::CFF;
    let generated = {
        let mut ctx = CffContext::new(proto, blocks, flags, seed, log)?;
        for (flag, transform) in build_pipeline(flags) {
            let changed = transform.apply(&mut ctx)?;
            debug!("{} applied, changed = {}", transform.name(), changed);
            if !changed {
                // the dispatcher itself always counts as applied
                applied.remove(flag - ObfuscationFlags::CFF);
            }
        }
        ctx.finish()?
    };

    let vm_code = if flags.contains(ObfuscationFlags::VM_PROTECT)
        && generated.code.len() >= vm_protect::MIN_PROTECT_SIZE
    {
        Some(vm_protect::protect_code(
            proto.id,
            &generated.code,
            seed ^ VM_SEED_SALT,
            log,
        )?)
    } else {
        None
    };

    let original_size = proto.size_code();
    let effective_seed = generated.metadata.seed;
    proto.code = generated.code;
    proto.max_stack_size = proto.max_stack_size.max(generated.max_stack_size);
    proto.mode |= applied.bits();
    proto.magic = CFF_MAGIC;
    proto.data = ((block_count as u64) << 32) | u64::from(effective_seed);
    if let Some(table) = &vm_code {
        vm_protect::stamp(proto, table.key);
        applied |= ObfuscationFlags::VM_PROTECT;
    }

    cff_log!(
        *log,
        "Flattened {}: {} -> {} instructions, {} blocks",
        proto.id,
        original_size,
        proto.size_code(),
        block_count
    );
    log.flush();

    Ok(FlattenReport {
        outcome: FlattenOutcome::Flattened,
        original_size,
        new_size: proto.size_code(),
        block_count,
        bogus_count: generated.layout.bogus_pcs.len(),
        fake_function_count: generated.layout.fake_function_pcs.len(),
        max_stack_size: proto.max_stack_size,
        applied,
        layout: Some(generated.layout),
        metadata: Some(generated.metadata),
        vm_code,
    })
}

/// Settings of an [`Obfuscator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    /// Transforms to apply.
    pub flags: ObfuscationFlags,
    /// Seed for every randomised choice.
    pub seed: u32,
    /// Debug log destination; logging is off when absent.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Whether [`Obfuscator::obfuscate_tree`] descends into nested functions.
    #[serde(default = "default_recurse")]
    pub recurse: bool,
}

const fn default_recurse() -> bool {
    true
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            flags: ObfuscationFlags::CFF,
            seed: 0x5EED,
            log_path: None,
            recurse: true,
        }
    }
}

impl ObfuscationConfig {
    /// Plain flattening.
    pub fn flatten_only(seed: u32) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Flattening with shuffled and encoded states, bogus blocks and opaque
    /// guards.
    pub fn standard(seed: u32) -> Self {
        Self {
            flags: ObfuscationFlags::CFF
                | ObfuscationFlags::BLOCK_SHUFFLE
                | ObfuscationFlags::BOGUS_BLOCKS
                | ObfuscationFlags::STATE_ENCODE
                | ObfuscationFlags::OPAQUE_PREDICATES,
            seed,
            ..Self::default()
        }
    }

    /// Every transform.
    pub fn maximum(seed: u32) -> Self {
        Self {
            flags: ObfuscationFlags::all(),
            seed,
            ..Self::default()
        }
    }
}

/// Applies a configuration to prototypes and collects their VM tables.
#[derive(Debug, Default)]
pub struct Obfuscator {
    config: ObfuscationConfig,
    registry: VmCodeRegistry,
}

impl Obfuscator {
    /// Obfuscator with an empty registry.
    pub fn new(config: ObfuscationConfig) -> Self {
        Self {
            config,
            registry: VmCodeRegistry::new(),
        }
    }

    /// The configuration.
    pub const fn config(&self) -> &ObfuscationConfig {
        &self.config
    }

    /// Tables produced so far.
    pub const fn registry(&self) -> &VmCodeRegistry {
        &self.registry
    }

    /// Mutable access to the registry, e.g. to drop tables of freed functions.
    pub fn registry_mut(&mut self) -> &mut VmCodeRegistry {
        &mut self.registry
    }

    fn open_log(&self) -> Result<DebugLog, ObfuscateError> {
        Ok(DebugLog::from_optional_path(self.config.log_path.as_deref())?)
    }

    /// Obfuscates one prototype, ignoring its children.
    pub fn obfuscate(&mut self, proto: &mut Proto) -> Result<FlattenReport, ObfuscateError> {
        let mut log = self.open_log()?;
        self.run(proto, self.config.seed, &mut log)
    }

    /// Obfuscates `proto` and, when configured, every nested prototype,
    /// depth-first. Child `i` of a function with seed `s` uses
    /// `s + i * CHILD_SEED_STRIDE`.
    pub fn obfuscate_tree(&mut self, proto: &mut Proto) -> Result<Vec<FlattenReport>, ObfuscateError> {
        let mut log = self.open_log()?;
        let mut reports = Vec::new();
        self.visit(proto, self.config.seed, &mut log, &mut reports)?;
        Ok(reports)
    }

    fn visit(
        &mut self,
        proto: &mut Proto,
        seed: u32,
        log: &mut DebugLog,
        reports: &mut Vec<FlattenReport>,
    ) -> Result<(), ObfuscateError> {
        reports.push(self.run(proto, seed, log)?);
        if self.config.recurse {
            for (index, child) in proto.protos.iter_mut().enumerate() {
                let child_seed = seed.wrapping_add((index as u32).wrapping_mul(CHILD_SEED_STRIDE));
                self.visit(child, child_seed, log, reports)?;
            }
        }
        Ok(())
    }

    fn run(
        &mut self,
        proto: &mut Proto,
        seed: u32,
        log: &mut DebugLog,
    ) -> Result<FlattenReport, ObfuscateError> {
        let report = flatten(proto, self.config.flags, seed, log)?;
        if let Some(table) = &report.vm_code {
            if self.registry.register(table.clone()).is_some() {
                debug!("Replaced VM table of {}", proto.id);
            }
        }
        Ok(report)
    }
}
