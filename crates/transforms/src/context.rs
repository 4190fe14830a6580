//! Per-invocation state of the flattening pass.
//!
//! A [`CffContext`] owns everything generated for one function: the block
//! partition, the growing output buffer with its pending jump fixups, the
//! scratch register assignment and the flag/seed pair. It is consumed by
//! [`CffContext::finish`]; dropping it early discards all generated code, so a
//! failed pass never touches the prototype.

use crate::metadata::CffMetadata;
use crate::state::{StateEncoder, STATE_RANGE};
use crate::ObfuscationFlags;
use lunaris_core::cfg_ir::BlockSet;
use lunaris_core::opcode::Opcode;
use lunaris_core::{Instruction, Proto};
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use lunaris_utils::log::DebugLog;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Size of the host register file.
pub const MAX_REGISTERS: usize = 255;
/// Decoy blocks generated per real block.
pub const BOGUS_BLOCK_RATIO: usize = 2;
/// Number of decoy functions woven into the dispatcher.
pub const NUM_FAKE_FUNCTIONS: usize = 3;
/// Blocks per decoy function.
pub const FAKE_FUNCTION_BLOCKS: usize = 4;

/// Scratch registers placed directly above the function's own registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchRegisters {
    /// Dispatch state (inner state for the nested dispatcher).
    pub state: u32,
    /// Outer state of the nested dispatcher.
    pub outer: u32,
    /// First opaque-predicate operand.
    pub opaque1: u32,
    /// Second opaque-predicate operand.
    pub opaque2: u32,
    /// Function-id register for interleaved decoy functions.
    pub func_id: u32,
}

impl ScratchRegisters {
    /// Allocates scratch registers above `max_stack_size`.
    pub fn allocate(max_stack_size: u8) -> Self {
        let base = u32::from(max_stack_size);
        Self {
            state: base,
            outer: base + 1,
            opaque1: base + 2,
            opaque2: base + 3,
            func_id: base + 4,
        }
    }

    /// Stack size needed by code generated under `flags`.
    pub fn required_stack(&self, flags: ObfuscationFlags) -> usize {
        let mut top = self.state;
        if flags.contains(ObfuscationFlags::NESTED_DISPATCHER) {
            top = top.max(self.outer);
        }
        if flags.intersects(
            ObfuscationFlags::OPAQUE_PREDICATES
                | ObfuscationFlags::BOGUS_BLOCKS
                | ObfuscationFlags::FUNC_INTERLEAVE,
        ) {
            top = top.max(self.opaque2);
        }
        if flags.contains(ObfuscationFlags::FUNC_INTERLEAVE) {
            top = top.max(self.func_id);
        }
        top as usize + 1
    }
}

/// Symbolic jump destination, bound to a pc once its code is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Head of the (flat or outer) dispatch loop.
    Dispatcher,
    /// Real block by index.
    Block(usize),
    /// Decoy block by index.
    Bogus(usize),
    /// Decoy function by index.
    FakeFunction(usize),
    /// Inner dispatcher of a nested group.
    InnerDispatcher(usize),
}

/// Output instruction buffer with deferred jump patching.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<Instruction>,
    labels: HashMap<Label, usize>,
    fixups: Vec<(usize, Label)>,
}

impl CodeBuffer {
    /// Pc the next emitted instruction will get.
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Generated code so far.
    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    /// Appends one instruction, returning its pc.
    pub fn emit(&mut self, inst: Instruction) -> Result<usize, TransformError> {
        self.code.try_reserve(1)?;
        self.code.push(inst);
        Ok(self.code.len() - 1)
    }

    /// Binds `label` to the current pc.
    pub fn bind(&mut self, label: Label) -> usize {
        let pc = self.pc();
        self.labels.insert(label, pc);
        pc
    }

    /// Pc bound to `label`, if any.
    pub fn label_pc(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Emits a placeholder `JMP` to be patched once `label` is bound.
    pub fn emit_jump(&mut self, label: Label) -> Result<usize, TransformError> {
        let site = self.emit(Instruction::jmp(0)?)?;
        self.fixups.try_reserve(1)?;
        self.fixups.push((site, label));
        Ok(site)
    }

    /// Emits a `JMP` to an already known pc.
    pub fn emit_jump_to(&mut self, target: usize) -> Result<usize, TransformError> {
        let site = self.pc();
        self.emit(Instruction::jmp(jump_offset(site, target))?)
    }

    /// Rewrites the jump at `site` so it lands on `target`.
    pub fn patch_jump(&mut self, site: usize, target: usize) -> Result<(), TransformError> {
        let patched = self.code[site].with_sj(jump_offset(site, target))?;
        self.code[site] = patched;
        Ok(())
    }

    /// Patches every pending placeholder jump.
    pub fn resolve(&mut self, log: &mut DebugLog) -> Result<(), TransformError> {
        let fixups = std::mem::take(&mut self.fixups);
        for (site, label) in fixups {
            let target = self
                .label_pc(label)
                .ok_or_else(|| TransformError::UnresolvedJump {
                    site,
                    label: format!("{label:?}"),
                })?;
            self.patch_jump(site, target)?;
            trace!(site, target, "patched jump to {:?}", label);
            cff_log!(
                *log,
                "Patch JMP at pc {} -> {:?} (pc {}), sJ={}",
                site,
                label,
                target,
                jump_offset(site, target)
            );
        }
        Ok(())
    }

    /// The finished instruction stream.
    pub fn into_code(self) -> Vec<Instruction> {
        self.code
    }
}

/// `sJ` making a jump at `site` land on `target`.
pub const fn jump_offset(site: usize, target: usize) -> i64 {
    target as i64 - site as i64 - 1
}

/// Where generated code ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenLayout {
    /// Pc of the (flat or outer) dispatcher head.
    pub dispatcher_pc: usize,
    /// Emitted start pc of every real block.
    pub block_pcs: Vec<usize>,
    /// Emitted start pc of every bogus block.
    pub bogus_pcs: Vec<usize>,
    /// Emitted start pc of every decoy function.
    pub fake_function_pcs: Vec<usize>,
    /// Pcs of the nested inner dispatchers (empty for the flat variant).
    pub inner_dispatcher_pcs: Vec<usize>,
    /// First real block index of each nested group.
    pub group_starts: Vec<usize>,
}

/// Output of a completed generation.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    /// New instruction stream.
    pub code: Vec<Instruction>,
    /// Raised stack size.
    pub max_stack_size: u8,
    /// Serializable description of the transformation.
    pub metadata: CffMetadata,
    /// Placement of generated pieces.
    pub layout: FlattenLayout,
}

/// State of one flattening invocation.
#[derive(Debug)]
pub struct CffContext<'a> {
    pub(crate) code: &'a [Instruction],
    pub(crate) blocks: BlockSet,
    pub(crate) out: CodeBuffer,
    pub(crate) regs: ScratchRegisters,
    pub(crate) flags: ObfuscationFlags,
    pub(crate) seed: u32,
    pub(crate) prologue: usize,
    pub(crate) dispatcher_pc: usize,
    pub(crate) group_starts: Vec<usize>,
    pub(crate) num_bogus: usize,
    pub(crate) num_fake_functions: usize,
    pub(crate) log: &'a mut DebugLog,
}

impl<'a> CffContext<'a> {
    /// Sets up a context for `proto`, whose blocks have already been identified.
    ///
    /// # Errors
    /// [`TransformError::RegisterExhausted`] when the scratch registers would not
    /// fit the register file, [`TransformError::StateSpaceExhausted`] when the
    /// real, bogus and decoy states exceed the state range.
    pub fn new(
        proto: &'a Proto,
        blocks: BlockSet,
        flags: ObfuscationFlags,
        seed: u32,
        log: &'a mut DebugLog,
    ) -> Result<Self, TransformError> {
        let regs = ScratchRegisters::allocate(proto.max_stack_size);
        let needed = regs.required_stack(flags);
        if needed > MAX_REGISTERS {
            return Err(TransformError::RegisterExhausted {
                needed,
                limit: MAX_REGISTERS,
            });
        }

        let num_bogus = if flags.contains(ObfuscationFlags::BOGUS_BLOCKS) {
            BOGUS_BLOCK_RATIO * blocks.len()
        } else {
            0
        };
        let num_fake_functions = if flags.contains(ObfuscationFlags::FUNC_INTERLEAVE) {
            NUM_FAKE_FUNCTIONS
        } else {
            0
        };
        let states = blocks.len() + num_bogus + num_fake_functions * FAKE_FUNCTION_BLOCKS;
        if states > STATE_RANGE {
            return Err(TransformError::StateSpaceExhausted {
                states,
                range: STATE_RANGE,
            });
        }

        let prologue = usize::from(
            proto
                .code
                .first()
                .is_some_and(|i| i.opcode().ok() == Some(Opcode::VARARGPREP)),
        );

        Ok(Self {
            code: &proto.code,
            blocks,
            out: CodeBuffer::default(),
            regs,
            flags,
            seed,
            prologue,
            dispatcher_pc: 0,
            group_starts: Vec::new(),
            num_bogus,
            num_fake_functions,
            log,
        })
    }

    /// The block partition.
    pub const fn blocks(&self) -> &BlockSet {
        &self.blocks
    }

    /// Scratch register assignment.
    pub const fn registers(&self) -> ScratchRegisters {
        self.regs
    }

    /// Current seed (advanced by the shuffler).
    pub const fn seed(&self) -> u32 {
        self.seed
    }

    /// Requested flags.
    pub const fn flags(&self) -> ObfuscationFlags {
        self.flags
    }

    /// Number of decoy blocks to generate.
    pub const fn num_bogus(&self) -> usize {
        self.num_bogus
    }

    /// Number of decoy functions to generate.
    pub const fn num_fake_functions(&self) -> usize {
        self.num_fake_functions
    }

    /// Value compared against a state register for the raw state `raw`,
    /// keyed by the context seed xor `salt` when encoding is enabled.
    pub fn state_code(&self, raw: usize, salt: u32) -> i64 {
        self.encoder(salt).encode(raw)
    }

    /// Encoder keyed by the context seed xor `salt`.
    pub fn encoder(&self, salt: u32) -> StateEncoder {
        StateEncoder::new(
            self.seed ^ salt,
            self.flags.contains(ObfuscationFlags::STATE_ENCODE),
        )
    }

    /// Deterministic generator for decoy code, keyed by seed xor `salt`.
    pub fn rng(&self, salt: u32) -> StdRng {
        StdRng::seed_from_u64(u64::from(self.seed ^ salt))
    }

    /// Copies source instructions `[from, to)` into the output, skipping the
    /// hoisted prologue.
    pub(crate) fn copy_source(&mut self, from: usize, to: usize) -> Result<(), TransformError> {
        for pc in from.max(self.prologue)..to {
            let inst = self.code[pc];
            self.out.emit(inst)?;
        }
        Ok(())
    }

    /// Runs PatchBack and packages the result.
    pub fn finish(self) -> Result<GeneratedCode, TransformError> {
        let Self {
            mut out,
            blocks,
            regs,
            flags,
            seed,
            dispatcher_pc,
            group_starts,
            num_bogus,
            num_fake_functions,
            log,
            ..
        } = self;

        out.resolve(log)?;

        let pcs = |make: fn(usize) -> Label, count: usize| -> Vec<usize> {
            (0..count).filter_map(|i| out.label_pc(make(i))).collect()
        };
        let inner_groups = if flags.contains(ObfuscationFlags::NESTED_DISPATCHER) {
            group_starts.len() + num_bogus.div_ceil(crate::dispatcher::GROUP_SIZE)
        } else {
            0
        };
        let layout = FlattenLayout {
            dispatcher_pc,
            block_pcs: pcs(Label::Block, blocks.len()),
            bogus_pcs: pcs(Label::Bogus, num_bogus),
            fake_function_pcs: pcs(Label::FakeFunction, num_fake_functions),
            inner_dispatcher_pcs: pcs(Label::InnerDispatcher, inner_groups),
            group_starts,
        };

        let metadata = CffMetadata::from_blocks(&blocks, regs.state, seed);
        let max_stack_size = u8::try_from(regs.required_stack(flags)).map_err(|_| {
            TransformError::RegisterExhausted {
                needed: regs.required_stack(flags),
                limit: MAX_REGISTERS,
            }
        })?;

        cff_log!(
            *log,
            "Generated {} instructions, dispatcher at pc {}, max stack {}",
            out.pc(),
            dispatcher_pc,
            max_stack_size
        );

        Ok(GeneratedCode {
            code: out.into_code(),
            max_stack_size,
            metadata,
            layout,
        })
    }
}
