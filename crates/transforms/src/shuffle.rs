use crate::context::CffContext;
use crate::util::Lcg;
use crate::Transform;
use lunaris_core::cfg_ir::BlockSet;
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use lunaris_utils::log::DebugLog;
use tracing::debug;

/// Permutes which state id each block answers to.
///
/// Code order is untouched; only the labels compared by the dispatcher move.
/// Block 0 keeps its state so the initial state load still selects the entry
/// block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shuffle;

impl Transform for Shuffle {
    fn name(&self) -> &'static str {
        "Shuffle"
    }

    fn apply(&self, ctx: &mut CffContext<'_>) -> Result<bool, TransformError> {
        let before: Vec<usize> = ctx.blocks.blocks().iter().map(|b| b.state_id).collect();
        ctx.seed = shuffle_states(&mut ctx.blocks, ctx.seed, ctx.log);
        let changed = ctx
            .blocks
            .blocks()
            .iter()
            .zip(&before)
            .any(|(b, &old)| b.state_id != old);
        if !changed {
            debug!("Shuffle produced no change");
        }
        Ok(changed)
    }
}

/// Fisher–Yates over the state ids of blocks `[1, n)`, driven by an LCG seeded
/// with `seed`.
///
/// # Returns
/// The advanced generator state, which becomes the context seed for every
/// later stage.
pub fn shuffle_states(blocks: &mut BlockSet, seed: u32, log: &mut DebugLog) -> u32 {
    let n = blocks.len();
    if n <= 2 {
        debug!("Not enough blocks to shuffle ({})", n);
        return seed;
    }

    let mut ids: Vec<usize> = blocks.blocks().iter().map(|b| b.state_id).collect();
    let mut lcg = Lcg::new(seed);
    lcg.shuffle_from(&mut ids, 1);

    for (index, (block, id)) in blocks.blocks_mut().iter_mut().zip(ids).enumerate() {
        block.state_id = id;
        cff_log!(*log, "Shuffle: block {} -> state {}", index, id);
    }
    debug!("Shuffled {} block states", n - 1);
    lcg.state()
}
