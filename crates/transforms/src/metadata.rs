//! Persistable description of a completed flattening.
//!
//! Binary layout, all fields little-endian:
//!
//! ```text
//! magic u32 | version i32 | num_blocks i32 | state_reg i32 | seed u32
//! num_blocks x { start_pc end_pc state_id original_target fall_through
//!                cond_target is_entry is_exit }   (8 x i32, absent = -1)
//! ```

use crate::dispatcher::INNER_STATE_SALT;
use crate::state::StateEncoder;
use crate::ObfuscationFlags;
use lunaris_core::cfg_ir::{BasicBlock, BlockSet};
use lunaris_utils::errors::MetadataError;
use serde::{Deserialize, Serialize};

/// `"CFF\0"` read as a big-endian word.
pub const METADATA_MAGIC: u32 = 0x4346_4600;
/// Current binary format version.
pub const METADATA_VERSION: i32 = 1;
/// Header size in bytes.
pub const HEADER_LEN: usize = 20;
/// Size of one block record in bytes.
pub const BLOCK_RECORD_LEN: usize = 8 * 4;

/// Block table and keys of one flattened function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CffMetadata {
    /// Number of real blocks.
    pub num_blocks: usize,
    /// Register holding the dispatch state.
    pub state_reg: u32,
    /// Seed the state codes were keyed with.
    pub seed: u32,
    /// Blocks in original pc order, with their final state ids.
    pub blocks: Vec<BasicBlock>,
}

impl CffMetadata {
    /// Projects a block partition.
    pub fn from_blocks(blocks: &BlockSet, state_reg: u32, seed: u32) -> Self {
        Self {
            num_blocks: blocks.len(),
            state_reg,
            seed,
            blocks: blocks.blocks().to_vec(),
        }
    }

    /// Start pc of every block in the original function.
    pub fn block_mapping(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.start_pc).collect()
    }

    /// Recovers the state id behind a dispatcher constant.
    ///
    /// The encoder has no closed-form inverse here; the forward codes of every
    /// recorded block are computed and searched instead. `flags` must be the
    /// flags the function was flattened with. Returns `None` for codes that
    /// belong to no real block (decoys included).
    pub fn decode_state(&self, code: i64, flags: ObfuscationFlags) -> Option<usize> {
        let seed = if flags.contains(ObfuscationFlags::NESTED_DISPATCHER) {
            self.seed ^ INNER_STATE_SALT
        } else {
            self.seed
        };
        let encoder = StateEncoder::new(seed, flags.contains(ObfuscationFlags::STATE_ENCODE));
        self.blocks
            .iter()
            .map(|b| b.state_id)
            .find(|&state| encoder.encode(state) == code)
    }

    /// Binary encoding.
    ///
    /// # Errors
    /// [`MetadataError::FieldOverflow`] when a count, pc or state id does not
    /// fit its `i32` field.
    pub fn serialize(&self) -> Result<Vec<u8>, MetadataError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.blocks.len() * BLOCK_RECORD_LEN);
        out.extend_from_slice(&METADATA_MAGIC.to_le_bytes());
        out.extend_from_slice(&METADATA_VERSION.to_le_bytes());
        out.extend_from_slice(&to_i32("num_blocks", self.blocks.len())?.to_le_bytes());
        out.extend_from_slice(&to_i32("state_reg", self.state_reg as usize)?.to_le_bytes());
        out.extend_from_slice(&self.seed.to_le_bytes());

        let opt = |field, v: Option<usize>| v.map_or(Ok(-1), |v| to_i32(field, v));
        for block in &self.blocks {
            let record = [
                to_i32("start_pc", block.start_pc)?,
                to_i32("end_pc", block.end_pc)?,
                to_i32("state_id", block.state_id)?,
                opt("original_target", block.original_target)?,
                opt("fall_through", block.fall_through)?,
                opt("cond_target", block.cond_target)?,
                i32::from(block.is_entry),
                i32::from(block.is_exit),
            ];
            for field in record {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        Ok(out)
    }

    /// Parses and validates the binary encoding.
    ///
    /// The header and the total length are checked before the block table is
    /// allocated.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() < HEADER_LEN {
            return Err(MetadataError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let word = |i: usize| -> [u8; 4] {
            let at = i * 4;
            [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
        };

        let magic = u32::from_le_bytes(word(0));
        if magic != METADATA_MAGIC {
            return Err(MetadataError::BadMagic(magic));
        }
        let version = i32::from_le_bytes(word(1));
        if version != METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }
        let count = i32::from_le_bytes(word(2));
        let num_blocks =
            usize::try_from(count).map_err(|_| MetadataError::NegativeBlockCount(count))?;
        let reg = i32::from_le_bytes(word(3));
        let state_reg =
            u32::try_from(reg).map_err(|_| MetadataError::NegativeStateRegister(reg))?;
        let seed = u32::from_le_bytes(word(4));

        let expected = num_blocks
            .checked_mul(BLOCK_RECORD_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or(MetadataError::Truncated {
                expected: usize::MAX,
                actual: bytes.len(),
            })?;
        if bytes.len() < expected {
            return Err(MetadataError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let mut blocks = Vec::with_capacity(num_blocks);
        for index in 0..num_blocks {
            let base = HEADER_LEN / 4 + index * 8;
            let field = |i: usize| i32::from_le_bytes(word(base + i));
            blocks.push(parse_block(index, num_blocks, field)?);
        }

        Ok(Self {
            num_blocks,
            state_reg,
            seed,
            blocks,
        })
    }
}

fn to_i32(field: &'static str, value: usize) -> Result<i32, MetadataError> {
    i32::try_from(value).map_err(|_| MetadataError::FieldOverflow { field, value })
}

fn parse_block(
    index: usize,
    num_blocks: usize,
    field: impl Fn(usize) -> i32,
) -> Result<BasicBlock, MetadataError> {
    let invalid = |reason| MetadataError::InvalidBlock { index, reason };
    let pc = |v: i32| usize::try_from(v).map_err(|_| invalid("negative pc"));
    let successor = |v: i32| -> Result<Option<usize>, MetadataError> {
        match v {
            -1 => Ok(None),
            v if v >= 0 && (v as usize) < num_blocks => Ok(Some(v as usize)),
            _ => Err(invalid("successor out of range")),
        }
    };
    let flag = |v: i32| match v {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(invalid("flag is not 0 or 1")),
    };

    let start_pc = pc(field(0))?;
    let end_pc = pc(field(1))?;
    if end_pc <= start_pc {
        return Err(invalid("empty pc range"));
    }
    let state_id = usize::try_from(field(2)).map_err(|_| invalid("negative state id"))?;

    Ok(BasicBlock {
        start_pc,
        end_pc,
        state_id,
        original_target: successor(field(3))?,
        fall_through: successor(field(4))?,
        cond_target: successor(field(5))?,
        is_entry: flag(field(6))?,
        is_exit: flag(field(7))?,
    })
}
