//! Opcode remapping and per-instruction encryption.
//!
//! Every host instruction is re-packed into a [`VmInstruction`] whose opcode
//! byte comes from a seed-derived permutation, then encrypted with a 64-bit
//! key and its pc:
//!
//! ```text
//! enc(x, pc) = rotl(x ^ key, pc % 64) ^ (key ^ pc * 0x9E3779B97F4A7C15)
//! ```
//!
//! The resulting [`VmCodeTable`] is handed to the embedder; the function's own
//! code stays executable by the host interpreter.

use crate::util::Lcg;
use crate::ObfuscationFlags;
use indexmap::IndexMap;
use lunaris_core::opcode::{OpMode, Opcode};
use lunaris_core::{FunctionId, Instruction, Proto, NUM_OPCODES};
use lunaris_utils::cff_log;
use lunaris_utils::errors::TransformError;
use lunaris_utils::log::DebugLog;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Functions shorter than this are left alone.
pub const MIN_PROTECT_SIZE: usize = 4;
/// Salt applied to the seed when protection runs from the flattening pass.
pub const VM_SEED_SALT: u32 = 0xFEDC_BA98;
/// Salt keying the opcode permutation.
pub const OPCODE_MAP_SALT: u32 = 0xDEAD_BEEF;
/// Per-pc multiplier of the second key stream.
pub const PC_KEY_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// Flags bit holding the instruction's `k`.
pub const VM_FLAG_K: u8 = 1 << 0;
/// Shift of the 3-bit addressing-mode tag.
pub const VM_MODE_SHIFT: u8 = 1;
/// Set when an operand did not fit its 16-bit slot.
pub const VM_FLAG_TRUNCATED: u8 = 1 << 7;

/// Derives the encryption key: `r1 = lcg(seed)`, `r2 = lcg(r1)`, `r1 << 32 | r2`.
pub fn derive_key(seed: u32) -> u64 {
    let mut lcg = Lcg::new(seed);
    let hi = lcg.next_u32();
    let lo = lcg.next_u32();
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Encrypts one packed instruction at `pc`.
pub const fn encrypt(inst: u64, key: u64, pc: usize) -> u64 {
    let rotated = (inst ^ key).rotate_left((pc % 64) as u32);
    rotated ^ (key ^ (pc as u64).wrapping_mul(PC_KEY_MULTIPLIER))
}

/// Inverse of [`encrypt`].
pub const fn decrypt(cipher: u64, key: u64, pc: usize) -> u64 {
    let unmasked = cipher ^ (key ^ (pc as u64).wrapping_mul(PC_KEY_MULTIPLIER));
    unmasked.rotate_right((pc % 64) as u32) ^ key
}

/// Seed-derived bijection over the 8-bit custom opcode space.
///
/// Host opcode `i` maps to `forward[i]`; `forward[NUM_OPCODES]` is the halt
/// marker and the remaining slots are unused custom opcodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeMap {
    forward: Vec<u8>,
    reverse: Vec<u8>,
}

impl OpcodeMap {
    /// Builds the permutation for `seed`.
    pub fn new(seed: u32) -> Self {
        let mut forward: Vec<u8> = (0..=u8::MAX).collect();
        Lcg::new(seed ^ OPCODE_MAP_SALT).shuffle_from(&mut forward, 0);
        let mut reverse = vec![0u8; forward.len()];
        for (host, &custom) in forward.iter().enumerate() {
            reverse[usize::from(custom)] = host as u8;
        }
        Self { forward, reverse }
    }

    /// Custom opcode of a raw host opcode byte.
    pub fn map(&self, host: u8) -> u8 {
        self.forward[usize::from(host)]
    }

    /// Raw host opcode byte of a custom opcode.
    pub fn unmap(&self, custom: u8) -> u8 {
        self.reverse[usize::from(custom)]
    }

    /// Custom opcode marking the end of a table.
    pub fn halt(&self) -> u8 {
        self.forward[NUM_OPCODES]
    }
}

/// `op << 56 | a << 40 | b << 24 | c << 8 | flags`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmInstruction(u64);

impl VmInstruction {
    /// Packs the fields.
    pub const fn pack(op: u8, a: u16, b: u16, c: u16, flags: u8) -> Self {
        Self(
            ((op as u64) << 56)
                | ((a as u64) << 40)
                | ((b as u64) << 24)
                | ((c as u64) << 8)
                | flags as u64,
        )
    }

    /// Wraps a packed word.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The packed word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Custom opcode.
    pub const fn op(self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// First operand.
    pub const fn a(self) -> u16 {
        (self.0 >> 40) as u16
    }

    /// Second operand.
    pub const fn b(self) -> u16 {
        (self.0 >> 24) as u16
    }

    /// Third operand.
    pub const fn c(self) -> u16 {
        (self.0 >> 8) as u16
    }

    /// Flags byte.
    pub const fn flags(self) -> u8 {
        self.0 as u8
    }

    /// The `k` bit of the source instruction.
    pub const fn k(self) -> bool {
        self.flags() & VM_FLAG_K != 0
    }

    /// Addressing-mode tag of the source instruction.
    pub const fn mode_tag(self) -> u8 {
        (self.flags() >> VM_MODE_SHIFT) & 0b111
    }

    /// Whether an operand was cut to 16 bits.
    pub const fn is_truncated(self) -> bool {
        self.flags() & VM_FLAG_TRUNCATED != 0
    }

    /// Re-packs a host instruction under `map`.
    pub fn from_host(inst: Instruction, map: &OpcodeMap) -> Self {
        let op = map.map(inst.op_byte());
        let mode = inst.opcode().map_or(OpMode::Abc, Opcode::mode);
        let mut truncated = false;
        let mut unsigned = |v: u64| {
            truncated |= v > u64::from(u16::MAX);
            v as u16
        };
        let (a, b, c, k) = match mode {
            OpMode::Abc => (
                unsigned(inst.a().into()),
                unsigned(inst.b().into()),
                unsigned(inst.c().into()),
                inst.k(),
            ),
            OpMode::ABx => (unsigned(inst.a().into()), unsigned(inst.bx()), 0, false),
            OpMode::AsBx => {
                let a = unsigned(inst.a().into());
                (a, signed(inst.sbx(), &mut truncated), 0, false)
            }
            OpMode::Ax => (unsigned(inst.ax()), 0, 0, false),
            OpMode::SJ => (signed(inst.sj(), &mut truncated), 0, 0, false),
        };
        let mut flags = u8::from(k) | (mode.tag() << VM_MODE_SHIFT);
        if truncated {
            flags |= VM_FLAG_TRUNCATED;
        }
        Self::pack(op, a, b, c, flags)
    }
}

fn signed(value: i64, truncated: &mut bool) -> u16 {
    *truncated |= i16::try_from(value).is_err();
    value as i16 as u16
}

impl fmt::Debug for VmInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmInstruction({:#018x})", self.0)
    }
}

/// Encrypted custom-opcode image of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCodeTable {
    /// Function the table belongs to.
    pub function: FunctionId,
    /// Encrypted instructions, ending with the halt marker.
    pub code: Vec<u64>,
    /// Encryption key.
    pub key: u64,
    /// Seed the key and the map were derived from.
    pub seed: u32,
    /// Opcode permutation.
    pub map: OpcodeMap,
}

impl VmCodeTable {
    /// Custom opcode of the halt marker.
    pub fn halt_opcode(&self) -> u8 {
        self.map.halt()
    }

    /// Number of entries, halt marker included.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Decrypts the entry at `pc`.
    pub fn decrypt_at(&self, pc: usize) -> Option<VmInstruction> {
        self.code
            .get(pc)
            .map(|&cipher| VmInstruction::from_raw(decrypt(cipher, self.key, pc)))
    }

    /// Host opcode behind a decrypted entry; `None` for the halt marker and
    /// unused custom opcodes.
    pub fn host_opcode(&self, inst: VmInstruction) -> Option<Opcode> {
        Opcode::from_byte(self.map.unmap(inst.op()))
    }

    /// Listing of every decrypted entry.
    pub fn disassemble(&self) -> Vec<String> {
        (0..self.code.len())
            .filter_map(|pc| self.decrypt_at(pc).map(|inst| (pc, inst)))
            .map(|(pc, inst)| {
                let name = if inst.op() == self.halt_opcode() {
                    "HALT"
                } else {
                    self.host_opcode(inst).map_or("?", Opcode::name)
                };
                format!(
                    "{pc:04}  {:#04x} {name:<10} a={} b={} c={} flags={:#04x}",
                    inst.op(),
                    inst.a(),
                    inst.b(),
                    inst.c(),
                    inst.flags()
                )
            })
            .collect()
    }
}

/// Builds the encrypted table for `code` without touching any prototype.
pub fn protect_code(
    function: FunctionId,
    code: &[Instruction],
    seed: u32,
    log: &mut DebugLog,
) -> Result<VmCodeTable, TransformError> {
    let key = derive_key(seed);
    let map = OpcodeMap::new(seed);
    cff_log!(*log, "VM protect {}: key {:#018x}", function, key);

    let mut cipher = Vec::new();
    cipher.try_reserve_exact(code.len() + 1)?;
    for (pc, &inst) in code.iter().enumerate() {
        let packed = VmInstruction::from_host(inst, &map);
        let encrypted = encrypt(packed.raw(), key, pc);
        cff_log!(
            *log,
            "  [pc {}] {} -> vm op {:#04x}, encrypted {:#018x}",
            pc,
            inst,
            packed.op(),
            encrypted
        );
        trace!(pc, op = packed.op(), "encrypted {:#018x}", encrypted);
        cipher.push(encrypted);
    }
    let halt = VmInstruction::pack(map.halt(), 0, 0, 0, 0);
    cipher.push(encrypt(halt.raw(), key, code.len()));
    debug!("VM table for {}: {} entries", function, cipher.len());

    Ok(VmCodeTable {
        function,
        code: cipher,
        key,
        seed,
        map,
    })
}

/// Records protection in the prototype's extension fields.
pub fn stamp(proto: &mut Proto, key: u64) {
    proto.mode |= ObfuscationFlags::VM_PROTECT.bits();
    proto.data = (proto.data & 0xFFFF_FFFF_0000_0000) | (key & 0xFFFF_FFFF);
}

/// Protects `proto` in place.
///
/// Functions shorter than [`MIN_PROTECT_SIZE`] are left untouched and yield
/// `None`. The code array itself is not modified.
pub fn vm_protect(
    proto: &mut Proto,
    seed: u32,
    log: &mut DebugLog,
) -> Result<Option<VmCodeTable>, TransformError> {
    if proto.size_code() < MIN_PROTECT_SIZE {
        cff_log!(*log, "VM protect skipped: {} instructions", proto.size_code());
        return Ok(None);
    }
    let table = protect_code(proto.id, &proto.code, seed, log)?;
    stamp(proto, table.key);
    Ok(Some(table))
}

/// Tables of every protected function, keyed by function id.
#[derive(Debug, Clone, Default)]
pub struct VmCodeRegistry {
    tables: IndexMap<FunctionId, VmCodeTable>,
}

impl VmCodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `table`, returning the entry it replaced.
    pub fn register(&mut self, table: VmCodeTable) -> Option<VmCodeTable> {
        self.tables.insert(table.function, table)
    }

    /// Table of `function`.
    pub fn find(&self, function: FunctionId) -> Option<&VmCodeTable> {
        self.tables.get(&function)
    }

    /// Drops the table of `function`.
    pub fn remove(&mut self, function: FunctionId) -> Option<VmCodeTable> {
        self.tables.shift_remove(&function)
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table is registered.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &VmCodeTable> {
        self.tables.values()
    }

    /// Drops every table.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
