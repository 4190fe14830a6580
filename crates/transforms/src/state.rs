//! Keyed bijection disguising dispatch state ids.
//!
//! `encode(s) = (s * 7919 + seed mod 30000) mod 30000`. 7919 is coprime with
//! 30000, so for a fixed seed the map permutes `[0, 30000)`. Every code fits
//! the signed 16-bit immediate of `EQI`. There is no closed-form `decode`; the
//! inverse is materialised from a block table by
//! [`crate::metadata::CffMetadata::decode_state`].

/// Size of the state space.
pub const STATE_RANGE: usize = 30_000;
/// Multiplier of the bijection; coprime with [`STATE_RANGE`].
pub const STATE_MULTIPLIER: i64 = 7919;

/// Encodes `state` under `seed`.
pub fn encode_state(state: usize, seed: u32) -> i64 {
    let range = STATE_RANGE as i64;
    let scaled = (state as i64).rem_euclid(range) * STATE_MULTIPLIER % range;
    (scaled + i64::from(seed) % range).rem_euclid(range)
}

/// Encodes states with a fixed key, or passes them through when disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEncoder {
    seed: u32,
    enabled: bool,
}

impl StateEncoder {
    /// Encoder keyed by `seed`.
    pub const fn new(seed: u32, enabled: bool) -> Self {
        Self { seed, enabled }
    }

    /// Code compared against the state register for `state`.
    pub fn encode(&self, state: usize) -> i64 {
        if self.enabled {
            encode_state(state, self.seed)
        } else {
            state as i64
        }
    }
}
