//! Engine configuration (§3 NEW, §9 "Unknown-opcode policy"): the knobs
//! the distilled spec left as hard-coded magic numbers or silent defaults.
//!
//! Grounded on the teacher's `serde`+`serde_json` dependency, used there
//! for `bch_sb_handle` option serialization; here for a small, loadable
//! `EngineConfig`.

use serde::{Deserialize, Serialize};

use crate::log::ReplayPolicy;

/// Process-wide knobs for one engine instance. Constructed once at
/// startup and threaded through [`crate::sb::Superblock::open`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of resident buffers across every mapping (§4.B).
    pub pool_size: usize,
    /// `1 << block_bits` bytes per block, §3's 256 B–64 KiB range.
    pub block_bits: u32,
    /// `need_delta`'s one-in-N interval; the original hard-codes `% 10`
    /// (§4.H). Exposed here rather than baked in.
    pub need_delta_interval: u32,
    /// How `Log::replay` handles an opcode tag it doesn't recognize (§9).
    pub replay_policy: ReplayPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pool_size: 4096,
            block_bits: 12,
            need_delta_interval: 10,
            replay_policy: ReplayPolicy::Lenient,
        }
    }
}

impl EngineConfig {
    pub fn block_size(&self) -> usize {
        1usize << self.block_bits
    }

    /// Parses a config from JSON text, matching the teacher's
    /// `serde_json`-based option loading.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
