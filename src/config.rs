//! Process-wide configuration knobs, read once at [`crate::JitEngine::new`] time.
//!
//! Loading these from a config file or CLI is an external concern (see spec §6); this crate
//! only defines the struct the embedder populates.

use std::ops::RangeInclusive;

/// Minimum `cache_size_kb` for the JIT to engage at all.
pub const MIN_CACHE_SIZE_KB: usize = 1024;

/// Configuration knobs for the JIT engine.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Size of the executable code cache, in KB. Below [`MIN_CACHE_SIZE_KB`] the JIT refuses
    /// to engage and [`crate::JitEngine::new`] returns an error.
    pub cache_size_kb: usize,
    /// Follow through unconditional constant-target jumps by inlining the target block.
    pub jit_inline: bool,
    /// Prefer lazy (checksum-recheck) invalidation over hard flush where both apply.
    pub jit_lazy_flush: bool,
    /// Opcode ranges (by the top 16 bits of the first instruction word) the compile driver must
    /// never translate, always falling back to the interpreter.
    pub jit_blacklist: Vec<RangeInclusive<u16>>,
    /// Emit a runtime disassembly trace of every compiled block via the `tracing` crate.
    pub jit_debug: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            cache_size_kb: 8192,
            jit_inline: true,
            jit_lazy_flush: true,
            jit_blacklist: Vec::new(),
            jit_debug: false,
        }
    }
}

impl JitConfig {
    /// Returns whether the given opcode word falls within a blacklisted range.
    pub fn is_blacklisted(&self, opcode: u16) -> bool {
        self.jit_blacklist.iter().any(|r| r.contains(&opcode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_matches_inclusive_range() {
        let cfg = JitConfig {
            jit_blacklist: vec![0xA000..=0xAFFF],
            ..Default::default()
        };

        assert!(cfg.is_blacklisted(0xA000));
        assert!(cfg.is_blacklisted(0xAFFF));
        assert!(!cfg.is_blacklisted(0x9FFF));
        assert!(!cfg.is_blacklisted(0xB000));
    }

    #[test]
    fn default_cache_size_clears_minimum() {
        assert!(JitConfig::default().cache_size_kb >= MIN_CACHE_SIZE_KB);
    }
}
