//! Policy constants (component L — ambient configuration).
//!
//! Grouped the way `near-store::StoreConfig` groups its RocksDB tuning
//! knobs, rather than as process-wide `#define`s like qp.c's
//! `QP_CHUNK_SIZE`/`QP_MIN_USED`/`QP_MAX_FREE`/`GROWTH_FACTOR`.

/// Tunable policy for chunk sizing and garbage-collection thresholds.
#[derive(Clone, Copy, Debug)]
pub struct TrieConfig {
    /// Cells per chunk. Must be a power of two.
    pub chunk_size: u32,
    /// A chunk with fewer live cells than this is considered fragmented
    /// and is a candidate for evacuation during compaction.
    pub min_used: u32,
    /// The bump chunk is abandoned (a fresh one started) once its free
    /// count exceeds this.
    pub max_free: u32,
    /// Geometric growth factor applied to the chunk table when it fills.
    pub growth_factor: f32,
    /// Enable `mprotect`-based read-only hardening of immutable chunks.
    /// Requires the `write-protect` crate feature; otherwise ignored.
    pub write_protect: bool,
}

impl Default for TrieConfig {
    fn default() -> Self {
        TrieConfig {
            chunk_size: 1 << 16,
            min_used: 1 << 16 >> 2,
            max_free: 1 << 16 >> 3,
            growth_factor: 2.0,
            write_protect: false,
        }
    }
}

impl TrieConfig {
    /// Auto-GC trips when accumulated garbage exceeds held-back garbage
    /// plus half of all live cells (`qp.c`'s `QP_AUTOGC`).
    #[inline]
    pub(crate) fn needs_gc(&self, used: u64, free: u64, hold: u64) -> bool {
        free > hold + used / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_power_of_two() {
        assert!(TrieConfig::default().chunk_size.is_power_of_two());
    }
}
