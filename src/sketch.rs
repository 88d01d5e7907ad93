//! Streaming distinct-count sketch used to size the aggregation table.
//!
//! Probabilistic counting in the Flajolet-Martin lineage: each hashed key is
//! split into a partition index (low 12 bits) and a residual; the partition's
//! bitmap records the position of the residual's lowest set bit. A partition
//! whose lowest *zero* bit sits at position `z` has seen roughly `2^z`
//! distinct keys, and summing that weight over all partitions (then dividing
//! by an empirical bias constant) estimates the distinct count of the whole
//! stream.
//!
//! The estimate only sizes the aggregation table; it never affects result
//! correctness. Merging is a bitwise OR, so the sketch is insensitive to
//! both input order and thread interleaving.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::mix;

pub const LOG_PARTITIONS: u32 = 12;
pub const PARTITIONS: usize = 1 << LOG_PARTITIONS;

/// Empirical bias correction for the lowest-zero-bit estimator.
const BIAS_CORRECTION: f64 = 0.77351;

/// Thread-private sketch accumulated over one contiguous key range.
pub struct LocalSketch {
    bitmaps: Box<[u32]>,
}

impl LocalSketch {
    pub fn new() -> Self {
        Self {
            bitmaps: vec![0u32; PARTITIONS].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn observe(&mut self, key: u32) {
        let h = mix(key);
        let p = (h as usize) & (PARTITIONS - 1);
        let r = h >> LOG_PARTITIONS;
        self.bitmaps[p] |= r & r.wrapping_neg();
    }

    /// OR this sketch into the shared one. Idempotent and commutative, so
    /// any interleaving of merges yields the same shared state.
    pub fn merge_into(&self, shared: &SharedSketch) {
        for (local, global) in self.bitmaps.iter().zip(shared.bitmaps.iter()) {
            if *local != 0 {
                // Relaxed suffices: the estimate phase barrier publishes
                // the merged bitmaps before any thread reads them.
                global.fetch_or(*local, Ordering::Relaxed);
            }
        }
    }

    /// Summed partition weights of this sketch alone.
    pub fn weight(&self) -> u64 {
        self.bitmaps.iter().map(|&b| partition_weight(b)).sum()
    }
}

impl Default for LocalSketch {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge target shared by all estimator threads.
pub struct SharedSketch {
    bitmaps: Box<[AtomicU32]>,
}

impl SharedSketch {
    pub fn new() -> Self {
        Self {
            bitmaps: (0..PARTITIONS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Summed weights over a contiguous partition range. Each thread scans
    /// its own range after the merge barrier.
    pub fn weight_of_range(&self, range: Range<usize>) -> u64 {
        self.bitmaps[range]
            .iter()
            .map(|b| partition_weight(b.load(Ordering::Relaxed)))
            .sum()
    }
}

impl Default for SharedSketch {
    fn default() -> Self {
        Self::new()
    }
}

/// `2^z` where `z` is the position of the lowest zero bit. A saturated
/// bitmap has no zero bit; `trailing_zeros` of `!bitmap == 0` is 32, which
/// is the canonical weight in that case.
#[inline(always)]
fn partition_weight(bitmap: u32) -> u64 {
    1u64 << (!bitmap).trailing_zeros()
}

/// Convert summed partition weights into a distinct-count estimate of at
/// least 1, so downstream table sizing always gets a positive capacity.
pub fn estimated_groups(total_weight: u64) -> usize {
    ((total_weight as f64 / BIAS_CORRECTION) as usize).max(1)
}

/// Single-threaded estimator over a whole key column. The parallel driver
/// in [`crate::exec`] produces the same answer for any thread count; tests
/// use this path as the fixed point.
pub fn estimate_serial(keys: &[u32]) -> usize {
    let mut local = LocalSketch::new();
    for &key in keys {
        local.observe(key);
    }
    estimated_groups(local.weight())
}
