//! Group aggregation tables.
//!
//! Two levels share one slot layout and hashing scheme:
//!
//! - [`AggTable`]: the shared open-addressing table mapping group key to
//!   `(sum, count)`. Slots are claimed by CAS on the key field; once a slot
//!   belongs to a group it belongs to it for the rest of the run, and all
//!   accumulation happens through atomic adds.
//! - [`LocalAggBuffer`]: a small thread-private table that coalesces
//!   repeated group keys during a probe scan before flushing them to the
//!   shared table as single deltas. Skewed workloads hit the same few
//!   groups millions of times per thread; buffering turns one CAS + two
//!   atomic adds per matched row into plain arithmetic, at the cost of a
//!   full drain whenever the buffer fills.
//!
//! Buffering is an optimization only: flushing through the buffer and
//! updating the shared table directly produce bit-identical results.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mix;

/// Key 0 marks an unclaimed slot in both tables.
const EMPTY: u32 = 0;

struct AggSlot {
    key: AtomicU32,
    sum: AtomicU64,
    count: AtomicU32,
}

pub struct AggTable {
    slots: Box<[AggSlot]>,
    mask: usize,
    shift: u32,
}

/// Headroom beyond the raw estimate before rounding up to a power of two.
/// The sketch may undershoot; a fuller table only costs longer probe
/// chains, but a *completely* full table would make the claim loop wrap,
/// so the extra quarter keeps that case out of reach of ordinary sketch
/// error. An actual overflow still aborts (see [`AggTable::update`]).
fn buckets_for(estimated_groups: usize) -> usize {
    let padded = estimated_groups + estimated_groups / 4;
    padded.next_power_of_two().max(1)
}

impl AggTable {
    pub fn with_capacity(estimated_groups: usize) -> Self {
        let buckets = buckets_for(estimated_groups);
        let slots: Box<[AggSlot]> = (0..buckets)
            .map(|_| AggSlot {
                key: AtomicU32::new(EMPTY),
                sum: AtomicU64::new(0),
                count: AtomicU32::new(0),
            })
            .collect();
        Self {
            slots,
            mask: buckets - 1,
            shift: 32 - buckets.trailing_zeros(),
        }
    }

    pub fn buckets(&self) -> usize {
        self.slots.len()
    }

    /// Top `log2(buckets)` bits of the mixed key. The widening cast keeps
    /// the shift legal for the 1-bucket table (shift of 32).
    #[inline(always)]
    fn home_slot(&self, key: u32) -> usize {
        ((mix(key) as u64) >> self.shift) as usize
    }

    /// Accumulate a delta for a group, claiming its slot first if needed.
    ///
    /// The claim loop is lock-free: a slot is ours once its key equals
    /// `key`, whether we installed it or lost the installing race to
    /// another thread updating the same group. Aborts if the probe
    /// sequence wraps the whole table, which can only happen when the true
    /// group count exceeds the allocated capacity.
    pub fn update(&self, key: u32, sum_delta: u64, count_delta: u32) {
        debug_assert_ne!(key, EMPTY, "group key 0 is reserved as the empty sentinel");
        let mut h = self.home_slot(key);
        let mut probes = 0;
        let slot = loop {
            let slot = &self.slots[h];
            let occupant = slot.key.load(Ordering::Acquire);
            if occupant == key {
                break slot;
            }
            if occupant == EMPTY {
                match slot
                    .key
                    .compare_exchange(EMPTY, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break slot,
                    // Lost the race, but the winner may have claimed the
                    // slot for this very group.
                    Err(winner) if winner == key => break slot,
                    Err(_) => {}
                }
            }
            h = (h + 1) & self.mask;
            probes += 1;
            assert!(
                probes < self.slots.len(),
                "aggregation table overflow: distinct groups exceed capacity {}",
                self.slots.len()
            );
        };
        // Relaxed adds: the pre-reduction barrier publishes the totals to
        // the scanning threads.
        slot.sum.fetch_add(sum_delta, Ordering::Relaxed);
        slot.count.fetch_add(count_delta, Ordering::Relaxed);
    }

    /// Fold a contiguous slot range into `(sum_of_averages, group_count)`
    /// using truncating per-group division. Only valid after all updates
    /// have been published by a barrier.
    pub fn fold_range(&self, range: Range<usize>) -> (u64, u32) {
        let mut sum_avgs = 0u64;
        let mut groups = 0u32;
        for slot in &self.slots[range] {
            if slot.key.load(Ordering::Relaxed) != EMPTY {
                let sum = slot.sum.load(Ordering::Relaxed);
                let count = slot.count.load(Ordering::Relaxed);
                sum_avgs += sum / count as u64;
                groups += 1;
            }
        }
        (sum_avgs, groups)
    }
}

pub const LOCAL_LOG_BUCKETS: u32 = 9;
const LOCAL_BUCKETS: usize = 1 << LOCAL_LOG_BUCKETS;

#[derive(Copy, Clone)]
struct LocalSlot {
    key: u32,
    sum: u64,
    count: u32,
}

const EMPTY_LOCAL_SLOT: LocalSlot = LocalSlot {
    key: EMPTY,
    sum: 0,
    count: 0,
};

/// Thread-private 512-slot open-addressing buffer. Plain fields, no
/// atomics: it is never shared.
pub struct LocalAggBuffer {
    slots: Box<[LocalSlot; LOCAL_BUCKETS]>,
    occupied: usize,
}

impl LocalAggBuffer {
    pub fn new() -> Self {
        Self {
            slots: Box::new([EMPTY_LOCAL_SLOT; LOCAL_BUCKETS]),
            occupied: 0,
        }
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Accumulate one matched row. Returns `true` when the buffer just
    /// became full: the caller must flush before the next call, which
    /// keeps an empty slot available and the probe loop finite.
    #[inline(always)]
    pub fn accumulate(&mut self, key: u32, product: u64) -> bool {
        debug_assert_ne!(key, EMPTY, "group key 0 is reserved as the empty sentinel");
        debug_assert!(self.occupied < LOCAL_BUCKETS, "accumulate into full buffer");
        let mut h = (mix(key) >> (32 - LOCAL_LOG_BUCKETS)) as usize;
        loop {
            let slot = &mut self.slots[h];
            if slot.key == key {
                slot.sum += product;
                slot.count += 1;
                return false;
            }
            if slot.key == EMPTY {
                *slot = LocalSlot {
                    key,
                    sum: product,
                    count: 1,
                };
                self.occupied += 1;
                return self.occupied == LOCAL_BUCKETS;
            }
            h = (h + 1) & (LOCAL_BUCKETS - 1);
        }
    }

    /// Drain every occupied slot into the shared table as one delta each
    /// and reset the buffer for reuse. Not incremental: the whole buffer
    /// empties in one pass.
    pub fn flush_into(&mut self, shared: &AggTable) {
        for slot in self.slots.iter_mut() {
            if slot.key != EMPTY {
                shared.update(slot.key, slot.sum, slot.count);
                *slot = EMPTY_LOCAL_SLOT;
            }
        }
        self.occupied = 0;
    }
}

impl Default for LocalAggBuffer {
    fn default() -> Self {
        Self::new()
    }
}
