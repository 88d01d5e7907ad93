//! Lock-free build-side hash table for the primary-key join.
//!
//! A flat open-addressing array of `{key, val}` slots shared by all worker
//! threads during the build phase. A slot is claimed by a single CAS on its
//! key from the empty sentinel; the value is stored afterwards with a plain
//! atomic write. Inner keys are unique by contract, so two threads can only
//! ever contend for the same slot *index* under hash collision, never for
//! the same key, and CAS-then-linear-probe resolves that without locks.
//!
//! No thread probes the table until every thread has finished building; the
//! orchestrator's post-build barrier publishes all key and value stores, so
//! probing needs no synchronization beyond the key load itself.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mix;

/// Key 0 marks an unclaimed slot; the data domain never contains it.
const EMPTY: u32 = 0;

struct Slot {
    key: AtomicU32,
    val: AtomicU32,
}

pub struct JoinTable {
    slots: Box<[Slot]>,
    mask: usize,
    shift: u32,
}

/// Power-of-two bucket count keeping the fill rate between 1/3 and 2/3,
/// minimum 2 buckets. Fixed once; the table is never resized.
fn buckets_for(inner_tuples: usize) -> (usize, u32) {
    let mut log_buckets = 1u32;
    let mut buckets = 2usize;
    while (buckets as f64) * 0.67 < inner_tuples as f64 {
        log_buckets += 1;
        buckets += buckets;
    }
    (buckets, log_buckets)
}

impl JoinTable {
    pub fn with_capacity(inner_tuples: usize) -> Self {
        let (buckets, log_buckets) = buckets_for(inner_tuples);
        let slots = (0..buckets)
            .map(|_| Slot {
                key: AtomicU32::new(EMPTY),
                val: AtomicU32::new(0),
            })
            .collect();
        Self {
            slots,
            mask: buckets - 1,
            shift: 32 - log_buckets,
        }
    }

    pub fn buckets(&self) -> usize {
        self.slots.len()
    }

    /// Home slot: the top `log2(buckets)` bits of the mixed key.
    #[inline(always)]
    fn home_slot(&self, key: u32) -> usize {
        (mix(key) >> self.shift) as usize
    }

    /// Insert one inner row. Safe to call from any number of threads as
    /// long as all inserted keys are distinct.
    pub fn insert(&self, key: u32, val: u32) {
        debug_assert_ne!(key, EMPTY, "key 0 is reserved as the empty sentinel");
        let mut h = self.home_slot(key);
        loop {
            let slot = &self.slots[h];
            if slot.key.load(Ordering::Relaxed) == EMPTY
                && slot
                    .key
                    .compare_exchange(EMPTY, key, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                // Plain store: probers only run after the build barrier,
                // which publishes this write.
                slot.val.store(val, Ordering::Relaxed);
                return;
            }
            // Slot taken by another key under hash collision.
            h = (h + 1) & self.mask;
        }
    }

    /// Probe for an inner row. Linear-probes from the home slot until the
    /// key matches or an empty slot proves absence; the load factor bound
    /// guarantees an empty slot exists, so the scan always terminates.
    #[inline(always)]
    pub fn lookup(&self, key: u32) -> Option<u32> {
        let mut h = self.home_slot(key);
        loop {
            let slot = &self.slots[h];
            let occupant = slot.key.load(Ordering::Acquire);
            if occupant == EMPTY {
                return None;
            }
            if occupant == key {
                return Some(slot.val.load(Ordering::Relaxed));
            }
            h = (h + 1) & self.mask;
        }
    }
}
