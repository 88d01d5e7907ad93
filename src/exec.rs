//! Pipeline orchestration: worker scheduling, phase barriers, and the
//! final reduction.
//!
//! One call to [`execute`] runs the whole plan:
//!
//! ```text
//! ESTIMATING -> BUILDING -> (barrier) -> PROBING/AGGREGATING -> (barrier)
//!            -> REDUCING -> DONE
//! ```
//!
//! Workers are plain scoped threads, all participating in every phase over
//! contiguous index ranges. The three synchronization points are the merge
//! barrier inside the estimate round and the two phase barriers of the join
//! round; scope joins transfer each worker's partial results back to the
//! orchestrator, so no shared field is ever written outside a
//! barrier-protected window. Barriers are constructed per invocation and
//! dropped with it, keeping the engine re-entrant.

use std::ops::Range;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use log::debug;

use crate::agg::{AggTable, LocalAggBuffer};
use crate::build::JoinTable;
use crate::sketch::{self, LocalSketch, SharedSketch};
use crate::{EngineError, InnerRelation, OuterRelation};

/// Contiguous index range for one thread; the last thread absorbs the
/// remainder.
fn chunk(total: usize, thread: usize, threads: usize) -> Range<usize> {
    let per = total / threads;
    let beg = per * thread;
    let end = if thread + 1 == threads {
        total
    } else {
        per * (thread + 1)
    };
    beg..end
}

/// Run the join + group-by plan and return the average of per-group
/// averages (truncating division at both levels).
///
/// Returns 0 when the join produces no groups at all. Panics only on
/// contract violations the lock-free tables cannot absorb (aggregation
/// table overflow, worker panic); every caller-side misuse is reported as
/// an [`EngineError`] before any thread starts.
pub fn execute(
    inner: InnerRelation<'_>,
    outer: OuterRelation<'_>,
    threads: usize,
) -> Result<u64, EngineError> {
    validate(&inner, &outer, threads)?;
    match outer.group_keys {
        Some(group_keys) => Ok(run_grouped(inner, outer, group_keys, threads)),
        None => Ok(run_ungrouped(inner, outer, threads)),
    }
}

fn validate(
    inner: &InnerRelation<'_>,
    outer: &OuterRelation<'_>,
    threads: usize,
) -> Result<(), EngineError> {
    if threads == 0 {
        return Err(EngineError::ZeroThreads);
    }
    // When concurrency discovery itself fails the ceiling check is skipped.
    if let Ok(max) = thread::available_parallelism()
        && threads > max.get()
    {
        return Err(EngineError::TooManyThreads {
            requested: threads,
            max: max.get(),
        });
    }
    if inner.keys.len() != inner.vals.len() {
        return Err(EngineError::ColumnLengthMismatch {
            relation: "inner",
            left: inner.keys.len(),
            right: inner.vals.len(),
        });
    }
    if outer.join_keys.len() != outer.vals.len() {
        return Err(EngineError::ColumnLengthMismatch {
            relation: "outer",
            left: outer.join_keys.len(),
            right: outer.vals.len(),
        });
    }
    if let Some(group_keys) = outer.group_keys
        && group_keys.len() != outer.join_keys.len()
    {
        return Err(EngineError::ColumnLengthMismatch {
            relation: "outer",
            left: outer.join_keys.len(),
            right: group_keys.len(),
        });
    }
    Ok(())
}

/// Parallel distinct-count estimate over the group-key column.
///
/// Each thread sketches a contiguous key range, ORs its bitmaps into the
/// shared sketch, waits at the merge barrier, then weighs a contiguous
/// partition range. The orchestrator sums the partial weights.
fn estimate_groups(keys: &[u32], threads: usize) -> usize {
    let shared = SharedSketch::new();
    let merged = Barrier::new(threads);

    let total_weight: u64 = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let shared = &shared;
                let merged = &merged;
                s.spawn(move || {
                    let mut local = LocalSketch::new();
                    for &key in &keys[chunk(keys.len(), t, threads)] {
                        local.observe(key);
                    }
                    local.merge_into(shared);
                    merged.wait();
                    shared.weight_of_range(chunk(sketch::PARTITIONS, t, threads))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("estimator worker panicked"))
            .sum()
    });

    sketch::estimated_groups(total_weight)
}

fn run_grouped(
    inner: InnerRelation<'_>,
    outer: OuterRelation<'_>,
    group_keys: &[u32],
    threads: usize,
) -> u64 {
    let started = Instant::now();
    let estimate = estimate_groups(group_keys, threads);
    debug!(
        "estimated {estimate} groups over {} outer rows in {:?}",
        outer.len(),
        started.elapsed()
    );

    let table = JoinTable::with_capacity(inner.len());
    let agg = AggTable::with_capacity(estimate);
    debug!(
        "join table: {} buckets, aggregation table: {} buckets",
        table.buckets(),
        agg.buckets()
    );

    let build_done = Barrier::new(threads);
    let probe_done = Barrier::new(threads);

    let (sum_avgs, num_groups) = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let table = &table;
                let agg = &agg;
                let build_done = &build_done;
                let probe_done = &probe_done;
                s.spawn(move || {
                    // Build: claim slots for this thread's inner rows.
                    for i in chunk(inner.len(), t, threads) {
                        table.insert(inner.keys[i], inner.vals[i]);
                    }
                    build_done.wait();

                    // Probe and aggregate through the local buffer.
                    let mut buf = LocalAggBuffer::new();
                    for o in chunk(outer.len(), t, threads) {
                        if let Some(inner_val) = table.lookup(outer.join_keys[o]) {
                            let product = inner_val as u64 * outer.vals[o] as u64;
                            if buf.accumulate(group_keys[o], product) {
                                buf.flush_into(agg);
                            }
                        }
                    }
                    buf.flush_into(agg);
                    probe_done.wait();

                    // Reduce this thread's slice of the aggregation table.
                    agg.fold_range(chunk(agg.buckets(), t, threads))
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("join worker panicked"))
            .fold((0u64, 0u64), |(s, g), (ps, pg)| (s + ps, g + pg as u64))
    });

    debug!("{num_groups} groups reduced in {:?}", started.elapsed());
    if num_groups == 0 { 0 } else { sum_avgs / num_groups }
}

/// Degenerate plan without a group-key column: one ungrouped SUM/COUNT
/// average over all matches. No sketch, no aggregation table, a single
/// post-build barrier.
fn run_ungrouped(inner: InnerRelation<'_>, outer: OuterRelation<'_>, threads: usize) -> u64 {
    let table = JoinTable::with_capacity(inner.len());
    let build_done = Barrier::new(threads);

    let (sum, count) = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let table = &table;
                let build_done = &build_done;
                s.spawn(move || {
                    for i in chunk(inner.len(), t, threads) {
                        table.insert(inner.keys[i], inner.vals[i]);
                    }
                    build_done.wait();

                    let mut sum = 0u64;
                    let mut count = 0u64;
                    for o in chunk(outer.len(), t, threads) {
                        if let Some(inner_val) = table.lookup(outer.join_keys[o]) {
                            sum += inner_val as u64 * outer.vals[o] as u64;
                            count += 1;
                        }
                    }
                    (sum, count)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("join worker panicked"))
            .fold((0u64, 0u64), |(s, c), (ps, pc)| (s + ps, c + pc))
    });

    if count == 0 { 0 } else { sum / count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    /// Naive single-threaded reference: HashMap join + HashMap group-by.
    fn reference(
        inner_keys: &[u32],
        inner_vals: &[u32],
        outer_join_keys: &[u32],
        group_keys: Option<&[u32]>,
        outer_vals: &[u32],
    ) -> u64 {
        let lookup: HashMap<u32, u32> = inner_keys
            .iter()
            .copied()
            .zip(inner_vals.iter().copied())
            .collect();
        match group_keys {
            Some(group_keys) => {
                let mut groups: HashMap<u32, (u64, u64)> = HashMap::new();
                for ((&jk, &gk), &ov) in
                    outer_join_keys.iter().zip(group_keys).zip(outer_vals)
                {
                    if let Some(&iv) = lookup.get(&jk) {
                        let entry = groups.entry(gk).or_insert((0, 0));
                        entry.0 += iv as u64 * ov as u64;
                        entry.1 += 1;
                    }
                }
                if groups.is_empty() {
                    return 0;
                }
                let sum_avgs: u64 = groups.values().map(|&(s, c)| s / c).sum();
                sum_avgs / groups.len() as u64
            }
            None => {
                let mut sum = 0u64;
                let mut count = 0u64;
                for (&jk, &ov) in outer_join_keys.iter().zip(outer_vals) {
                    if let Some(&iv) = lookup.get(&jk) {
                        sum += iv as u64 * ov as u64;
                        count += 1;
                    }
                }
                if count == 0 { 0 } else { sum / count }
            }
        }
    }

    /// Seeded workload: unique shuffled inner keys, outer rows sampling
    /// them with the given selectivity, group keys skewed toward a few
    /// heavy hitters.
    struct Workload {
        inner_keys: Vec<u32>,
        inner_vals: Vec<u32>,
        outer_join_keys: Vec<u32>,
        group_keys: Vec<u32>,
        outer_vals: Vec<u32>,
    }

    impl Workload {
        fn generate(
            inner_tuples: usize,
            outer_tuples: usize,
            groups: u32,
            hh_groups: u32,
            hh_probability: f64,
            selectivity: f64,
            seed: u64,
        ) -> Self {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);

            let mut inner_keys: Vec<u32> = (1..=inner_tuples as u32).collect();
            inner_keys.shuffle(&mut rng);
            let inner_vals: Vec<u32> =
                (0..inner_tuples).map(|_| rng.random_range(1..100_000)).collect();

            let mut outer_join_keys = Vec::with_capacity(outer_tuples);
            let mut group_keys = Vec::with_capacity(outer_tuples);
            let mut outer_vals = Vec::with_capacity(outer_tuples);
            for _ in 0..outer_tuples {
                // Misses use keys beyond the inner domain.
                let key = if rng.random_bool(selectivity) {
                    rng.random_range(1..=inner_tuples as u32)
                } else {
                    inner_tuples as u32 + rng.random_range(1..1_000)
                };
                outer_join_keys.push(key);

                let group = if hh_groups > 0 && rng.random_bool(hh_probability) {
                    rng.random_range(1..=hh_groups)
                } else {
                    rng.random_range(1..=groups)
                };
                group_keys.push(group);
                outer_vals.push(rng.random_range(1..1_000));
            }

            Self {
                inner_keys,
                inner_vals,
                outer_join_keys,
                group_keys,
                outer_vals,
            }
        }

        fn inner(&self) -> InnerRelation<'_> {
            InnerRelation::new(&self.inner_keys, &self.inner_vals)
        }

        fn outer(&self) -> OuterRelation<'_> {
            OuterRelation::new(&self.outer_join_keys, Some(&self.group_keys), &self.outer_vals)
        }

        fn expected(&self) -> u64 {
            reference(
                &self.inner_keys,
                &self.inner_vals,
                &self.outer_join_keys,
                Some(&self.group_keys),
                &self.outer_vals,
            )
        }
    }

    /// Engine-visible thread count capped to what this machine allows.
    fn capped(threads: usize) -> usize {
        let available = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        threads.min(available)
    }

    #[test]
    fn chunk_covers_everything_once() {
        for (total, threads) in [(10, 3), (0, 4), (7, 8), (100, 1), (101, 4)] {
            let mut covered = 0;
            for t in 0..threads {
                let range = chunk(total, t, threads);
                assert_eq!(range.start, covered);
                covered = range.end;
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        assert_eq!(chunk(10, 2, 3), 6..10);
        assert_eq!(chunk(10, 0, 3), 0..3);
    }

    #[test]
    fn rejects_zero_threads() {
        let workload = Workload::generate(10, 20, 4, 0, 0.0, 1.0, 1);
        assert_eq!(
            execute(workload.inner(), workload.outer(), 0),
            Err(EngineError::ZeroThreads)
        );
    }

    #[test]
    fn rejects_more_threads_than_cores() {
        let workload = Workload::generate(10, 20, 4, 0, 0.0, 1.0, 1);
        let err = execute(workload.inner(), workload.outer(), 100_000).unwrap_err();
        assert!(matches!(err, EngineError::TooManyThreads { requested: 100_000, .. }));
    }

    #[test]
    fn rejects_mismatched_columns() {
        let keys = [1u32, 2, 3];
        let short_vals = [10u32, 20];
        let inner = InnerRelation::new(&keys, &short_vals);
        let outer = OuterRelation::new(&keys, None, &keys);
        assert_eq!(
            execute(inner, outer, 1),
            Err(EngineError::ColumnLengthMismatch {
                relation: "inner",
                left: 3,
                right: 2,
            })
        );

        let ok_inner = InnerRelation::new(&keys, &keys);
        let bad_outer = OuterRelation::new(&keys, Some(&short_vals), &keys);
        assert!(execute(ok_inner, bad_outer, 1).is_err());
    }

    #[test]
    fn concrete_three_group_scenario() {
        // group 100: 10*1 + 10*2 = 30 over 2 rows -> 15
        // group 200: 20*3       = 60 over 1 row  -> 60
        // group 300: 30*4       = 120 over 1 row -> 120
        // (15 + 60 + 120) / 3 = 65
        let inner = InnerRelation::new(&[1, 2, 3], &[10, 20, 30]);
        let outer = OuterRelation::new(
            &[1, 1, 2, 3],
            Some(&[100, 100, 200, 300]),
            &[1, 2, 3, 4],
        );
        for threads in [1, 2, 4] {
            let threads = capped(threads);
            assert_eq!(execute(inner, outer, threads), Ok(65), "{threads} threads");
        }
    }

    #[test]
    fn division_truncates_at_both_levels() {
        // group 1: (10*1 + 10*2) / 2 = 15; group 2: 10*5 / 1 = 50.
        // (15 + 50) / 2 = 32 (truncated from 32.5).
        let inner = InnerRelation::new(&[1], &[10]);
        let outer = OuterRelation::new(&[1, 1, 1], Some(&[1, 1, 2]), &[1, 2, 5]);
        assert_eq!(execute(inner, outer, 1), Ok(32));
    }

    #[test]
    fn ungrouped_average_over_all_matches() {
        let inner = InnerRelation::new(&[1, 2, 3], &[10, 20, 30]);
        let outer = OuterRelation::new(&[1, 1, 2, 3, 9], None, &[1, 2, 3, 4, 5]);
        // (10 + 20 + 60 + 120) / 4 = 52 (truncated from 52.5).
        for threads in [1, 2, 4] {
            let threads = capped(threads);
            assert_eq!(execute(inner, outer, threads), Ok(52), "{threads} threads");
        }
    }

    #[test]
    fn no_matches_yields_zero() {
        let inner = InnerRelation::new(&[1, 2], &[10, 20]);
        let outer = OuterRelation::new(&[5, 6, 7], Some(&[1, 2, 3]), &[1, 2, 3]);
        assert_eq!(execute(inner, outer, capped(2)), Ok(0));

        let ungrouped = OuterRelation::new(&[5, 6, 7], None, &[1, 2, 3]);
        assert_eq!(execute(inner, ungrouped, capped(2)), Ok(0));
    }

    #[test]
    fn empty_relations_yield_zero() {
        let inner = InnerRelation::new(&[], &[]);
        let outer = OuterRelation::new(&[], Some(&[]), &[]);
        assert_eq!(execute(inner, outer, 1), Ok(0));
    }

    #[test]
    fn matches_naive_reference() {
        let workload = Workload::generate(2_000, 50_000, 500, 10, 0.6, 0.9, 11);
        let expected = workload.expected();
        assert_eq!(execute(workload.inner(), workload.outer(), capped(4)), Ok(expected));
    }

    #[test]
    fn result_is_thread_count_invariant() {
        let workload = Workload::generate(1_000, 30_000, 128, 4, 0.8, 0.75, 23);
        let expected = workload.expected();
        for threads in [1usize, 2, 4, 8] {
            let threads = capped(threads);
            assert_eq!(
                execute(workload.inner(), workload.outer(), threads),
                Ok(expected),
                "{threads} threads"
            );
        }
    }

    #[test]
    fn many_more_groups_than_estimate_floor() {
        // Group count far above the sketch's low-cardinality floor, so the
        // table is sized from a genuine estimate rather than the minimum.
        let workload = Workload::generate(500, 200_000, 50_000, 0, 0.0, 1.0, 99);
        let expected = workload.expected();
        assert_eq!(execute(workload.inner(), workload.outer(), capped(4)), Ok(expected));
    }
}
