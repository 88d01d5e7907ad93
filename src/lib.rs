//! Parallel in-memory equi-join + group-by execution engine.
//!
//! Executes one fixed query plan over a pair of column-oriented relations:
//! join a large outer relation against a primary-key inner relation, group
//! the matches by an aggregation key, average `SUM(inner.val * outer.val)`
//! per group, and reduce the per-group averages into a single scalar.
//!
//! # Pipeline
//!
//! ```text
//!  outer group keys ──► sketch estimator ──► aggregation table size
//!                                                    │
//!  inner relation ──► lock-free build ──(barrier)──► │
//!                                                    ▼
//!  outer relation ──► probe ──► local buffers ──► shared aggregation table
//!                                                    │
//!                                  (barrier) ──► parallel reduction ──► u64
//! ```
//!
//! All phases run on the same fixed set of worker threads over contiguous
//! index ranges; the shared tables are open-addressing arrays mutated only
//! through CAS slot claims and atomic adds. See [`execute`].

pub mod agg;
pub mod build;
pub mod exec;
pub mod sketch;

pub use exec::execute;

use thiserror::Error;

/// Multiplicative hashing constant (2^32 divided by the golden ratio).
pub(crate) const HASH_MULTIPLIER: u32 = 0x9e37_79b1;

/// Mix a key before splitting it into slot / partition / bitmap bits.
#[inline(always)]
pub(crate) fn mix(key: u32) -> u32 {
    key.wrapping_mul(HASH_MULTIPLIER)
}

/// Borrowed column view of the inner (primary-key) relation.
///
/// Keys must be unique and nonzero; zero is reserved as the empty-slot
/// sentinel. Uniqueness is a caller contract and is not validated.
#[derive(Copy, Clone)]
pub struct InnerRelation<'a> {
    pub keys: &'a [u32],
    pub vals: &'a [u32],
}

impl<'a> InnerRelation<'a> {
    pub fn new(keys: &'a [u32], vals: &'a [u32]) -> Self {
        Self { keys, vals }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Borrowed column view of the outer (probe-side) relation.
///
/// When `group_keys` is `None` the query degenerates to a single ungrouped
/// SUM/COUNT average over all matches.
#[derive(Copy, Clone)]
pub struct OuterRelation<'a> {
    pub join_keys: &'a [u32],
    pub group_keys: Option<&'a [u32]>,
    pub vals: &'a [u32],
}

impl<'a> OuterRelation<'a> {
    pub fn new(join_keys: &'a [u32], group_keys: Option<&'a [u32]>, vals: &'a [u32]) -> Self {
        Self {
            join_keys,
            group_keys,
            vals,
        }
    }

    pub fn len(&self) -> usize {
        self.join_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join_keys.is_empty()
    }
}

/// Caller misuse detected before any worker thread starts. There are no
/// recoverable runtime errors: once the pipeline is running it either
/// completes or aborts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("thread count must be positive")]
    ZeroThreads,
    #[error("thread count {requested} exceeds hardware concurrency {max}")]
    TooManyThreads { requested: usize, max: usize },
    #[error("{relation} relation columns differ in length: {left} vs {right}")]
    ColumnLengthMismatch {
        relation: &'static str,
        left: usize,
        right: usize,
    },
}
