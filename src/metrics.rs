//! In-process metrics: `once_cell::sync::Lazy` statics registered against the default
//! `prometheus` registry with `register_*!` macros.
//!
//! This crate builds no HTTP `/metrics` exporter; it records the counters so an embedder can
//! scrape them through its own exporter.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_uint_gauge, IntCounter,
    IntCounterVec, UIntGauge,
};
use strum_macros::IntoStaticStr;

pub struct PagerMetrics {
    pub same_block_accesses: IntCounter,
    pub same_block_hits: IntCounter,
    pub disjoint_accesses: IntCounter,
    pub disjoint_hits: IntCounter,

    pub bytes_resident: UIntGauge,
    /// Bytes resident in the disjoint map, intentionally excluded from `size_used`/hard-limit
    /// accounting; tracked separately so the undercount is at least observable.
    pub disjoint_bytes_resident: UIntGauge,

    errors: IntCounterVec,
    eviction_outcomes: IntCounterVec,
}

pub static PAGER_METRICS: Lazy<PagerMetrics> = Lazy::new(|| PagerMetrics {
    same_block_accesses: register_int_counter!(
        "blockpager_same_block_accesses_total",
        "Number of get_page/try_page calls resolved on the same-block path"
    )
    .expect("failed to register metric"),
    same_block_hits: register_int_counter!(
        "blockpager_same_block_hits_total",
        "Number of same-block accesses that found an already-loaded slot"
    )
    .expect("failed to register metric"),
    disjoint_accesses: register_int_counter!(
        "blockpager_disjoint_accesses_total",
        "Number of get_disjoint/try_disjoint calls"
    )
    .expect("failed to register metric"),
    disjoint_hits: register_int_counter!(
        "blockpager_disjoint_hits_total",
        "Number of disjoint accesses that found an already-loaded slot"
    )
    .expect("failed to register metric"),
    bytes_resident: register_uint_gauge!(
        "blockpager_bytes_resident",
        "Bytes currently resident in block-map slots"
    )
    .expect("failed to register metric"),
    disjoint_bytes_resident: register_uint_gauge!(
        "blockpager_disjoint_bytes_resident",
        "Bytes currently resident in the disjoint map (not counted against size_used)"
    )
    .expect("failed to register metric"),
    errors: register_int_counter_vec!(
        "blockpager_errors_total",
        "Errors observed by the pager, by kind",
        &["kind"]
    )
    .expect("failed to register metric"),
    eviction_outcomes: register_int_counter_vec!(
        "blockpager_eviction_outcomes_total",
        "Outcomes of eviction scans, by kind",
        &["outcome"]
    )
    .expect("failed to register metric"),
});

#[derive(Debug, Clone, Copy, IntoStaticStr)]
pub enum ErrorKind {
    OutOfMemory,
    Io,
    RingSubmit,
    EvictIterLimit,
}

pub fn error_inc(kind: ErrorKind) {
    let label: &'static str = kind.into();
    PAGER_METRICS
        .errors
        .get_metric_with_label_values(&[label])
        .expect("label set is static")
        .inc();
}

#[derive(Debug, Clone, Copy, IntoStaticStr)]
pub enum EvictionOutcome {
    Evicted,
    SkippedBorrowed,
    TargetReached,
    NoColdCandidate,
}

pub fn eviction_outcome_inc(outcome: EvictionOutcome) {
    let label: &'static str = outcome.into();
    PAGER_METRICS
        .eviction_outcomes
        .get_metric_with_label_values(&[label])
        .expect("label set is static")
        .inc();
}
