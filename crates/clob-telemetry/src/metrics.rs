//! Prometheus metrics for the venue gateway.
//!
//! Covers the gateway's observability surface:
//! - Sequence allocations and evictions
//! - Admission grants and rejections per endpoint class
//! - Circuit breaker state and transitions
//! - Cache hit/miss/eviction counts
//! - Retry attempts and final outcomes
//! - Request deduplication and batch item results
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, GaugeVec,
};

/// Total sequence numbers allocated, per identity.
pub static SEQ_ALLOCATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_sequence_allocations_total",
        "Total sequence numbers allocated",
        &["identity"]
    )
    .unwrap()
});

/// Total idle identities evicted from the sequence allocator.
pub static SEQ_EVICTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clob_sequence_evicted_total",
        "Total idle identities evicted from the sequence allocator"
    )
    .unwrap()
});

/// Tokens granted by the admission controller, per endpoint class.
pub static ADMISSION_GRANTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_admission_granted_total",
        "Total admission tokens granted",
        &["endpoint_class"]
    )
    .unwrap()
});

/// Admission rejections, per endpoint class.
pub static ADMISSION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_admission_rejected_total",
        "Total admission rejections",
        &["endpoint_class"]
    )
    .unwrap()
});

/// Circuit breaker state transitions.
pub static BREAKER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_breaker_transitions_total",
        "Total circuit breaker state transitions",
        &["breaker", "from", "to"]
    )
    .unwrap()
});

/// Circuit breaker current state (0=closed, 1=open, 2=half-open).
pub static BREAKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "clob_breaker_state",
        "Circuit breaker current state (0=closed, 1=open, 2=half-open)",
        &["breaker"]
    )
    .unwrap()
});

/// Cache hits.
pub static CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("clob_cache_hits_total", "Total cache hits").unwrap()
});

/// Cache misses (absent or expired).
pub static CACHE_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("clob_cache_misses_total", "Total cache misses").unwrap()
});

/// Cache evictions, by reason (lru or expired).
pub static CACHE_EVICTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_cache_evictions_total",
        "Total cache evictions",
        &["reason"]
    )
    .unwrap()
});

/// Retry attempts, by per-attempt outcome.
pub static RETRY_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_retry_attempts_total",
        "Total retry executor attempts",
        &["outcome"]
    )
    .unwrap()
});

/// Final retry executor outcomes.
pub static RETRY_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_retry_outcomes_total",
        "Final retry executor outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Requests coalesced onto an already in-flight identical request.
pub static DEDUP_COALESCED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clob_dedup_coalesced_total",
        "Total requests coalesced onto an in-flight identical request"
    )
    .unwrap()
});

/// Batch items completed, by outcome (ok, error, cancelled).
pub static BATCH_ITEMS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_batch_items_total",
        "Total batch items completed",
        &["outcome"]
    )
    .unwrap()
});
