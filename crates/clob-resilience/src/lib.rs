//! Resilience components for the venue gateway.
//!
//! The leaf components with real concurrency hazards:
//!
//! - [`SequenceAllocator`]: per-identity monotonic sequence numbers
//! - [`AdmissionController`]: per-endpoint-class token-bucket admission
//! - [`CircuitBreaker`]: failure isolation for one remote dependency
//! - [`TtlCache`]: time-bounded metadata cache with O(1) LRU eviction
//! - [`RetryExecutor`]: bounded exponential backoff around fallible calls
//! - [`RequestDeduplicator`]: single-flight collapsing of identical requests
//!
//! Each component owns its internal state exclusively and is constructed
//! explicitly (no ambient globals), so tests build isolated instances.

pub mod admission;
pub mod breaker;
pub mod cache;
pub mod dedup;
pub mod nonce;
pub mod retry;

pub use admission::{AdmissionController, QuotaConfig};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::{CacheConfig, TtlCache};
pub use dedup::RequestDeduplicator;
pub use nonce::SequenceAllocator;
pub use retry::{RetryExecutor, RetryPolicy};
