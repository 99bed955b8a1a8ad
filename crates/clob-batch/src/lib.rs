//! Bounded fan-out worker pool for batch operations.
//!
//! Runs one operation across many items (e.g. "fetch state for N
//! identities") with a hard concurrency bound, per-item failure isolation,
//! and prompt cancellation of not-yet-started items.

pub mod pool;

pub use pool::{run_batch, BatchConfig, BatchOutcome, BatchPool};
