//! Bounded-concurrency batch execution.
//!
//! Fans one operation out across many items (typically identities) with a
//! hard bound on simultaneous in-flight operations. Per-item outcomes are
//! independent: one item's failure is captured in its result and never
//! cancels or fails sibling items.

use std::future::Future;

use clob_core::{CoreResult, GateError};
use clob_telemetry::metrics;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Batch execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum simultaneous in-flight operations. Default: 8.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl BatchConfig {
    /// Validate the configuration at construction time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_concurrency == 0 {
            return Err(GateError::Config(
                "batch max_concurrency must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one batch item.
#[derive(Debug)]
pub struct BatchOutcome<I, T> {
    /// The submitted item.
    pub item: I,
    /// The item's own result; sibling failures never appear here.
    pub result: CoreResult<T>,
}

/// Bounded fan-out worker pool.
pub struct BatchPool {
    config: BatchConfig,
}

impl BatchPool {
    /// Create a pool with a validated configuration.
    pub fn new(config: BatchConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configured concurrency bound.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Run `op` for every item with the pool's concurrency bound.
    ///
    /// See [`run_batch`].
    pub async fn run<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        cancel: CancellationToken,
        op: F,
    ) -> Vec<BatchOutcome<I, T>>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        run_batch(items, self.config.max_concurrency, cancel, op).await
    }
}

/// Run `op` for every item, at most `max_concurrency` in flight at once.
///
/// Results come back in submission order. Items not yet started when
/// `cancel` fires resolve immediately to [`GateError::Cancelled`];
/// already-started items complete or fail naturally. The batch is not a
/// bypass of the resilience path: `op` is expected to be the same guarded
/// call a standalone request would make.
pub async fn run_batch<I, T, F, Fut>(
    items: Vec<I>,
    max_concurrency: usize,
    cancel: CancellationToken,
    op: F,
) -> Vec<BatchOutcome<I, T>>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let total = items.len();
    let concurrency = max_concurrency.max(1);
    let op = &op;
    let cancel = &cancel;

    let mut indexed: Vec<(usize, BatchOutcome<I, T>)> = stream::iter(items.into_iter().enumerate())
        .map(|(idx, item)| async move {
            if cancel.is_cancelled() {
                debug!(idx, "batch item skipped after cancellation");
                return (
                    idx,
                    BatchOutcome {
                        item,
                        result: Err(GateError::Cancelled),
                    },
                );
            }
            let result = op(item.clone()).await;
            (idx, BatchOutcome { item, result })
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    indexed.sort_by_key(|(idx, _)| *idx);
    let outcomes: Vec<BatchOutcome<I, T>> =
        indexed.into_iter().map(|(_, outcome)| outcome).collect();

    let mut succeeded = 0usize;
    let mut cancelled = 0usize;
    let mut failed = 0usize;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(_) => succeeded += 1,
            Err(GateError::Cancelled) => cancelled += 1,
            Err(_) => failed += 1,
        }
    }
    metrics::BATCH_ITEMS_TOTAL
        .with_label_values(&["ok"])
        .inc_by(succeeded as f64);
    metrics::BATCH_ITEMS_TOTAL
        .with_label_values(&["error"])
        .inc_by(failed as f64);
    metrics::BATCH_ITEMS_TOTAL
        .with_label_values(&["cancelled"])
        .inc_by(cancelled as f64);
    info!(succeeded, failed, cancelled, total, "batch completed");

    outcomes
}
