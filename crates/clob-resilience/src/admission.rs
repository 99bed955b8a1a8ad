//! Admission control via continuous token buckets.
//!
//! One bucket per endpoint class (optionally per identity within a class),
//! refilled continuously at `capacity × safety_margin / window`. Buckets are
//! independent: exhausting one class never blocks another, and tracked
//! identities never contaminate each other's quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clob_core::{Clock, CoreResult, EndpointClass, GateError, Identity, SystemClock};
use clob_telemetry::metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on a single wait slice while blocking for a token, so a
/// mis-projected wait is re-checked against fresh bucket state.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Quota configuration for one endpoint class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Venue-documented request capacity per window.
    pub capacity: u32,
    /// Quota window in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Fraction of the documented quota actually used. Default: 0.8.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Track a separate bucket per identity within this class.
    #[serde(default)]
    pub per_identity: bool,
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_safety_margin() -> f64 {
    0.8
}

impl QuotaConfig {
    /// Validate the configuration at construction time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.capacity == 0 {
            return Err(GateError::Config("quota capacity must be > 0".to_string()));
        }
        if self.window_ms == 0 {
            return Err(GateError::Config("quota window must be > 0".to_string()));
        }
        if self.safety_margin <= 0.0 || self.safety_margin > 1.0 {
            return Err(GateError::Config(format!(
                "safety margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        Ok(())
    }

    /// Effective bucket capacity after the safety margin.
    #[must_use]
    fn effective_capacity(&self) -> f64 {
        f64::from(self.capacity) * self.safety_margin
    }

    /// Refill rate in tokens per millisecond.
    #[must_use]
    fn refill_per_ms(&self) -> f64 {
        self.effective_capacity() / self.window_ms as f64
    }
}

/// Token bucket state. Tokens accrue fractionally between calls.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
    last_access_ms: u64,
}

/// Key of one independent bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    class: EndpointClass,
    identity: Option<Identity>,
}

/// Per-endpoint-class admission controller.
///
/// Safe for arbitrarily many concurrent callers: quota lookup is read-only,
/// and each bucket has its own narrow mutex.
pub struct AdmissionController<C: Clock> {
    quotas: HashMap<EndpointClass, QuotaConfig>,
    buckets: DashMap<BucketKey, Arc<Mutex<BucketState>>>,
    clock: C,
}

impl<C: Clock> AdmissionController<C> {
    /// Create a controller from per-class quotas, validating each.
    pub fn new(quotas: HashMap<EndpointClass, QuotaConfig>, clock: C) -> CoreResult<Self> {
        for (class, quota) in &quotas {
            quota
                .validate()
                .map_err(|e| GateError::Config(format!("quota for {class}: {e}")))?;
        }
        Ok(Self {
            quotas,
            buckets: DashMap::new(),
            clock,
        })
    }

    /// Deduct one token or return `RateLimitExceeded` with the projected wait.
    ///
    /// Endpoint classes without a configured quota are admitted unchecked.
    pub fn try_acquire(
        &self,
        class: &EndpointClass,
        identity: Option<&Identity>,
    ) -> CoreResult<()> {
        let Some(quota) = self.quotas.get(class) else {
            debug!(%class, "no quota configured, admitting unchecked");
            return Ok(());
        };

        let now = self.clock.now_ms();
        let bucket = self.bucket(class, identity, quota, now);
        let mut state = bucket.lock();

        refill(&mut state, quota, now);
        state.last_access_ms = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            metrics::ADMISSION_GRANTED_TOTAL
                .with_label_values(&[class.as_str()])
                .inc();
            return Ok(());
        }

        let deficit = 1.0 - state.tokens;
        let wait_ms = (deficit / quota.refill_per_ms()).ceil() as u64;
        metrics::ADMISSION_REJECTED_TOTAL
            .with_label_values(&[class.as_str()])
            .inc();
        Err(GateError::RateLimitExceeded {
            endpoint_class: class.clone(),
            retry_after: Duration::from_millis(wait_ms),
        })
    }

    /// Acquire a token, sleeping until one is projected to be available.
    ///
    /// With a `timeout`, gives up once the deadline passes and returns
    /// `RateLimitExceeded` carrying the still-projected wait. Without one,
    /// waits as long as it takes. Cancellation-safe: a dropped future has
    /// consumed no token.
    pub async fn acquire(
        &self,
        class: &EndpointClass,
        identity: Option<&Identity>,
        timeout: Option<Duration>,
    ) -> CoreResult<()> {
        let started_ms = self.clock.now_ms();

        loop {
            let retry_after = match self.try_acquire(class, identity) {
                Ok(()) => return Ok(()),
                Err(GateError::RateLimitExceeded { retry_after, .. }) => retry_after,
                Err(e) => return Err(e),
            };

            // Sleep outside any lock; cap the slice so a projection made
            // against stale state is revisited.
            let mut slice = retry_after.min(MAX_WAIT_SLICE);

            if let Some(timeout) = timeout {
                let elapsed = Duration::from_millis(self.clock.now_ms() - started_ms);
                if elapsed >= timeout {
                    debug!(%class, ?elapsed, "admission wait timed out");
                    return Err(GateError::RateLimitExceeded {
                        endpoint_class: class.clone(),
                        retry_after,
                    });
                }
                slice = slice.min(timeout - elapsed);
            }

            tokio::time::sleep(slice.max(Duration::from_millis(1))).await;
        }
    }

    /// Tokens currently available for a class (after refill projection).
    ///
    /// Returns `None` for classes without a configured quota.
    #[must_use]
    pub fn remaining(&self, class: &EndpointClass, identity: Option<&Identity>) -> Option<f64> {
        let quota = self.quotas.get(class)?;
        let now = self.clock.now_ms();
        let bucket = self.bucket(class, identity, quota, now);
        let mut state = bucket.lock();
        refill(&mut state, quota, now);
        Some(state.tokens)
    }

    /// Drop buckets not accessed within `max_age`.
    ///
    /// Bounds memory growth when identities are ephemeral. Returns the
    /// number of buckets removed.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(max_age.as_millis() as u64);

        let mut removed = 0usize;
        self.buckets.retain(|_, bucket| {
            let keep = bucket.lock().last_access_ms >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, "evicted idle admission buckets");
        }
        removed
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Get or create the bucket for a class/identity pair.
    ///
    /// New buckets start full: a fresh class or identity gets its whole
    /// effective capacity as burst.
    fn bucket(
        &self,
        class: &EndpointClass,
        identity: Option<&Identity>,
        quota: &QuotaConfig,
        now: u64,
    ) -> Arc<Mutex<BucketState>> {
        let key = BucketKey {
            class: class.clone(),
            identity: if quota.per_identity {
                identity.cloned()
            } else {
                None
            },
        };

        if let Some(bucket) = self.buckets.get(&key) {
            return Arc::clone(&bucket);
        }

        Arc::clone(
            self.buckets
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(BucketState {
                        tokens: quota.effective_capacity(),
                        last_refill_ms: now,
                        last_access_ms: now,
                    }))
                })
                .value(),
        )
    }
}

impl AdmissionController<SystemClock> {
    /// Create a controller with the system clock.
    pub fn with_system_clock(quotas: HashMap<EndpointClass, QuotaConfig>) -> CoreResult<Self> {
        Self::new(quotas, SystemClock)
    }
}

/// Accrue tokens for the elapsed interval, capped at effective capacity.
fn refill(state: &mut BucketState, quota: &QuotaConfig, now: u64) {
    let elapsed_ms = now.saturating_sub(state.last_refill_ms) as f64;
    state.tokens = (state.tokens + elapsed_ms * quota.refill_per_ms()).min(quota.effective_capacity());
    state.last_refill_ms = now;
}
