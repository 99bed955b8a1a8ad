//! Backoff-driven retry execution.
//!
//! Wraps a fallible async operation with bounded exponential backoff. The
//! circuit breaker is consulted before every attempt (fail fast when open),
//! an error classifier decides whether to retry, fail fast, or surface
//! immediately, and each attempt's outcome is reported to the breaker
//! exactly once.

use std::future::Future;
use std::time::Duration;

use clob_core::{Clock, CoreResult, ErrorClassifier, ErrorKind, GateError};
use clob_telemetry::metrics;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Default: 4 (one call plus three
    /// retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry (ms). Default: 1,000.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single backoff delay (ms). Default: 60,000.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplicative backoff factor. Default: 2.0.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Jitter fraction applied as ± on each delay. Default: 0.25.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Validate the policy at construction time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempts == 0 {
            return Err(GateError::Config("max_attempts must be > 0".to_string()));
        }
        if self.backoff_factor < 1.0 {
            return Err(GateError::Config(format!(
                "backoff factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(GateError::Config(format!(
                "jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Executes operations under a retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor with a validated policy.
    pub fn new(policy: RetryPolicy) -> CoreResult<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the policy, consulting `breaker` before each attempt.
    ///
    /// `op` receives the zero-based attempt number. Fatal and cancelled
    /// outcomes surface immediately and unchanged; retryable and
    /// rate-limited outcomes sleep the backoff delay (or the venue's
    /// projected retry-after, whichever is longer) and try again. After the
    /// last attempt the final error is wrapped in `RetryBudgetExhausted`
    /// with the attempt count and elapsed time.
    pub async fn run<C, T, F, Fut>(
        &self,
        breaker: &CircuitBreaker<C>,
        classifier: &dyn ErrorClassifier,
        mut op: F,
    ) -> CoreResult<T>
    where
        C: Clock,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            // Fail fast while open; an open breaker consumes no budget.
            breaker.try_acquire()?;

            let error = match op(attempt).await {
                Ok(value) => {
                    breaker.on_success();
                    metrics::RETRY_ATTEMPTS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    metrics::RETRY_OUTCOMES_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = classifier.classify(&error);
            if classification.trips_breaker {
                breaker.on_failure();
            } else if classification.kind == ErrorKind::Cancelled
                || matches!(error, GateError::RateLimitExceeded { .. })
            {
                // No verdict about the dependency: free any trial slot
                // without touching the failure count.
                breaker.release();
            } else {
                // The dependency answered, just not in our favor.
                breaker.on_success();
            }

            match classification.kind {
                ErrorKind::Cancelled => {
                    metrics::RETRY_OUTCOMES_TOTAL
                        .with_label_values(&["cancelled"])
                        .inc();
                    return Err(error);
                }
                ErrorKind::Fatal => {
                    debug!(attempt, %error, "fatal error, not retrying");
                    metrics::RETRY_ATTEMPTS_TOTAL
                        .with_label_values(&["fatal"])
                        .inc();
                    metrics::RETRY_OUTCOMES_TOTAL
                        .with_label_values(&["fatal"])
                        .inc();
                    return Err(error);
                }
                ErrorKind::Retryable | ErrorKind::RateLimited => {
                    metrics::RETRY_ATTEMPTS_TOTAL
                        .with_label_values(&["retryable"])
                        .inc();

                    if attempt + 1 >= self.policy.max_attempts {
                        warn!(
                            attempts = self.policy.max_attempts,
                            %error,
                            "retry budget exhausted"
                        );
                        metrics::RETRY_OUTCOMES_TOTAL
                            .with_label_values(&["exhausted"])
                            .inc();
                        return Err(GateError::RetryBudgetExhausted {
                            attempts: self.policy.max_attempts,
                            elapsed: started.elapsed(),
                            last: Box::new(error),
                        });
                    }

                    let mut delay = self.backoff_delay(attempt);
                    // Honor the venue's projected wait when it is longer
                    // than our own backoff.
                    if let GateError::RateLimitExceeded { retry_after, .. } = &error {
                        delay = delay.max(*retry_after);
                    }

                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff delay for an attempt: `min(base × factor^attempt, cap)` with
    /// uniform ±jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay_ms as f64;
        let capped = (base * self.policy.backoff_factor.powi(attempt as i32))
            .min(self.policy.max_delay_ms as f64);

        let jittered = if self.policy.jitter > 0.0 {
            let spread = capped * self.policy.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
