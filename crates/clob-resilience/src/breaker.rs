//! Failure-isolating circuit breaker.
//!
//! Wraps calls to one remote dependency with the Closed → Open → HalfOpen
//! state machine: consecutive failures open the circuit, the recovery
//! timeout admits exactly one trial call, and the trial's outcome decides
//! whether the circuit closes again or re-opens.

use std::time::Duration;

use clob_core::{Clock, CoreResult, GateError, SystemClock};
use clob_telemetry::metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing; calls are rejected immediately.
    Open,
    /// Testing recovery; exactly one trial call is admitted.
    HalfOpen,
}

impl BreakerState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens. Default: 5.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial (ms). Default: 60,000.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    /// Validate the configuration at construction time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.failure_threshold == 0 {
            return Err(GateError::Config(
                "breaker failure threshold must be > 0".to_string(),
            ));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(GateError::Config(
                "breaker recovery timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable breaker state, held behind one narrow mutex.
#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: u64,
    trial_in_flight: bool,
}

/// Three-state circuit breaker for one protected dependency.
///
/// Callers pair every successful [`try_acquire`](Self::try_acquire) with
/// exactly one outcome report: [`on_success`](Self::on_success),
/// [`on_failure`](Self::on_failure), or [`release`](Self::release) when the
/// call produced no verdict about the dependency (cancellation, local
/// admission rejection).
pub struct CircuitBreaker<C: Clock> {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: C,
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker for a named dependency.
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: C) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at_ms: 0,
                trial_in_flight: false,
            }),
            clock,
        })
    }

    /// Request permission to call the protected dependency.
    ///
    /// Returns `CircuitOpen` (with time until the next trial) when rejecting.
    /// When the recovery timeout has elapsed, transitions to `HalfOpen` and
    /// admits exactly one trial; concurrent callers arriving while the trial
    /// is in flight are rejected immediately, not queued.
    pub fn try_acquire(&self) -> CoreResult<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let timeout_ms = self.config.recovery_timeout_ms;
                let elapsed = now.saturating_sub(inner.opened_at_ms);
                if elapsed >= timeout_ms {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(GateError::CircuitOpen {
                        retry_in: Duration::from_millis(timeout_ms - elapsed),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(GateError::CircuitOpen {
                        retry_in: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call. Resets the failure count and closes the
    /// circuit if it was testing recovery.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    /// Report a failed call.
    ///
    /// A failure during recovery testing re-opens the circuit and restarts
    /// the timeout; reaching the threshold while closed opens it.
    pub fn on_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                inner.opened_at_ms = now;
            }
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached"
                    );
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at_ms = now;
                }
            }
            BreakerState::Open => {
                // Late failure from a call admitted before opening; restart
                // the recovery window.
                inner.opened_at_ms = now;
            }
        }
    }

    /// Release a permit without a verdict about the dependency.
    ///
    /// Used for cancellations and local rejections: the trial slot is freed
    /// but the failure count and state are untouched.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Manually open the circuit. Wins over concurrent automatic transitions;
    /// the recovery timeout restarts from now.
    pub fn force_open(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.opened_at_ms = now;
        if inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    /// Manually close the circuit and clear the failure count.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    /// Reset to the initial closed state.
    pub fn reset(&self) {
        info!(breaker = %self.name, "breaker reset");
        self.force_close();
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "breaker state transition"
        );
        metrics::BREAKER_TRANSITIONS_TOTAL
            .with_label_values(&[&self.name, from.as_str(), to.as_str()])
            .inc();
        metrics::BREAKER_STATE
            .with_label_values(&[&self.name])
            .set(to.gauge_value());
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the system clock.
    pub fn with_system_clock(name: impl Into<String>, config: BreakerConfig) -> CoreResult<Self> {
        Self::new(name, config, SystemClock)
    }
}
