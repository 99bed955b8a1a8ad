//! Gateway error taxonomy.
//!
//! One shared failure vocabulary crosses every component so callers always
//! receive a specific, typed outcome: admission rejections carry the
//! projected wait, breaker rejections carry the time until the next trial,
//! and exhausted retries carry the last underlying error unchanged.

use crate::types::EndpointClass;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the gateway and its resilience components.
///
/// `Clone` is required so a single in-flight result can be broadcast to
/// every deduplicated waiter.
#[derive(Debug, Error, Clone)]
pub enum GateError {
    /// Admission controller rejected the call; retry after the carried wait.
    #[error("rate limit exceeded for {endpoint_class}, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Endpoint class whose bucket was empty.
        endpoint_class: EndpointClass,
        /// Projected wait until one token is available.
        retry_after: Duration,
    },

    /// Circuit breaker is open; the dependency is not being called.
    #[error("circuit open, next trial in {retry_in:?}")]
    CircuitOpen {
        /// Time until the breaker will admit a trial call.
        retry_in: Duration,
    },

    /// The caller cancelled the operation or its deadline elapsed.
    #[error("operation cancelled")]
    Cancelled,

    /// All retry attempts were consumed; the last underlying error is carried.
    #[error("retry budget exhausted after {attempts} attempts in {elapsed:?}: {last}")]
    RetryBudgetExhausted {
        /// Number of attempts executed.
        attempts: u32,
        /// Wall time spent across all attempts and backoff sleeps.
        elapsed: Duration,
        /// Last underlying error, unchanged.
        last: Box<GateError>,
    },

    /// The venue rejected the credentials.
    #[error("authentication rejected by venue")]
    Auth,

    /// Pass-through error from the remote call executor.
    #[error("upstream error (status {status:?}): {message}")]
    Upstream {
        /// HTTP status when the transport produced one.
        status: Option<u16>,
        /// Venue or transport error text.
        message: String,
    },

    /// A component was constructed with invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Upstream error without an HTTP status (transport-level failure).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, GateError>;
