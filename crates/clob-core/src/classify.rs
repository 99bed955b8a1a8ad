//! Pluggable error classification.
//!
//! The retry executor and circuit breaker do not understand the venue's
//! error vocabulary. A classifier maps each [`GateError`] into a
//! [`Classification`] that tells them how to react: retry, fail fast, back
//! off for rate limiting, or treat as a cancellation.

use crate::error::GateError;

/// How an error should drive retry control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; retry with backoff.
    Retryable,
    /// Permanent; surface immediately without retrying.
    Fatal,
    /// Quota-related; retry after the carried (or backoff) wait.
    RateLimited,
    /// Caller cancellation; surface immediately, never counted as a failure.
    Cancelled,
}

/// Classification of one error instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Retry disposition.
    pub kind: ErrorKind,
    /// Whether this outcome is evidence the protected dependency is broken.
    ///
    /// Local rejections (admission, cancellation) and venue-side input
    /// errors respond without touching the dependency's health, so they
    /// must not feed the breaker's failure count.
    pub trips_breaker: bool,
}

impl Classification {
    /// Transient failure that also counts against the breaker.
    #[must_use]
    pub fn retryable() -> Self {
        Self {
            kind: ErrorKind::Retryable,
            trips_breaker: true,
        }
    }

    /// Permanent failure; does not implicate the dependency.
    #[must_use]
    pub fn fatal() -> Self {
        Self {
            kind: ErrorKind::Fatal,
            trips_breaker: false,
        }
    }

    /// Quota rejection; retried after a wait, never trips the breaker.
    #[must_use]
    pub fn rate_limited() -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            trips_breaker: false,
        }
    }

    /// Cancellation; surfaced unchanged, no health verdict.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            trips_breaker: false,
        }
    }
}

/// Maps raw gateway errors into retry/breaker dispositions.
///
/// The venue's specific error vocabulary lives behind this trait; the
/// resilience core stays agnostic.
pub trait ErrorClassifier: Send + Sync {
    /// Classify one error instance.
    fn classify(&self, error: &GateError) -> Classification;
}

/// Default classification rules.
///
/// - rate limits (local or venue 429) back off and retry
/// - 5xx and transport-level failures retry and count against the breaker
/// - auth, config, and venue 4xx input errors are fatal
/// - cancellation and open-breaker rejections are never retried
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &GateError) -> Classification {
        match error {
            GateError::RateLimitExceeded { .. } => Classification::rate_limited(),
            GateError::Cancelled => Classification::cancelled(),
            GateError::CircuitOpen { .. }
            | GateError::Auth
            | GateError::Config(_)
            | GateError::RetryBudgetExhausted { .. } => Classification::fatal(),
            GateError::Upstream { status, .. } => match status {
                Some(code) if *code == 408 || *code == 429 => Classification::rate_limited(),
                Some(code) if *code >= 500 => Classification::retryable(),
                Some(_) => Classification::fatal(),
                // No status: connection refused, reset, timeout.
                None => Classification::retryable(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointClass;
    use std::time::Duration;

    #[test]
    fn test_server_errors_are_retryable_and_trip() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::Upstream {
            status: Some(503),
            message: "unavailable".to_string(),
        });
        assert_eq!(class.kind, ErrorKind::Retryable);
        assert!(class.trips_breaker);
    }

    #[test]
    fn test_client_errors_are_fatal_without_tripping() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::Upstream {
            status: Some(400),
            message: "invalid price increment".to_string(),
        });
        assert_eq!(class.kind, ErrorKind::Fatal);
        assert!(!class.trips_breaker);
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::transport("connection reset"));
        assert_eq!(class.kind, ErrorKind::Retryable);
        assert!(class.trips_breaker);
    }

    #[test]
    fn test_local_rate_limit_never_trips() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::RateLimitExceeded {
            endpoint_class: EndpointClass::new("order-submit"),
            retry_after: Duration::from_millis(100),
        });
        assert_eq!(class.kind, ErrorKind::RateLimited);
        assert!(!class.trips_breaker);
    }

    #[test]
    fn test_cancellation_is_not_retried() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::Cancelled);
        assert_eq!(class.kind, ErrorKind::Cancelled);
        assert!(!class.trips_breaker);
    }

    #[test]
    fn test_circuit_open_is_fatal() {
        let classifier = DefaultClassifier;
        let class = classifier.classify(&GateError::CircuitOpen {
            retry_in: Duration::from_secs(30),
        });
        assert_eq!(class.kind, ErrorKind::Fatal);
        assert!(!class.trips_breaker);
    }
}
