//! Remote call executor trait.
//!
//! The gateway is agnostic to what transport actually reaches the venue.
//! A [`RemoteCall`] implementation owns request construction and the
//! venue's error vocabulary; the resilience path wraps it.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clob_core::{CoreResult, EndpointClass, Identity};
use parking_lot::Mutex;
use serde_json::Value;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Executes one call against the remote venue.
///
/// Implementations map transport failures and venue status codes into the
/// gateway error taxonomy so the classifier can react to them.
pub trait RemoteCall: Send + Sync {
    /// Execute `payload` against `endpoint_class` on behalf of `identity`.
    fn execute<'a>(
        &'a self,
        endpoint_class: &'a EndpointClass,
        identity: Option<&'a Identity>,
        payload: Value,
    ) -> BoxFuture<'a, CoreResult<Value>>;
}

/// Shared handle to any remote call executor.
pub type DynRemoteCall = Arc<dyn RemoteCall>;

/// Scriptable executor for tests.
///
/// Responses are served from a queue; with the queue empty the payload is
/// echoed back. An optional per-call delay keeps flights open long enough
/// for concurrency tests to attach.
#[derive(Default)]
pub struct MockVenue {
    responses: Mutex<VecDeque<CoreResult<Value>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU32,
    last_payload: Mutex<Option<Value>>,
}

impl MockVenue {
    /// Create a mock with no scripted responses (echo mode).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response.
    pub fn push_response(&self, response: CoreResult<Value>) {
        self.responses.lock().push_back(response);
    }

    /// Queue `n` copies of an error.
    pub fn push_errors(&self, error: clob_core::GateError, n: usize) {
        let mut responses = self.responses.lock();
        for _ in 0..n {
            responses.push_back(Err(error.clone()));
        }
    }

    /// Delay every call by `delay` before responding.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of calls executed.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payload of the most recent call.
    #[must_use]
    pub fn last_payload(&self) -> Option<Value> {
        self.last_payload.lock().clone()
    }
}

impl RemoteCall for MockVenue {
    fn execute<'a>(
        &'a self,
        _endpoint_class: &'a EndpointClass,
        _identity: Option<&'a Identity>,
        payload: Value,
    ) -> BoxFuture<'a, CoreResult<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock() = Some(payload.clone());

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.responses.lock().pop_front().unwrap_or(Ok(payload))
        })
    }
}
