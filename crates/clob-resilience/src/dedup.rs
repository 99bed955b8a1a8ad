//! In-flight request deduplication.
//!
//! Collapses concurrently issued, semantically identical requests into one
//! underlying call. The first caller for a fingerprint becomes the leader
//! and executes the operation; everyone else attaches as a waiter and
//! receives the leader's result. The in-flight entry is removed before the
//! result is broadcast, so a caller arriving after resolution starts a
//! fresh flight instead of attaching to a finished one.

use std::future::Future;

use clob_core::{CoreResult, Fingerprint};
use clob_telemetry::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Collapses identical in-flight requests into a single underlying call.
///
/// `T` must be `Clone` so one result can fan out to every waiter.
pub struct RequestDeduplicator<T: Clone> {
    in_flight: DashMap<Fingerprint, broadcast::Sender<CoreResult<T>>>,
}

/// Removes the in-flight entry if the leader is dropped before resolving,
/// closing the channel so waiters stop waiting on a flight that will never
/// finish.
struct FlightGuard<'a, T: Clone> {
    map: &'a DashMap<Fingerprint, broadcast::Sender<CoreResult<T>>>,
    fingerprint: &'a Fingerprint,
    armed: bool,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.map.remove(self.fingerprint);
        }
    }
}

impl<T: Clone> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RequestDeduplicator<T> {
    /// Create an empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Execute `op` once per fingerprint across all concurrent callers.
    ///
    /// Callers presenting a fingerprint that is already in flight wait for
    /// that flight's result (success or error) without invoking `op`. If
    /// the leader is cancelled before resolving, one waiter takes over and
    /// runs the flight itself.
    pub async fn dedupe<F, Fut>(&self, fingerprint: Fingerprint, mut op: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        loop {
            let mut waiter = None;
            match self.in_flight.entry(fingerprint.clone()) {
                Entry::Occupied(entry) => {
                    waiter = Some(entry.get().subscribe());
                    metrics::DEDUP_COALESCED_TOTAL.inc();
                    debug!(%fingerprint, "coalescing onto in-flight request");
                }
                Entry::Vacant(entry) => {
                    // Single result per flight, so a buffer of one suffices.
                    let (tx, _rx) = broadcast::channel(1);
                    entry.insert(tx);
                }
            }

            if let Some(mut rx) = waiter {
                match rx.recv().await {
                    Ok(result) => return result,
                    Err(_) => {
                        // Leader vanished without resolving; contend for
                        // leadership of a fresh flight.
                        debug!(%fingerprint, "flight leader vanished, retrying");
                        continue;
                    }
                }
            }

            // We are the leader.
            let mut guard = FlightGuard {
                map: &self.in_flight,
                fingerprint: &fingerprint,
                armed: true,
            };
            let result = op().await;

            // Remove before broadcasting so late arrivals start a new
            // flight rather than attaching to a resolved one.
            if let Some((_, tx)) = self.in_flight.remove(&fingerprint) {
                guard.armed = false;
                let _ = tx.send(result.clone());
            }
            return result;
        }
    }
}
