//! Per-identity sequence allocation with monotonic guarantees.
//!
//! Issues unique, strictly increasing sequence numbers ("nonces") per
//! identity, safe under concurrent callers. Each identity gets its own
//! atomic counter, so allocations for unrelated identities never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clob_core::{Clock, Identity, SystemClock};
use clob_telemetry::metrics;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, info};

/// Upper bound (exclusive) of the random seed offset added to the initial
/// counter value. Randomizing the start prevents an external observer from
/// inferring how many sequence numbers an identity has consumed.
const SEED_OFFSET_RANGE: u64 = 100_000;

/// Per-identity counter state.
///
/// `last_used_ms` is touched on every operation and drives idle eviction.
#[derive(Debug)]
struct SequenceSlot {
    counter: AtomicU64,
    last_used_ms: AtomicU64,
}

/// Issues monotonically increasing, collision-free sequence numbers per
/// identity.
///
/// # Guarantees
/// - For one identity, concurrent `next` calls return distinct, strictly
///   increasing values (a single atomic `fetch_add`, no lost updates)
/// - Allocations for different identities never serialize on a shared lock
/// - First use of an identity seeds the counter at current time plus a
///   cryptographically sourced random offset
pub struct SequenceAllocator<C: Clock> {
    slots: DashMap<Identity, Arc<SequenceSlot>>,
    clock: C,
}

impl<C: Clock> SequenceAllocator<C> {
    /// Creates a new allocator with the given clock.
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Allocate the next sequence number for an identity.
    ///
    /// Never fails and never blocks beyond the map-shard critical section.
    pub fn next(&self, identity: &Identity) -> u64 {
        let now = self.clock.now_ms();
        let slot = self.slot(identity, now);
        // Touch before allocating so idle eviction never observes a slot
        // that is about to hand out a value as stale.
        slot.last_used_ms.store(now, Ordering::Release);
        let value = slot.counter.fetch_add(1, Ordering::AcqRel) + 1;

        metrics::SEQ_ALLOCATIONS_TOTAL
            .with_label_values(&[identity.as_str()])
            .inc();
        value
    }

    /// Seed an identity's counter from a venue-reported value.
    ///
    /// Fast-forward only: seeding never moves an existing counter backwards,
    /// so previously issued values stay unique.
    pub fn seed(&self, identity: &Identity, value: u64) {
        let now = self.clock.now_ms();
        let slot = self.slot(identity, now);
        slot.last_used_ms.store(now, Ordering::Release);

        loop {
            let current = slot.counter.load(Ordering::Acquire);
            if current >= value {
                break;
            }
            match slot.counter.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(%identity, value, "sequence counter seeded");
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    /// Read the last issued value without allocating.
    #[must_use]
    pub fn peek(&self, identity: &Identity) -> Option<u64> {
        self.slots
            .get(identity)
            .map(|slot| slot.counter.load(Ordering::Acquire))
    }

    /// Number of identities currently tracked.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.slots.len()
    }

    /// Remove state for identities with no allocation in `max_age`.
    ///
    /// Bounds memory under high identity churn. Callers must ensure the
    /// evicted identities are genuinely idle for the full window; an
    /// identity allocated again after eviction is re-seeded at current time
    /// plus a fresh random offset, which stays ahead of its old values.
    ///
    /// Returns the number of identities removed.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(max_age.as_millis() as u64);

        let mut removed = 0usize;
        self.slots.retain(|_, slot| {
            let keep = slot.last_used_ms.load(Ordering::Acquire) >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            metrics::SEQ_EVICTED_TOTAL.inc_by(removed as f64);
            info!(removed, "evicted idle sequence identities");
        }
        removed
    }

    /// Get or create the slot for an identity.
    fn slot(&self, identity: &Identity, now: u64) -> Arc<SequenceSlot> {
        if let Some(slot) = self.slots.get(identity) {
            return Arc::clone(&slot);
        }

        Arc::clone(
            self.slots
                .entry(identity.clone())
                .or_insert_with(|| {
                    let offset = OsRng.gen_range(0..SEED_OFFSET_RANGE);
                    debug!(%identity, "tracking new sequence identity");
                    Arc::new(SequenceSlot {
                        counter: AtomicU64::new(now.saturating_add(offset)),
                        last_used_ms: AtomicU64::new(now),
                    })
                })
                .value(),
        )
    }
}

impl SequenceAllocator<SystemClock> {
    /// Creates a new allocator with the system clock.
    #[must_use]
    pub fn with_system_clock() -> Self {
        Self::new(SystemClock)
    }
}
