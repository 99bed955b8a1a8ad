//! Time-bounded metadata cache with O(1) LRU eviction.
//!
//! Generic key/value store with per-entry TTL and a capacity bound. The
//! recency order lives in an intrusive doubly linked list over slab indices
//! next to a hash index, so lookup, promotion, and eviction of the
//! least-recently-used entry are all O(1) — this cache sits on the hot path
//! and a linear eviction scan would degrade with entry count.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use clob_core::{Clock, CoreResult, GateError, SystemClock};
use clob_telemetry::metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sentinel for "no neighbor" in the intrusive list.
const NIL: usize = usize::MAX;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied by [`TtlCache::put`] (ms). Default: 300,000 (5 minutes).
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Maximum entry count before LRU eviction. Default: 10,000.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_capacity() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            capacity: default_capacity(),
        }
    }
}

impl CacheConfig {
    /// Validate the configuration at construction time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.capacity == 0 {
            return Err(GateError::Config("cache capacity must be > 0".to_string()));
        }
        if self.default_ttl_ms == 0 {
            return Err(GateError::Config("cache TTL must be > 0".to_string()));
        }
        Ok(())
    }
}

/// One cached entry plus its links in the recency list.
#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    expires_at_ms: u64,
    /// Toward the most-recently-used end.
    prev: usize,
    /// Toward the least-recently-used end.
    next: usize,
}

/// Hash index + slab + intrusive recency list.
#[derive(Debug)]
struct CacheInner<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn entry(&self, idx: usize) -> &Entry<K, V> {
        self.slots[idx].as_ref().expect("indexed slot occupied")
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry<K, V> {
        self.slots[idx].as_mut().expect("indexed slot occupied")
    }

    /// Detach an entry from the recency list.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.entry(idx);
            (entry.prev, entry.next)
        };
        if prev != NIL {
            self.entry_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entry_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
        let entry = self.entry_mut(idx);
        entry.prev = NIL;
        entry.next = NIL;
    }

    /// Link an entry at the most-recently-used end.
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let entry = self.entry_mut(idx);
            entry.prev = NIL;
            entry.next = old_head;
        }
        if old_head != NIL {
            self.entry_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Remove an entry entirely, returning it.
    fn remove_idx(&mut self, idx: usize) -> Entry<K, V> {
        self.unlink(idx);
        let entry = self.slots[idx].take().expect("indexed slot occupied");
        self.index.remove(&entry.key);
        self.free.push(idx);
        entry
    }

    /// Allocate a slot for a new entry and index it.
    fn insert_front(&mut self, entry: Entry<K, V>) {
        let key = entry.key.clone();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }
}

/// Thread-safe cache with per-entry TTL and O(1) LRU eviction.
///
/// Used to memoize venue metadata (price-increment rules, fee tiers) and to
/// back read deduplication. Concurrent `get`/`put` never corrupt the recency
/// list; the last writer for a key wins, and readers never observe a torn
/// entry.
pub struct TtlCache<K, V, C: Clock> {
    inner: Mutex<CacheInner<K, V>>,
    config: CacheConfig,
    clock: C,
}

impl<K, V, C> TtlCache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    /// Create a cache with the given configuration and clock.
    pub fn new(config: CacheConfig, clock: C) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(CacheInner::new(config.capacity)),
            config,
            clock,
        })
    }

    /// Get a value, promoting the entry to most-recently-used.
    ///
    /// An entry past its expiry behaves as absent even if active eviction
    /// has not run yet; it is removed on touch.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let Some(&idx) = inner.index.get(key) else {
            metrics::CACHE_MISSES_TOTAL.inc();
            return None;
        };

        if now > inner.entry(idx).expires_at_ms {
            inner.remove_idx(idx);
            metrics::CACHE_MISSES_TOTAL.inc();
            metrics::CACHE_EVICTIONS_TOTAL
                .with_label_values(&["expired"])
                .inc();
            return None;
        }

        inner.unlink(idx);
        inner.push_front(idx);
        metrics::CACHE_HITS_TOTAL.inc();
        Some(inner.entry(idx).value.clone())
    }

    /// Insert with the default TTL.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, Duration::from_millis(self.config.default_ttl_ms));
    }

    /// Insert with an explicit TTL.
    ///
    /// The last writer for a key wins. Inserting a new key at capacity
    /// evicts the least-recently-used entry.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now_ms();
        let expires_at_ms = now.saturating_add(ttl.as_millis() as u64);
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.index.get(&key) {
            let entry = inner.entry_mut(idx);
            entry.value = value;
            entry.expires_at_ms = expires_at_ms;
            inner.unlink(idx);
            inner.push_front(idx);
            return;
        }

        if inner.index.len() >= self.config.capacity {
            let tail = inner.tail;
            debug_assert_ne!(tail, NIL, "non-empty cache has a tail");
            inner.remove_idx(tail);
            metrics::CACHE_EVICTIONS_TOTAL
                .with_label_values(&["lru"])
                .inc();
        }

        inner.insert_front(Entry {
            key,
            value,
            expires_at_ms,
            prev: NIL,
            next: NIL,
        });
    }

    /// Remove a key, returning its value if present and unexpired.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        let entry = inner.remove_idx(idx);
        (now <= entry.expires_at_ms).then_some(entry.value)
    }

    /// Sweep up to `max_items` entries from the cold end, removing expired
    /// ones.
    ///
    /// Bounded per call so the lock hold stays short; expired entries the
    /// sweep does not reach are still removed lazily on `get`. Returns the
    /// number of entries removed.
    pub fn evict_expired(&self, max_items: usize) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let mut removed = 0usize;
        let mut checked = 0usize;
        let mut idx = inner.tail;
        while idx != NIL && checked < max_items {
            let toward_head = inner.entry(idx).prev;
            if now > inner.entry(idx).expires_at_ms {
                inner.remove_idx(idx);
                removed += 1;
            }
            checked += 1;
            idx = toward_head;
        }

        if removed > 0 {
            metrics::CACHE_EVICTIONS_TOTAL
                .with_label_values(&["expired"])
                .inc_by(removed as f64);
            debug!(removed, checked, "swept expired cache entries");
        }
        removed
    }

    /// Number of entries, including any not-yet-swept expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let capacity = self.config.capacity;
        *inner = CacheInner::new(capacity);
    }
}

impl<K, V> TtlCache<K, V, SystemClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with the system clock.
    pub fn with_system_clock(config: CacheConfig) -> CoreResult<Self> {
        Self::new(config, SystemClock)
    }
}
