//! # Event Pool
//!
//! `EventPool` is the bounded, timestamp-keyed queue the engine moves events
//! through. Each of the three specialized pools (incoming, processing,
//! sending) wraps the same `PoolInner` with different defaults and overflow
//! behavior.
//!
//! The lock is reentrant: a host callback invoked while we hold a pool's
//! lock (for example `analyze()` running during an incoming-pool drain) may
//! turn around and call back into the engine — `reply()` touching the
//! sending pool, or a processing-pool lookup — without deadlocking, as long
//! as it doesn't try to re-enter the *same* pool's lock from a different
//! thread (the lock is reentrant per-thread, not free of contention across
//! threads).

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use serde::Serialize;

use crate::event::Event;

/// What to do when `append` would push a bounded pool over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest (lowest-timestamp) entry to make room.
    DropOldest,
    /// Refuse the incoming entry, leaving the pool unchanged.
    DropNewest,
    /// Return an error to the caller; the pool is unchanged.
    Reject,
}

/// An event plus the pool-tracked bookkeeping around it.
#[derive(Debug, Clone)]
pub struct EventMetadata {
    pub event: Event,
    pub added_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl EventMetadata {
    fn new(event: Event) -> Self {
        Self {
            event,
            added_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Point-in-time counters exposed via `GET /state`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub len: usize,
    pub capacity: Option<usize>,
    pub policy: OverflowPolicy,
    pub total_added: u64,
    pub total_removed: u64,
    pub total_dropped: u64,
    /// Average age of resident events, in fractional seconds.
    pub avg_age_seconds: f64,
}

struct PoolInner {
    by_timestamp: HashMap<DateTime<Utc>, EventMetadata>,
    order: BTreeSet<DateTime<Utc>>,
    total_added: u64,
    total_removed: u64,
    total_dropped: u64,
    /// Bumped on every mutation; lets the persistence loop skip an
    /// unnecessary snapshot without a deep diff (spec §4.6).
    generation: u64,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            by_timestamp: HashMap::new(),
            order: BTreeSet::new(),
            total_added: 0,
            total_removed: 0,
            total_dropped: 0,
            generation: 0,
        }
    }

    fn insert(&mut self, meta: EventMetadata) -> DateTime<Utc> {
        let mut key = meta.event.timestamp;
        // Collision probing: two events minted in the same microsecond are
        // vanishingly rare but must not clobber each other (spec §3.3).
        while self.by_timestamp.contains_key(&key) {
            key += chrono::Duration::microseconds(1);
        }
        self.order.insert(key);
        self.by_timestamp.insert(key, meta);
        self.total_added += 1;
        self.generation += 1;
        key
    }

    fn remove(&mut self, key: &DateTime<Utc>) -> Option<EventMetadata> {
        let removed = self.by_timestamp.remove(key);
        if removed.is_some() {
            self.order.remove(key);
            self.total_removed += 1;
            self.generation += 1;
        }
        removed
    }

    fn mark_dropped(&mut self) {
        self.total_dropped += 1;
        self.generation += 1;
    }

    fn drop_oldest_one(&mut self) -> bool {
        if let Some(&oldest) = self.order.iter().next() {
            self.order.remove(&oldest);
            self.by_timestamp.remove(&oldest);
            self.total_dropped += 1;
            self.generation += 1;
            true
        } else {
            false
        }
    }

    fn evict_older_than(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let expired: Vec<DateTime<Utc>> = self
            .order
            .iter()
            .take_while(|ts| **ts < cutoff)
            .copied()
            .collect();
        for ts in &expired {
            self.order.remove(ts);
            self.by_timestamp.remove(ts);
            self.total_dropped += 1;
        }
        if !expired.is_empty() {
            self.generation += 1;
        }
        expired.len()
    }

    fn avg_age_seconds(&self, now: DateTime<Utc>) -> f64 {
        if self.by_timestamp.is_empty() {
            return 0.0;
        }
        let total: i64 = self
            .by_timestamp
            .values()
            .map(|m| (now - m.added_at).num_milliseconds())
            .sum();
        (total as f64 / self.by_timestamp.len() as f64) / 1000.0
    }
}

/// A bounded, timestamp-ordered event queue.
///
/// Wrapped in a `ReentrantMutex<RefCell<_>>` rather than a plain `Mutex` so
/// that host callbacks invoked from inside a locked section (see module
/// docs) can re-enter without deadlocking the owning thread.
pub struct EventPool {
    name: &'static str,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    max_age: Option<Duration>,
    inner: ReentrantMutex<RefCell<PoolInner>>,
}

impl EventPool {
    pub fn new(name: &'static str, capacity: Option<usize>, policy: OverflowPolicy, max_age: Option<Duration>) -> Self {
        Self {
            name,
            capacity,
            policy,
            max_age,
            inner: ReentrantMutex::new(RefCell::new(PoolInner::new())),
        }
    }

    /// Construct the incoming pool: bounded at 10_000, 300s max age,
    /// `drop_oldest` on overflow (spec §3.3 defaults).
    pub fn incoming() -> Self {
        Self::new("incoming", Some(10_000), OverflowPolicy::DropOldest, Some(Duration::from_secs(300)))
    }

    /// Construct the processing pool: unbounded, no hard age eviction (the
    /// engine notifies the host on a 60s timeout hint instead, spec §4.6).
    pub fn processing() -> Self {
        Self::new("processing", None, OverflowPolicy::Reject, None)
    }

    /// Construct the sending pool: bounded at 50_000, `drop_oldest` on
    /// overflow, retries capped by the engine at 3 attempts (spec §3.3).
    pub fn sending() -> Self {
        Self::new("sending", Some(50_000), OverflowPolicy::DropOldest, None)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert a freshly-arrived event. Returns the key it was stored under
    /// (normally `event.timestamp`, but bumped on collision).
    pub fn append(&self, event: Event) -> crate::error::Result<DateTime<Utc>> {
        self.append_with_retry(event, 0)
    }

    /// Insert an event that is being retried, preserving its retry count.
    pub fn append_with_retry(&self, event: Event, retry_count: u32) -> crate::error::Result<DateTime<Utc>> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        // Age cleanup is opportunistic: run it on every append, not just on
        // drains, so a pool that is fed faster than it is read still sheds
        // stale entries (spec §3.3: "invoked opportunistically on append,
        // pop_batch, and on an idle tick").
        if let Some(max_age) = self.max_age {
            inner.evict_older_than(max_age, Utc::now());
        }

        if let Some(cap) = self.capacity {
            if inner.by_timestamp.len() >= cap {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.drop_oldest_one();
                    }
                    OverflowPolicy::DropNewest => {
                        inner.total_dropped += 1;
                        return Err(crate::error::EngineError::pool(
                            format!("{} pool at capacity ({}), dropping newest", self.name, cap),
                            self.name,
                        ));
                    }
                    OverflowPolicy::Reject => {
                        return Err(crate::error::EngineError::pool(
                            format!("{} pool at capacity ({}), rejecting", self.name, cap),
                            self.name,
                        ));
                    }
                }
            }
        }

        let mut meta = EventMetadata::new(event);
        meta.retry_count = retry_count;
        Ok(inner.insert(meta))
    }

    /// Remove and return a single event by its pool key.
    pub fn pop_by_timestamp(&self, key: &DateTime<Utc>) -> Option<EventMetadata> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.remove(key)
    }

    /// Drain up to `max` events in FIFO (oldest-first) order.
    pub fn pop_batch(&self, max: usize) -> Vec<EventMetadata> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if let Some(max_age) = self.max_age {
            inner.evict_older_than(max_age, Utc::now());
        }
        let keys: Vec<DateTime<Utc>> = inner.order.iter().take(max).copied().collect();
        keys.into_iter()
            .filter_map(|k| inner.remove(&k))
            .collect()
    }

    /// Drain up to `max` events, grouped by `(destination, destination_address,
    /// destination_port)` so the send loop can batch one cumulative POST per
    /// peer (spec §4.5). Groups preserve FIFO order within themselves.
    pub fn pop_batch_grouped(&self, max: usize) -> HashMap<(String, String, u16), Vec<EventMetadata>> {
        let drained = self.pop_batch(max);
        let mut groups: HashMap<(String, String, u16), Vec<EventMetadata>> = HashMap::new();
        for meta in drained {
            let key = (
                meta.event.destination.clone(),
                meta.event.destination_address.clone(),
                meta.event.destination_port,
            );
            groups.entry(key).or_default().push(meta);
        }
        groups
    }

    /// Evict entries older than this pool's configured max age. No-op for
    /// pools with `max_age: None`. Returns the number evicted. Exposed for
    /// an explicit idle-tick caller; `append`/`pop_batch` already run this
    /// opportunistically, so a running node never depends on this being
    /// called separately.
    pub fn evict_expired(&self) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.evict_older_than(max_age, Utc::now())
    }

    /// Record a drop that happens outside this pool's own overflow path —
    /// e.g. the send loop exhausting an event's retry budget after the
    /// entry was already removed via `pop_batch_grouped` (spec §4.5 step 4,
    /// §7 kind 4, §8's "total_dropped" invariant).
    pub fn record_drop(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.mark_dropped();
    }

    /// Scan for resident entries whose processing timeout has elapsed,
    /// without removing them — the processing pool's timeout is a
    /// host-notification mechanism, not an automatic eviction (spec §5/§9:
    /// "surfaced via `check_timeouts()` to the host ... no automatic
    /// failure reply"). Each entry's own `maximum_processing_time` wins
    /// over `default_timeout` when present.
    pub fn check_timeouts(&self, default_timeout: Duration, now: DateTime<Utc>) -> Vec<EventMetadata> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .by_timestamp
            .values()
            .filter(|meta| {
                let budget = meta
                    .event
                    .maximum_processing_time
                    .map(Duration::from_secs_f64)
                    .unwrap_or(default_timeout);
                now.signed_duration_since(meta.added_at)
                    >= chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::zero())
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        guard.borrow().by_timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        let guard = self.inner.lock();
        guard.borrow().generation
    }

    /// Snapshot every resident event, oldest first, without removing them —
    /// used by the persistence loop.
    pub fn snapshot(&self) -> Vec<EventMetadata> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .order
            .iter()
            .filter_map(|k| inner.by_timestamp.get(k).cloned())
            .collect()
    }

    /// Restore pool contents from a persisted snapshot (engine startup).
    pub fn restore(&self, entries: Vec<EventMetadata>) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        for meta in entries {
            inner.insert(meta);
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        PoolStats {
            len: inner.by_timestamp.len(),
            capacity: self.capacity,
            policy: self.policy,
            total_added: inner.total_added,
            total_removed: inner.total_removed,
            total_dropped: inner.total_dropped,
            avg_age_seconds: inner.avg_age_seconds(Utc::now()),
        }
    }
}
