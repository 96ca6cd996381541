//! Read cache for point lookups
//!
//! One [`ReadCache`] per cacheable entity kind, keyed by row identifier.
//! Entries are populated on read-miss and removed on update. A miss registers
//! a pending fill for its key; invalidating the key bumps that fill's
//! generation, and a fill whose generation moved while the row was being
//! fetched is discarded, so a reader that raced with a committed update can
//! never reinstall the pre-update row. Fills for other keys are unaffected.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::StoreError;

/// Default number of entries kept per entity kind
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Fills in flight for one key
struct Pending {
    generation: u64,
    readers: usize,
}

struct CacheState<V> {
    /// Value and the insertion sequence it was stored under
    entries: HashMap<i64, (V, u64)>,
    /// Insertion order for FIFO eviction; entries whose sequence no longer
    /// matches were invalidated and are skipped
    order: VecDeque<(i64, u64)>,
    pending: HashMap<i64, Pending>,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn is_live(&self, key: i64, seq: u64) -> bool {
        matches!(self.entries.get(&key), Some((_, s)) if *s == seq)
    }

    /// Drop order slots left behind by invalidation once they dominate the queue
    fn compact(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(key, seq)| matches!(entries.get(key), Some((_, s)) if s == seq));
        }
    }
}

/// Hit/miss counters of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded identifier → record cache
pub struct ReadCache<V> {
    kind: &'static str,
    capacity: Option<usize>,
    state: RwLock<CacheState<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ReadCache<V> {
    /// Cache holding at most `capacity` entries
    pub fn bounded(kind: &'static str, capacity: usize) -> Self {
        Self::with_capacity(kind, Some(capacity.max(1)))
    }

    /// Cache without a size bound
    pub fn unbounded(kind: &'static str) -> Self {
        Self::with_capacity(kind, None)
    }

    fn with_capacity(kind: &'static str, capacity: Option<usize>) -> Self {
        Self {
            kind,
            capacity,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                pending: HashMap::new(),
                next_seq: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Entity kind this cache holds
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Cached value for `key`, if any
    pub fn get(&self, key: i64) -> Option<V> {
        self.state.read().entries.get(&key).map(|(v, _)| v.clone())
    }

    /// Return the cached value, or fetch it and populate the cache
    ///
    /// Absent rows are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: i64, fetch: F) -> Result<Option<V>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, StoreError>>,
    {
        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        let fill = match self.begin_fill(key) {
            Ok(fill) => fill,
            Err(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(value));
            }
        };
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fetched = fetch().await?;
        if let Some(value) = &fetched {
            fill.complete(value.clone());
        }
        Ok(fetched)
    }

    /// Register a pending fill, or return the value another reader stored meanwhile
    fn begin_fill(&self, key: i64) -> Result<Fill<'_, V>, V> {
        let mut state = self.state.write();
        if let Some((value, _)) = state.entries.get(&key) {
            return Err(value.clone());
        }
        let pending = state.pending.entry(key).or_insert(Pending {
            generation: 0,
            readers: 0,
        });
        pending.readers += 1;
        Ok(Fill {
            cache: self,
            key,
            generation: pending.generation,
        })
    }

    fn populate(&self, state: &mut CacheState<V>, key: i64, value: V) {
        let seq = state.next_seq;
        state.next_seq += 1;
        if let Some(slot) = state.entries.get_mut(&key) {
            slot.0 = value;
            return;
        }
        state.entries.insert(key, (value, seq));
        state.order.push_back((key, seq));

        if let Some(capacity) = self.capacity {
            while state.entries.len() > capacity {
                match state.order.pop_front() {
                    Some((oldest, oldest_seq)) if state.is_live(oldest, oldest_seq) => {
                        state.entries.remove(&oldest);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        state.compact();
    }

    /// Remove `key` and prevent in-flight fills from repopulating it
    pub fn invalidate(&self, key: i64) {
        let mut state = self.state.write();
        if let Some(pending) = state.pending.get_mut(&key) {
            pending.generation = pending.generation.wrapping_add(1);
        }
        // The order slot is skipped later
        state.entries.remove(&key);
        trace!(kind = self.kind, key, "invalidated cache entry");
    }

    /// Guard that invalidates `key` when dropped, on every exit path
    pub fn invalidate_on_drop(&self, key: i64) -> InvalidateOnDrop<'_, V> {
        InvalidateOnDrop { cache: self, key }
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.write();
        for pending in state.pending.values_mut() {
            pending.generation = pending.generation.wrapping_add(1);
        }
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// A registered fill; deregisters on drop, including when the fetch fails or is cancelled
struct Fill<'a, V: Clone> {
    cache: &'a ReadCache<V>,
    key: i64,
    generation: u64,
}

impl<V: Clone> Fill<'_, V> {
    fn complete(self, value: V) {
        let mut state = self.cache.state.write();
        let current = state.pending.get(&self.key).map(|p| p.generation);
        if current == Some(self.generation) {
            self.cache.populate(&mut state, self.key, value);
        } else {
            trace!(
                kind = self.cache.kind,
                key = self.key,
                "skipped cache fill after concurrent invalidation"
            );
        }
        // Deregistration happens in Drop once the lock is released
    }
}

impl<V: Clone> Drop for Fill<'_, V> {
    fn drop(&mut self) {
        let mut state = self.cache.state.write();
        if let Some(pending) = state.pending.get_mut(&self.key) {
            pending.readers -= 1;
            if pending.readers == 0 {
                state.pending.remove(&self.key);
            }
        }
    }
}

/// Invalidates a cache entry when dropped
pub struct InvalidateOnDrop<'a, V: Clone> {
    cache: &'a ReadCache<V>,
    key: i64,
}

impl<V: Clone> Drop for InvalidateOnDrop<'_, V> {
    fn drop(&mut self) {
        self.cache.invalidate(self.key);
    }
}
