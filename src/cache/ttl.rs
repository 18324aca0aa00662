//! TTL cache with lazy and scheduled eviction.
//!
//! Reads treat an entry past its deadline as absent. A background sweep pops
//! deadlines off a min-heap and removes the matching entries. Heap nodes are
//! tagged with the generation of the write that created them, so a node left
//! over from an older write never evicts a newer value for the same key.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::clock::deadline_after;
use crate::config::CacheConfig;
use crate::task::PeriodicTask;

/// Lifetime used for entries that should never expire in practice.
pub const PERMANENT_TTL: Duration = Duration::from_secs(99 * 365 * 24 * 60 * 60);

/// Stale heap nodes tolerated before the heap is rebuilt.
const COMPACT_SLACK: usize = 64;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expire_at: Instant,
    generation: u64,
}

/// Heap node. Ordered by deadline first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    expire_at: Instant,
    generation: u64,
    key: String,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, Entry<V>>,
    queue: BinaryHeap<Reverse<Expiry>>,
    next_generation: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    fn insert(&mut self, key: &str, value: V, expire_at: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expire_at,
                generation,
            },
        );
        self.queue.push(Reverse(Expiry {
            expire_at,
            generation,
            key: key.to_string(),
        }));

        if self.queue.len() > 2 * self.entries.len() + COMPACT_SLACK {
            self.compact();
        }
    }

    /// Rebuild the heap from live entries, dropping nodes of overwritten
    /// or invalidated writes.
    fn compact(&mut self) {
        let before = self.queue.len();
        self.queue = self
            .entries
            .iter()
            .map(|(key, entry)| {
                Reverse(Expiry {
                    expire_at: entry.expire_at,
                    generation: entry.generation,
                    key: key.clone(),
                })
            })
            .collect();
        trace!(before = before, after = self.queue.len(), "Compacted expiry queue");
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(root)| root.expire_at <= now)
        {
            let Some(Reverse(expiry)) = self.queue.pop() else {
                break;
            };
            let current = self
                .entries
                .get(&expiry.key)
                .is_some_and(|entry| entry.generation == expiry.generation);
            if current {
                self.entries.remove(&expiry.key);
                removed += 1;
            }
        }
        removed
    }
}

/// A string-keyed cache whose entries expire after a per-entry TTL.
///
/// All operations serialize on one mutex. Producers run outside it, so two
/// concurrent misses on the same key may both invoke their producer; the
/// later write wins.
pub struct TtlCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
    sweeper: Option<PeriodicTask>,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.len())
            .field("sweeping", &self.sweeper.is_some())
            .finish()
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    /// Create a cache swept every `sweep_interval`.
    ///
    /// Must be called from within a tokio runtime. The sweep stops when the
    /// cache is dropped or [`TtlCache::shutdown`] is called.
    pub fn new(sweep_interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(CacheState::new()));
        let swept = state.clone();
        let sweeper = PeriodicTask::spawn("cache-sweep", sweep_interval, move || {
            let swept = swept.clone();
            async move {
                let removed = swept.lock().purge_expired(Instant::now());
                if removed > 0 {
                    debug!(removed = removed, "Cache sweep removed expired entries");
                } else {
                    trace!("Cache sweep found no expired entries");
                }
            }
        });

        Self {
            state,
            sweeper: Some(sweeper),
        }
    }

    /// Create a cache swept at the configured interval.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.sweep_interval())
    }

    /// Create a cache without a background sweep.
    ///
    /// Expired entries are still invisible to readers; call
    /// [`TtlCache::purge_expired`] to reclaim their memory.
    pub fn unswept() -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new())),
            sweeper: None,
        }
    }
}

impl<V: Clone> TtlCache<V> {
    /// Return the live value for `key`, or compute it with `producer` and
    /// cache it for `ttl`.
    pub fn get<F>(&self, key: &str, ttl: Duration, producer: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.lookup(key) {
            trace!(key = %key, "Cache hit");
            return value;
        }

        trace!(key = %key, "Cache miss");
        let value = producer();
        self.put(key, value.clone(), ttl);
        value
    }

    /// Like [`TtlCache::get`] with an effectively unbounded TTL.
    pub fn get_permanent<F>(&self, key: &str, producer: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.get(key, PERMANENT_TTL, producer)
    }

    /// Return the live value for `key` without computing anything.
    pub fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.expire_at > now)
            .map(|entry| entry.value.clone())
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn put(&self, key: &str, value: V, ttl: Duration) {
        let expire_at = deadline_after(Instant::now(), ttl);
        self.state.lock().insert(key, value, expire_at);
    }
}

impl<V> TtlCache<V> {
    /// Remove `key` regardless of its expiration. Missing keys are ignored.
    pub fn invalidate(&self, key: &str) {
        if self.state.lock().entries.remove(key).is_some() {
            trace!(key = %key, "Invalidated cache entry");
        }
    }

    /// Remove every entry whose deadline has passed.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop().await;
        }
    }
}
