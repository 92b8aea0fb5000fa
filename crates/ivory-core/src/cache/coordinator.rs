//! Keyed memoization with soft/hard TTL and single-flight computation
//!
//! Entries live in a `BTreeMap` behind a parking_lot RwLock so a prefix sweep
//! is a single range walk under one write lock: readers see either the whole
//! prefix or none of it. In-flight computations are tracked separately; each
//! key has at most one, and every concurrent caller awaits the same
//! `tokio::sync::OnceCell`.
//!
//! Timestamps use `tokio::time::Instant`, so tests can pause and advance time.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CoreError;

struct CacheEntry<V> {
    value: V,
    soft_expiry: Instant,
    hard_expiry: Instant,
}

/// One in-flight computation shared by every caller of its key
struct Flight<V> {
    result: OnceCell<Result<V, CoreError>>,
    /// Set when the key is invalidated mid-flight; the result is then handed
    /// to waiters but never stored.
    detached: AtomicBool,
}

impl<V> Flight<V> {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            detached: AtomicBool::new(false),
        }
    }
}

/// Releases a flight's slot in the flight table when dropped
///
/// Held by the initializing future, so a caller cancelled mid-compute still
/// frees the key for later computations.
struct FlightSlot<'a, V: Clone> {
    inner: &'a Inner<V>,
    key: &'a str,
    flight: &'a Flight<V>,
}

impl<V: Clone> Drop for FlightSlot<'_, V> {
    fn drop(&mut self) {
        self.inner.finish(self.key, self.flight);
    }
}

/// Range starting at the first key >= `prefix`; callers stop at the first
/// key that no longer starts with it.
fn from_prefix(prefix: &str) -> (Bound<&str>, Bound<&str>) {
    (Bound::Included(prefix), Bound::Unbounded)
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    prefetches: AtomicU64,
    invalidated: AtomicU64,
}

/// Snapshot of coordinator activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    /// Underlying computations actually executed
    pub computations: u64,
    pub prefetches: u64,
    pub invalidated: u64,
}

impl CacheStats {
    /// Hit rate (0.0-1.0), stale hits included
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

struct Inner<V> {
    entries: RwLock<BTreeMap<String, CacheEntry<V>>>,
    flights: Mutex<HashMap<String, Arc<Flight<V>>>>,
    soft_ttl: Duration,
    hard_ttl: Duration,
    counters: Counters,
}

impl<V: Clone> Inner<V> {
    /// Store a computed value unless its flight was detached
    fn store(&self, key: &str, flight: &Flight<V>, value: V) {
        let mut entries = self.entries.write();
        // Checked under the entries lock: an invalidation either detached us
        // already, or will sweep this entry after we release the lock.
        if flight.detached.load(Ordering::SeqCst) {
            debug!(key, "Discarding result invalidated mid-flight");
            return;
        }
        let now = Instant::now();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                soft_expiry: now + self.soft_ttl,
                hard_expiry: now + self.hard_ttl,
            },
        );
    }

    fn finish(&self, key: &str, flight: &Flight<V>) {
        let mut flights = self.flights.lock();
        if flights
            .get(key)
            .is_some_and(|current| std::ptr::eq(current.as_ref(), flight))
        {
            flights.remove(key);
        }
    }
}

/// Cache coordinator
///
/// Cheap to clone; clones share the same table. There is no global instance:
/// whoever composes the analytics core constructs and owns one.
pub struct CacheCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a coordinator. `soft_ttl` is clamped to `hard_ttl`.
    pub fn new(soft_ttl: Duration, hard_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                flights: Mutex::new(HashMap::new()),
                soft_ttl: soft_ttl.min(hard_ttl),
                hard_ttl,
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.soft_ttl(), config.hard_ttl())
    }

    /// Return the cached value or compute it
    ///
    /// - fresh entry: returned as is
    /// - soft-expired entry: returned, and one background recompute starts
    /// - missing or hard-expired: `compute` runs as the single in-flight
    ///   computation for `key`; concurrent callers share its result
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        match self.lookup(key) {
            Lookup::Fresh(value) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Cache hit");
                return Ok(value);
            }
            Lookup::Stale(value) => {
                self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Cache hit (stale), refreshing in background");
                self.spawn_background(key, compute, "soft refresh");
                return Ok(value);
            }
            Lookup::Miss => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Cache miss");
            }
        }

        let flight = self.join_flight(key);
        self.drive(key, &flight, compute, true).await
    }

    /// Recompute `key` now and replace its entry
    ///
    /// Joins a computation already in flight instead of starting a second one.
    pub async fn refresh<F, Fut>(&self, key: &str, compute: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        let flight = self.join_flight(key);
        self.drive(key, &flight, compute, false).await
    }

    /// Warm `key` in the background
    ///
    /// Never blocks and never fails the caller: errors are logged and
    /// dropped. Returns false when nothing was scheduled (entry already fresh,
    /// computation already in flight, or no tokio runtime).
    pub fn prefetch<F, Fut>(&self, key: &str, compute: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        if matches!(self.lookup(key), Lookup::Fresh(_)) {
            return false;
        }
        let scheduled = self.spawn_background(key, compute, "prefetch");
        if scheduled {
            self.inner.counters.prefetches.fetch_add(1, Ordering::Relaxed);
        }
        scheduled
    }

    /// Remove every entry whose key starts with `prefix`
    ///
    /// Computations in flight for matching keys are detached: their waiters
    /// still get the result, but it is not stored. Returns the number of
    /// entries removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let detached = {
            let mut flights = self.inner.flights.lock();
            let before = flights.len();
            flights.retain(|key, flight| {
                if key.starts_with(prefix) {
                    flight.detached.store(true, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            });
            before - flights.len()
        };

        let removed = {
            let mut entries = self.inner.entries.write();
            let doomed: Vec<String> = entries
                .range::<str, _>(from_prefix(prefix))
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                entries.remove(key);
            }
            doomed.len()
        };

        self.inner
            .counters
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(prefix, removed, detached, "Cache prefix invalidated");
        removed
    }

    /// Drop everything
    pub fn invalidate_all(&self) -> usize {
        self.invalidate("")
    }

    /// Soft-expire every entry under `prefix`
    ///
    /// The next read serves the old value and refreshes it in the background.
    pub fn mark_stale(&self, prefix: &str) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let mut marked = 0;
        for (key, entry) in entries.range_mut::<str, _>(from_prefix(prefix)) {
            if !key.starts_with(prefix) {
                break;
            }
            if entry.soft_expiry > now {
                entry.soft_expiry = now;
                marked += 1;
            }
        }
        debug!(prefix, marked, "Cache prefix marked stale");
        marked
    }

    /// Evict hard-expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.hard_expiry > now);
        before - entries.len()
    }

    /// True if `key` has a non-hard-expired entry
    pub fn contains(&self, key: &str) -> bool {
        !matches!(self.lookup(key), Lookup::Miss)
    }

    /// Live keys under `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .range::<str, _>(from_prefix(prefix))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.hard_expiry > now)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            entries: self.len(),
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &str) -> Lookup<V> {
        let now = Instant::now();
        {
            let entries = self.inner.entries.read();
            match entries.get(key) {
                None => return Lookup::Miss,
                Some(entry) if now < entry.soft_expiry => return Lookup::Fresh(entry.value.clone()),
                Some(entry) if now < entry.hard_expiry => return Lookup::Stale(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Hard-expired: evict, re-checking in case it was replaced meanwhile
        let mut entries = self.inner.entries.write();
        if entries
            .get(key)
            .is_some_and(|entry| Instant::now() >= entry.hard_expiry)
        {
            entries.remove(key);
            debug!(key, "Evicted hard-expired entry");
        }
        Lookup::Miss
    }

    fn join_flight(&self, key: &str) -> Arc<Flight<V>> {
        let mut flights = self.inner.flights.lock();
        Arc::clone(
            flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Flight::new())),
        )
    }

    /// Await the flight's result, running `compute` if nobody else is
    ///
    /// With `reuse_fresh`, a fresh entry stored by a flight that finished
    /// between our lookup and joining is returned instead of recomputing.
    async fn drive<F, Fut>(
        &self,
        key: &str,
        flight: &Flight<V>,
        compute: F,
        reuse_fresh: bool,
    ) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>>,
    {
        let inner = &self.inner;
        flight
            .result
            .get_or_init(|| async move {
                let _slot = FlightSlot { inner, key, flight };
                if reuse_fresh {
                    if let Lookup::Fresh(value) = self.lookup(key) {
                        return Ok(value);
                    }
                }
                inner.counters.computations.fetch_add(1, Ordering::Relaxed);
                let result = compute().await;
                if let Ok(value) = &result {
                    inner.store(key, flight, value.clone());
                }
                result
            })
            .await
            .clone()
    }

    /// Run a computation on a background task unless one is in flight
    fn spawn_background<F, Fut>(&self, key: &str, compute: F, reason: &'static str) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key, reason, "No tokio runtime, background computation skipped");
            return false;
        };

        let flight = {
            let mut flights = self.inner.flights.lock();
            if flights.contains_key(key) {
                return false;
            }
            let flight = Arc::new(Flight::new());
            flights.insert(key.to_string(), Arc::clone(&flight));
            flight
        };

        let this = self.clone();
        let key = key.to_string();
        handle.spawn(async move {
            if let Err(e) = this.drive(&key, &flight, compute, true).await {
                warn!(key = %key, reason, error = %e, "Background cache computation failed");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> CacheCoordinator<u64> {
        CacheCoordinator::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    type Ready = std::future::Ready<Result<u64, CoreError>>;

    fn counted(counter: &Arc<AtomicUsize>, value: u64) -> impl FnOnce() -> Ready + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_second_call_is_a_hit() {
        let cache = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cache.get_or_compute("k", counted(&calls, 7)).await.unwrap(), 7);
        assert_eq!(cache.get_or_compute("k", counted(&calls, 8)).await.unwrap(), 7);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.computations), (1, 1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_key_computes_once() {
        let cache = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..32 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tasks.spawn(async move {
                cache
                    .get_or_compute("user:1:heatmap:2024", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().computations, 1);
    }

    #[tokio::test]
    async fn test_errors_are_shared_but_not_cached() {
        let cache = coordinator();

        let err = cache
            .get_or_compute("k", || async { Err(CoreError::compute("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Compute { .. }));
        assert!(cache.is_empty());

        // Next call retries
        assert_eq!(cache.get_or_compute("k", || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_expiry_serves_stale_and_refreshes() {
        let cache = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_compute("k", counted(&calls, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // Stale value comes back immediately
        assert_eq!(cache.get_or_compute("k", counted(&calls, 2)).await.unwrap(), 1);
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get_or_compute("k", counted(&calls, 3)).await.unwrap(), 2);
        assert_eq!(cache.stats().stale_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_expiry_recomputes_in_foreground() {
        let cache = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_compute("k", counted(&calls, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(!cache.contains("k"));
        assert_eq!(cache.get_or_compute("k", counted(&calls, 2)).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_prefix_respects_key_boundaries() {
        let cache = coordinator();
        for key in ["user:1:heatmap:2024", "user:1:trend:week:0", "user:12:heatmap:2024", "user:2:x"] {
            cache.get_or_compute(key, || async { Ok(1) }).await.unwrap();
        }

        assert_eq!(cache.invalidate("user:1:"), 2);
        assert!(cache.keys_with_prefix("user:1:").is_empty());
        assert!(cache.contains("user:12:heatmap:2024"));
        assert!(cache.contains("user:2:x"));
        assert_eq!(cache.stats().invalidated, 2);
    }

    #[tokio::test]
    async fn test_invalidate_detaches_in_flight_computation() {
        let cache = coordinator();
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let task = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("user:1:heatmap:2024", move || async move {
                        let _ = wait.await;
                        Ok(5)
                    })
                    .await
            })
        };
        settle().await;

        cache.invalidate("user:1:");
        release.send(()).unwrap();

        // The waiting caller still gets its value, but nothing is stored
        assert_eq!(task.await.unwrap().unwrap(), 5);
        assert!(!cache.contains("user:1:heatmap:2024"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalidate_is_atomic_for_concurrent_readers() {
        const KEYS: usize = 64;
        let cache = coordinator();
        for i in 0..KEYS {
            let key = format!("user:1:trend:{:02}", i);
            cache.get_or_compute(&key, || async { Ok(1) }).await.unwrap();
        }
        cache.get_or_compute("user:2:heatmap:2024", || async { Ok(2) }).await.unwrap();

        let mut readers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let cache = cache.clone();
            readers.spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..2_000 {
                    let live = cache.keys_with_prefix("user:1:").len();
                    seen.push(live);
                    if live == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                seen
            });
        }
        tokio::task::yield_now().await;
        assert_eq!(cache.invalidate("user:1:"), KEYS);

        while let Some(joined) = readers.join_next().await {
            let seen = joined.unwrap();
            assert!(
                seen.iter().all(|&live| live == KEYS || live == 0),
                "partial prefix observed: {:?}",
                seen
            );
        }
        assert!(cache.keys_with_prefix("user:1:").is_empty());
        assert!(cache.contains("user:2:heatmap:2024"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_refresh_releases_the_key() {
        let cache = coordinator();
        cache.get_or_compute("k", || async { Ok(1) }).await.unwrap();

        let slow = cache.refresh("k", || async {
            tokio::time::sleep(Duration::from_secs(100)).await;
            Ok(2)
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert!(cache.inner.flights.lock().is_empty());

        // Past the soft TTL: the stale read must schedule a refresh
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.get_or_compute("k", || async { Ok(3) }).await.unwrap(), 1);
        settle().await;
        assert_eq!(cache.get_or_compute("k", || async { Ok(4) }).await.unwrap(), 3);
        assert_eq!(cache.stats().stale_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_cold_compute_allows_prefetch() {
        let cache = coordinator();

        let slow = cache.get_or_compute("cold", || async {
            tokio::time::sleep(Duration::from_secs(100)).await;
            Ok(5)
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());

        assert!(cache.prefetch("cold", || async { Ok(6) }));
        settle().await;
        assert_eq!(cache.get_or_compute("cold", || async { Ok(7) }).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_prefetch_warms_and_swallows_errors() {
        let cache = coordinator();

        assert!(cache.prefetch("warm", || async { Ok(9) }));
        assert!(cache.prefetch("broken", || async { Err(CoreError::compute("nope")) }));
        settle().await;

        assert!(cache.contains("warm"));
        assert!(!cache.contains("broken"));
        // Already fresh: nothing to do
        assert!(!cache.prefetch("warm", || async { Ok(10) }));
        assert_eq!(cache.stats().prefetches, 2);
    }

    #[test]
    fn test_prefetch_without_runtime_is_skipped() {
        let cache = coordinator();
        assert!(!cache.prefetch("k", || async { Ok(1) }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_replaces_value() {
        let cache = coordinator();
        cache.get_or_compute("k", || async { Ok(1) }).await.unwrap();
        assert_eq!(cache.refresh("k", || async { Ok(2) }).await.unwrap(), 2);
        assert_eq!(cache.get_or_compute("k", || async { Ok(3) }).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_stale_triggers_background_refresh() {
        let cache = coordinator();
        cache.get_or_compute("user:1:a", || async { Ok(1) }).await.unwrap();
        cache.get_or_compute("user:2:a", || async { Ok(1) }).await.unwrap();

        assert_eq!(cache.mark_stale("user:1:"), 1);
        assert_eq!(cache.get_or_compute("user:1:a", || async { Ok(2) }).await.unwrap(), 1);
        settle().await;
        assert_eq!(cache.get_or_compute("user:1:a", || async { Ok(3) }).await.unwrap(), 2);
        assert_eq!(cache.get_or_compute("user:2:a", || async { Ok(3) }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = coordinator();
        cache.get_or_compute("a", || async { Ok(1) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_or_compute("b", || async { Ok(1) }).await.unwrap();

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
