//! Size-weighted LRU cache for expensive, explicitly disposed resources
//!
//! Entries are bounded by the sum of their declared weights rather than by
//! their count. Construction is single-flight: concurrent lookups of a
//! missing key share one in-flight construction and all receive its result,
//! including its error.
//!
//! Values are handed out as [`Cached`] handles. Removing an entry never
//! disposes a value that a caller still holds: disposal happens when the last
//! handle is released, so the resources actually held may exceed the
//! capacity for as long as evicted handles stay in use.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use tracing::{debug, warn};

/// A resource that owns handles which must be released explicitly.
///
/// The cache calls [`Disposable::dispose`] exactly once, after the entry has
/// left the cache and no [`Cached`] handle to it remains. Callers never
/// dispose values they obtained from the cache.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self);
}

/// Shared handle to a cached value.
///
/// Dropping the last handle of a value that is no longer in the cache
/// disposes it on the current runtime.
#[derive(Debug)]
pub struct Cached<V: Disposable + 'static> {
    value: Arc<V>,
    disposed: bool,
}

impl<V: Disposable + 'static> Cached<V> {
    fn new(value: V) -> Arc<Self> {
        Arc::new(Self { value: Arc::new(value), disposed: false })
    }
}

impl<V: Disposable + 'static> Deref for Cached<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V: Disposable + 'static> Drop for Cached<V> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let value = self.value.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { value.dispose().await });
            }
            Err(_) => warn!("No runtime left to dispose a cached value, dropping it"),
        }
    }
}

/// Disposes `value` in place when the caller held the last handle. Otherwise
/// the last remaining handle disposes it when dropped.
async fn retire<V: Disposable + 'static>(value: Arc<Cached<V>>) {
    if let Some(mut cached) = Arc::into_inner(value) {
        cached.value.dispose().await;
        cached.disposed = true;
    }
}

type Construction<V, E> = Shared<BoxFuture<'static, Result<Arc<Cached<V>>, E>>>;

struct Entry<V: Disposable + 'static, E> {
    id: u64,
    construction: Construction<V, E>,
    weight: u64,
    tick: u64,
}

struct CacheState<K, V: Disposable + 'static, E> {
    entries: HashMap<K, Entry<V, E>>,
    /// Recency tick to key, least recently used first
    recency: BTreeMap<u64, K>,
    clock: u64,
    next_id: u64,
    total_weight: u64,
}

impl<K, V, E> CacheState<K, V, E>
where
    K: Clone + Eq + Hash,
    V: Disposable + 'static,
    E: Clone,
{
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &K) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn insert(&mut self, key: K, weight: u64, construction: Construction<V, E>) -> u64 {
        let tick = self.next_tick();
        self.next_id += 1;
        let id = self.next_id;
        self.recency.insert(tick, key.clone());
        self.total_weight += weight;
        self.entries.insert(key, Entry { id, construction, weight, tick });
        id
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V, E>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.total_weight -= entry.weight;
        Some(entry)
    }

    fn is_current(&self, key: &K, id: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.id == id)
    }

    /// Removes settled entries, least recently used first, until the total
    /// weight fits `capacity`. Entries still under construction and the
    /// `protected` key are skipped, so the cache may stay over capacity.
    fn evict_to(&mut self, capacity: u64, protected: &K) -> Vec<Arc<Cached<V>>> {
        let mut victims = Vec::new();
        if self.total_weight <= capacity {
            return victims;
        }

        let candidates: Vec<K> = self.recency.values().cloned().collect();
        for key in candidates {
            if self.total_weight <= capacity {
                break;
            }
            if &key == protected {
                continue;
            }

            let settled = self
                .entries
                .get(&key)
                .and_then(|entry| entry.construction.peek())
                .map(|result| result.as_ref().ok().cloned());
            let Some(value) = settled else {
                continue;
            };

            self.remove(&key);
            victims.extend(value);
        }

        victims
    }
}

/// Generic weighted LRU cache.
pub struct WeightedLruCache<K, V: Disposable + 'static, E> {
    name: &'static str,
    capacity: u64,
    state: Mutex<CacheState<K, V, E>>,
}

impl<K, V, E> WeightedLruCache<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    V: Disposable + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `name` labels the cache's metrics.
    pub fn new(name: &'static str, capacity: u64) -> Self {
        gauge!("lsif_cache_capacity_bytes", "cache" => name).set(capacity as f64);
        Self {
            name,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                clock: 0,
                next_id: 0,
                total_weight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_weight(&self, state: &CacheState<K, V, E>) {
        gauge!("lsif_cache_weight_bytes", "cache" => self.name).set(state.total_weight as f64);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Sum of the weights of every entry, including pending ones.
    pub fn weight(&self) -> u64 {
        self.lock().total_weight
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Returns the cached value for `key`, constructing it with `factory`
    /// on a miss.
    ///
    /// `weight` is charged for the lifetime of the entry. The construction
    /// is also driven by a background task, so it completes and is cached
    /// even if every caller waiting on it goes away. A failed construction is never
    /// served: its error is returned to the callers that joined it, and a
    /// failure nobody collected is discarded by the next lookup.
    pub async fn get_or_create<F, Fut>(&self, key: K, weight: u64, factory: F) -> Result<Arc<Cached<V>>, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        loop {
            let (id, construction, victims) = {
                let mut state = self.lock();
                let existing = state
                    .entries
                    .get(&key)
                    .map(|entry| (entry.id, entry.construction.clone()));
                match existing {
                    Some((id, construction)) => match construction.peek().cloned() {
                        Some(Ok(value)) => {
                            state.touch(&key);
                            counter!("lsif_cache_hits_total", "cache" => self.name).increment(1);
                            return Ok(value);
                        }
                        Some(Err(_)) => {
                            state.remove(&key);
                            self.record_weight(&state);
                            continue;
                        }
                        None => (id, construction, Vec::new()),
                    },
                    None => {
                        counter!("lsif_cache_misses_total", "cache" => self.name).increment(1);
                        let construction =
                            factory().map(|result| result.map(Cached::new)).boxed().shared();
                        tokio::spawn(construction.clone().map(drop));
                        let id = state.insert(key.clone(), weight, construction.clone());
                        let victims = state.evict_to(self.capacity, &key);
                        self.record_weight(&state);
                        (id, construction, victims)
                    }
                }
            };

            if !victims.is_empty() {
                debug!(cache = self.name, evicted = victims.len(), "Evicted cache entries");
                counter!("lsif_cache_evictions_total", "cache" => self.name)
                    .increment(victims.len() as u64);
                for victim in victims {
                    retire(victim).await;
                }
            }

            match construction.await {
                Ok(value) => {
                    let mut state = self.lock();
                    if state.is_current(&key, id) {
                        state.touch(&key);
                        return Ok(value);
                    }
                    debug!(cache = self.name, key = ?key, "Entry removed during construction, retrying");
                }
                Err(err) => {
                    let mut state = self.lock();
                    if state.is_current(&key, id) {
                        state.remove(&key);
                        self.record_weight(&state);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Removes `key` and disposes its value once no handle to it remains.
    /// Returns whether an entry was present.
    ///
    /// An entry still under construction is removed immediately and
    /// disposed once its construction settles.
    pub async fn invalidate(&self, key: &K) -> bool {
        let entry = {
            let mut state = self.lock();
            let entry = state.remove(key);
            self.record_weight(&state);
            entry
        };

        let Some(entry) = entry else {
            return false;
        };

        debug!(cache = self.name, key = ?key, "Invalidated cache entry");
        if let Ok(value) = entry.construction.await {
            retire(value).await;
        }
        true
    }

    /// Removes every entry, disposing the values no caller still holds.
    pub async fn clear(&self) {
        let entries: Vec<Entry<V, E>> = {
            let mut state = self.lock();
            state.recency.clear();
            state.total_weight = 0;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        gauge!("lsif_cache_weight_bytes", "cache" => self.name).set(0.0);

        for entry in entries {
            if let Ok(value) = entry.construction.await {
                retire(value).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Resource {
        id: u32,
        disposals: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Disposable for Resource {
        async fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestCache = WeightedLruCache<&'static str, Resource, String>;

    struct Fixture {
        cache: TestCache,
        disposals: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(capacity: u64) -> Self {
            Self {
                cache: WeightedLruCache::new("test", capacity),
                disposals: Arc::new(AtomicUsize::new(0)),
            }
        }

        async fn get(&self, key: &'static str, weight: u64, id: u32) -> Arc<Cached<Resource>> {
            let disposals = self.disposals.clone();
            self.cache
                .get_or_create(key, weight, move || {
                    let disposals = disposals.clone();
                    async move { Ok(Resource { id, disposals }) }
                })
                .await
                .unwrap()
        }

        fn disposed(&self) -> usize {
            self.disposals.load(Ordering::SeqCst)
        }
    }

    /// Lets background construction and disposal tasks run.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_hit_returns_existing_value() {
        let fixture = Fixture::new(100);

        let first = fixture.get("a", 10, 1).await;
        let actual = fixture.get("a", 10, 2).await;

        assert_eq!(actual.id, 1);
        assert!(Arc::ptr_eq(&first, &actual));
        assert_eq!(fixture.cache.weight(), 10);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used_first() {
        let fixture = Fixture::new(30);
        fixture.get("a", 10, 1).await;
        fixture.get("b", 10, 2).await;
        fixture.get("c", 10, 3).await;

        fixture.get("d", 10, 4).await;
        settle().await;

        assert!(!fixture.cache.contains(&"a"));
        assert!(fixture.cache.contains(&"b"));
        assert!(fixture.cache.contains(&"d"));
        assert_eq!(fixture.cache.weight(), 30);
        assert_eq!(fixture.disposed(), 1);
    }

    #[tokio::test]
    async fn test_touch_protects_from_next_eviction() {
        let fixture = Fixture::new(30);
        fixture.get("a", 10, 1).await;
        fixture.get("b", 10, 2).await;
        fixture.get("c", 10, 3).await;

        fixture.get("a", 10, 1).await;
        fixture.get("d", 10, 4).await;

        assert!(fixture.cache.contains(&"a"));
        assert!(!fixture.cache.contains(&"b"));
    }

    #[tokio::test]
    async fn test_evicts_several_entries_for_a_heavy_insert() {
        let fixture = Fixture::new(30);
        fixture.get("a", 10, 1).await;
        fixture.get("b", 10, 2).await;
        fixture.get("c", 10, 3).await;

        fixture.get("d", 25, 4).await;
        settle().await;

        assert_eq!(fixture.cache.len(), 1);
        assert_eq!(fixture.cache.weight(), 25);
        assert_eq!(fixture.disposed(), 3);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_returned_to_its_creator() {
        let fixture = Fixture::new(10);
        fixture.get("a", 5, 1).await;

        let actual = fixture.get("huge", 50, 2).await;

        assert_eq!(actual.id, 2);
        assert!(fixture.cache.contains(&"huge"));
        assert!(!fixture.cache.contains(&"a"));
        assert_eq!(fixture.cache.weight(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_construct_once() {
        let fixture = Fixture::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let calls = calls.clone();
            let disposals = fixture.disposals.clone();
            fixture.cache.get_or_create("a", 10, move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let disposals = disposals.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Resource { id: 7, disposals })
                }
            })
        });
        let actual = futures::future::join_all(lookups).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(actual.iter().all(|value| value.as_ref().unwrap().id == 7));
        assert_eq!(fixture.cache.weight(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_construction_reaches_every_waiter_and_is_not_cached() {
        let fixture = Fixture::new(100);

        let lookups = (0..3).map(|_| {
            fixture.cache.get_or_create("a", 10, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<Resource, _>("missing file".to_string())
            })
        });
        let actual = futures::future::join_all(lookups).await;

        assert!(actual.iter().all(|result| result.as_ref().err().map(String::as_str) == Some("missing file")));
        assert!(fixture.cache.is_empty());
        assert_eq!(fixture.cache.weight(), 0);

        let recovered = fixture.get("a", 10, 9).await;
        assert_eq!(recovered.id, 9);
    }

    #[tokio::test]
    async fn test_invalidate_disposes_exactly_once() {
        let fixture = Fixture::new(100);
        fixture.get("a", 10, 1).await;

        let first = fixture.cache.invalidate(&"a").await;
        let second = fixture.cache.invalidate(&"a").await;
        settle().await;

        assert!(first);
        assert!(!second);
        assert_eq!(fixture.disposed(), 1);
        assert_eq!(fixture.cache.weight(), 0);

        let actual = fixture.get("a", 10, 2).await;
        assert_eq!(actual.id, 2);
    }

    #[tokio::test]
    async fn test_clear_disposes_everything() {
        let fixture = Fixture::new(100);
        fixture.get("a", 10, 1).await;
        fixture.get("b", 10, 2).await;

        fixture.cache.clear().await;
        settle().await;

        assert!(fixture.cache.is_empty());
        assert_eq!(fixture.cache.weight(), 0);
        assert_eq!(fixture.disposed(), 2);
    }

    #[tokio::test]
    async fn test_evicted_value_stays_usable_until_released() {
        let fixture = Fixture::new(10);
        let held = fixture.get("a", 10, 1).await;

        fixture.get("b", 10, 2).await;
        settle().await;

        assert!(!fixture.cache.contains(&"a"));
        assert_eq!(held.id, 1);
        assert_eq!(fixture.disposed(), 0);

        drop(held);
        settle().await;

        assert_eq!(fixture.disposed(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_defers_disposal_while_held() {
        let fixture = Fixture::new(100);
        let held = fixture.get("a", 10, 1).await;
        let other = held.clone();

        assert!(fixture.cache.invalidate(&"a").await);
        drop(held);
        settle().await;

        assert_eq!(fixture.disposed(), 0);
        assert_eq!(other.id, 1);

        drop(other);
        settle().await;

        assert_eq!(fixture.disposed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_completes_without_waiters() {
        let fixture = Fixture::new(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = {
            let calls = calls.clone();
            let disposals = fixture.disposals.clone();
            fixture.cache.get_or_create("a", 10, move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let disposals = disposals.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Resource { id: 3, disposals })
                }
            })
        };

        let abandoned = tokio::time::timeout(Duration::from_millis(1), lookup).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        let actual = fixture.get("a", 10, 4).await;

        assert!(abandoned.is_err());
        assert_eq!(actual.id, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.cache.weight(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncollected_failure_is_discarded() {
        let fixture = Fixture::new(100);
        let lookup = fixture.cache.get_or_create("a", 10, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<Resource, _>("missing file".to_string())
        });

        let abandoned = tokio::time::timeout(Duration::from_millis(1), lookup).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        let actual = fixture.get("a", 10, 5).await;

        assert!(abandoned.is_err());
        assert_eq!(actual.id, 5);
        assert_eq!(fixture.cache.weight(), 10);
    }
}
