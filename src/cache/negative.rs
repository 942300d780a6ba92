use crate::core::{AssemblyError, Result};
use lru::LruCache;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Answer of a cache query.
///
/// `Absent` is a cached answer ("the backing store has no mapping"), distinct
/// from `Unknown` ("never asked, or evicted").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Unknown,
    Absent,
    Present(V),
}

impl<V> Lookup<V> {
    pub fn is_known(&self) -> bool {
        !matches!(self, Lookup::Unknown)
    }

    /// Converts a known answer into an `Option`, `None` when unknown.
    pub fn known(self) -> Option<Option<V>> {
        match self {
            Lookup::Unknown => None,
            Lookup::Absent => Some(None),
            Lookup::Present(value) => Some(Some(value)),
        }
    }
}

#[derive(Debug, Clone)]
enum Cached<V> {
    Absent,
    Present(V),
}

/// Counters for a [`NegativeCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegativeCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub loads: u64,
}

/// Key/value cache that remembers confirmed absences.
///
/// Optionally bounded; eviction only ever turns an entry back into
/// [`Lookup::Unknown`].
pub struct NegativeCache<K, V>
where
    K: Eq + Hash,
{
    entries: Mutex<LruCache<K, Cached<V>>>,
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

impl<K, V> NegativeCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn unbounded() -> Self {
        Self::from_lru(LruCache::unbounded())
    }

    pub fn bounded(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            AssemblyError::Config("Negative cache capacity must be greater than zero".to_string())
        })?;
        Ok(Self::from_lru(LruCache::new(capacity)))
    }

    /// Bounded when `capacity` is set, unbounded otherwise.
    pub fn with_capacity(capacity: Option<usize>) -> Result<Self> {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Ok(Self::unbounded()),
        }
    }

    fn from_lru(entries: LruCache<K, Cached<V>>) -> Self {
        Self {
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Result<Lookup<V>> {
        let mut entries = self.entries.lock()?;
        let lookup = match entries.get(key) {
            Some(Cached::Present(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Present(value.clone())
            }
            Some(Cached::Absent) => {
                self.negative_hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Absent
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Unknown
            }
        };
        Ok(lookup)
    }

    pub fn record_present(&self, key: K, value: V) -> Result<()> {
        self.entries.lock()?.put(key, Cached::Present(value));
        Ok(())
    }

    pub fn record_absent(&self, key: K) -> Result<()> {
        self.entries.lock()?.put(key, Cached::Absent);
        Ok(())
    }

    /// Records the answer of a backing-store lookup.
    pub fn record(&self, key: K, value: Option<V>) -> Result<()> {
        match value {
            Some(value) => self.record_present(key, value),
            None => self.record_absent(key),
        }
    }

    /// Records an absence unless the key is already known to be present.
    ///
    /// Returns the value that is cached afterwards.
    pub fn record_absent_if_unknown(&self, key: K) -> Result<Option<V>> {
        let mut entries = self.entries.lock()?;
        if let Some(Cached::Present(value)) = entries.peek(&key) {
            return Ok(Some(value.clone()));
        }
        entries.put(key, Cached::Absent);
        Ok(None)
    }

    pub fn invalidate(&self, key: &K) -> Result<()> {
        self.entries.lock()?.pop(key);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.entries.lock()?.clear();
        Ok(())
    }

    /// Answers from the cache, or asks `loader` and caches its answer.
    ///
    /// Loader errors are returned as-is and leave the entry unknown. An absent
    /// answer never replaces a value recorded while the loader ran.
    pub async fn get_or_load<F, Fut>(&self, key: &K, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if let Some(known) = self.get(key)?.known() {
            return Ok(known);
        }

        self.loads.fetch_add(1, Ordering::Relaxed);
        match loader().await? {
            Some(value) => {
                self.record_present(key.clone(), value.clone())?;
                Ok(Some(value))
            }
            None => self.record_absent_if_unknown(key.clone()),
        }
    }

    pub fn stats(&self) -> NegativeCacheStats {
        let entries = self.entries.lock().map(|entries| entries.len()).unwrap_or(0);
        NegativeCacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tri_state_distinguishes_absent_from_unknown() {
        let cache = NegativeCache::<String, u32>::unbounded();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Lookup::Unknown);

        cache.record_absent("a".to_string()).unwrap();
        cache.record_present("b".to_string(), 7).unwrap();

        assert_eq!(cache.get(&"a".to_string()).unwrap(), Lookup::Absent);
        assert_eq!(cache.get(&"b".to_string()).unwrap(), Lookup::Present(7));

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.negative_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_absent_answer_is_not_reloaded() {
        let cache = NegativeCache::<&'static str, String>::unbounded();
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let value = cache
                .get_or_load(&"READ:9999", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().negative_hits, 4);
    }

    #[tokio::test]
    async fn test_loader_errors_are_not_cached() {
        let cache = NegativeCache::<u32, u32>::unbounded();

        let failed = cache
            .get_or_load(&1, || async { Err(AssemblyError::Store("offline".to_string())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get(&1).unwrap(), Lookup::Unknown);

        let loaded = cache.get_or_load(&1, || async { Ok(Some(10)) }).await.unwrap();
        assert_eq!(loaded, Some(10));
    }

    #[tokio::test]
    async fn test_late_absent_answer_keeps_present_value() {
        let cache = NegativeCache::<u32, u32>::unbounded();

        let loaded = cache
            .get_or_load(&1, || async {
                cache.record_present(1, 42).unwrap();
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(loaded, Some(42));
        assert_eq!(cache.get(&1).unwrap(), Lookup::Present(42));
        assert_eq!(cache.record_absent_if_unknown(2).unwrap(), None);
        assert_eq!(cache.get(&2).unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_bounded_eviction_returns_to_unknown() {
        let cache = NegativeCache::<u32, u32>::bounded(2).unwrap();
        cache.record_absent(1).unwrap();
        cache.record_present(2, 20).unwrap();
        cache.record_present(3, 30).unwrap();

        assert_eq!(cache.get(&1).unwrap(), Lookup::Unknown);
        assert_eq!(cache.get(&3).unwrap(), Lookup::Present(30));
        assert!(NegativeCache::<u32, u32>::bounded(0).is_err());
    }

    #[test]
    fn test_invalidate_forgets_answer() {
        let cache = NegativeCache::<u32, u32>::unbounded();
        cache.record_present(1, 1).unwrap();
        cache.invalidate(&1).unwrap();
        assert_eq!(cache.get(&1).unwrap(), Lookup::Unknown);
    }
}
