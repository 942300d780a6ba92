use crate::cache::{Lookup, NegativeCache, NegativeCacheStats};
use crate::core::{AssemblyError, BusinessKey, KeyedLocks, LocalKey, Result, StableIdentity};
use crate::storage::MappingStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// Snapshot of resolver activity for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub resolved: u64,
    pub created: u64,
    pub forward_cache: NegativeCacheStats,
    pub reverse_cache: NegativeCacheStats,
}

/// Maps local keys to stable identities, creating each identity exactly once.
///
/// The caches are run-scoped; the [`MappingStore`] is the only durable record.
pub struct IdentityResolver {
    store: Arc<dyn MappingStore>,
    forward: NegativeCache<LocalKey, StableIdentity>,
    reverse: NegativeCache<BusinessKey, StableIdentity>,
    creation_locks: KeyedLocks<LocalKey>,
    resolved: AtomicU64,
    created: AtomicU64,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn MappingStore>, capacity: Option<usize>) -> Result<Self> {
        Ok(Self {
            store,
            forward: NegativeCache::with_capacity(capacity)?,
            reverse: NegativeCache::with_capacity(capacity)?,
            creation_locks: KeyedLocks::new(),
            resolved: AtomicU64::new(0),
            created: AtomicU64::new(0),
        })
    }

    /// Returns the identity for `key`, creating and persisting one on first
    /// sight.
    ///
    /// Concurrent callers for the same unseen key are serialized; exactly one
    /// of them creates the identity and the rest observe it.
    pub async fn resolve_or_create(&self, key: &LocalKey) -> Result<StableIdentity> {
        self.resolved.fetch_add(1, Ordering::Relaxed);
        if let Lookup::Present(identity) = self.forward.get(key)? {
            return Ok(identity);
        }

        let _guard = self.creation_locks.lock(key).await;

        // Another caller may have finished creating while we waited. A cached
        // absence is only a hint here; the store decides.
        if let Lookup::Present(identity) = self.forward.get(key)? {
            return Ok(identity);
        }
        let existing = self.store.get(key).await.map_err(|e| {
            AssemblyError::Resolution(format!("Mapping lookup failed for {}: {}", key, e))
        })?;
        if let Some(identity) = existing {
            self.forward.record_present(key.clone(), identity)?;
            return Ok(identity);
        }

        let identity = StableIdentity::new();
        self.store.put(key, identity).await.map_err(|e| {
            AssemblyError::Resolution(format!("Failed to persist mapping for {}: {}", key, e))
        })?;
        self.forward.record_present(key.clone(), identity)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, local_key = %key, identity = %identity, "identity created");
        Ok(identity)
    }

    /// Looks up an existing identity without creating one.
    ///
    /// Store loads run under the key's creation lock so an answer can never
    /// predate a concurrent creation.
    pub async fn lookup(&self, key: &LocalKey) -> Result<Option<StableIdentity>> {
        if let Some(known) = self.forward.get(key)?.known() {
            return Ok(known);
        }
        let _guard = self.creation_locks.lock(key).await;
        self.forward
            .get_or_load(key, || async {
                self.store.get(key).await.map_err(|e| {
                    AssemblyError::Resolution(format!("Mapping lookup failed for {}: {}", key, e))
                })
            })
            .await
    }

    /// Current owner of a business key, if it has been seen.
    pub async fn lookup_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>> {
        if let Some(known) = self.reverse.get(key)?.known() {
            return Ok(known);
        }
        let _guard = self.creation_locks.lock(&key.local_key()).await;
        self.reverse
            .get_or_load(key, || async {
                self.store.get_reverse(key).await.map_err(|e| {
                    AssemblyError::Resolution(format!("Reverse lookup failed for {}: {}", key, e))
                })
            })
            .await
    }

    /// Records the first owner of a business key (forward and reverse).
    pub async fn register_business_key(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()> {
        self.repoint(key, identity).await.map(|_| ())
    }

    /// Points a business key at `identity` in the store and in the caches.
    ///
    /// Returns whether the store was written.
    pub async fn repoint(&self, key: &BusinessKey, identity: StableIdentity) -> Result<bool> {
        let forward_key = key.local_key();
        let _guard = self.creation_locks.lock(&forward_key).await;
        let changed = self.store.repoint(key, identity).await.map_err(|e| {
            AssemblyError::Resolution(format!("Failed to repoint {}: {}", key, e))
        })?;
        self.forward.record_present(forward_key, identity)?;
        self.reverse.record_present(key.clone(), identity)?;
        Ok(changed)
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            resolved: self.resolved.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            forward_cache: self.forward.stats(),
            reverse_cache: self.reverse.stats(),
        }
    }
}
