#![allow(dead_code)]

use async_trait::async_trait;
use clinmerge::core::{AssemblyError, BusinessKey, EntityKind, LocalKey, Result, StableIdentity};
use clinmerge::storage::{EntityStore, MappingStore, MemoryEntityStore, MemoryMappingStore, StoredEntity};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Entity store that fails chosen operations on demand.
#[derive(Default)]
pub struct FlakyEntityStore {
    inner: MemoryEntityStore,
    failing_upserts: Mutex<HashSet<StableIdentity>>,
    failing_deletes: Mutex<HashSet<StableIdentity>>,
    transient_upsert_failures: AtomicU32,
    fail_all_upserts: AtomicBool,
    upsert_attempts: AtomicU64,
    delete_attempts: Mutex<Vec<StableIdentity>>,
}

impl FlakyEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryEntityStore {
        &self.inner
    }

    pub fn fail_upserts_for(&self, identity: StableIdentity) {
        self.failing_upserts.lock().unwrap().insert(identity);
    }

    pub fn fail_deletes_for(&self, identity: StableIdentity) {
        self.failing_deletes.lock().unwrap().insert(identity);
    }

    /// The next `count` upserts fail, whatever the identity.
    pub fn fail_next_upserts(&self, count: u32) {
        self.transient_upsert_failures.store(count, Ordering::SeqCst);
    }

    /// Stops every injected failure.
    pub fn heal(&self) {
        self.failing_upserts.lock().unwrap().clear();
        self.failing_deletes.lock().unwrap().clear();
        self.transient_upsert_failures.store(0, Ordering::SeqCst);
        self.fail_all_upserts.store(false, Ordering::SeqCst);
    }

    pub fn fail_all_upserts(&self, fail: bool) {
        self.fail_all_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn upsert_attempts(&self) -> u64 {
        self.upsert_attempts.load(Ordering::SeqCst)
    }

    pub fn delete_attempts(&self) -> Vec<StableIdentity> {
        self.delete_attempts.lock().unwrap().clone()
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_upsert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EntityStore for FlakyEntityStore {
    async fn upsert_entity(&self, entity: StoredEntity) -> Result<()> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all_upserts.load(Ordering::SeqCst)
            || self.take_transient_failure()
            || self.failing_upserts.lock().unwrap().contains(&entity.identity)
        {
            return Err(AssemblyError::Store(format!(
                "injected upsert failure for {}",
                entity.identity
            )));
        }
        self.inner.upsert_entity(entity).await
    }

    async fn fetch_entity(&self, identity: StableIdentity) -> Result<Option<StoredEntity>> {
        self.inner.fetch_entity(identity).await
    }

    async fn fetch_dependents(
        &self,
        identity: StableIdentity,
        kinds: &[EntityKind],
    ) -> Result<Vec<StableIdentity>> {
        self.inner.fetch_dependents(identity, kinds).await
    }

    async fn delete_entity(&self, identity: StableIdentity) -> Result<()> {
        self.delete_attempts.lock().unwrap().push(identity);
        if self.failing_deletes.lock().unwrap().contains(&identity) {
            return Err(AssemblyError::Store(format!(
                "injected delete failure for {}",
                identity
            )));
        }
        self.inner.delete_entity(identity).await
    }
}

/// Mapping store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyMappingStore {
    inner: MemoryMappingStore,
    fail_writes: AtomicBool,
}

impl FlakyMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryMappingStore {
        &self.inner
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AssemblyError::Store("mapping store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MappingStore for FlakyMappingStore {
    async fn get(&self, key: &LocalKey) -> Result<Option<StableIdentity>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &LocalKey, identity: StableIdentity) -> Result<()> {
        self.check()?;
        self.inner.put(key, identity).await
    }

    async fn get_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>> {
        self.inner.get_reverse(key).await
    }

    async fn put_reverse(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()> {
        self.check()?;
        self.inner.put_reverse(key, identity).await
    }
}

/// Mapping store whose first forward read answers late with what it saw
/// before the delay.
pub struct SlowMappingStore {
    inner: MemoryMappingStore,
    delay: Duration,
    delayed: AtomicBool,
}

impl SlowMappingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryMappingStore::new(),
            delay,
            delayed: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &MemoryMappingStore {
        &self.inner
    }
}

#[async_trait]
impl MappingStore for SlowMappingStore {
    async fn get(&self, key: &LocalKey) -> Result<Option<StableIdentity>> {
        let answer = self.inner.get(key).await?;
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(answer)
    }

    async fn put(&self, key: &LocalKey, identity: StableIdentity) -> Result<()> {
        self.inner.put(key, identity).await
    }

    async fn get_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>> {
        self.inner.get_reverse(key).await
    }

    async fn put_reverse(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()> {
        self.inner.put_reverse(key, identity).await
    }
}
