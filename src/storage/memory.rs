use super::{EntityStore, MappingStore, StoredEntity};
use crate::core::{BusinessKey, EntityKind, LocalKey, Result, StableIdentity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// In-memory entity store.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<StableIdentity, StoredEntity>>,
    upserts: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Total writes (upserts and deletes) seen by the store.
    pub fn write_count(&self) -> u64 {
        self.upsert_count() + self.delete_count()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upsert_entity(&self, entity: StoredEntity) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.entities.write().await.insert(entity.identity, entity);
        Ok(())
    }

    async fn fetch_entity(&self, identity: StableIdentity) -> Result<Option<StoredEntity>> {
        Ok(self.entities.read().await.get(&identity).cloned())
    }

    async fn fetch_dependents(
        &self,
        identity: StableIdentity,
        kinds: &[EntityKind],
    ) -> Result<Vec<StableIdentity>> {
        let entities = self.entities.read().await;
        let mut dependents = entities
            .values()
            .filter(|entity| entity.subject == Some(identity) && kinds.contains(&entity.kind))
            .map(|entity| entity.identity)
            .collect::<Vec<_>>();
        dependents.sort();
        Ok(dependents)
    }

    async fn delete_entity(&self, identity: StableIdentity) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.entities.write().await.remove(&identity);
        Ok(())
    }
}

/// Forward and reverse mapping tables shared by the mapping stores.
#[derive(Debug, Clone, Default)]
pub(crate) struct MappingTables {
    pub(crate) forward: HashMap<LocalKey, StableIdentity>,
    pub(crate) reverse: HashMap<BusinessKey, StableIdentity>,
}

impl MappingTables {
    /// Returns whether the table changed.
    pub(crate) fn put(&mut self, key: &LocalKey, identity: StableIdentity) -> bool {
        self.forward.insert(key.clone(), identity) != Some(identity)
    }

    pub(crate) fn put_reverse(&mut self, key: &BusinessKey, identity: StableIdentity) -> bool {
        self.reverse.insert(key.clone(), identity) != Some(identity)
    }

    pub(crate) fn repoint(&mut self, key: &BusinessKey, identity: StableIdentity) -> bool {
        let forward_key = key.local_key();
        if self.forward.get(&forward_key) == Some(&identity)
            && self.reverse.get(key) == Some(&identity)
        {
            return false;
        }
        self.forward.insert(forward_key, identity);
        self.reverse.insert(key.clone(), identity);
        true
    }
}

/// In-memory mapping store.
#[derive(Default)]
pub struct MemoryMappingStore {
    tables: RwLock<MappingTables>,
    writes: AtomicU64,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn forward_len(&self) -> usize {
        self.tables.read().await.forward.len()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, key: &LocalKey) -> Result<Option<StableIdentity>> {
        Ok(self.tables.read().await.forward.get(key).copied())
    }

    async fn put(&self, key: &LocalKey, identity: StableIdentity) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tables.write().await.put(key, identity);
        Ok(())
    }

    async fn get_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>> {
        Ok(self.tables.read().await.reverse.get(key).copied())
    }

    async fn put_reverse(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tables.write().await.put_reverse(key, identity);
        Ok(())
    }

    async fn repoint(&self, key: &BusinessKey, identity: StableIdentity) -> Result<bool> {
        let changed = self.tables.write().await.repoint(key, identity);
        if changed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn problem_for(subject: StableIdentity) -> StoredEntity {
        let mut entity = StoredEntity::new(StableIdentity::new(), EntityKind::Problem);
        entity.subject = Some(subject);
        entity.fields.insert("code".to_string(), json!("38341003"));
        entity
    }

    #[tokio::test]
    async fn test_fetch_dependents_filters_by_subject_and_kind() {
        let store = MemoryEntityStore::new();
        let patient = StableIdentity::new();
        let problem = problem_for(patient);
        let mut encounter = StoredEntity::new(StableIdentity::new(), EntityKind::Encounter);
        encounter.subject = Some(patient);

        store.upsert_entity(problem.clone()).await.unwrap();
        store.upsert_entity(encounter).await.unwrap();
        store.upsert_entity(problem_for(StableIdentity::new())).await.unwrap();

        let dependents = store
            .fetch_dependents(patient, &[EntityKind::Problem, EntityKind::Episode])
            .await
            .unwrap();
        assert_eq!(dependents, vec![problem.identity]);
        assert_eq!(store.upsert_count(), 3);
    }

    #[tokio::test]
    async fn test_repoint_writes_only_on_change() {
        let store = MemoryMappingStore::new();
        let mrn = BusinessKey::new(EntityKind::Patient, "MRN", "MRN123");
        let target = StableIdentity::new();

        assert!(store.repoint(&mrn, target).await.unwrap());
        assert!(!store.repoint(&mrn, target).await.unwrap());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get(&mrn.local_key()).await.unwrap(), Some(target));
        assert_eq!(store.get_reverse(&mrn).await.unwrap(), Some(target));
    }
}
