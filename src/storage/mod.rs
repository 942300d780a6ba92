//! Collaborator contracts for durable entity and mapping storage.

pub mod memory;
pub mod persistence;

pub use memory::{MemoryEntityStore, MemoryMappingStore};
pub use persistence::{FileMappingStore, MappingSnapshot};

use crate::core::{BusinessKey, EntityKind, FieldSet, LocalKey, Result, StableIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Persisted form of an assembled entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEntity {
    pub identity: StableIdentity,
    pub kind: EntityKind,
    pub fields: FieldSet,
    /// Identity this entity belongs to (e.g. the patient of a problem).
    pub subject: Option<StableIdentity>,
    pub parent: Option<StableIdentity>,
    pub children: BTreeSet<StableIdentity>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StoredEntity {
    pub fn new(identity: StableIdentity, kind: EntityKind) -> Self {
        Self {
            identity,
            kind,
            fields: FieldSet::new(),
            subject: None,
            parent: None,
            children: BTreeSet::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Durable entity store. Atomic at single-entity granularity.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_entity(&self, entity: StoredEntity) -> Result<()>;

    async fn fetch_entity(&self, identity: StableIdentity) -> Result<Option<StoredEntity>>;

    /// Identities of entities of the given kinds whose subject is `identity`.
    async fn fetch_dependents(
        &self,
        identity: StableIdentity,
        kinds: &[EntityKind],
    ) -> Result<Vec<StableIdentity>>;

    /// Removes the entity's content. Deleting an absent entity is not an error.
    async fn delete_entity(&self, identity: StableIdentity) -> Result<()>;
}

/// Persistent LocalKey -> StableIdentity associations, plus reverse
/// associations for business keys.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, key: &LocalKey) -> Result<Option<StableIdentity>>;

    async fn put(&self, key: &LocalKey, identity: StableIdentity) -> Result<()>;

    async fn get_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>>;

    async fn put_reverse(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()>;

    /// Points a business key (forward and reverse) at `identity`.
    ///
    /// Returns whether anything was written. Stores that can do so should
    /// override this to apply both halves atomically.
    async fn repoint(&self, key: &BusinessKey, identity: StableIdentity) -> Result<bool> {
        let forward_key = key.local_key();
        let forward = self.get(&forward_key).await?;
        let reverse = self.get_reverse(key).await?;
        if forward == Some(identity) && reverse == Some(identity) {
            return Ok(false);
        }
        self.put(&forward_key, identity).await?;
        self.put_reverse(key, identity).await?;
        Ok(true)
    }
}
