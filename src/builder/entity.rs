use crate::core::{AssemblyError, EntityKind, FieldSet, Result, StableIdentity};
use crate::storage::StoredEntity;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fields and references emitted by one source pass for one entity.
///
/// Only what is present is applied; absent fields and references are left
/// as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub fields: FieldSet,
    pub subject: Option<StableIdentity>,
    pub parent: Option<StableIdentity>,
}

impl EntityUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_subject(mut self, subject: StableIdentity) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_parent(mut self, parent: StableIdentity) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.subject.is_none() && self.parent.is_none()
    }
}

/// Mutable draft of one entity for the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityBuilder {
    identity: StableIdentity,
    kind: EntityKind,
    fields: FieldSet,
    subject: Option<StableIdentity>,
    parent: Option<StableIdentity>,
    dirty: bool,
    deleted: bool,
    born_epoch: u64,
    merges: u64,
}

impl EntityBuilder {
    pub(crate) fn new(identity: StableIdentity, kind: EntityKind, born_epoch: u64) -> Self {
        Self {
            identity,
            kind,
            fields: FieldSet::new(),
            subject: None,
            parent: None,
            dirty: false,
            deleted: false,
            born_epoch,
            merges: 0,
        }
    }

    pub fn identity(&self) -> StableIdentity {
        self.identity
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    pub fn subject(&self) -> Option<StableIdentity> {
        self.subject
    }

    pub fn parent(&self) -> Option<StableIdentity> {
        self.parent
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn born_epoch(&self) -> u64 {
        self.born_epoch
    }

    /// Number of non-empty updates merged into this builder.
    pub fn merges(&self) -> u64 {
        self.merges
    }

    /// Flags the builder for deletion; returning it routes it to the
    /// deletion handler instead of merging.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Rejects structurally invalid updates before anything is applied.
    pub fn validate(&self, update: &EntityUpdate) -> Result<()> {
        if update.parent == Some(self.identity) {
            return Err(AssemblyError::Merge(format!(
                "{} {} references itself as its own parent",
                self.kind, self.identity
            )));
        }
        if update.subject == Some(self.identity) && self.kind != EntityKind::Patient {
            return Err(AssemblyError::Merge(format!(
                "{} {} references itself as its own subject",
                self.kind, self.identity
            )));
        }
        Ok(())
    }

    /// Applies an update with last-writer-wins per present field.
    pub(crate) fn apply(&mut self, update: EntityUpdate) {
        if update.is_empty() {
            return;
        }
        self.fields.extend(update.fields);
        if update.subject.is_some() {
            self.subject = update.subject;
        }
        if update.parent.is_some() {
            self.parent = update.parent;
        }
        self.dirty = true;
        self.merges = self.merges.saturating_add(1);
    }

    pub(crate) fn repoint_subject(&mut self, old: StableIdentity, new: StableIdentity) -> bool {
        if self.subject != Some(old) {
            return false;
        }
        self.subject = Some(new);
        self.dirty = true;
        true
    }

    /// Folds this run's changes over the previously stored version.
    pub fn into_stored(
        self,
        base: Option<StoredEntity>,
        children: BTreeSet<StableIdentity>,
    ) -> StoredEntity {
        let mut stored = base.unwrap_or_else(|| StoredEntity::new(self.identity, self.kind.clone()));
        stored.kind = self.kind;
        stored.fields.extend(self.fields);
        if self.subject.is_some() {
            stored.subject = self.subject;
        }
        if self.parent.is_some() {
            stored.parent = self.parent;
        }
        stored.children.extend(children);
        stored.version = stored.version.saturating_add(1);
        stored.updated_at = Utc::now();
        stored
    }
}
