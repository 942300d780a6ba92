use super::tombstone::{ChildRegistry, Tombstones};
use crate::builder::{BuilderCache, EntityBuilder};
use crate::core::{AssemblyError, LocalKey, Result, StableIdentity};
use crate::staging::{EntityWriter, StagingQueue};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Deletion requested for an entity that was never created.
///
/// Recorded in the run manifest; never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionWarning {
    pub identity: Option<StableIdentity>,
    pub local_key: Option<LocalKey>,
    pub message: String,
}

impl DeletionWarning {
    pub fn unknown_key(local_key: &LocalKey) -> Self {
        Self {
            identity: None,
            local_key: Some(local_key.clone()),
            message: format!("no identity was ever assigned to {}", local_key),
        }
    }

    pub fn unknown_entity(identity: StableIdentity) -> Self {
        Self {
            identity: Some(identity),
            local_key: None,
            message: format!("no entity content found for {}", identity),
        }
    }
}

impl fmt::Display for DeletionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A child whose cascaded deletion failed. Siblings are still deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeFailure {
    pub identity: StableIdentity,
    pub error: AssemblyError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Every identity a deletion was attempted for, root included.
    pub attempted: usize,
    pub deleted: Vec<StableIdentity>,
    pub warnings: Vec<DeletionWarning>,
    pub failures: Vec<CascadeFailure>,
}

impl DeletionReport {
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty()
    }
}

enum Removal {
    Deleted { children: BTreeSet<StableIdentity> },
    NotFound,
}

/// Turns inactive records into deletions, cascading to recorded children.
pub struct DeletionHandler {
    builders: Arc<BuilderCache>,
    staging: Arc<StagingQueue>,
    writer: Arc<EntityWriter>,
    tombstones: Arc<Tombstones>,
    children: Arc<ChildRegistry>,
}

impl DeletionHandler {
    pub fn new(
        builders: Arc<BuilderCache>,
        staging: Arc<StagingQueue>,
        writer: Arc<EntityWriter>,
        tombstones: Arc<Tombstones>,
        children: Arc<ChildRegistry>,
    ) -> Self {
        Self {
            builders,
            staging,
            writer,
            tombstones,
            children,
        }
    }

    /// Deletes `identity` and, depth-first, every child recorded for it.
    ///
    /// A failure on the root is returned; failures on children are collected
    /// in the report.
    pub async fn delete(&self, identity: StableIdentity) -> Result<DeletionReport> {
        self.cascade(identity, false)
            .instrument(info_span!("deletion", identity = %identity))
            .await
    }

    /// Deletes the entity of a builder that was returned marked deleted.
    ///
    /// The builder's own changes are discarded with it.
    pub async fn delete_builder(&self, builder: EntityBuilder) -> Result<DeletionReport> {
        let identity = builder.identity();
        let had_content = builder.merges() > 0;
        self.cascade(identity, had_content)
            .instrument(info_span!("deletion", identity = %identity))
            .await
    }

    async fn cascade(&self, root: StableIdentity, root_cached: bool) -> Result<DeletionReport> {
        let mut report = DeletionReport::default();
        let mut visited = HashSet::from([root]);

        report.attempted += 1;
        let mut pending = match self.remove(root, root_cached).await? {
            Removal::Deleted { children } => {
                report.deleted.push(root);
                children.into_iter().rev().collect::<Vec<_>>()
            }
            Removal::NotFound => {
                event!(Level::WARN, identity = %root, "deletion requested for unknown entity");
                report.warnings.push(DeletionWarning::unknown_entity(root));
                Vec::new()
            }
        };

        while let Some(child) = pending.pop() {
            if !visited.insert(child) {
                continue;
            }
            report.attempted += 1;
            match self.remove(child, false).await {
                Ok(Removal::Deleted { children }) => {
                    report.deleted.push(child);
                    pending.extend(children.into_iter().rev());
                }
                Ok(Removal::NotFound) => {
                    report.warnings.push(DeletionWarning::unknown_entity(child));
                }
                Err(error @ AssemblyError::InvariantViolation(_)) => return Err(error),
                Err(error) => {
                    event!(Level::ERROR, parent = %root, child = %child, error = %error, "cascade delete failed");
                    report.failures.push(CascadeFailure {
                        identity: child,
                        error,
                    });
                }
            }
        }

        event!(
            Level::INFO,
            attempted = report.attempted,
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            "deletion complete"
        );
        Ok(report)
    }

    async fn remove(&self, identity: StableIdentity, cached: bool) -> Result<Removal> {
        // Tombstone first: a builder already handed to a worker is skipped.
        self.tombstones.record(identity)?;
        let cached = self.builders.take_idle(identity)?.is_some() || cached;
        let staged = self.staging.withdraw(identity)?.is_some();

        let _guard = self.writer.lock(identity).await;
        let stored = self.writer.fetch(identity).await?;
        let mut children = self.children.forget(identity)?;

        let found = cached || staged || stored.is_some() || !children.is_empty();
        if !found {
            return Ok(Removal::NotFound);
        }

        if let Some(entity) = stored {
            children.extend(entity.children);
        }
        self.writer.delete_locked(identity).await?;
        Ok(Removal::Deleted { children })
    }
}
