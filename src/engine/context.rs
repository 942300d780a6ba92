use crate::builder::BuilderCache;
use crate::cache::{CachedTerminology, TerminologyLookup};
use crate::config::RunPolicy;
use crate::core::{EpochClock, Result};
use crate::deletion::{ChildRegistry, DeletionHandler, Tombstones};
use crate::migration::MigrationCoordinator;
use crate::resolve::IdentityResolver;
use crate::staging::{EntityWriter, StagingQueue};
use crate::storage::{EntityStore, MappingStore};
use std::sync::Arc;

/// Run-scoped state, built when a run starts and dropped when it ends.
///
/// Nothing here is durable; the entity and mapping stores are.
pub struct RunContext {
    pub(crate) policy: RunPolicy,
    pub(crate) clock: Arc<EpochClock>,
    pub(crate) resolver: Arc<IdentityResolver>,
    pub(crate) builders: Arc<BuilderCache>,
    pub(crate) tombstones: Arc<Tombstones>,
    pub(crate) children: Arc<ChildRegistry>,
    pub(crate) writer: Arc<EntityWriter>,
    pub(crate) staging: Arc<StagingQueue>,
    pub(crate) deletion: DeletionHandler,
    pub(crate) migration: MigrationCoordinator,
    pub(crate) terminology: Option<CachedTerminology>,
}

impl RunContext {
    pub fn new(
        entity_store: Arc<dyn EntityStore>,
        mapping_store: Arc<dyn MappingStore>,
        policy: RunPolicy,
    ) -> Result<Self> {
        policy.validate()?;

        let clock = Arc::new(EpochClock::new());
        let resolver = Arc::new(IdentityResolver::new(
            mapping_store,
            policy.cache.resolver_capacity,
        )?);
        let builders = Arc::new(BuilderCache::new(clock.clone()));
        let tombstones = Arc::new(Tombstones::new(clock.clone()));
        let children = Arc::new(ChildRegistry::new());
        let writer = Arc::new(EntityWriter::new(
            entity_store,
            tombstones.clone(),
            children.clone(),
            policy.retry.clone(),
        ));
        let staging = Arc::new(StagingQueue::new(writer.clone(), &policy.staging));
        let deletion = DeletionHandler::new(
            builders.clone(),
            staging.clone(),
            writer.clone(),
            tombstones.clone(),
            children.clone(),
        );
        let migration = MigrationCoordinator::new(
            resolver.clone(),
            writer.clone(),
            builders.clone(),
            policy.migration.clone(),
        );

        Ok(Self {
            policy,
            clock,
            resolver,
            builders,
            tombstones,
            children,
            writer,
            staging,
            deletion,
            migration,
            terminology: None,
        })
    }

    pub(crate) fn attach_terminology(&mut self, lookup: Arc<dyn TerminologyLookup>) -> Result<()> {
        self.terminology = Some(CachedTerminology::new(
            lookup,
            self.policy.cache.terminology_capacity,
        )?);
        Ok(())
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn builders(&self) -> &BuilderCache {
        &self.builders
    }

    pub fn tombstones(&self) -> &Tombstones {
        &self.tombstones
    }

    pub fn children(&self) -> &ChildRegistry {
        &self.children
    }

    pub fn writer(&self) -> &EntityWriter {
        &self.writer
    }

    pub fn staging(&self) -> &StagingQueue {
        &self.staging
    }

    pub fn deletion(&self) -> &DeletionHandler {
        &self.deletion
    }

    pub fn migration(&self) -> &MigrationCoordinator {
        &self.migration
    }

    pub fn terminology(&self) -> Option<&CachedTerminology> {
        self.terminology.as_ref()
    }
}
