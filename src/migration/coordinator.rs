use crate::builder::BuilderCache;
use crate::config::MigrationPolicy;
use crate::core::{AssemblyError, BusinessKey, EntityKind, LocalKey, Result, StableIdentity};
use crate::resolve::IdentityResolver;
use crate::staging::EntityWriter;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Level, event, info_span};

/// A detected reassignment of a business key to a different identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    /// Primary key of the record that revealed the reassignment.
    pub local_key: LocalKey,
    pub business_key: BusinessKey,
    pub old_identity: StableIdentity,
    pub new_identity: StableIdentity,
    /// Dependents known up front; the store is consulted as well.
    pub dependents: Vec<StableIdentity>,
}

impl MigrationJob {
    pub fn new(
        local_key: LocalKey,
        business_key: BusinessKey,
        old_identity: StableIdentity,
        new_identity: StableIdentity,
    ) -> Self {
        Self {
            local_key,
            business_key,
            old_identity,
            new_identity,
            dependents: Vec::new(),
        }
    }

    pub fn with_dependents(mut self, dependents: Vec<StableIdentity>) -> Self {
        self.dependents = dependents;
        self
    }

    fn ledger_key(&self) -> (BusinessKey, StableIdentity, StableIdentity) {
        (self.business_key.clone(), self.old_identity, self.new_identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub business_key: BusinessKey,
    pub old_identity: StableIdentity,
    pub new_identity: StableIdentity,
    pub moved: Vec<StableIdentity>,
    /// Portable by kind but closed, so left with the old identity.
    pub skipped_closed: Vec<StableIdentity>,
    pub repointed_builders: usize,
    /// Whether this job had already been completed earlier in the run.
    pub already_completed: bool,
    pub completed_at: DateTime<Utc>,
}

impl MigrationReport {
    fn empty(job: &MigrationJob, already_completed: bool) -> Self {
        Self {
            business_key: job.business_key.clone(),
            old_identity: job.old_identity,
            new_identity: job.new_identity,
            moved: Vec::new(),
            skipped_closed: Vec::new(),
            repointed_builders: 0,
            already_completed,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub detected: u64,
    pub executed: u64,
    pub moved: u64,
}

/// Re-points portable dependents when a business key changes owner.
pub struct MigrationCoordinator {
    resolver: Arc<IdentityResolver>,
    writer: Arc<EntityWriter>,
    builders: Arc<BuilderCache>,
    policy: MigrationPolicy,
    completed: Mutex<HashSet<(BusinessKey, StableIdentity, StableIdentity)>>,
    detected: AtomicU64,
    executed: AtomicU64,
    moved: AtomicU64,
}

impl MigrationCoordinator {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        writer: Arc<EntityWriter>,
        builders: Arc<BuilderCache>,
        policy: MigrationPolicy,
    ) -> Self {
        Self {
            resolver,
            writer,
            builders,
            policy,
            completed: Mutex::new(HashSet::new()),
            detected: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            moved: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    /// Compares the current owner of `business_key` with `identity`.
    ///
    /// A first sighting registers the key and yields no job. A key of a
    /// different kind than `local_key` is a merge error.
    pub async fn detect(
        &self,
        local_key: &LocalKey,
        business_key: &BusinessKey,
        identity: StableIdentity,
    ) -> Result<Option<MigrationJob>> {
        if business_key.kind != local_key.entity_type {
            return Err(AssemblyError::Merge(format!(
                "{} does not identify {} entities",
                business_key, local_key.entity_type
            )));
        }
        match self.resolver.lookup_reverse(business_key).await? {
            None => {
                self.resolver.register_business_key(business_key, identity).await?;
                Ok(None)
            }
            Some(owner) if owner == identity => Ok(None),
            Some(old_identity) => {
                self.detected.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::INFO,
                    business_key = %business_key,
                    old = %old_identity,
                    new = %identity,
                    "business key reassignment detected"
                );
                Ok(Some(MigrationJob::new(
                    local_key.clone(),
                    business_key.clone(),
                    old_identity,
                    identity,
                )))
            }
        }
    }

    pub fn is_completed(&self, job: &MigrationJob) -> Result<bool> {
        Ok(self.completed.lock()?.contains(&job.ledger_key()))
    }

    /// Runs a job to completion. Every failure is a migration error.
    pub async fn execute(&self, job: &MigrationJob) -> Result<MigrationReport> {
        let span = info_span!(
            "migration",
            business_key = %job.business_key,
            old = %job.old_identity,
            new = %job.new_identity
        );
        self.execute_inner(job).instrument(span).await.map_err(|err| match err {
            AssemblyError::Migration(_) => err,
            other => AssemblyError::Migration(format!(
                "{} -> {} for {}: {}",
                job.old_identity, job.new_identity, job.business_key, other
            )),
        })
    }

    async fn execute_inner(&self, job: &MigrationJob) -> Result<MigrationReport> {
        if self.is_completed(job)? {
            event!(Level::DEBUG, "migration already completed");
            return Ok(MigrationReport::empty(job, true));
        }

        let resolved = self.resolver.lookup(&job.local_key).await?;
        if resolved != Some(job.new_identity) {
            return Err(AssemblyError::Migration(format!(
                "target identity {} for {} cannot be resolved (found {:?})",
                job.new_identity, job.local_key, resolved
            )));
        }

        // The key moves last; while the old owner is on record an interrupted
        // job is detected again on the next sighting.
        let mut report = MigrationReport::empty(job, false);
        for dependent in self.dependents(job).await? {
            match self.move_dependent(dependent, job).await? {
                Moved::Moved => report.moved.push(dependent),
                Moved::Closed => report.skipped_closed.push(dependent),
                Moved::NotApplicable => {}
            }
        }
        self.repoint_cached(job, &mut report).await?;

        self.resolver.repoint(&job.business_key, job.new_identity).await?;
        report.completed_at = Utc::now();

        self.completed.lock()?.insert(job.ledger_key());
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.moved.fetch_add(report.moved.len() as u64, Ordering::Relaxed);
        event!(
            Level::INFO,
            moved = report.moved.len(),
            skipped_closed = report.skipped_closed.len(),
            builders = report.repointed_builders,
            "migration complete"
        );
        Ok(report)
    }

    async fn dependents(&self, job: &MigrationJob) -> Result<BTreeSet<StableIdentity>> {
        let mut dependents = self
            .writer
            .store()
            .fetch_dependents(job.old_identity, &self.policy.portable_kinds)
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>();
        dependents.extend(job.dependents.iter().copied());
        Ok(dependents)
    }

    /// Re-points idle cached builders, holding back closed episodes the
    /// same way stored ones are.
    async fn repoint_cached(&self, job: &MigrationJob, report: &mut MigrationReport) -> Result<()> {
        let mut movable = Vec::new();
        for builder in self
            .builders
            .idle_dependents(job.old_identity, &self.policy.portable_kinds)?
        {
            let identity = builder.identity();
            let open = is_open(builder.kind(), builder.field("end"))
                && match self.writer.fetch(identity).await? {
                    Some(stored) => is_open(&stored.kind, stored.field("end")),
                    None => true,
                };
            if self.policy.open_episodes_only && !open {
                if !report.skipped_closed.contains(&identity) {
                    report.skipped_closed.push(identity);
                }
            } else {
                movable.push(identity);
            }
        }
        report.repointed_builders =
            self.builders
                .repoint_subject(job.old_identity, job.new_identity, &movable)?;
        Ok(())
    }

    async fn move_dependent(&self, identity: StableIdentity, job: &MigrationJob) -> Result<Moved> {
        let _guard = self.writer.lock(identity).await;
        let Some(mut entity) = self.writer.fetch(identity).await? else {
            return Ok(Moved::NotApplicable);
        };
        if entity.subject != Some(job.old_identity) || !self.is_portable(&entity.kind) {
            return Ok(Moved::NotApplicable);
        }
        if self.policy.open_episodes_only && !is_open(&entity.kind, entity.field("end")) {
            return Ok(Moved::Closed);
        }

        entity.subject = Some(job.new_identity);
        entity.version = entity.version.saturating_add(1);
        entity.updated_at = Utc::now();
        self.writer.upsert_locked(entity).await?;
        Ok(Moved::Moved)
    }

    fn is_portable(&self, kind: &EntityKind) -> bool {
        self.policy.portable_kinds.contains(kind)
    }

    pub fn stats(&self) -> MigrationStats {
        MigrationStats {
            detected: self.detected.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            moved: self.moved.load(Ordering::Relaxed),
        }
    }
}

enum Moved {
    Moved,
    Closed,
    NotApplicable,
}

/// Episodes are open until they carry a non-null `end`. Other kinds are
/// always considered open.
fn is_open(kind: &EntityKind, end: Option<&serde_json::Value>) -> bool {
    *kind != EntityKind::Episode || end.is_none_or(|end| end.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::EpochClock;
    use crate::deletion::{ChildRegistry, Tombstones};
    use crate::storage::{EntityStore, MemoryEntityStore, MemoryMappingStore, StoredEntity};
    use serde_json::json;

    struct Fixture {
        resolver: Arc<IdentityResolver>,
        store: Arc<MemoryEntityStore>,
        coordinator: MigrationCoordinator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(EpochClock::new());
        let store = Arc::new(MemoryEntityStore::new());
        let resolver = Arc::new(IdentityResolver::new(Arc::new(MemoryMappingStore::new()), None).unwrap());
        let writer = Arc::new(EntityWriter::new(
            store.clone(),
            Arc::new(Tombstones::new(clock.clone())),
            Arc::new(ChildRegistry::new()),
            RetryPolicy::default(),
        ));
        let coordinator = MigrationCoordinator::new(
            resolver.clone(),
            writer,
            Arc::new(BuilderCache::new(clock)),
            MigrationPolicy::default(),
        );
        Fixture {
            resolver,
            store,
            coordinator,
        }
    }

    async fn dependent(store: &MemoryEntityStore, kind: EntityKind, subject: StableIdentity) -> StableIdentity {
        let identity = StableIdentity::new();
        let mut entity = StoredEntity::new(identity, kind);
        entity.subject = Some(subject);
        store.upsert_entity(entity).await.unwrap();
        identity
    }

    #[tokio::test]
    async fn test_only_portable_open_dependents_move() {
        let fx = fixture();
        let mrn = BusinessKey::new(EntityKind::Patient, "MRN", "MRN123");
        let new_key = LocalKey::new("emis", EntityKind::Patient, "p2");
        let old = StableIdentity::new();
        let new = fx.resolver.resolve_or_create(&new_key).await.unwrap();
        fx.resolver.register_business_key(&mrn, old).await.unwrap();

        let problem = dependent(&fx.store, EntityKind::Problem, old).await;
        let encounter = dependent(&fx.store, EntityKind::Encounter, old).await;
        let closed = dependent(&fx.store, EntityKind::Episode, old).await;
        let mut episode = fx.store.fetch_entity(closed).await.unwrap().unwrap();
        episode.fields.insert("end".to_string(), json!("2024-01-31"));
        fx.store.upsert_entity(episode).await.unwrap();

        let job = fx.coordinator.detect(&new_key, &mrn, new).await.unwrap().unwrap();
        let report = fx.coordinator.execute(&job).await.unwrap();

        assert_eq!(report.moved, vec![problem]);
        assert_eq!(report.skipped_closed, vec![closed]);
        let untouched = fx.store.fetch_entity(encounter).await.unwrap().unwrap();
        assert_eq!(untouched.subject, Some(old));
        assert_eq!(fx.resolver.lookup_reverse(&mrn).await.unwrap(), Some(new));
    }

    #[tokio::test]
    async fn test_unresolvable_target_is_a_migration_error() {
        let fx = fixture();
        let mrn = BusinessKey::new(EntityKind::Patient, "MRN", "MRN9");
        let job = MigrationJob::new(
            LocalKey::new("emis", EntityKind::Patient, "never-seen"),
            mrn,
            StableIdentity::new(),
            StableIdentity::new(),
        );

        let err = fx.coordinator.execute(&job).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Migration(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_first_sighting_registers_without_job() {
        let fx = fixture();
        let mrn = BusinessKey::new(EntityKind::Patient, "MRN", "MRN5");
        let key = LocalKey::new("emis", EntityKind::Patient, "p5");
        let identity = fx.resolver.resolve_or_create(&key).await.unwrap();

        assert!(fx.coordinator.detect(&key, &mrn, identity).await.unwrap().is_none());
        assert!(fx.coordinator.detect(&key, &mrn, identity).await.unwrap().is_none());
        assert_eq!(fx.resolver.lookup_reverse(&mrn).await.unwrap(), Some(identity));
    }
}
