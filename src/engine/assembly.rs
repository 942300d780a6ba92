use super::context::RunContext;
use super::manifest::{RunManifest, RunResult, RunStats};
use crate::builder::{EntityUpdate, ReturnDisposition, ReturnOutcome};
use crate::cache::TerminologyLookup;
use crate::config::RunPolicy;
use crate::core::{AssemblyError, BusinessKey, LocalKey, Result, SourceCoordinate, StableIdentity};
use crate::deletion::{DeletionReport, DeletionWarning};
use crate::source::{RecordSource, SourceRecord};
use crate::staging::DrainReport;
use crate::storage::{EntityStore, MappingStore};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Level, event, info_span};

#[derive(Default)]
struct RunCounters {
    records: AtomicU64,
    skipped: AtomicU64,
    merges: AtomicU64,
    batches: AtomicU64,
    persisted: AtomicU64,
    skipped_stale: AtomicU64,
    deletions: AtomicU64,
    deletion_warnings: AtomicU64,
    cascade_failures: AtomicU64,
    migrations: AtomicU64,
    moved_dependents: AtomicU64,
}

impl RunCounters {
    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Orchestrates one assembly run: resolution, merging, persistence,
/// deletion and migration.
///
/// Resolution and merge errors skip the record and land in the manifest.
/// Any other error aborts the run after in-flight persistence has drained;
/// later calls then fail with [`AssemblyError::RunAborted`].
pub struct AssemblyEngine {
    context: RunContext,
    manifest: Mutex<RunManifest>,
    failures: Mutex<Vec<AssemblyError>>,
    aborted: AtomicBool,
    counters: RunCounters,
}

impl AssemblyEngine {
    pub fn new(
        entity_store: Arc<dyn EntityStore>,
        mapping_store: Arc<dyn MappingStore>,
        policy: RunPolicy,
    ) -> Result<Self> {
        Ok(Self {
            context: RunContext::new(entity_store, mapping_store, policy)?,
            manifest: Mutex::new(RunManifest::new()),
            failures: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            counters: RunCounters::default(),
        })
    }

    /// Attaches a terminology lookup, fronted by a negative cache.
    pub fn with_terminology(mut self, lookup: Arc<dyn TerminologyLookup>) -> Result<Self> {
        self.context.attach_terminology(lookup)?;
        Ok(self)
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub async fn lookup_code(&self, code_system: &str, code: &str) -> Result<Option<String>> {
        let terminology = self.context.terminology().ok_or_else(|| {
            AssemblyError::Config("No terminology lookup is attached to this run".to_string())
        })?;
        terminology.lookup(code_system, code).await
    }

    /// Processes one source record.
    ///
    /// Returns `Ok` for records that were skipped with a manifest entry.
    pub async fn submit_record(&self, record: SourceRecord) -> Result<()> {
        self.ensure_running()?;
        self.counters.records.fetch_add(1, Ordering::Relaxed);

        let coordinate = record.coordinate.clone();
        let span = info_span!(
            "record",
            at = %coordinate,
            key = %record.local_key,
            active = record.active
        );
        match self.process(record).instrument(span).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_record_scoped() => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.manifest.lock()?.record_skip(&coordinate, err);
                Ok(())
            }
            Err(err) => Err(self.abort(err).await),
        }
    }

    /// Feeds every record of `source`, then ends the group.
    pub async fn run_source(&self, source: &mut dyn RecordSource) -> Result<u64> {
        let mut submitted = 0;
        loop {
            let next = match source.next().await {
                Ok(next) => next,
                Err(err) => return Err(self.abort(err).await),
            };
            let Some(record) = next else {
                break;
            };
            self.submit_record(record).await?;
            submitted += 1;
        }
        self.end_group().await?;
        Ok(submitted)
    }

    /// Signals that no more updates are expected for the cached builders:
    /// every builder with pending changes is staged.
    pub async fn end_group(&self) -> Result<usize> {
        self.ensure_running()?;
        match self.stage_ready().await {
            Ok(staged) => Ok(staged),
            Err(err) => Err(self.abort(err).await),
        }
    }

    /// Stages ready builders and dispatches the partial batch.
    pub async fn flush(&self) -> Result<()> {
        self.end_group().await?;
        if let Err(err) = self.context.staging.flush().await {
            return Err(self.abort(err).await);
        }
        Ok(())
    }

    /// Drain barrier: waits for every outstanding persistence task.
    ///
    /// A failed task aborts the run.
    pub async fn await_drain(&self) -> Result<DrainReport> {
        match self.drain_barrier().await {
            Ok(report) => Ok(report),
            Err(err) => Err(self.abort(err).await),
        }
    }

    /// Flushes, drains and reports the run.
    pub async fn await_completion(&self) -> RunResult {
        if !self.is_aborted() {
            if let Err(err) = self.flush().await {
                event!(Level::ERROR, error = %err, "final flush failed");
            }
        }
        if let Err(err) = self.drain_barrier().await {
            self.abort(err).await;
        }

        let failures = self
            .failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_else(|err| vec![AssemblyError::from(err)]);
        let manifest = self
            .manifest
            .lock()
            .map(|manifest| manifest.clone())
            .unwrap_or_default();
        let succeeded = failures.is_empty() && !self.is_aborted();

        event!(
            Level::INFO,
            succeeded,
            failures = failures.len(),
            manifest_entries = manifest.len(),
            "run complete"
        );
        RunResult {
            succeeded,
            failures,
            manifest,
            stats: self.stats(),
        }
    }

    pub fn stats(&self) -> RunStats {
        let resolver = self.context.resolver.stats();
        let c = &self.counters;
        RunStats {
            records: RunCounters::get(&c.records),
            skipped: RunCounters::get(&c.skipped),
            identities_created: resolver.created,
            resolver_negative_hits: resolver.forward_cache.negative_hits
                + resolver.reverse_cache.negative_hits,
            merges: RunCounters::get(&c.merges),
            batches: RunCounters::get(&c.batches),
            persisted: RunCounters::get(&c.persisted),
            skipped_stale: RunCounters::get(&c.skipped_stale),
            deletions: RunCounters::get(&c.deletions),
            deletion_warnings: RunCounters::get(&c.deletion_warnings),
            cascade_failures: RunCounters::get(&c.cascade_failures),
            migrations: RunCounters::get(&c.migrations),
            moved_dependents: RunCounters::get(&c.moved_dependents),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_aborted() {
            let cause = self
                .failures
                .lock()?
                .first()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown cause".to_string());
            return Err(AssemblyError::RunAborted(cause));
        }
        Ok(())
    }

    async fn process(&self, record: SourceRecord) -> Result<()> {
        if !record.active {
            return self.process_inactive(record).await;
        }
        if let Some(business_key) = &record.business_key {
            ensure_key_kind(&record.local_key, business_key)?;
        }

        let resolver = &self.context.resolver;
        let identity = resolver.resolve_or_create(&record.local_key).await?;

        let mut update = EntityUpdate {
            fields: record.fields,
            ..EntityUpdate::default()
        };
        if let Some(subject) = &record.references.subject {
            update.subject = Some(resolver.resolve_or_create(subject).await?);
        }
        if let Some(parent) = &record.references.parent {
            update.parent = Some(resolver.resolve_or_create(parent).await?);
        }
        let parent = update.parent;

        if let Some(business_key) = &record.business_key {
            self.migrate_if_reassigned(&record.local_key, business_key, identity)
                .await?;
        }

        let builders = &self.context.builders;
        let (token, builder) = builders.checkout(identity, &record.local_key.entity_type)?;
        let outcome = builders.return_builder(token, builder, update, ReturnDisposition::AwaitMore)?;
        self.counters.merges.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = parent {
            self.context.children.record(parent, identity)?;
        }

        match outcome {
            ReturnOutcome::Cached => Ok(()),
            ReturnOutcome::Staged(builder) => self.context.staging.enqueue(builder).await,
            ReturnOutcome::Deleted(builder) => {
                let report = self.context.deletion.delete_builder(builder).await?;
                self.record_deletion(&record.coordinate, report)
            }
        }
    }

    async fn process_inactive(&self, record: SourceRecord) -> Result<()> {
        let Some(identity) = self.context.resolver.lookup(&record.local_key).await? else {
            event!(Level::WARN, key = %record.local_key, "inactive record for unknown entity");
            self.counters.deletion_warnings.fetch_add(1, Ordering::Relaxed);
            self.manifest
                .lock()?
                .record_warning(&record.coordinate, DeletionWarning::unknown_key(&record.local_key));
            return Ok(());
        };

        let builders = &self.context.builders;
        let (token, mut builder) = builders.checkout(identity, &record.local_key.entity_type)?;
        builder.mark_deleted();
        match builders.return_builder(token, builder, EntityUpdate::default(), ReturnDisposition::AwaitMore)? {
            ReturnOutcome::Deleted(builder) => {
                let report = self.context.deletion.delete_builder(builder).await?;
                self.record_deletion(&record.coordinate, report)
            }
            _ => Err(AssemblyError::InvariantViolation(format!(
                "builder for {} was marked deleted but not routed to deletion",
                identity
            ))),
        }
    }

    async fn migrate_if_reassigned(
        &self,
        local_key: &LocalKey,
        business_key: &BusinessKey,
        identity: StableIdentity,
    ) -> Result<()> {
        let migration = &self.context.migration;
        let Some(job) = migration.detect(local_key, business_key, identity).await? else {
            return Ok(());
        };

        // Dependents submitted earlier must be durable before they are moved.
        self.drain_barrier().await?;
        let report = migration.execute(&job).await?;
        self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        RunCounters::add(&self.counters.moved_dependents, report.moved.len());
        Ok(())
    }

    fn record_deletion(&self, coordinate: &SourceCoordinate, report: DeletionReport) -> Result<()> {
        RunCounters::add(&self.counters.deletions, report.deleted.len());
        RunCounters::add(&self.counters.deletion_warnings, report.warnings.len());
        RunCounters::add(&self.counters.cascade_failures, report.failures.len());

        let mut manifest = self.manifest.lock()?;
        for warning in report.warnings {
            manifest.record_warning(coordinate, warning);
        }
        for failure in report.failures {
            manifest.record_cascade_failure(coordinate, failure.identity, failure.error);
        }
        Ok(())
    }

    async fn stage_ready(&self) -> Result<usize> {
        let ready = self.context.builders.drain_ready()?;
        let staged = ready.len();
        for builder in ready {
            self.context.staging.enqueue(builder).await?;
        }
        if staged > 0 {
            event!(Level::DEBUG, staged, "group ended");
        }
        Ok(staged)
    }

    /// Drains the worker pool. Failed tasks mark the run aborted and are
    /// recorded individually before the summary error is returned.
    async fn drain_barrier(&self) -> Result<DrainReport> {
        let report = self.context.staging.await_drain().await?;
        RunCounters::add(&self.counters.batches, report.batches);
        RunCounters::add(&self.counters.persisted, report.persisted);
        RunCounters::add(&self.counters.skipped_stale, report.skipped_stale);

        if !report.is_clean() {
            self.aborted.store(true, Ordering::SeqCst);
            let mut failures = self.failures.lock()?;
            failures.extend(report.failures.iter().map(|failure| failure.error.clone()));
        }
        report.into_result()
    }

    /// Marks the run aborted and lets in-flight work finish. Returns `err`.
    async fn abort(&self, err: AssemblyError) -> AssemblyError {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return err;
        }

        event!(Level::ERROR, error = %err, kind = err.kind(), "run aborted");
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(err.clone());
        }

        match self.context.staging.await_drain().await {
            Ok(report) => {
                RunCounters::add(&self.counters.batches, report.batches);
                RunCounters::add(&self.counters.persisted, report.persisted);
                RunCounters::add(&self.counters.skipped_stale, report.skipped_stale);
                if let Ok(mut failures) = self.failures.lock() {
                    failures.extend(report.failures.into_iter().map(|failure| failure.error));
                }
            }
            Err(drain_err) => {
                if let Ok(mut failures) = self.failures.lock() {
                    failures.push(drain_err);
                }
            }
        }
        err
    }
}

/// A business key identifies entities of one kind only.
fn ensure_key_kind(local_key: &LocalKey, business_key: &BusinessKey) -> Result<()> {
    if business_key.kind != local_key.entity_type {
        return Err(AssemblyError::Merge(format!(
            "{} record {} cannot carry {} business key {}",
            local_key.entity_type, local_key, business_key.kind, business_key
        )));
    }
    Ok(())
}
