use super::batch::Batch;
use super::writer::{EntityWriter, WriteOutcome};
use crate::builder::EntityBuilder;
use crate::config::StagingPolicy;
use crate::core::{AssemblyError, Result, StableIdentity};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, Level, event, info_span};

/// A builder that could not be written, or a task that died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceFailure {
    pub identity: Option<StableIdentity>,
    pub error: AssemblyError,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batch_id: u64,
    pub persisted: usize,
    pub skipped_stale: usize,
    pub failures: Vec<PersistenceFailure>,
}

/// Everything observed by the worker pool since the previous drain.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub batches: usize,
    pub persisted: usize,
    pub skipped_stale: usize,
    pub failures: Vec<PersistenceFailure>,
}

impl DrainReport {
    fn absorb(&mut self, batch: BatchReport) {
        self.batches += 1;
        self.persisted += batch.persisted;
        self.skipped_stale += batch.skipped_stale;
        self.failures.extend(batch.failures);
    }

    fn absorb_join(&mut self, joined: std::result::Result<BatchReport, JoinError>) {
        match joined {
            Ok(batch) => self.absorb(batch),
            Err(err) => {
                self.batches += 1;
                self.failures.push(PersistenceFailure {
                    identity: None,
                    error: AssemblyError::Persistence(format!("persistence task failed: {}", err)),
                });
            }
        }
    }

    fn merge(&mut self, other: DrainReport) {
        self.batches += other.batches;
        self.persisted += other.persisted;
        self.skipped_stale += other.skipped_stale;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Escalates recorded failures into a single persistence error.
    pub fn into_result(self) -> Result<DrainReport> {
        let Some(first) = self.failures.first() else {
            return Ok(self);
        };
        Err(AssemblyError::Persistence(format!(
            "{} entity write(s) failed; first: {}",
            self.failures.len(),
            first.error
        )))
    }
}

/// Counters accumulated over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub enqueued: u64,
    pub batches_dispatched: u64,
    pub withdrawn: u64,
    pub pending: usize,
}

/// Batches completed builders and persists them on a bounded worker pool.
pub struct StagingQueue {
    writer: Arc<EntityWriter>,
    batch_size: usize,
    active: Mutex<Batch>,
    next_batch_id: AtomicU64,
    permits: Arc<Semaphore>,
    tasks: AsyncMutex<JoinSet<BatchReport>>,
    reaped: Mutex<DrainReport>,
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    withdrawn: AtomicU64,
}

impl StagingQueue {
    pub fn new(writer: Arc<EntityWriter>, policy: &StagingPolicy) -> Self {
        let batch_size = policy.batch_size.max(1);
        Self {
            writer,
            batch_size,
            active: Mutex::new(Batch::new(1, batch_size)),
            next_batch_id: AtomicU64::new(2),
            permits: Arc::new(Semaphore::new(policy.max_inflight_batches.max(1))),
            tasks: AsyncMutex::new(JoinSet::new()),
            reaped: Mutex::new(DrainReport::default()),
            enqueued: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            withdrawn: AtomicU64::new(0),
        }
    }

    /// Appends to the active batch, dispatching it once it is full.
    pub async fn enqueue(&self, builder: EntityBuilder) -> Result<()> {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let full = {
            let mut active = self.active.lock()?;
            if active.push(builder) {
                Some(self.swap_active(&mut active))
            } else {
                None
            }
        };

        match full {
            Some(batch) => self.dispatch(batch).await,
            None => Ok(()),
        }
    }

    /// Dispatches the current partial batch, if any.
    pub async fn flush(&self) -> Result<()> {
        let partial = {
            let mut active = self.active.lock()?;
            if active.is_empty() {
                None
            } else {
                Some(self.swap_active(&mut active))
            }
        };

        match partial {
            Some(batch) => self.dispatch(batch).await,
            None => Ok(()),
        }
    }

    /// Removes a builder that has not been handed to a worker yet.
    pub fn withdraw(&self, identity: StableIdentity) -> Result<Option<EntityBuilder>> {
        let withdrawn = self.active.lock()?.withdraw(identity);
        if withdrawn.is_some() {
            self.withdrawn.fetch_add(1, Ordering::Relaxed);
        }
        Ok(withdrawn)
    }

    /// Flushes the partial batch and waits for every outstanding task.
    ///
    /// Failures are reported, not raised; tasks that are still running are
    /// always allowed to finish.
    pub async fn await_drain(&self) -> Result<DrainReport> {
        self.flush().await?;

        let mut report = DrainReport::default();
        {
            let mut tasks = self.tasks.lock().await;
            while let Some(joined) = tasks.join_next().await {
                report.absorb_join(joined);
            }
        }

        let reaped = std::mem::take(&mut *self.reaped.lock()?);
        report.merge(reaped);
        event!(
            Level::DEBUG,
            batches = report.batches,
            persisted = report.persisted,
            failures = report.failures.len(),
            "staging queue drained"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StagingStats {
        StagingStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            batches_dispatched: self.dispatched.load(Ordering::Relaxed),
            withdrawn: self.withdrawn.load(Ordering::Relaxed),
            pending: self.active.lock().map(|active| active.len()).unwrap_or(0),
        }
    }

    fn swap_active(&self, active: &mut Batch) -> Batch {
        let next_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        std::mem::replace(active, Batch::new(next_id, self.batch_size))
    }

    async fn dispatch(&self, batch: Batch) -> Result<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AssemblyError::Persistence("worker pool is closed".to_string()))?;

        let span = info_span!("staging.batch", batch_id = batch.id(), size = batch.len());
        let writer = self.writer.clone();
        let mut tasks = self.tasks.lock().await;

        // Collect finished tasks so the set does not grow for the whole run.
        while let Some(joined) = tasks.try_join_next() {
            self.reaped.lock()?.absorb_join(joined);
        }

        tasks.spawn(
            async move {
                let _permit = permit;
                persist_batch(writer, batch).await
            }
            .instrument(span),
        );
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn persist_batch(writer: Arc<EntityWriter>, batch: Batch) -> BatchReport {
    let mut report = BatchReport {
        batch_id: batch.id(),
        ..BatchReport::default()
    };

    for builder in batch.into_builders() {
        let identity = builder.identity();
        match writer.persist(builder).await {
            Ok(WriteOutcome::Persisted) => report.persisted += 1,
            Ok(WriteOutcome::SkippedStale) => report.skipped_stale += 1,
            Err(error) => {
                event!(Level::ERROR, identity = %identity, error = %error, "entity persist failed");
                report.failures.push(PersistenceFailure {
                    identity: Some(identity),
                    error,
                });
            }
        }
    }

    event!(
        Level::DEBUG,
        persisted = report.persisted,
        skipped = report.skipped_stale,
        "batch persisted"
    );
    report
}
