use crate::builder::EntityBuilder;
use crate::config::RetryPolicy;
use crate::core::{AssemblyError, KeyedGuard, KeyedLocks, Result, StableIdentity};
use crate::deletion::{ChildRegistry, Tombstones};
use crate::storage::{EntityStore, StoredEntity};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    /// The identity was deleted after the builder was created.
    SkippedStale,
}

/// Single point through which entity content reaches the durable store.
///
/// Every write and delete for one identity holds that identity's lock, so a
/// persistence task, a deletion and a migration never interleave on the
/// same entity.
pub struct EntityWriter {
    store: Arc<dyn EntityStore>,
    locks: KeyedLocks<StableIdentity>,
    tombstones: Arc<Tombstones>,
    children: Arc<ChildRegistry>,
    retry: RetryPolicy,
}

impl EntityWriter {
    pub fn new(
        store: Arc<dyn EntityStore>,
        tombstones: Arc<Tombstones>,
        children: Arc<ChildRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            tombstones,
            children,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub async fn lock(&self, identity: StableIdentity) -> KeyedGuard<StableIdentity> {
        self.locks.lock(&identity).await
    }

    /// Merges a completed builder over the stored entity and writes it.
    pub async fn persist(&self, builder: EntityBuilder) -> Result<WriteOutcome> {
        let identity = builder.identity();
        let _guard = self.lock(identity).await;

        if self.tombstones.is_stale(identity, builder.born_epoch())? {
            event!(Level::DEBUG, identity = %identity, "stale builder skipped after deletion");
            return Ok(WriteOutcome::SkippedStale);
        }

        let base = self
            .with_retry(identity, "fetch", || self.store.fetch_entity(identity))
            .await?;
        let children = self.children.children_of(identity)?;
        let stored = builder.into_stored(base, children);
        self.upsert_locked(stored).await?;
        Ok(WriteOutcome::Persisted)
    }

    /// Writes an entity. The caller must hold the identity's lock.
    pub async fn upsert_locked(&self, entity: StoredEntity) -> Result<()> {
        let identity = entity.identity;
        self.with_retry(identity, "upsert", || self.store.upsert_entity(entity.clone()))
            .await
    }

    /// Deletes an entity. The caller must hold the identity's lock.
    pub async fn delete_locked(&self, identity: StableIdentity) -> Result<()> {
        self.with_retry(identity, "delete", || self.store.delete_entity(identity))
            .await
    }

    pub async fn fetch(&self, identity: StableIdentity) -> Result<Option<StoredEntity>> {
        self.with_retry(identity, "fetch", || self.store.fetch_entity(identity))
            .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        identity: StableIdentity,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err: Option<AssemblyError> = None;

        for attempt in 1..=max_attempts {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    event!(
                        Level::WARN,
                        identity = %identity,
                        operation,
                        attempt,
                        error = %err,
                        "entity store operation failed"
                    );
                    last_err = Some(err);
                }
            }

            if attempt < max_attempts {
                sleep(TokioDuration::from_millis(self.retry.backoff_ms(attempt))).await;
            }
        }

        let cause = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(AssemblyError::Persistence(format!(
            "{} of {} failed after {} attempts: {}",
            operation, identity, max_attempts, cause
        )))
    }
}
