// ============================================================================
// clinmerge: clinical entity resolution and incremental merge
// ============================================================================

pub mod builder;
pub mod cache;
pub mod config;
pub mod core;
pub mod deletion;
pub mod engine;
pub mod migration;
pub mod prelude;
pub mod resolve;
pub mod source;
pub mod staging;
pub mod storage;

// Re-export main types for convenience
pub use config::{CachePolicy, MigrationPolicy, RetryPolicy, RunPolicy, StagingPolicy};
pub use core::{
    AssemblyError, BusinessKey, EntityKind, FieldSet, LocalKey, Result, SourceCoordinate,
    StableIdentity,
};
pub use engine::{AssemblyEngine, RunContext, RunManifest, RunResult, RunStats};
pub use source::{RecordReferences, RecordSource, SourceRecord, VecRecordSource};
pub use storage::{
    EntityStore, FileMappingStore, MappingStore, MemoryEntityStore, MemoryMappingStore,
    StoredEntity,
};

/// Assembles the in-memory stores and an engine with the default policy.
///
/// # Examples
///
/// ```
/// use clinmerge::{EntityKind, LocalKey, SourceCoordinate, SourceRecord};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let (engine, entities) = clinmerge::in_memory().unwrap();
/// let key = LocalKey::new("emis", EntityKind::Encounter, "100");
///
/// engine
///     .submit_record(
///         SourceRecord::active(SourceCoordinate::new("encounters.csv", 1), key.clone())
///             .field("class", json!("INPATIENT")),
///     )
///     .await
///     .unwrap();
/// let result = engine.await_completion().await;
///
/// assert!(result.succeeded);
/// let identity = engine.context().resolver().lookup(&key).await.unwrap().unwrap();
/// use clinmerge::EntityStore;
/// let stored = entities.fetch_entity(identity).await.unwrap().unwrap();
/// assert_eq!(stored.field("class"), Some(&json!("INPATIENT")));
/// # });
/// ```
pub fn in_memory() -> Result<(AssemblyEngine, std::sync::Arc<MemoryEntityStore>)> {
    let entities = std::sync::Arc::new(MemoryEntityStore::new());
    let engine = AssemblyEngine::new(
        entities.clone(),
        std::sync::Arc::new(MemoryMappingStore::new()),
        RunPolicy::default(),
    )?;
    Ok((engine, entities))
}
