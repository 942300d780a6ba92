//! Types needed to drive a run, grouped for glob import.
//!
//! `use clinmerge::prelude::*;` covers the engine, records, stores and policy.
//! Lower-level pieces (builder cache, staging queue, coordinators) stay under
//! their own modules.

pub use crate::builder::EntityUpdate;
pub use crate::cache::TerminologyLookup;
pub use crate::config::RunPolicy;
pub use crate::core::{
    AssemblyError, BusinessKey, EntityKind, LocalKey, Result, SourceCoordinate, StableIdentity,
};
pub use crate::deletion::DeletionWarning;
pub use crate::engine::{AssemblyEngine, ManifestEntryKind, RunResult};
pub use crate::source::{RecordSource, SourceRecord, VecRecordSource};
pub use crate::storage::{
    EntityStore, FileMappingStore, MappingStore, MemoryEntityStore, MemoryMappingStore,
};
