use crate::core::{AssemblyError, SourceCoordinate, StableIdentity};
use crate::deletion::DeletionWarning;
use log::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntryKind {
    /// Record skipped after a resolution or merge error.
    Skipped { error: AssemblyError },
    Warning { warning: DeletionWarning },
    /// A child could not be deleted while cascading from this record.
    CascadeFailure {
        identity: StableIdentity,
        error: AssemblyError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub coordinate: SourceCoordinate,
    pub kind: ManifestEntryKind,
}

/// Records skipped or warned about during a run, by source coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunManifest {
    entries: Vec<ManifestEntry>,
}

impl RunManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&mut self, coordinate: &SourceCoordinate, error: AssemblyError) {
        warn!(
            "record skipped: at='{}' kind='{}' error='{}'",
            coordinate,
            error.kind(),
            error
        );
        self.push(coordinate, ManifestEntryKind::Skipped { error });
    }

    pub fn record_warning(&mut self, coordinate: &SourceCoordinate, warning: DeletionWarning) {
        warn!("deletion warning: at='{}' {}", coordinate, warning);
        self.push(coordinate, ManifestEntryKind::Warning { warning });
    }

    pub fn record_cascade_failure(
        &mut self,
        coordinate: &SourceCoordinate,
        identity: StableIdentity,
        error: AssemblyError,
    ) {
        warn!(
            "cascade delete failed: at='{}' child='{}' error='{}'",
            coordinate, identity, error
        );
        self.push(coordinate, ManifestEntryKind::CascadeFailure { identity, error });
    }

    fn push(&mut self, coordinate: &SourceCoordinate, kind: ManifestEntryKind) {
        self.entries.push(ManifestEntry {
            coordinate: coordinate.clone(),
            kind,
        });
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.kind, ManifestEntryKind::Skipped { .. }))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.kind, ManifestEntryKind::Warning { .. }))
    }

    pub fn cascade_failures(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.kind, ManifestEntryKind::CascadeFailure { .. }))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub records: u64,
    pub skipped: u64,
    pub identities_created: u64,
    pub resolver_negative_hits: u64,
    pub merges: u64,
    pub batches: u64,
    pub persisted: u64,
    pub skipped_stale: u64,
    pub deletions: u64,
    pub deletion_warnings: u64,
    pub cascade_failures: u64,
    pub migrations: u64,
    pub moved_dependents: u64,
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub succeeded: bool,
    pub failures: Vec<AssemblyError>,
    pub manifest: RunManifest,
    pub stats: RunStats,
}

impl RunResult {
    pub fn first_failure(&self) -> Option<&AssemblyError> {
        self.failures.first()
    }
}
