pub mod assembly;
pub mod context;
pub mod manifest;

pub use assembly::AssemblyEngine;
pub use context::RunContext;
pub use manifest::{ManifestEntry, ManifestEntryKind, RunManifest, RunResult, RunStats};
