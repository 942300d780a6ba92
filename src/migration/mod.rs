pub mod coordinator;

pub use coordinator::{MigrationCoordinator, MigrationJob, MigrationReport, MigrationStats};
