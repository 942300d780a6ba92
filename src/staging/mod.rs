pub mod batch;
pub mod pool;
pub mod writer;

pub use batch::Batch;
pub use pool::{BatchReport, DrainReport, PersistenceFailure, StagingQueue, StagingStats};
pub use writer::{EntityWriter, WriteOutcome};
