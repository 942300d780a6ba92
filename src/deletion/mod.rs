pub mod handler;
pub mod tombstone;

pub use handler::{CascadeFailure, DeletionHandler, DeletionReport, DeletionWarning};
pub use tombstone::{ChildRegistry, Tombstone, Tombstones};
