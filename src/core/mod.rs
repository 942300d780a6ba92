pub mod clock;
pub mod error;
pub mod keyed_lock;
pub mod types;

pub use clock::EpochClock;
pub use error::{AssemblyError, Result};
pub use keyed_lock::{KeyedGuard, KeyedLocks};
pub use types::{BusinessKey, EntityKind, FieldSet, LocalKey, SourceCoordinate, StableIdentity};
