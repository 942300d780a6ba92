pub mod negative;
pub mod terminology;

pub use negative::{Lookup, NegativeCache, NegativeCacheStats};
pub use terminology::{CachedTerminology, TerminologyLookup};
