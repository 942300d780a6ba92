use super::negative::{NegativeCache, NegativeCacheStats};
use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Code-system translation table, e.g. Read v2 or SNOMED CT descriptions.
#[async_trait]
pub trait TerminologyLookup: Send + Sync {
    async fn lookup(&self, code_system: &str, code: &str) -> Result<Option<String>>;
}

/// Terminology lookup fronted by a negative cache.
///
/// Large fractions of some code systems have no mapping at all, so confirmed
/// misses are cached just like hits.
pub struct CachedTerminology {
    inner: Arc<dyn TerminologyLookup>,
    cache: NegativeCache<(String, String), String>,
}

impl CachedTerminology {
    pub fn new(inner: Arc<dyn TerminologyLookup>, capacity: Option<usize>) -> Result<Self> {
        Ok(Self {
            inner,
            cache: NegativeCache::with_capacity(capacity)?,
        })
    }

    pub async fn lookup(&self, code_system: &str, code: &str) -> Result<Option<String>> {
        let key = (code_system.to_string(), code.to_string());
        self.cache
            .get_or_load(&key, || self.inner.lookup(code_system, code))
            .await
    }

    pub fn stats(&self) -> NegativeCacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl TerminologyLookup for CachedTerminology {
    async fn lookup(&self, code_system: &str, code: &str) -> Result<Option<String>> {
        CachedTerminology::lookup(self, code_system, code).await
    }
}
