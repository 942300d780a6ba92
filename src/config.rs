use crate::core::{AssemblyError, EntityKind, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Batching and worker-pool limits for background persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagingPolicy {
    /// Builders per batch before it is handed to the worker pool.
    pub batch_size: usize,
    /// Maximum number of batches persisting concurrently.
    pub max_inflight_batches: usize,
}

impl Default for StagingPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_inflight_batches: 8,
        }
    }
}

/// Retry behavior for store writes made by the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retrying after `attempt` failures.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Capacities of the run-scoped negative caches. `None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachePolicy {
    pub resolver_capacity: Option<usize>,
    pub terminology_capacity: Option<usize>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            resolver_capacity: None,
            terminology_capacity: Some(100_000),
        }
    }
}

/// Which dependents follow a business key when it moves to a new identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPolicy {
    pub portable_kinds: Vec<EntityKind>,
    /// Only move episodes that have not ended.
    pub open_episodes_only: bool,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            portable_kinds: vec![EntityKind::Problem, EntityKind::Episode],
            open_episodes_only: true,
        }
    }
}

/// Settings for one assembly run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunPolicy {
    #[serde(default)]
    pub staging: StagingPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub migration: MigrationPolicy,
}

impl RunPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of builders per persistence batch
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.staging.batch_size = batch_size;
        self
    }

    /// Set the maximum number of concurrently persisting batches
    pub fn max_inflight_batches(mut self, max: usize) -> Self {
        self.staging.max_inflight_batches = max;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolver_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache.resolver_capacity = capacity;
        self
    }

    pub fn terminology_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache.terminology_capacity = capacity;
        self
    }

    pub fn portable_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.migration.portable_kinds = kinds;
        self
    }

    pub fn open_episodes_only(mut self, open_only: bool) -> Self {
        self.migration.open_episodes_only = open_only;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| AssemblyError::Config(format!("Invalid run policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AssemblyError::Config(format!("Failed to read run policy {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.staging.batch_size == 0 {
            return Err(AssemblyError::Config(
                "staging.batch_size must be at least 1".to_string(),
            ));
        }
        if self.staging.max_inflight_batches == 0 {
            return Err(AssemblyError::Config(
                "staging.max_inflight_batches must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AssemblyError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.cache.resolver_capacity == Some(0) || self.cache.terminology_capacity == Some(0) {
            return Err(AssemblyError::Config(
                "cache capacities must be greater than zero when set".to_string(),
            ));
        }
        if self.migration.portable_kinds.is_empty() {
            return Err(AssemblyError::Config(
                "migration.portable_kinds must name at least one kind".to_string(),
            ));
        }
        Ok(())
    }
}
