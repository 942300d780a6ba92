use crate::core::{EpochClock, Result, StableIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Marker for an identity deleted during this run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tombstone {
    pub identity: StableIdentity,
    pub epoch: u64,
    pub deleted_at: DateTime<Utc>,
}

/// Run-scoped deletion markers.
///
/// A builder born before its identity's tombstone is stale: persisting it
/// would revive a deleted entity.
pub struct Tombstones {
    clock: Arc<EpochClock>,
    entries: Mutex<HashMap<StableIdentity, Tombstone>>,
}

impl Tombstones {
    pub fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, identity: StableIdentity) -> Result<Tombstone> {
        let tombstone = Tombstone {
            identity,
            epoch: self.clock.tick(),
            deleted_at: Utc::now(),
        };
        self.entries.lock()?.insert(identity, tombstone.clone());
        Ok(tombstone)
    }

    pub fn get(&self, identity: StableIdentity) -> Result<Option<Tombstone>> {
        Ok(self.entries.lock()?.get(&identity).cloned())
    }

    /// Whether a builder born at `born_epoch` predates the identity's deletion.
    pub fn is_stale(&self, identity: StableIdentity, born_epoch: u64) -> Result<bool> {
        Ok(self
            .entries
            .lock()?
            .get(&identity)
            .map(|tombstone| tombstone.epoch > born_epoch)
            .unwrap_or(false))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Children recorded for each parent during this run.
#[derive(Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<StableIdentity, BTreeSet<StableIdentity>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, parent: StableIdentity, child: StableIdentity) -> Result<()> {
        self.children.lock()?.entry(parent).or_default().insert(child);
        Ok(())
    }

    pub fn children_of(&self, parent: StableIdentity) -> Result<BTreeSet<StableIdentity>> {
        Ok(self
            .children
            .lock()?
            .get(&parent)
            .cloned()
            .unwrap_or_default())
    }

    pub fn forget(&self, parent: StableIdentity) -> Result<BTreeSet<StableIdentity>> {
        Ok(self.children.lock()?.remove(&parent).unwrap_or_default())
    }
}
