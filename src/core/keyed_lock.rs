use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-key async locks.
///
/// Serializes work on a single key (identity creation, entity writes) while
/// leaving unrelated keys free to proceed. Slots are created on demand and
/// dropped once no caller holds or waits on them.
pub struct KeyedLocks<K> {
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let slot = {
            // A poisoned table only means another caller panicked while
            // inserting or removing a slot; the map itself is still coherent.
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = slot.lock_owned().await;
        KeyedGuard {
            key: key.clone(),
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or contended.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Release before inspecting the count so waiters see the unlock.
        self.guard.take();
        let idle = slots
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&self.key);
        }
    }
}
