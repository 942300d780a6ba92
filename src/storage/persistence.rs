//! File-backed mapping store so identities survive across runs.

use super::MappingStore;
use super::memory::MappingTables;
use crate::core::{AssemblyError, BusinessKey, LocalKey, Result, StableIdentity};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};

const MAPPING_FORMAT_VERSION: u16 = 1;

/// On-disk layout of the mapping snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub format_version: u16,
    pub created_at_unix_ms: i64,
    pub forward: Vec<(LocalKey, StableIdentity)>,
    pub reverse: Vec<(BusinessKey, StableIdentity)>,
}

impl MappingSnapshot {
    fn from_tables(tables: &MappingTables) -> Self {
        let mut forward = tables
            .forward
            .iter()
            .map(|(key, identity)| (key.clone(), *identity))
            .collect::<Vec<_>>();
        forward.sort();
        let mut reverse = tables
            .reverse
            .iter()
            .map(|(key, identity)| (key.clone(), *identity))
            .collect::<Vec<_>>();
        reverse.sort();

        Self {
            format_version: MAPPING_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            forward,
            reverse,
        }
    }

    fn into_tables(self) -> MappingTables {
        MappingTables {
            forward: self.forward.into_iter().collect(),
            reverse: self.reverse.into_iter().collect(),
        }
    }
}

/// Mapping store persisted as a MessagePack snapshot.
///
/// Every mutation rewrites the snapshot through a temp file in the same
/// directory, then renames it over the previous one. A mutation becomes
/// visible to readers only after its snapshot is on disk.
pub struct FileMappingStore {
    path: PathBuf,
    tables: RwLock<MappingTables>,
    // Serializes writers; readers never wait on snapshot I/O.
    writer: Mutex<()>,
}

impl FileMappingStore {
    /// Opens the store at `path`, loading an existing snapshot if present.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    AssemblyError::IoError(format!("Failed to create mapping directory: {}", e))
                })?;
            }
        }

        let tables = match load_snapshot(&path)? {
            Some(snapshot) => snapshot.into_tables(),
            None => MappingTables::default(),
        };

        Ok(Self {
            path,
            tables: RwLock::new(tables),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn forward_len(&self) -> usize {
        self.tables.read().await.forward.len()
    }

    /// Applies `mutate` to a copy of the tables and publishes the copy once
    /// its snapshot is written. On error the visible tables are unchanged.
    async fn commit<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut MappingTables) -> bool,
    {
        let _writer = self.writer.lock().await;
        let mut staged = self.tables.read().await.clone();
        if !mutate(&mut staged) {
            return Ok(false);
        }
        self.save(&staged).await?;
        *self.tables.write().await = staged;
        Ok(true)
    }

    async fn save(&self, tables: &MappingTables) -> Result<()> {
        let snapshot = MappingSnapshot::from_tables(tables);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .map_err(|e| AssemblyError::IoError(format!("Mapping snapshot task failed: {}", e)))?
    }
}

fn load_snapshot(path: &Path) -> Result<Option<MappingSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)
        .map_err(|e| AssemblyError::IoError(format!("Failed to read mapping snapshot: {}", e)))?;
    let snapshot: MappingSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
        AssemblyError::Serialization(format!("Failed to deserialize mapping snapshot: {}", e))
    })?;
    if snapshot.format_version != MAPPING_FORMAT_VERSION {
        return Err(AssemblyError::Serialization(format!(
            "Unsupported mapping snapshot version {}",
            snapshot.format_version
        )));
    }
    Ok(Some(snapshot))
}

fn write_snapshot(path: &Path, snapshot: &MappingSnapshot) -> Result<()> {
    let serialized = rmp_serde::to_vec(snapshot).map_err(|e| {
        AssemblyError::Serialization(format!("Failed to serialize mapping snapshot: {}", e))
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = NamedTempFile::new_in(&dir)
        .map_err(|e| AssemblyError::IoError(format!("Failed to create temp file: {}", e)))?;
    temp.write_all(&serialized)
        .map_err(|e| AssemblyError::IoError(format!("Failed to write mapping snapshot: {}", e)))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| AssemblyError::IoError(format!("Failed to sync mapping snapshot: {}", e)))?;
    temp.persist(path)
        .map_err(|e| AssemblyError::IoError(format!("Failed to rename mapping snapshot: {}", e)))?;
    Ok(())
}

#[async_trait]
impl MappingStore for FileMappingStore {
    async fn get(&self, key: &LocalKey) -> Result<Option<StableIdentity>> {
        Ok(self.tables.read().await.forward.get(key).copied())
    }

    async fn put(&self, key: &LocalKey, identity: StableIdentity) -> Result<()> {
        self.commit(|tables| tables.put(key, identity)).await.map(|_| ())
    }

    async fn get_reverse(&self, key: &BusinessKey) -> Result<Option<StableIdentity>> {
        Ok(self.tables.read().await.reverse.get(key).copied())
    }

    async fn put_reverse(&self, key: &BusinessKey, identity: StableIdentity) -> Result<()> {
        self.commit(|tables| tables.put_reverse(key, identity)).await.map(|_| ())
    }

    async fn repoint(&self, key: &BusinessKey, identity: StableIdentity) -> Result<bool> {
        self.commit(|tables| tables.repoint(key, identity)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mappings_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mappings").join("identity.msgpack");
        let encounter = LocalKey::new("emis:practice-1", EntityKind::Encounter, "100");
        let mrn = BusinessKey::new(EntityKind::Patient, "MRN", "MRN123");
        let encounter_id = StableIdentity::new();
        let patient_id = StableIdentity::new();

        {
            let store = FileMappingStore::open(&path).unwrap();
            store.put(&encounter, encounter_id).await.unwrap();
            assert!(store.repoint(&mrn, patient_id).await.unwrap());
        }

        let reopened = FileMappingStore::open(&path).unwrap();
        assert_eq!(reopened.get(&encounter).await.unwrap(), Some(encounter_id));
        assert_eq!(reopened.get_reverse(&mrn).await.unwrap(), Some(patient_id));
        assert_eq!(reopened.get(&mrn.local_key()).await.unwrap(), Some(patient_id));
        assert_eq!(reopened.forward_len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_mapping_unpublished() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("mappings");
        let path = dir.join("identity.msgpack");
        let encounter = LocalKey::new("emis:practice-1", EntityKind::Encounter, "100");
        let store = FileMappingStore::open(&path).unwrap();

        fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(
            store.put(&encounter, StableIdentity::new()).await,
            Err(AssemblyError::IoError(_))
        ));
        assert_eq!(store.get(&encounter).await.unwrap(), None);
        assert_eq!(store.forward_len().await, 0);

        fs::create_dir_all(&dir).unwrap();
        let identity = StableIdentity::new();
        store.put(&encounter, identity).await.unwrap();
        let reopened = FileMappingStore::open(&path).unwrap();
        assert_eq!(reopened.get(&encounter).await.unwrap(), Some(identity));
    }

    #[test]
    fn test_corrupt_snapshot_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.msgpack");
        fs::write(&path, b"not msgpack").unwrap();
        assert!(matches!(
            FileMappingStore::open(&path),
            Err(AssemblyError::Serialization(_))
        ));
    }
}
