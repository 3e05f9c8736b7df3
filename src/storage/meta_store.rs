//! Durable tablet metadata store

use crate::core::{CooldownError, Result, SchemaHash, TabletId};
use crate::tablet::TabletMeta;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Single-writer store of tablet metadata. `save` replaces the whole record
/// atomically: after a crash either the old or the new version is visible.
pub trait TabletMetaStore: Send + Sync {
    fn save(&self, meta: &TabletMeta) -> Result<()>;

    fn load(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<Option<TabletMeta>>;

    fn remove(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<()>;

    fn list(&self) -> Result<Vec<(TabletId, SchemaHash)>>;
}

// ============================================================================
// File Meta Store
// ============================================================================

/// One MessagePack file per tablet: `<dir>/<tablet_id>_<schema_hash>.meta`.
pub struct FileMetaStore {
    dir: PathBuf,
}

impl FileMetaStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            CooldownError::MetadataPersistError(format!(
                "Failed to create meta directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> PathBuf {
        self.dir.join(format!("{}_{}.meta", tablet_id, schema_hash))
    }

    fn parse_file_name(name: &str) -> Option<(TabletId, SchemaHash)> {
        let stem = name.strip_suffix(".meta")?;
        let (tablet, hash) = stem.split_once('_')?;
        Some((tablet.parse().ok()?, hash.parse().ok()?))
    }
}

impl TabletMetaStore for FileMetaStore {
    fn save(&self, meta: &TabletMeta) -> Result<()> {
        let path = self.meta_path(meta.tablet_id, meta.schema_hash);
        let serialized = rmp_serde::to_vec(meta).map_err(|e| {
            CooldownError::MetadataPersistError(format!("Failed to serialize tablet meta: {}", e))
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| {
            CooldownError::MetadataPersistError(format!("Failed to create temp file: {}", e))
        })?;
        temp.write_all(&serialized).map_err(|e| {
            CooldownError::MetadataPersistError(format!("Failed to write tablet meta: {}", e))
        })?;
        temp.as_file().sync_all().map_err(|e| {
            CooldownError::MetadataPersistError(format!("Failed to sync tablet meta: {}", e))
        })?;
        temp.persist(&path).map_err(|e| {
            CooldownError::MetadataPersistError(format!(
                "Failed to rename tablet meta into '{}': {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    fn load(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<Option<TabletMeta>> {
        let path = self.meta_path(tablet_id, schema_hash);
        if !path.exists() {
            return Ok(None);
        }
        let mut data = Vec::new();
        File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(|e| CooldownError::Io(format!("Failed to read '{}': {}", path.display(), e)))?;
        let meta: TabletMeta = rmp_serde::from_slice(&data).map_err(|e| {
            CooldownError::Corruption(format!(
                "Failed to deserialize tablet meta '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(meta))
    }

    fn remove(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<()> {
        let path = self.meta_path(tablet_id, schema_hash);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                CooldownError::MetadataPersistError(format!(
                    "Failed to delete '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(TabletId, SchemaHash)>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(Self::parse_file_name) {
                keys.push(key);
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RowsetId, Version};
    use crate::rowset::RowsetMeta;
    use tempfile::TempDir;

    fn sample_meta(tablet_id: TabletId) -> TabletMeta {
        let mut meta = TabletMeta::new(tablet_id, 270068377, 10009);
        meta.rowsets.push(RowsetMeta::new_local(
            RowsetId::new(),
            tablet_id,
            Version::new(0, 1),
            0,
            vec![],
        ));
        meta
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::open(temp_dir.path()).unwrap();
        let meta = sample_meta(10005);

        store.save(&meta).unwrap();
        let loaded = store.load(10005, 270068377).unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(store.load(10006, 270068377).unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_without_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::open(temp_dir.path()).unwrap();
        let mut meta = sample_meta(10005);
        store.save(&meta).unwrap();

        meta.storage_policy_id = 10002;
        store.save(&meta).unwrap();

        let loaded = store.load(10005, 270068377).unwrap().unwrap();
        assert_eq!(loaded.storage_policy_id, 10002);
        let files: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_list_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::open(temp_dir.path()).unwrap();
        store.save(&sample_meta(10006)).unwrap();
        store.save(&sample_meta(10005)).unwrap();
        fs::write(temp_dir.path().join("README"), b"not a meta").unwrap();

        assert_eq!(
            store.list().unwrap(),
            vec![(10005, 270068377), (10006, 270068377)]
        );

        store.remove(10005, 270068377).unwrap();
        store.remove(10005, 270068377).unwrap();
        assert_eq!(store.list().unwrap(), vec![(10006, 270068377)]);
    }

    #[test]
    fn test_corrupt_meta_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::open(temp_dir.path()).unwrap();
        fs::write(store.meta_path(1, 2), b"\xc1garbage").unwrap();

        assert!(matches!(store.load(1, 2), Err(CooldownError::Corruption(_))));
    }
}
