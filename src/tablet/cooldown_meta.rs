//! Remote cooldown meta: the document listing every cooled rowset of a tablet.
//!
//! Written by the lease holder after the segments it references, so its
//! presence is the only signal that an upload completed. Any replica that
//! later holds the lease under the same `(replica, term)` can adopt it.

use crate::core::{CooldownError, ReplicaId, ResourceId, Result, RowsetId, TabletId, Version};
use crate::rowset::{RowsetMeta, remote_tablet_dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// `data/<tablet_id>/<replica_id>.<term>.meta`
pub fn remote_cooldown_meta_path(tablet_id: TabletId, replica_id: ReplicaId, term: u64) -> PathBuf {
    remote_tablet_dir(tablet_id).join(format!("{}.{}.meta", replica_id, term))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooledRowset {
    pub rowset_id: RowsetId,
    pub version: Version,
    pub num_rows: u64,
    pub segment_sizes: Vec<u64>,
    pub segment_paths: Vec<PathBuf>,
    pub resource_id: ResourceId,
    pub newest_write_timestamp: DateTime<Utc>,
}

impl CooledRowset {
    /// Entry for a rowset that already lives on `resource_id`.
    pub fn from_meta(meta: &RowsetMeta) -> Option<Self> {
        Some(Self {
            rowset_id: meta.rowset_id,
            version: meta.version,
            num_rows: meta.num_rows,
            segment_sizes: meta.segment_sizes.clone(),
            segment_paths: meta.remote_segment_paths.clone(),
            resource_id: meta.resource_id?,
            newest_write_timestamp: meta.newest_write_timestamp,
        })
    }

    /// Rowset meta for `tablet_id` pointing at `segment_paths`.
    pub fn to_rowset_meta(&self, tablet_id: TabletId, segment_paths: Vec<PathBuf>) -> RowsetMeta {
        RowsetMeta {
            rowset_id: self.rowset_id,
            tablet_id,
            version: self.version,
            num_rows: self.num_rows,
            segment_sizes: self.segment_sizes.clone(),
            newest_write_timestamp: self.newest_write_timestamp,
            resource_id: Some(self.resource_id),
            remote_segment_paths: segment_paths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownMeta {
    pub cooldown_meta_id: Uuid,
    pub tablet_id: TabletId,
    pub replica_id: ReplicaId,
    pub term: u64,
    /// Cooled rowsets in version order.
    pub rowsets: Vec<CooledRowset>,
}

impl CooldownMeta {
    pub fn new(tablet_id: TabletId, replica_id: ReplicaId, term: u64, mut rowsets: Vec<CooledRowset>) -> Self {
        rowsets.sort_by_key(|rs| rs.version);
        Self {
            cooldown_meta_id: Uuid::new_v4(),
            tablet_id,
            replica_id,
            term,
            rowsets,
        }
    }

    pub fn path(&self) -> PathBuf {
        remote_cooldown_meta_path(self.tablet_id, self.replica_id, self.term)
    }

    pub fn find(&self, version: Version) -> Option<&CooledRowset> {
        self.rowsets.iter().find(|rs| rs.version == version)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            CooldownError::UploadFailure(format!("Failed to encode cooldown meta: {}", e))
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(data).map_err(|e| {
            CooldownError::Corruption(format!("Failed to decode cooldown meta: {}", e))
        })?;
        for rowset in &meta.rowsets {
            if rowset.segment_paths.len() != rowset.segment_sizes.len() {
                return Err(CooldownError::Corruption(format!(
                    "cooldown meta {} lists {} paths for {} segments of rowset {}",
                    meta.cooldown_meta_id,
                    rowset.segment_paths.len(),
                    rowset.segment_sizes.len(),
                    rowset.rowset_id
                )));
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cooled(version: Version) -> CooledRowset {
        let id = RowsetId::new();
        CooledRowset {
            rowset_id: id,
            version,
            num_rows: 1,
            segment_sizes: vec![10],
            segment_paths: vec![PathBuf::from(format!("data/10005/{}_0.dat", id))],
            resource_id: 10000,
            newest_write_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_meta_path_layout() {
        assert_eq!(
            remote_cooldown_meta_path(10005, 10009, 1),
            PathBuf::from("data/10005/10009.1.meta")
        );
    }

    #[test]
    fn test_rowsets_are_kept_in_version_order() {
        let meta = CooldownMeta::new(
            10005,
            10009,
            1,
            vec![cooled(Version::new(2, 2)), cooled(Version::new(0, 1))],
        );
        assert_eq!(meta.rowsets[0].version, Version::new(0, 1));
        assert!(meta.find(Version::new(2, 2)).is_some());
        assert!(meta.find(Version::new(3, 3)).is_none());
        assert_eq!(meta.path(), PathBuf::from("data/10005/10009.1.meta"));

        let decoded = CooldownMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_decode_rejects_inconsistent_entries() {
        let mut entry = cooled(Version::new(0, 1));
        entry.segment_paths.clear();
        let meta = CooldownMeta::new(1, 2, 3, vec![entry]);
        let data = serde_json::to_vec(&meta).unwrap();

        assert!(matches!(
            CooldownMeta::decode(&data),
            Err(CooldownError::Corruption(_))
        ));
        assert!(matches!(
            CooldownMeta::decode(b"{not json"),
            Err(CooldownError::Corruption(_))
        ));
    }
}
