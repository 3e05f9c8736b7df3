//! Rowsets: immutable, version-ranged groups of segment files.
//!
//! A rowset's data never changes after publish. Cooldown only changes where
//! the segments live, which is recorded in [`RowsetMeta::resource_id`] and
//! [`RowsetMeta::remote_segment_paths`].

pub mod unused;

pub use unused::{SweepStats, UnusedRowsets};

use crate::core::{CooldownError, ResourceId, Result, RowsetId, TabletId, Version};
use crate::io::RemoteBackend;
use crate::storage::StorageRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Local path of segment `idx` of a rowset inside a tablet data directory.
pub fn local_segment_path(tablet_dir: &Path, rowset_id: &RowsetId, idx: usize) -> PathBuf {
    tablet_dir.join(format!("{}_{}.dat", rowset_id, idx))
}

/// Remote directory shared by every replica of a tablet.
pub fn remote_tablet_dir(tablet_id: TabletId) -> PathBuf {
    PathBuf::from("data").join(tablet_id.to_string())
}

/// Remote path of segment `idx` of a rowset.
pub fn remote_segment_path(tablet_id: TabletId, rowset_id: &RowsetId, idx: usize) -> PathBuf {
    remote_tablet_dir(tablet_id).join(format!("{}_{}.dat", rowset_id, idx))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub version: Version,
    pub num_rows: u64,
    /// Byte size of every segment, in segment order.
    pub segment_sizes: Vec<u64>,
    pub newest_write_timestamp: DateTime<Utc>,
    /// `None` while the rowset lives on local disk.
    pub resource_id: Option<ResourceId>,
    /// Backend-relative segment paths; empty while local.
    pub remote_segment_paths: Vec<PathBuf>,
}

impl RowsetMeta {
    pub fn new_local(
        rowset_id: RowsetId,
        tablet_id: TabletId,
        version: Version,
        num_rows: u64,
        segment_sizes: Vec<u64>,
    ) -> Self {
        Self {
            rowset_id,
            tablet_id,
            version,
            num_rows,
            segment_sizes,
            newest_write_timestamp: Utc::now(),
            resource_id: None,
            remote_segment_paths: Vec::new(),
        }
    }

    pub fn with_newest_write_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.newest_write_timestamp = ts;
        self
    }

    pub fn num_segments(&self) -> usize {
        self.segment_sizes.len()
    }

    pub fn is_local(&self) -> bool {
        self.resource_id.is_none()
    }

    pub fn data_disk_size(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }

    /// Copy of this meta relocated to `resource_id`. Data fields are kept.
    pub fn to_remote(&self, resource_id: ResourceId, segment_paths: Vec<PathBuf>) -> Self {
        Self {
            resource_id: Some(resource_id),
            remote_segment_paths: segment_paths,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.version.is_valid() {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} has invalid version {}",
                self.rowset_id, self.version
            )));
        }
        if !self.is_local() && self.remote_segment_paths.len() != self.num_segments() {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} lists {} remote paths for {} segments",
                self.rowset_id,
                self.remote_segment_paths.len(),
                self.num_segments()
            )));
        }
        Ok(())
    }
}

/// Bytes of one segment as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub path: PathBuf,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Read handle for one rowset. Handed out by the tablet as [`RowsetSharedPtr`];
/// a handle keeps pointing at the location it was created with, so readers
/// that obtained it before a cooldown commit keep reading the local copy.
pub struct Rowset {
    meta: RowsetMeta,
    tablet_dir: PathBuf,
    registry: Arc<StorageRegistry>,
}

pub type RowsetSharedPtr = Arc<Rowset>;

impl Rowset {
    pub fn new(meta: RowsetMeta, tablet_dir: PathBuf, registry: Arc<StorageRegistry>) -> RowsetSharedPtr {
        Arc::new(Self {
            meta,
            tablet_dir,
            registry,
        })
    }

    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    pub fn rowset_id(&self) -> &RowsetId {
        &self.meta.rowset_id
    }

    pub fn version(&self) -> Version {
        self.meta.version
    }

    pub fn start_version(&self) -> i64 {
        self.meta.version.start
    }

    pub fn end_version(&self) -> i64 {
        self.meta.version.end
    }

    pub fn is_local(&self) -> bool {
        self.meta.is_local()
    }

    pub fn num_segments(&self) -> usize {
        self.meta.num_segments()
    }

    pub fn num_rows(&self) -> u64 {
        self.meta.num_rows
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        self.meta.resource_id
    }

    pub fn local_segment_paths(&self) -> Vec<PathBuf> {
        (0..self.num_segments())
            .map(|idx| local_segment_path(&self.tablet_dir, &self.meta.rowset_id, idx))
            .collect()
    }

    /// Backend holding this rowset, resolved on every call so a re-registered
    /// resource takes effect immediately.
    pub fn remote_backend(&self) -> Result<Option<Arc<dyn RemoteBackend>>> {
        let Some(resource_id) = self.meta.resource_id else {
            return Ok(None);
        };
        let resource = self.registry.get_storage_resource(resource_id)?.ok_or_else(|| {
            CooldownError::ConfigurationError(format!(
                "Storage resource {} of rowset {} is not registered",
                resource_id, self.meta.rowset_id
            ))
        })?;
        Ok(Some(resource.backend))
    }

    /// Reads every segment from wherever this handle says the rowset lives.
    pub async fn load_segments(&self) -> Result<Vec<Segment>> {
        let mut segments = Vec::with_capacity(self.num_segments());
        match self.remote_backend()? {
            None => {
                for (index, path) in self.local_segment_paths().into_iter().enumerate() {
                    let data = tokio::fs::read(&path).await.map_err(|e| {
                        CooldownError::Io(format!("Failed to read '{}': {}", path.display(), e))
                    })?;
                    segments.push(Segment { index, path, data });
                }
            }
            Some(backend) => {
                for (index, path) in self.meta.remote_segment_paths.iter().enumerate() {
                    let data = backend.read_bytes(path).await?;
                    segments.push(Segment {
                        index,
                        path: path.clone(),
                        data,
                    });
                }
            }
        }
        for segment in &segments {
            let expected = self.meta.segment_sizes.get(segment.index).copied();
            if expected != Some(segment.len() as u64) {
                return Err(CooldownError::Corruption(format!(
                    "segment {} of rowset {} is {} bytes, meta says {:?}",
                    segment.index,
                    self.meta.rowset_id,
                    segment.len(),
                    expected
                )));
            }
        }
        Ok(segments)
    }

    /// Deletes the local segment files; missing files are not an error.
    pub(crate) async fn remove_local_files(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.local_segment_paths() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CooldownError::Io(format!(
                        "Failed to delete '{}': {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for Rowset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rowset")
            .field("rowset_id", &self.meta.rowset_id.to_string())
            .field("version", &self.meta.version)
            .field("is_local", &self.is_local())
            .finish()
    }
}
