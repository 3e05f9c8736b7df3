use super::RowsetSharedPtr;
use crate::core::Result;
use std::sync::Mutex;
use tracing::{Level, event};

/// Counts from one sweep of [`UnusedRowsets`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Rowsets whose local files were deleted.
    pub reclaimed: usize,
    /// Rowsets still referenced by a reader and kept for the next sweep.
    pub deferred: usize,
    pub files_removed: usize,
}

/// Local copies replaced by a cooldown commit, waiting for their last reader.
///
/// The collector holds one reference to each rowset. A rowset is reclaimed
/// only when that reference is the last one, so an in-flight read of the
/// local bytes always completes.
#[derive(Default)]
pub struct UnusedRowsets {
    pending: Mutex<Vec<RowsetSharedPtr>>,
}

impl UnusedRowsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rowset: RowsetSharedPtr) -> Result<()> {
        let mut pending = self.pending.lock()?;
        if !pending
            .iter()
            .any(|existing| existing.rowset_id() == rowset.rowset_id())
        {
            pending.push(rowset);
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.pending.lock()?.is_empty())
    }

    pub async fn sweep(&self) -> Result<SweepStats> {
        let reclaimable: Vec<RowsetSharedPtr> = {
            let mut pending = self.pending.lock()?;
            let (free, busy): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|rowset| std::sync::Arc::strong_count(rowset) == 1);
            *pending = busy;
            free
        };

        let mut stats = SweepStats {
            deferred: self.len()?,
            ..SweepStats::default()
        };
        for rowset in reclaimable {
            match rowset.remove_local_files().await {
                Ok(removed) => {
                    stats.reclaimed += 1;
                    stats.files_removed += removed;
                    event!(
                        Level::DEBUG,
                        rowset_id = %rowset.rowset_id(),
                        files = removed,
                        "reclaimed local copy of cooled rowset"
                    );
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        rowset_id = %rowset.rowset_id(),
                        error = %err,
                        "failed to reclaim local rowset files, retrying on next sweep"
                    );
                    self.add(rowset)?;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RowsetId, Version};
    use crate::rowset::{Rowset, RowsetMeta, local_segment_path};
    use crate::storage::StorageRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_waits_for_last_reader() {
        let temp_dir = TempDir::new().unwrap();
        let id = RowsetId::new();
        let seg = local_segment_path(temp_dir.path(), &id, 0);
        std::fs::write(&seg, b"abc").unwrap();
        let rowset = Rowset::new(
            RowsetMeta::new_local(id, 1, Version::new(2, 2), 1, vec![3]),
            temp_dir.path().to_path_buf(),
            Arc::new(StorageRegistry::new()),
        );

        let unused = UnusedRowsets::new();
        let reader = rowset.clone();
        unused.add(rowset).unwrap();
        unused.add(reader.clone()).unwrap();
        assert_eq!(unused.len().unwrap(), 1);

        let stats = unused.sweep().await.unwrap();
        assert_eq!(stats.reclaimed, 0);
        assert_eq!(stats.deferred, 1);
        assert!(seg.exists());
        assert_eq!(reader.load_segments().await.unwrap()[0].data, b"abc");

        drop(reader);
        let stats = unused.sweep().await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.files_removed, 1);
        assert!(!seg.exists());
        assert!(unused.is_empty().unwrap());
    }
}
