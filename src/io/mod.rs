//! Remote storage abstraction used by the cooldown engine.
//!
//! A [`RemoteBackend`] is a flat object/file namespace rooted at
//! [`RemoteBackend::root`]; every path handed to it is relative to that root.
//! Implementations are selected when a storage resource is registered.

pub mod instrumented;
pub mod local_dir;

pub use instrumented::{BackendOpStats, InstrumentedBackend};
pub use local_dir::LocalDirBackend;

use crate::core::{CooldownError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Sequential writer for a new remote file.
#[async_trait]
pub trait RemoteFileWriter: Send {
    fn path(&self) -> &Path;

    async fn append(&mut self, data: &[u8]) -> Result<()>;

    fn bytes_appended(&self) -> u64;

    /// Makes the file visible; content is durable once this returns `Ok`.
    async fn close(&mut self) -> Result<()>;

    /// Drops everything written so far without publishing the file.
    async fn abort(&mut self) -> Result<()>;
}

/// Random-access reader over an existing remote file.
#[async_trait]
pub trait RemoteFileReader: Send + Sync {
    fn path(&self) -> &Path;

    fn size(&self) -> u64;

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    async fn read_all(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size())
            .map_err(|_| CooldownError::Io(format!("{} is too large", self.path().display())))?;
        self.read_at(0, size).await
    }
}

/// Capability set every remote store has to provide.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Identifier of the resource this backend serves.
    fn id(&self) -> &str;

    /// Root that all relative paths resolve against.
    fn root(&self) -> &Path;

    /// Idempotent readiness check.
    async fn connect(&self) -> Result<()>;

    async fn create_file(&self, path: &Path) -> Result<Box<dyn RemoteFileWriter>>;

    async fn open_file(&self, path: &Path) -> Result<Box<dyn RemoteFileReader>>;

    async fn delete_file(&self, path: &Path) -> Result<()>;

    async fn create_directory(&self, path: &Path) -> Result<()>;

    async fn delete_directory(&self, path: &Path) -> Result<()>;

    /// Server-side link of `src` to `dest` without copying bytes.
    async fn link_file(&self, src: &Path, dest: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn file_size(&self, path: &Path) -> Result<u64>;

    /// Lists files under `path`, returned relative to the backend root.
    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Copies a local file to `remote_path`; durable once this returns `Ok`.
    async fn upload(&self, local_path: &Path, remote_path: &Path) -> Result<()>;

    /// Uploads `(local, remote)` pairs. Not transactional: every item is
    /// attempted and reported on its own.
    async fn batch_upload(&self, items: &[(PathBuf, PathBuf)]) -> BatchReport {
        let mut report = BatchReport::default();
        for (local, remote) in items {
            let result = self.upload(local, remote).await;
            report.push(remote.clone(), result);
        }
        report
    }

    /// Deletes every path, reporting each outcome separately.
    async fn batch_delete(&self, paths: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        for path in paths {
            let result = self.delete_file(path).await;
            report.push(path.clone(), result);
        }
        report
    }

    async fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self.create_file(path).await?;
        if let Err(err) = writer.append(data).await {
            writer.abort().await.ok();
            return Err(err);
        }
        writer.close().await
    }

    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let reader = self.open_file(path).await?;
        reader.read_all().await
    }
}

impl fmt::Debug for dyn RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("id", &self.id())
            .field("root", &self.root())
            .finish()
    }
}

/// Outcome of one item of a batch operation.
#[derive(Debug)]
pub struct BatchItem {
    pub path: PathBuf,
    pub result: Result<()>,
}

/// Per-item results of a batch upload or delete.
#[derive(Debug, Default)]
pub struct BatchReport {
    items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn push(&mut self, path: PathBuf, result: Result<()>) {
        self.items.push(BatchItem { path, result });
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when every item succeeded.
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|item| item.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|item| item.result.is_err())
    }

    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|item| item.result.is_ok()).count()
    }

    /// Collapses the report into one error naming every failed item.
    pub fn summarize_failures(&self) -> Option<String> {
        let failures: Vec<String> = self
            .failed()
            .map(|item| match &item.result {
                Err(err) => format!("{} ({})", item.path.display(), err),
                Ok(()) => item.path.display().to_string(),
            })
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(format!(
                "{} of {} items failed: {}",
                failures.len(),
                self.items.len(),
                failures.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_tracks_items_individually() {
        let mut report = BatchReport::default();
        report.push(PathBuf::from("data/1/a_0.dat"), Ok(()));
        report.push(
            PathBuf::from("data/1/a_1.dat"),
            Err(CooldownError::Io("connection reset".to_string())),
        );
        report.push(PathBuf::from("data/1/a_2.dat"), Ok(()));

        assert_eq!(report.len(), 3);
        assert!(!report.is_complete());
        assert_eq!(report.succeeded_count(), 2);

        let failed: Vec<_> = report.failed().map(|item| item.path.clone()).collect();
        assert_eq!(failed, vec![PathBuf::from("data/1/a_1.dat")]);

        let summary = report.summarize_failures().unwrap();
        assert!(summary.starts_with("1 of 3 items failed"));
        assert!(summary.contains("connection reset"));
    }

    #[test]
    fn test_empty_report_is_complete() {
        let report = BatchReport::default();
        assert!(report.is_empty());
        assert!(report.is_complete());
        assert!(report.summarize_failures().is_none());
    }
}
