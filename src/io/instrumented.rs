use super::{BatchReport, RemoteBackend, RemoteFileReader, RemoteFileWriter};
use crate::core::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of how often each backend operation was invoked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOpStats {
    pub uploads: u64,
    pub batch_uploads: u64,
    pub links: u64,
    pub creates: u64,
    pub opens: u64,
    pub deletes: u64,
    pub exists_checks: u64,
    pub lists: u64,
}

#[derive(Default)]
struct Counters {
    uploads: AtomicU64,
    batch_uploads: AtomicU64,
    links: AtomicU64,
    creates: AtomicU64,
    opens: AtomicU64,
    deletes: AtomicU64,
    exists_checks: AtomicU64,
    lists: AtomicU64,
}

/// Wraps a backend and counts calls per operation.
///
/// Batch uploads count once in `batch_uploads` and once per item in `uploads`.
pub struct InstrumentedBackend<B> {
    inner: B,
    counters: Arc<Counters>,
}

impl<B: RemoteBackend> InstrumentedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn stats(&self) -> BackendOpStats {
        let c = &self.counters;
        BackendOpStats {
            uploads: c.uploads.load(Ordering::Relaxed),
            batch_uploads: c.batch_uploads.load(Ordering::Relaxed),
            links: c.links.load(Ordering::Relaxed),
            creates: c.creates.load(Ordering::Relaxed),
            opens: c.opens.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            exists_checks: c.exists_checks.load(Ordering::Relaxed),
            lists: c.lists.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

#[async_trait]
impl<B: RemoteBackend> RemoteBackend for InstrumentedBackend<B> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn root(&self) -> &Path {
        self.inner.root()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn create_file(&self, path: &Path) -> Result<Box<dyn RemoteFileWriter>> {
        Self::bump(&self.counters.creates, 1);
        self.inner.create_file(path).await
    }

    async fn open_file(&self, path: &Path) -> Result<Box<dyn RemoteFileReader>> {
        Self::bump(&self.counters.opens, 1);
        self.inner.open_file(path).await
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        Self::bump(&self.counters.deletes, 1);
        self.inner.delete_file(path).await
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        self.inner.create_directory(path).await
    }

    async fn delete_directory(&self, path: &Path) -> Result<()> {
        self.inner.delete_directory(path).await
    }

    async fn link_file(&self, src: &Path, dest: &Path) -> Result<()> {
        Self::bump(&self.counters.links, 1);
        self.inner.link_file(src, dest).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Self::bump(&self.counters.exists_checks, 1);
        self.inner.exists(path).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        self.inner.file_size(path).await
    }

    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        Self::bump(&self.counters.lists, 1);
        self.inner.list(path).await
    }

    async fn upload(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        Self::bump(&self.counters.uploads, 1);
        self.inner.upload(local_path, remote_path).await
    }

    async fn batch_upload(&self, items: &[(PathBuf, PathBuf)]) -> BatchReport {
        Self::bump(&self.counters.batch_uploads, 1);
        Self::bump(&self.counters.uploads, items.len() as u64);
        self.inner.batch_upload(items).await
    }

    async fn batch_delete(&self, paths: &[PathBuf]) -> BatchReport {
        Self::bump(&self.counters.deletes, paths.len() as u64);
        self.inner.batch_delete(paths).await
    }
}
