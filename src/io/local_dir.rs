use super::{BatchReport, RemoteBackend, RemoteFileReader, RemoteFileWriter};
use crate::config::CooldownConfig;
use crate::core::{CooldownError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// A [`RemoteBackend`] that keeps its objects in a local directory.
///
/// Serves as the test backend and as the backend for remote filesystems that
/// are mounted locally. Files become visible only once fully written and
/// synced (write to a temp sibling, fsync, rename).
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    id: String,
    root: PathBuf,
    op_timeout: Option<Duration>,
}

impl LocalDirBackend {
    pub fn new<P: AsRef<Path>>(root: P, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().to_path_buf(),
            op_timeout: None,
        }
    }

    /// Backend whose operations honor `config.backend_op_timeout`.
    pub fn from_config<P: AsRef<Path>>(root: P, id: impl Into<String>, config: &CooldownConfig) -> Self {
        let backend = Self::new(root, id);
        match config.backend_op_timeout {
            Some(timeout) => backend.with_op_timeout(timeout),
            None => backend,
        }
    }

    /// Fails any single operation that runs longer than `timeout`.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Absolute location of a backend-relative path.
    pub fn full_path(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(CooldownError::Io(format!(
                "Path '{}' escapes backend root of '{}'",
                path.display(),
                self.id
            )));
        }
        Ok(self.root.join(path))
    }

    async fn timed<T, F>(&self, op: &str, path: &Path, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>> + Send,
    {
        let result = match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                CooldownError::Io(format!(
                    "{} '{}' on backend '{}' timed out after {:?}",
                    op,
                    path.display(),
                    self.id,
                    limit
                ))
            })?,
            None => fut.await,
        };
        result.map_err(|e| {
            CooldownError::Io(format!(
                "{} '{}' on backend '{}' failed: {}",
                op,
                path.display(),
                self.id,
                e
            ))
        })
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

async fn copy_durably(src: &Path, dest: &Path) -> std::io::Result<()> {
    ensure_parent(dest).await?;
    let temp = temp_sibling(dest);
    if let Err(err) = fs::copy(src, &temp).await {
        fs::remove_file(&temp).await.ok();
        return Err(err);
    }
    let file = OpenOptions::new().write(true).open(&temp).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, dest).await
}

async fn read_range(path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl RemoteBackend for LocalDirBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn connect(&self) -> Result<()> {
        let root = self.root.clone();
        self.timed("connect", Path::new(""), fs::create_dir_all(root))
            .await
    }

    async fn create_file(&self, path: &Path) -> Result<Box<dyn RemoteFileWriter>> {
        let final_path = self.full_path(path)?;
        let temp_path = temp_sibling(&final_path);
        let file = self
            .timed("create_file", path, async {
                ensure_parent(&final_path).await?;
                File::create(&temp_path).await
            })
            .await?;
        Ok(Box::new(LocalDirFileWriter {
            path: path.to_path_buf(),
            final_path,
            temp_path,
            file: Some(file),
            bytes_appended: 0,
        }))
    }

    async fn open_file(&self, path: &Path) -> Result<Box<dyn RemoteFileReader>> {
        let full = self.full_path(path)?;
        let metadata = self.timed("open_file", path, fs::metadata(&full)).await?;
        Ok(Box::new(LocalDirFileReader {
            path: path.to_path_buf(),
            full_path: full,
            size: metadata.len(),
            op_timeout: self.op_timeout,
        }))
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        let full = self.full_path(path)?;
        self.timed("delete_file", path, async {
            match fs::remove_file(&full).await {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        let full = self.full_path(path)?;
        self.timed("create_directory", path, fs::create_dir_all(&full))
            .await
    }

    async fn delete_directory(&self, path: &Path) -> Result<()> {
        let full = self.full_path(path)?;
        self.timed("delete_directory", path, async {
            match fs::remove_dir_all(&full).await {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn link_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let src_full = self.full_path(src)?;
        let dest_full = self.full_path(dest)?;
        self.timed("link_file", dest, async {
            ensure_parent(&dest_full).await?;
            fs::hard_link(&src_full, &dest_full).await
        })
        .await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let full = self.full_path(path)?;
        self.timed("exists", path, fs::try_exists(&full)).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        let full = self.full_path(path)?;
        let metadata = self.timed("file_size", path, fs::metadata(&full)).await?;
        Ok(metadata.len())
    }

    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let full = self.full_path(path)?;
        let root = self.root.clone();
        self.timed("list", path, async move {
            let mut files = Vec::new();
            let mut entries = match fs::read_dir(&full).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(".tmp") {
                    continue;
                }
                let absolute = entry.path();
                let relative = absolute
                    .strip_prefix(&root)
                    .map(Path::to_path_buf)
                    .unwrap_or(absolute);
                files.push(relative);
            }
            files.sort();
            Ok(files)
        })
        .await
    }

    async fn upload(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let dest = self.full_path(remote_path)?;
        self.timed("upload", remote_path, copy_durably(local_path, &dest))
            .await
    }

    async fn batch_upload(&self, items: &[(PathBuf, PathBuf)]) -> BatchReport {
        let uploads = items
            .iter()
            .map(|(local, remote)| async move { (remote.clone(), self.upload(local, remote).await) });
        let mut report = BatchReport::default();
        for (remote, result) in futures::future::join_all(uploads).await {
            report.push(remote, result);
        }
        report
    }
}

struct LocalDirFileWriter {
    path: PathBuf,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    bytes_appended: u64,
}

impl LocalDirFileWriter {
    fn closed_error(&self) -> CooldownError {
        CooldownError::Io(format!("Writer for '{}' is already closed", self.path.display()))
    }
}

#[async_trait]
impl RemoteFileWriter for LocalDirFileWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let closed = self.closed_error();
        let file = self.file.as_mut().ok_or(closed)?;
        file.write_all(data).await?;
        self.bytes_appended += data.len() as u64;
        Ok(())
    }

    fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    async fn close(&mut self) -> Result<()> {
        let closed = self.closed_error();
        let mut file = self.file.take().ok_or(closed)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        if self.file.take().is_some() {
            match fs::remove_file(&self.temp_path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

struct LocalDirFileReader {
    path: PathBuf,
    full_path: PathBuf,
    size: u64,
    op_timeout: Option<Duration>,
}

#[async_trait]
impl RemoteFileReader for LocalDirFileReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(CooldownError::Io(format!(
                "Read of {} bytes at {} is past the end of '{}' ({} bytes)",
                len,
                offset,
                self.path.display(),
                self.size
            )));
        }
        let read = read_range(&self.full_path, offset, len);
        let result = match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
                CooldownError::Io(format!(
                    "Read of '{}' timed out after {:?}",
                    self.path.display(),
                    limit
                ))
            })?,
            None => read.await,
        };
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(temp_dir: &TempDir) -> LocalDirBackend {
        LocalDirBackend::new(temp_dir.path().join("remote"), "10000")
    }

    #[tokio::test]
    async fn test_write_read_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let fs = backend(&temp_dir);
        fs.connect().await.unwrap();

        let path = Path::new("data/10005/a_0.dat");
        fs.write_bytes(path, b"segment-bytes").await.unwrap();

        assert!(fs.exists(path).await.unwrap());
        assert_eq!(fs.file_size(path).await.unwrap(), 13);
        assert_eq!(fs.read_bytes(path).await.unwrap(), b"segment-bytes");

        let reader = fs.open_file(path).await.unwrap();
        assert_eq!(reader.read_at(8, 5).await.unwrap(), b"bytes");
        assert!(reader.read_at(10, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_aborted_writer_leaves_nothing_visible() {
        let temp_dir = TempDir::new().unwrap();
        let fs = backend(&temp_dir);

        let path = Path::new("data/1/partial.dat");
        let mut writer = fs.create_file(path).await.unwrap();
        writer.append(b"half").await.unwrap();
        assert_eq!(writer.bytes_appended(), 4);
        writer.abort().await.unwrap();

        assert!(!fs.exists(path).await.unwrap());
        assert!(fs.list(Path::new("data/1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_relative_to_root() {
        let temp_dir = TempDir::new().unwrap();
        let fs = backend(&temp_dir);

        fs.write_bytes(Path::new("data/7/b.dat"), b"b").await.unwrap();
        fs.write_bytes(Path::new("data/7/a.dat"), b"a").await.unwrap();
        fs.create_directory(Path::new("data/7/nested")).await.unwrap();

        let listed = fs.list(Path::new("data/7")).await.unwrap();
        assert_eq!(
            listed,
            vec![PathBuf::from("data/7/a.dat"), PathBuf::from("data/7/b.dat")]
        );
        assert!(fs.list(Path::new("data/missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_link_and_batch_delete() {
        let temp_dir = TempDir::new().unwrap();
        let fs = backend(&temp_dir);
        let local = temp_dir.path().join("local.dat");
        std::fs::write(&local, b"local-data").unwrap();

        let items = vec![
            (local.clone(), PathBuf::from("data/1/x_0.dat")),
            (temp_dir.path().join("missing.dat"), PathBuf::from("data/1/x_1.dat")),
        ];
        let report = fs.batch_upload(&items).await;
        assert_eq!(report.succeeded_count(), 1);
        assert!(!report.is_complete());
        let failed: Vec<_> = report.failed().map(|item| item.path.clone()).collect();
        assert_eq!(failed, vec![PathBuf::from("data/1/x_1.dat")]);

        fs.link_file(Path::new("data/1/x_0.dat"), Path::new("data/2/x_0.dat"))
            .await
            .unwrap();
        assert_eq!(fs.read_bytes(Path::new("data/2/x_0.dat")).await.unwrap(), b"local-data");

        let report = fs
            .batch_delete(&[PathBuf::from("data/1/x_0.dat"), PathBuf::from("data/1/never.dat")])
            .await;
        assert!(report.is_complete());
        assert!(!fs.exists(Path::new("data/1/x_0.dat")).await.unwrap());
        assert!(fs.exists(Path::new("data/2/x_0.dat")).await.unwrap());

        fs.delete_directory(Path::new("data/2")).await.unwrap();
        assert!(!fs.exists(Path::new("data/2/x_0.dat")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let temp_dir = TempDir::new().unwrap();
        let fs = backend(&temp_dir);
        assert!(fs.exists(Path::new("../escape")).await.is_err());
        assert!(fs.full_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_from_config_carries_op_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let config = CooldownConfig::new(temp_dir.path());
        assert_eq!(LocalDirBackend::from_config(temp_dir.path(), "1", &config).op_timeout, None);

        let config = config.backend_op_timeout(Duration::from_millis(250));
        assert_eq!(
            LocalDirBackend::from_config(temp_dir.path(), "1", &config).op_timeout,
            Some(Duration::from_millis(250))
        );
    }
}
