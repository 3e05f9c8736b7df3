#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tablet_cooldown::io::{
    BackendOpStats, BatchReport, RemoteFileReader, RemoteFileWriter,
};
use tablet_cooldown::rowset::local_segment_path;
use tablet_cooldown::{
    CooldownConfig, CooldownError, FileMetaStore, InstrumentedBackend, LocalDirBackend, PolicyId,
    RemoteBackend, ReplicaId, ResourceId, Result, RowsetId, RowsetMeta, RowsetSharedPtr,
    SchemaHash, StorageEngine, StoragePolicy, StorageRegistry, StorageResource, Tablet,
    TabletMeta, TabletMetaStore, TabletId, Version,
};
use tempfile::TempDir;

pub const RESOURCE_ID: ResourceId = 10000;
pub const POLICY_ID: PolicyId = 10002;
pub const REPLICA_ID: ReplicaId = 10009;
pub const OTHER_REPLICA_ID: ReplicaId = 111111111;
pub const SCHEMA_HASH: SchemaHash = 1;

type Hook = Box<dyn FnOnce() + Send>;

/// Local backend with call counters and injectable upload faults.
pub struct FaultyBackend {
    inner: InstrumentedBackend<LocalDirBackend>,
    fail_uploads: AtomicBool,
    stall_uploads: AtomicBool,
    before_upload: Mutex<Option<Hook>>,
}

impl FaultyBackend {
    pub fn new(root: &Path, config: &CooldownConfig) -> Self {
        Self {
            inner: InstrumentedBackend::new(LocalDirBackend::from_config(
                root,
                RESOURCE_ID.to_string(),
                config,
            )),
            fail_uploads: AtomicBool::new(false),
            stall_uploads: AtomicBool::new(false),
            before_upload: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> BackendOpStats {
        self.inner.stats()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Batch uploads never complete while set.
    pub fn set_stall_uploads(&self, stall: bool) {
        self.stall_uploads.store(stall, Ordering::SeqCst);
    }

    /// Runs `hook` once, right before the next batch upload starts.
    pub fn before_next_upload(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_upload.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn remote_file(&self, path: impl AsRef<Path>) -> PathBuf {
        self.inner.root().join(path)
    }
}

#[async_trait]
impl RemoteBackend for FaultyBackend {
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
        self.inner.create_file(path).await
    }

    async fn open_file(&self, path: &Path) -> Result<Box<dyn RemoteFileReader>> {
        self.inner.open_file(path).await
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.inner.delete_file(path).await
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        self.inner.create_directory(path).await
    }

    async fn delete_directory(&self, path: &Path) -> Result<()> {
        self.inner.delete_directory(path).await
    }

    async fn link_file(&self, src: &Path, dest: &Path) -> Result<()> {
        self.inner.link_file(src, dest).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        self.inner.file_size(path).await
    }

    async fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list(path).await
    }

    async fn upload(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        self.inner.upload(local_path, remote_path).await
    }

    async fn batch_upload(&self, items: &[(PathBuf, PathBuf)]) -> BatchReport {
        let hook = self.before_upload.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.stall_uploads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            let mut report = BatchReport::default();
            for (_, remote) in items {
                report.push(
                    remote.clone(),
                    Err(CooldownError::Io("injected upload failure".to_string())),
                );
            }
            return report;
        }
        self.inner.batch_upload(items).await
    }
}

/// File meta store whose saves can be made to fail.
pub struct FlakyMetaStore {
    inner: FileMetaStore,
    fail_saves: AtomicBool,
}

impl FlakyMetaStore {
    pub fn open(dir: &Path) -> Self {
        Self {
            inner: FileMetaStore::open(dir).unwrap(),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl TabletMetaStore for FlakyMetaStore {
    fn save(&self, meta: &TabletMeta) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CooldownError::Io("injected meta write failure".to_string()));
        }
        self.inner.save(meta)
    }

    fn load(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<Option<TabletMeta>> {
        self.inner.load(tablet_id, schema_hash)
    }

    fn remove(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<()> {
        self.inner.remove(tablet_id, schema_hash)
    }

    fn list(&self) -> Result<Vec<(TabletId, SchemaHash)>> {
        self.inner.list()
    }
}

pub struct Harness {
    pub temp_dir: TempDir,
    pub config: CooldownConfig,
    pub registry: Arc<StorageRegistry>,
    pub backend: Arc<FaultyBackend>,
    pub meta_store: Arc<FlakyMetaStore>,
    pub engine: StorageEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(customize: impl FnOnce(CooldownConfig) -> CooldownConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = customize(CooldownConfig::new(temp_dir.path().join("storage")));
        let backend = Arc::new(FaultyBackend::new(&temp_dir.path().join("remote"), &config));
        let registry = Arc::new(StorageRegistry::new());
        registry
            .put_storage_resource(RESOURCE_ID, StorageResource::new(backend.clone(), 1))
            .unwrap();
        registry
            .put_storage_policy(POLICY_ID, StoragePolicy::new("cooldown_policy", 1, RESOURCE_ID))
            .unwrap();

        let meta_store = Arc::new(FlakyMetaStore::open(&config.resolved_meta_dir()));
        let engine =
            StorageEngine::with_meta_store(config.clone(), registry.clone(), meta_store.clone())
                .unwrap();

        Self {
            temp_dir,
            config,
            registry,
            backend,
            meta_store,
            engine,
        }
    }

    /// A fresh engine over the same directories, as after a restart.
    pub fn reopen(&self) -> StorageEngine {
        StorageEngine::open(self.config.clone(), self.registry.clone()).unwrap()
    }

    /// Tablet owned by `REPLICA_ID` under term 1, on the test policy.
    pub async fn owned_tablet(&self, tablet_id: TabletId) -> Arc<Tablet> {
        let tablet = self
            .engine
            .create_tablet(tablet_id, SCHEMA_HASH, REPLICA_ID)
            .await
            .unwrap();
        tablet.set_storage_policy_id(POLICY_ID).unwrap();
        tablet.update_cooldown_conf(1, REPLICA_ID).unwrap();
        tablet
    }
}

/// Writes segment files into the tablet directory and returns their meta.
pub fn write_rowset(
    tablet: &Tablet,
    version: (i64, i64),
    segments: &[&[u8]],
    num_rows: u64,
) -> RowsetMeta {
    let rowset_id = RowsetId::new();
    for (idx, data) in segments.iter().enumerate() {
        std::fs::write(local_segment_path(tablet.tablet_dir(), &rowset_id, idx), data).unwrap();
    }
    RowsetMeta::new_local(
        rowset_id,
        tablet.tablet_id(),
        Version::from(version),
        num_rows,
        segments.iter().map(|s| s.len() as u64).collect(),
    )
}

pub fn publish(
    tablet: &Tablet,
    version: (i64, i64),
    segments: &[&[u8]],
    num_rows: u64,
) -> RowsetSharedPtr {
    tablet
        .add_inc_rowset(write_rowset(tablet, version, segments, num_rows))
        .unwrap()
}
