//! Storage engine: owns the tablets of one node and drives cooldown over them.

use crate::config::CooldownConfig;
use crate::core::{CooldownError, NO_STORAGE_POLICY, ReplicaId, Result, SchemaHash, TabletId};
use crate::rowset::{SweepStats, UnusedRowsets};
use crate::storage::{FileMetaStore, StorageRegistry, TabletMetaStore};
use crate::tablet::{CooldownOutcome, Tablet, TabletContext, TabletMeta, TabletSharedPtr};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, Level, event, info_span};

/// Per-tablet results of one [`StorageEngine::run_cooldown_pass`].
#[derive(Debug, Default)]
pub struct CooldownPassReport {
    pub results: Vec<(TabletId, Result<CooldownOutcome>)>,
}

impl CooldownPassReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Tablets that moved at least one rowset to remote storage.
    pub fn cooled(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    Ok(CooldownOutcome::Uploaded { .. } | CooldownOutcome::Adopted { .. })
                )
            })
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (TabletId, &CooldownError)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (*id, e)))
    }

    pub fn outcome(&self, tablet_id: TabletId) -> Option<&Result<CooldownOutcome>> {
        self.results
            .iter()
            .find(|(id, _)| *id == tablet_id)
            .map(|(_, r)| r)
    }
}

pub struct StorageEngine {
    ctx: TabletContext,
    tablets: RwLock<HashMap<TabletId, TabletSharedPtr>>,
}

impl StorageEngine {
    /// Opens the engine on `config`, reloading every tablet found in the
    /// meta store.
    pub fn open(config: CooldownConfig, registry: Arc<StorageRegistry>) -> Result<Self> {
        let meta_store = Arc::new(FileMetaStore::open(config.resolved_meta_dir())?);
        Self::with_meta_store(config, registry, meta_store)
    }

    pub fn with_meta_store(
        config: CooldownConfig,
        registry: Arc<StorageRegistry>,
        meta_store: Arc<dyn TabletMetaStore>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.storage_root_path.join("data"))?;

        let ctx = TabletContext {
            registry,
            meta_store,
            unused_rowsets: Arc::new(UnusedRowsets::new()),
            config: Arc::new(config),
        };

        let mut tablets = HashMap::new();
        for (tablet_id, schema_hash) in ctx.meta_store.list()? {
            let Some(meta) = ctx.meta_store.load(tablet_id, schema_hash)? else {
                continue;
            };
            let tablet = Tablet::from_meta(meta, ctx.clone())?;
            tablets.insert(tablet_id, tablet);
        }
        event!(
            Level::INFO,
            tablets = tablets.len(),
            root = %ctx.config.storage_root_path.display(),
            "storage engine opened"
        );

        Ok(Self {
            ctx,
            tablets: RwLock::new(tablets),
        })
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.ctx.registry
    }

    pub fn unused_rowsets(&self) -> &Arc<UnusedRowsets> {
        &self.ctx.unused_rowsets
    }

    pub async fn create_tablet(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        replica_id: ReplicaId,
    ) -> Result<TabletSharedPtr> {
        let mut tablets = self.tablets.write().await;
        if tablets.contains_key(&tablet_id) {
            return Err(CooldownError::TabletExists(tablet_id));
        }

        let meta = TabletMeta::new(tablet_id, schema_hash, replica_id);
        let tablet = Tablet::from_meta(meta, self.ctx.clone())?;
        tokio::fs::create_dir_all(tablet.tablet_dir()).await?;
        tablet.save_meta()?;
        tablets.insert(tablet_id, tablet.clone());

        event!(Level::INFO, tablet_id, schema_hash, replica_id, "tablet created");
        Ok(tablet)
    }

    pub async fn get_tablet(&self, tablet_id: TabletId) -> Result<TabletSharedPtr> {
        self.tablets
            .read()
            .await
            .get(&tablet_id)
            .cloned()
            .ok_or(CooldownError::TabletNotFound(tablet_id))
    }

    /// Tablets sorted by id.
    pub async fn tablets(&self) -> Vec<TabletSharedPtr> {
        let mut tablets: Vec<_> = self.tablets.read().await.values().cloned().collect();
        tablets.sort_by_key(|t| t.tablet_id());
        tablets
    }

    /// Removes the tablet and its persisted meta. Local segment files go with
    /// it; remote data is left for the remote side's own GC.
    pub async fn drop_tablet(&self, tablet_id: TabletId) -> Result<()> {
        let tablet = self
            .tablets
            .write()
            .await
            .remove(&tablet_id)
            .ok_or(CooldownError::TabletNotFound(tablet_id))?;
        self.ctx
            .meta_store
            .remove(tablet.tablet_id(), tablet.schema_hash())?;
        match tokio::fs::remove_dir_all(tablet.tablet_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        event!(Level::INFO, tablet_id, "tablet dropped");
        Ok(())
    }

    /// Runs one cooldown attempt on every tablet with a storage policy, at
    /// most `max_concurrent_cooldowns` at a time.
    pub async fn run_cooldown_pass(&self) -> Result<CooldownPassReport> {
        let mut candidates = Vec::new();
        for tablet in self.tablets().await {
            if tablet.storage_policy_id()? != NO_STORAGE_POLICY {
                candidates.push(tablet);
            }
        }

        let span = info_span!("engine.cooldown_pass", tablets = candidates.len());
        let limit = self.ctx.config.max_concurrent_cooldowns.max(1);
        let mut results: Vec<(TabletId, Result<CooldownOutcome>)> = stream::iter(candidates)
            .map(|tablet| async move {
                let outcome = tablet.cooldown_with_outcome().await;
                (tablet.tablet_id(), outcome)
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .instrument(span)
            .await;
        results.sort_by_key(|(id, _)| *id);

        let report = CooldownPassReport { results };
        event!(
            Level::INFO,
            tablets = report.len(),
            cooled = report.cooled(),
            failed = report.failures().count(),
            "cooldown pass finished"
        );
        Ok(report)
    }

    pub async fn sweep_unused_rowsets(&self) -> Result<SweepStats> {
        let stats = self.ctx.unused_rowsets.sweep().await?;
        if stats.reclaimed > 0 || stats.deferred > 0 {
            event!(
                Level::INFO,
                reclaimed = stats.reclaimed,
                deferred = stats.deferred,
                files = stats.files_removed,
                "swept unused rowsets"
            );
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("root", &self.ctx.config.storage_root_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_get_drop() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(
            CooldownConfig::new(temp_dir.path()),
            Arc::new(StorageRegistry::new()),
        )
        .unwrap();

        let tablet = engine.create_tablet(10005, 7, 10009).await.unwrap();
        assert!(tablet.tablet_dir().is_dir());
        assert!(matches!(
            engine.create_tablet(10005, 7, 10009).await,
            Err(CooldownError::TabletExists(10005))
        ));
        assert_eq!(engine.get_tablet(10005).await.unwrap().replica_id(), 10009);

        engine.drop_tablet(10005).await.unwrap();
        assert!(matches!(
            engine.get_tablet(10005).await,
            Err(CooldownError::TabletNotFound(10005))
        ));
        assert!(engine.tablets().await.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_reloads_tablets() {
        let temp_dir = TempDir::new().unwrap();
        let registry = Arc::new(StorageRegistry::new());
        {
            let engine =
                StorageEngine::open(CooldownConfig::new(temp_dir.path()), registry.clone()).unwrap();
            engine.create_tablet(1, 1, 1).await.unwrap();
            engine.create_tablet(2, 1, 1).await.unwrap();
        }

        let engine = StorageEngine::open(CooldownConfig::new(temp_dir.path()), registry).unwrap();
        let ids: Vec<_> = engine.tablets().await.iter().map(|t| t.tablet_id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_pass_skips_tablets_without_policy() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(
            CooldownConfig::new(temp_dir.path()),
            Arc::new(StorageRegistry::new()),
        )
        .unwrap();
        engine.create_tablet(1, 1, 1).await.unwrap();

        let report = engine.run_cooldown_pass().await.unwrap();
        assert!(report.is_empty());
    }
}
