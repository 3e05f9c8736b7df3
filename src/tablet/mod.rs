//! Tablets and their rowset index.

pub mod conflict;
pub mod cooldown;
pub mod cooldown_meta;

pub use conflict::{ConfUpdate, CooldownConf, CooldownConflictResolver};
pub use cooldown::{CooldownOutcome, CooldownPhase, CooldownStats};
pub use cooldown_meta::{CooledRowset, CooldownMeta, remote_cooldown_meta_path};

use crate::config::CooldownConfig;
use crate::core::{
    CooldownError, NO_STORAGE_POLICY, PolicyId, ReplicaId, Result, SchemaHash, TabletId, Version,
};
use crate::rowset::{Rowset, RowsetMeta, RowsetSharedPtr, UnusedRowsets};
use crate::storage::{StorageRegistry, TabletMetaStore};
use cooldown::CooldownCounters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{Level, event};
use uuid::Uuid;

/// Persisted state of one tablet replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub replica_id: ReplicaId,
    pub storage_policy_id: PolicyId,
    pub cooldown_conf: CooldownConf,
    /// Remote cooldown meta last written or adopted by this replica.
    pub cooldown_meta_id: Option<Uuid>,
    /// Rowset index sorted by version.
    pub rowsets: Vec<RowsetMeta>,
}

impl TabletMeta {
    pub fn new(tablet_id: TabletId, schema_hash: SchemaHash, replica_id: ReplicaId) -> Self {
        Self {
            tablet_id,
            schema_hash,
            replica_id,
            storage_policy_id: NO_STORAGE_POLICY,
            cooldown_conf: CooldownConf::default(),
            cooldown_meta_id: None,
            rowsets: Vec::new(),
        }
    }

    pub fn max_version(&self) -> Option<Version> {
        self.rowsets.iter().map(|rs| rs.version).max()
    }
}

/// Collaborators shared by every tablet of an engine.
#[derive(Clone)]
pub struct TabletContext {
    pub registry: Arc<StorageRegistry>,
    pub meta_store: Arc<dyn TabletMetaStore>,
    pub unused_rowsets: Arc<UnusedRowsets>,
    pub config: Arc<CooldownConfig>,
}

/// Guarded by the tablet meta lock.
pub(crate) struct TabletState {
    pub(crate) storage_policy_id: PolicyId,
    pub(crate) cooldown_meta_id: Option<Uuid>,
    pub(crate) rowsets: BTreeMap<Version, RowsetSharedPtr>,
}

pub struct Tablet {
    tablet_id: TabletId,
    schema_hash: SchemaHash,
    replica_id: ReplicaId,
    tablet_dir: PathBuf,
    ctx: TabletContext,
    resolver: CooldownConflictResolver,
    state: RwLock<TabletState>,
    /// Versions with an upload in flight.
    migrating: Mutex<HashSet<Version>>,
    phase: Mutex<CooldownPhase>,
    counters: CooldownCounters,
}

pub type TabletSharedPtr = Arc<Tablet>;

fn check_contiguous(rowsets: &[RowsetMeta]) -> Result<()> {
    let mut expected_start = 0;
    for rs in rowsets {
        rs.validate()?;
        if rs.version.start != expected_start {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} at {} does not continue from version {}",
                rs.rowset_id, rs.version, expected_start
            )));
        }
        expected_start = rs.version.end + 1;
    }
    Ok(())
}

impl Tablet {
    /// Builds the in-memory tablet from persisted metadata.
    pub fn from_meta(meta: TabletMeta, ctx: TabletContext) -> Result<TabletSharedPtr> {
        let mut rowset_metas = meta.rowsets;
        rowset_metas.sort_by_key(|rs| rs.version);
        check_contiguous(&rowset_metas)?;

        let tablet_dir = ctx.config.tablet_data_dir(meta.tablet_id, meta.schema_hash);
        let rowsets = rowset_metas
            .into_iter()
            .map(|rs| {
                let rowset = Rowset::new(rs, tablet_dir.clone(), ctx.registry.clone());
                (rowset.version(), rowset)
            })
            .collect();

        Ok(Arc::new(Self {
            tablet_id: meta.tablet_id,
            schema_hash: meta.schema_hash,
            replica_id: meta.replica_id,
            tablet_dir,
            resolver: CooldownConflictResolver::new(
                meta.tablet_id,
                meta.replica_id,
                meta.cooldown_conf,
            ),
            state: RwLock::new(TabletState {
                storage_policy_id: meta.storage_policy_id,
                cooldown_meta_id: meta.cooldown_meta_id,
                rowsets,
            }),
            migrating: Mutex::new(HashSet::new()),
            phase: Mutex::new(CooldownPhase::Idle),
            counters: CooldownCounters::default(),
            ctx,
        }))
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn schema_hash(&self) -> SchemaHash {
        self.schema_hash
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Local directory holding this tablet's segment files.
    pub fn tablet_dir(&self) -> &Path {
        &self.tablet_dir
    }

    pub(crate) fn ctx(&self) -> &TabletContext {
        &self.ctx
    }

    pub(crate) fn resolver(&self) -> &CooldownConflictResolver {
        &self.resolver
    }

    pub(crate) fn state(&self) -> &RwLock<TabletState> {
        &self.state
    }

    pub(crate) fn migrating(&self) -> &Mutex<HashSet<Version>> {
        &self.migrating
    }

    pub(crate) fn phase_slot(&self) -> &Mutex<CooldownPhase> {
        &self.phase
    }

    pub(crate) fn counters(&self) -> &CooldownCounters {
        &self.counters
    }

    pub(crate) fn build_meta(&self, state: &TabletState) -> Result<TabletMeta> {
        Ok(TabletMeta {
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            replica_id: self.replica_id,
            storage_policy_id: state.storage_policy_id,
            cooldown_conf: self.resolver.current()?,
            cooldown_meta_id: state.cooldown_meta_id,
            rowsets: state.rowsets.values().map(|rs| rs.meta().clone()).collect(),
        })
    }

    /// Current persisted-form snapshot of the tablet.
    pub fn tablet_meta(&self) -> Result<TabletMeta> {
        let state = self.state.read()?;
        self.build_meta(&state)
    }

    pub fn save_meta(&self) -> Result<()> {
        let state = self.state.read()?;
        let meta = self.build_meta(&state)?;
        self.persist_meta(&meta)
    }

    /// Writes `meta` through the meta store while the caller holds the meta
    /// lock. On a multi-thread runtime the worker is handed over to other
    /// tasks for the duration of the fsync.
    pub(crate) fn persist_meta(&self, meta: &TabletMeta) -> Result<()> {
        let store = &self.ctx.meta_store;
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| store.save(meta))
            }
            _ => store.save(meta),
        }
    }

    pub fn storage_policy_id(&self) -> Result<PolicyId> {
        Ok(self.state.read()?.storage_policy_id)
    }

    pub fn set_storage_policy_id(&self, policy_id: PolicyId) -> Result<()> {
        let mut state = self.state.write()?;
        if state.storage_policy_id == policy_id {
            return Ok(());
        }
        let previous = state.storage_policy_id;
        state.storage_policy_id = policy_id;
        let meta = self.build_meta(&state)?;
        if let Err(err) = self.persist_meta(&meta) {
            state.storage_policy_id = previous;
            return Err(err);
        }
        event!(
            Level::INFO,
            tablet_id = self.tablet_id,
            policy_id,
            "tablet storage policy changed"
        );
        Ok(())
    }

    /// Applies a lease update and persists it before returning, so the term
    /// survives a restart. A lease that cannot be persisted is rolled back.
    pub fn update_cooldown_conf(&self, term: u64, cooldown_replica_id: ReplicaId) -> Result<ConfUpdate> {
        let state = self.state.write()?;
        let previous = self.resolver.current()?;
        let update = self.resolver.update(term, cooldown_replica_id)?;
        if update != ConfUpdate::Applied {
            return Ok(update);
        }
        let meta = self.build_meta(&state)?;
        if let Err(err) = self.persist_meta(&meta) {
            self.resolver.restore(previous)?;
            event!(
                Level::ERROR,
                tablet_id = self.tablet_id,
                term,
                cooldown_replica_id,
                error = %err,
                "failed to persist cooldown conf, keeping previous lease"
            );
            return Err(CooldownError::MetadataPersistError(err.to_string()));
        }
        Ok(update)
    }

    pub fn cooldown_conf(&self) -> Result<CooldownConf> {
        self.resolver.current()
    }

    pub fn is_cooldown_owner(&self) -> Result<bool> {
        self.resolver.is_authorized()
    }

    pub fn cooldown_meta_id(&self) -> Result<Option<Uuid>> {
        Ok(self.state.read()?.cooldown_meta_id)
    }

    /// Publishes a committed local rowset. The first rowset must start at
    /// version 0 and every later one right after the current max version.
    pub fn add_inc_rowset(&self, meta: RowsetMeta) -> Result<RowsetSharedPtr> {
        meta.validate()?;
        if meta.tablet_id != self.tablet_id {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} belongs to tablet {}, not {}",
                meta.rowset_id, meta.tablet_id, self.tablet_id
            )));
        }
        if !meta.is_local() {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} must be published on local storage",
                meta.rowset_id
            )));
        }

        let mut state = self.state.write()?;
        let expected_start = state
            .rowsets
            .keys()
            .next_back()
            .map(|v| v.end + 1)
            .unwrap_or(0);
        if meta.version.start != expected_start {
            return Err(CooldownError::InvalidRowset(format!(
                "rowset {} at {} does not continue from version {}",
                meta.rowset_id, meta.version, expected_start
            )));
        }

        let rowset = Rowset::new(meta, self.tablet_dir.clone(), self.ctx.registry.clone());
        let mut next = self.build_meta(&state)?;
        next.rowsets.push(rowset.meta().clone());
        self.persist_meta(&next)?;

        state.rowsets.insert(rowset.version(), rowset.clone());
        event!(
            Level::DEBUG,
            tablet_id = self.tablet_id,
            version = %rowset.version(),
            rowset_id = %rowset.rowset_id(),
            "rowset published"
        );
        Ok(rowset)
    }

    /// Handle for the rowset covering exactly `version`, reflecting the
    /// latest committed location.
    pub fn get_rowset_by_version(&self, version: impl Into<Version>) -> Result<RowsetSharedPtr> {
        let version = version.into();
        self.state
            .read()?
            .rowsets
            .get(&version)
            .cloned()
            .ok_or(CooldownError::RowsetNotFound(version))
    }

    /// All rowsets in version order.
    pub fn rowsets(&self) -> Result<Vec<RowsetSharedPtr>> {
        Ok(self.state.read()?.rowsets.values().cloned().collect())
    }

    pub fn rowset_with_max_version(&self) -> Result<Option<RowsetSharedPtr>> {
        Ok(self.state.read()?.rowsets.values().next_back().cloned())
    }

    pub fn max_version(&self) -> Result<Option<Version>> {
        Ok(self.state.read()?.rowsets.keys().next_back().copied())
    }

    pub fn num_rows(&self) -> Result<u64> {
        Ok(self
            .state
            .read()?
            .rowsets
            .values()
            .map(|rs| rs.num_rows())
            .sum())
    }

    pub fn cooldown_phase(&self) -> Result<CooldownPhase> {
        Ok(*self.phase.lock()?)
    }

    pub fn cooldown_stats(&self) -> CooldownStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet")
            .field("tablet_id", &self.tablet_id)
            .field("schema_hash", &self.schema_hash)
            .field("replica_id", &self.replica_id)
            .finish()
    }
}
