//! Cooldown state machine of a tablet.
//!
//! One attempt walks `Idle -> SelectingCandidate -> Uploading -> Committing`
//! and always ends back in `Idle`. The lease is checked before anything is
//! selected and again under the tablet meta lock right before the commit, so
//! a replica that lost the lease mid-upload never switches a rowset to remote.
//! Uploads run without the meta lock; only the final swap takes it.

use super::cooldown_meta::{CooledRowset, CooldownMeta, remote_cooldown_meta_path};
use super::{CooldownConf, Tablet};
use crate::core::{CooldownError, NO_STORAGE_POLICY, Result, Version};
use crate::rowset::{Rowset, RowsetMeta, RowsetSharedPtr, remote_segment_path, remote_tablet_dir};
use crate::storage::ResolvedStorage;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPhase {
    Idle,
    SelectingCandidate,
    Uploading,
    Committing,
}

/// What a successful cooldown attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownOutcome {
    /// The tablet has no storage policy.
    LocalOnly,
    /// Nothing is eligible right now.
    NoCandidate,
    /// One rowset was uploaded and committed as remote.
    Uploaded { version: Version },
    /// Rowsets already uploaded under the current lease were linked in.
    Adopted { versions: Vec<Version> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownStats {
    pub attempts: u64,
    pub uploaded: u64,
    pub adopted: u64,
    pub no_ops: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Default)]
pub(crate) struct CooldownCounters {
    attempts: AtomicU64,
    uploaded: AtomicU64,
    adopted: AtomicU64,
    no_ops: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl CooldownCounters {
    fn record(&self, result: &Result<CooldownOutcome>) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(CooldownOutcome::Uploaded { .. }) => &self.uploaded,
            Ok(CooldownOutcome::Adopted { .. }) => &self.adopted,
            Ok(CooldownOutcome::LocalOnly | CooldownOutcome::NoCandidate) => &self.no_ops,
            Err(CooldownError::NotCooldownOwner { .. }) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CooldownStats {
        CooldownStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            adopted: self.adopted.load(Ordering::Relaxed),
            no_ops: self.no_ops.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Publishes the phase of the running attempt; back to `Idle` on drop.
struct PhaseGuard<'a> {
    slot: &'a Mutex<CooldownPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn new(slot: &'a Mutex<CooldownPhase>) -> Self {
        Self { slot }
    }

    fn set(&self, phase: CooldownPhase) {
        if let Ok(mut current) = self.slot.lock() {
            *current = phase;
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.set(CooldownPhase::Idle);
    }
}

/// Marks a version as in flight so no concurrent attempt picks it.
struct MigratingGuard<'a> {
    set: &'a Mutex<HashSet<Version>>,
    version: Version,
}

impl<'a> MigratingGuard<'a> {
    /// Must be called with the tablet meta lock held, so the rowset behind
    /// `version` cannot be committed between selection and reservation.
    fn reserve(set: &'a Mutex<HashSet<Version>>, version: Version) -> Result<Option<Self>> {
        if set.lock()?.insert(version) {
            Ok(Some(Self { set, version }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for MigratingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.version);
        }
    }
}

fn as_upload_failure(err: CooldownError) -> CooldownError {
    match err {
        CooldownError::UploadFailure(_) => err,
        other => CooldownError::UploadFailure(other.to_string()),
    }
}

fn as_persist_error(err: CooldownError) -> CooldownError {
    match err {
        CooldownError::MetadataPersistError(_) => err,
        other => CooldownError::MetadataPersistError(other.to_string()),
    }
}

impl Tablet {
    /// Migrates the oldest eligible local rowset to remote storage.
    ///
    /// Succeeds without doing anything when the tablet has no storage policy
    /// or no rowset is eligible, so callers can poll it.
    pub async fn cooldown(&self) -> Result<()> {
        self.cooldown_with_outcome().await.map(|_| ())
    }

    pub async fn cooldown_with_outcome(&self) -> Result<CooldownOutcome> {
        let span = info_span!(
            "tablet.cooldown",
            tablet_id = self.tablet_id(),
            replica_id = self.replica_id()
        );
        let result = self.run_cooldown().instrument(span).await;
        self.counters().record(&result);
        result
    }

    async fn run_cooldown(&self) -> Result<CooldownOutcome> {
        let phase = PhaseGuard::new(self.phase_slot());

        let lease = match self.resolver().check_authorized() {
            Ok(lease) => lease,
            Err(err) => {
                event!(Level::DEBUG, error = %err, "cooldown rejected");
                return Err(err);
            }
        };

        let policy_id = self.storage_policy_id()?;
        if policy_id == NO_STORAGE_POLICY {
            return Ok(CooldownOutcome::LocalOnly);
        }

        phase.set(CooldownPhase::SelectingCandidate);
        let Some((candidate, _reservation)) = self.pick_cooldown_candidate()? else {
            event!(Level::DEBUG, "no rowset eligible for cooldown");
            return Ok(CooldownOutcome::NoCandidate);
        };
        event!(
            Level::DEBUG,
            version = %candidate.version(),
            rowset_id = %candidate.rowset_id(),
            "picked cooldown candidate"
        );

        let storage = match self.ctx().registry.resolve(policy_id) {
            Ok(storage) => storage,
            Err(err) => {
                event!(Level::WARN, policy_id, error = %err, "cannot resolve storage policy");
                return Err(err);
            }
        };
        self.bounded("connect", storage.resource.backend.connect())
            .await?
            .map_err(as_upload_failure)?;

        if let Some(outcome) = self.try_adopt_cooled_rowsets(lease, &storage, &phase).await? {
            return Ok(outcome);
        }

        phase.set(CooldownPhase::Uploading);
        let (cooled, remote_meta) = match self.upload_rowset(lease, &storage, &candidate).await {
            Ok(uploaded) => uploaded,
            Err(err) => {
                event!(Level::WARN, version = %candidate.version(), error = %err, "rowset upload failed");
                return Err(err);
            }
        };

        let remote_meta = self.republish_cooldown_meta(&storage, remote_meta).await?;

        phase.set(CooldownPhase::Committing);
        let version = candidate.version();
        let committed = self.commit_cooled_rowsets(
            lease,
            vec![(candidate, cooled)],
            remote_meta.cooldown_meta_id,
        )?;
        if committed == 0 {
            return Ok(CooldownOutcome::NoCandidate);
        }
        event!(
            Level::INFO,
            version = %version,
            resource_id = storage.resource_id,
            term = remote_meta.term,
            "rowset cooled down"
        );
        Ok(CooldownOutcome::Uploaded { version })
    }

    /// The first local rowset in version order, if it is old enough and not
    /// already being uploaded, reserved for this attempt. Later rowsets are
    /// never picked ahead of it.
    fn pick_cooldown_candidate(&self) -> Result<Option<(RowsetSharedPtr, MigratingGuard<'_>)>> {
        let state = self.state().read()?;
        let Some(first_local) = state.rowsets.values().find(|rs| rs.is_local()) else {
            return Ok(None);
        };
        let age = (Utc::now() - first_local.meta().newest_write_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.ctx().config.retention {
            return Ok(None);
        }
        let reservation = MigratingGuard::reserve(self.migrating(), first_local.version())?;
        Ok(reservation.map(|guard| (first_local.clone(), guard)))
    }

    /// Runs one remote call, bounded by `backend_op_timeout` when set. A call
    /// that runs out of time is an upload failure.
    async fn bounded<T>(&self, op: &'static str, call: impl Future<Output = T>) -> Result<T> {
        let Some(limit) = self.ctx().config.backend_op_timeout else {
            return Ok(call.await);
        };
        tokio::time::timeout(limit, call).await.map_err(|_| {
            event!(Level::WARN, op, timeout = ?limit, "remote call timed out");
            CooldownError::UploadFailure(format!("{} timed out after {:?}", op, limit))
        })
    }

    /// Links in rowsets that were already uploaded under the current lease.
    ///
    /// Only the meta file counts as proof of a finished upload. Local rowsets
    /// are matched by exact version, starting from the oldest local one and
    /// stopping at the first gap so availability stays monotonic.
    async fn try_adopt_cooled_rowsets(
        &self,
        lease: CooldownConf,
        storage: &ResolvedStorage,
        phase: &PhaseGuard<'_>,
    ) -> Result<Option<CooldownOutcome>> {
        let backend = &storage.resource.backend;
        let meta_path =
            remote_cooldown_meta_path(self.tablet_id(), lease.cooldown_replica_id, lease.term);
        if !self
            .bounded("exists", backend.exists(&meta_path))
            .await?
            .map_err(as_upload_failure)?
        {
            return Ok(None);
        }
        let data = self
            .bounded("read", backend.read_bytes(&meta_path))
            .await?
            .map_err(as_upload_failure)?;
        let remote = CooldownMeta::decode(&data)?;

        let mut adopted = Vec::new();
        for rowset in self.rowsets()?.into_iter().filter(|rs| rs.is_local()) {
            let Some(entry) = remote.find(rowset.version()) else {
                break;
            };
            if entry.resource_id != storage.resource_id {
                event!(
                    Level::WARN,
                    version = %rowset.version(),
                    remote_resource = entry.resource_id,
                    policy_resource = storage.resource_id,
                    "cooled rowset lives on another resource, not adopting"
                );
                break;
            }
            if entry.segment_sizes.len() != rowset.num_segments() || entry.num_rows != rowset.num_rows()
            {
                event!(
                    Level::WARN,
                    version = %rowset.version(),
                    local_segments = rowset.num_segments(),
                    remote_segments = entry.segment_sizes.len(),
                    local_rows = rowset.num_rows(),
                    remote_rows = entry.num_rows,
                    "cooled rowset does not match local rowset, not adopting"
                );
                break;
            }
            let mut own_paths = Vec::with_capacity(entry.segment_paths.len());
            for (idx, src) in entry.segment_paths.iter().enumerate() {
                let dest = remote_segment_path(self.tablet_id(), &entry.rowset_id, idx);
                if *src != dest
                    && !self
                        .bounded("exists", backend.exists(&dest))
                        .await?
                        .map_err(as_upload_failure)?
                {
                    self.bounded("link", backend.link_file(src, &dest))
                        .await?
                        .map_err(as_upload_failure)?;
                }
                own_paths.push(dest);
            }
            adopted.push((rowset, entry.to_rowset_meta(self.tablet_id(), own_paths)));
        }

        if adopted.is_empty() {
            return Ok(None);
        }

        phase.set(CooldownPhase::Committing);
        let versions: Vec<Version> = adopted.iter().map(|(rs, _)| rs.version()).collect();
        let committed = self.commit_cooled_rowsets(lease, adopted, remote.cooldown_meta_id)?;
        if committed == 0 {
            return Ok(Some(CooldownOutcome::NoCandidate));
        }
        event!(
            Level::INFO,
            cooldown_meta_id = %remote.cooldown_meta_id,
            rowsets = versions.len(),
            term = lease.term,
            "adopted already cooled rowsets"
        );
        Ok(Some(CooldownOutcome::Adopted { versions }))
    }

    /// Uploads the segments of `rowset`, then the tablet's cooldown meta.
    /// Any failed segment aborts before the meta is written.
    async fn upload_rowset(
        &self,
        lease: CooldownConf,
        storage: &ResolvedStorage,
        rowset: &RowsetSharedPtr,
    ) -> Result<(RowsetMeta, CooldownMeta)> {
        let backend = &storage.resource.backend;
        let tablet_id = self.tablet_id();
        let remote_dir = remote_tablet_dir(tablet_id);
        self.bounded("create_directory", backend.create_directory(&remote_dir))
            .await?
            .map_err(as_upload_failure)?;

        let remote_paths: Vec<PathBuf> = (0..rowset.num_segments())
            .map(|idx| remote_segment_path(tablet_id, rowset.rowset_id(), idx))
            .collect();
        let items: Vec<(PathBuf, PathBuf)> = rowset
            .local_segment_paths()
            .into_iter()
            .zip(remote_paths.iter().cloned())
            .collect();
        if !items.is_empty() {
            let report = self.bounded("batch_upload", backend.batch_upload(&items)).await?;
            if let Some(summary) = report.summarize_failures() {
                return Err(CooldownError::UploadFailure(format!(
                    "rowset {} {}: {}",
                    rowset.rowset_id(),
                    rowset.version(),
                    summary
                )));
            }
        }

        let cooled = rowset.meta().to_remote(storage.resource_id, remote_paths);
        let mut entries: Vec<CooledRowset> = self
            .rowsets()?
            .iter()
            .filter_map(|rs| CooledRowset::from_meta(rs.meta()))
            .collect();
        entries.extend(CooledRowset::from_meta(&cooled));
        let remote_meta =
            CooldownMeta::new(tablet_id, lease.cooldown_replica_id, lease.term, entries);
        let encoded = remote_meta.encode()?;
        let meta_path = remote_meta.path();
        self.bounded("write", backend.write_bytes(&meta_path, &encoded))
            .await?
            .map_err(as_upload_failure)?;
        event!(
            Level::DEBUG,
            version = %rowset.version(),
            segments = rowset.num_segments(),
            meta = %remote_meta.path().display(),
            "rowset uploaded"
        );
        Ok((cooled, remote_meta))
    }

    /// Rewrites the cooldown meta under the current term when the lease moved
    /// on during the upload but still names this replica, so that replicas
    /// taking the lease at the new term find the finished upload.
    async fn republish_cooldown_meta(
        &self,
        storage: &ResolvedStorage,
        mut remote_meta: CooldownMeta,
    ) -> Result<CooldownMeta> {
        let current = self.resolver().current()?;
        if current.term == remote_meta.term || !current.is_authorized(self.replica_id()) {
            return Ok(remote_meta);
        }
        let started_term = remote_meta.term;
        remote_meta.term = current.term;
        let encoded = remote_meta.encode()?;
        let meta_path = remote_meta.path();
        self.bounded("write", storage.resource.backend.write_bytes(&meta_path, &encoded))
            .await?
            .map_err(as_upload_failure)?;
        event!(
            Level::INFO,
            started_term,
            term = current.term,
            meta = %meta_path.display(),
            "lease term moved during upload, cooldown meta republished"
        );
        Ok(remote_meta)
    }

    /// Swaps local rowsets for their remote counterparts and persists the
    /// tablet meta, all under the meta lock. Returns how many were swapped;
    /// rowsets already replaced by a concurrent attempt are skipped.
    fn commit_cooled_rowsets(
        &self,
        lease: CooldownConf,
        replacements: Vec<(RowsetSharedPtr, RowsetMeta)>,
        cooldown_meta_id: Uuid,
    ) -> Result<usize> {
        let mut state = self.state().write()?;
        if let Err(err) = self.resolver().check_still_authorized(lease) {
            event!(Level::WARN, error = %err, "lease lost before commit, uploaded data is orphaned");
            return Err(err);
        }

        let mut swaps = Vec::with_capacity(replacements.len());
        for (old, cooled) in replacements {
            match state.rowsets.get(&old.version()) {
                Some(current) if Arc::ptr_eq(current, &old) => swaps.push((old, cooled)),
                _ => event!(
                    Level::DEBUG,
                    version = %old.version(),
                    "rowset already replaced by a concurrent cooldown"
                ),
            }
        }
        if swaps.is_empty() {
            return Ok(0);
        }

        let mut next = self.build_meta(&state)?;
        for (old, cooled) in &swaps {
            if let Some(slot) = next.rowsets.iter_mut().find(|rs| rs.version == old.version()) {
                *slot = cooled.clone();
            }
        }
        next.cooldown_meta_id = Some(cooldown_meta_id);
        if let Err(err) = self.persist_meta(&next) {
            let err = as_persist_error(err);
            event!(Level::ERROR, error = %err, "failed to persist cooled tablet meta");
            return Err(err);
        }

        state.cooldown_meta_id = next.cooldown_meta_id;
        let committed = swaps.len();
        for (old, cooled) in swaps {
            let remote = Rowset::new(
                cooled,
                self.tablet_dir().to_path_buf(),
                self.ctx().registry.clone(),
            );
            state.rowsets.insert(old.version(), remote);
            self.ctx().unused_rowsets.add(old)?;
        }
        Ok(committed)
    }
}
