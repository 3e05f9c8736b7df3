// ============================================================================
// Tablet Cooldown Library
// ============================================================================

pub mod config;
pub mod core;
pub mod engine;
pub mod io;
pub mod rowset;
pub mod storage;
pub mod tablet;

pub use config::CooldownConfig;
pub use core::{
    CooldownError, NO_STORAGE_POLICY, PolicyId, ReplicaId, ResourceId, Result, RowsetId,
    SchemaHash, TabletId, Version,
};
pub use engine::{CooldownPassReport, StorageEngine};
pub use io::{BatchReport, InstrumentedBackend, LocalDirBackend, RemoteBackend};
pub use rowset::{Rowset, RowsetMeta, RowsetSharedPtr, SweepStats, UnusedRowsets};
pub use storage::{
    FileMetaStore, StoragePolicy, StorageRegistry, StorageResource, TabletMetaStore,
};
pub use tablet::{
    ConfUpdate, CooldownConf, CooldownMeta, CooldownOutcome, CooldownPhase, CooldownStats, Tablet,
    TabletMeta, TabletSharedPtr,
};
