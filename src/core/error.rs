use crate::core::types::{ReplicaId, TabletId, Version};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CooldownError {
    #[error("Replica {replica_id} is not the cooldown owner of tablet {tablet_id} (term {term}, owner {owner})")]
    NotCooldownOwner {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        term: u64,
        owner: ReplicaId,
    },

    #[error("Conflicting cooldown lease for tablet {tablet_id} at term {term}: holder {current}, proposed {proposed}")]
    ConflictingLease {
        tablet_id: TabletId,
        term: u64,
        current: ReplicaId,
        proposed: ReplicaId,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Upload failure: {0}")]
    UploadFailure(String),

    #[error("Cooldown lease of tablet {tablet_id} expired during upload (term {started_term} -> {current_term})")]
    LeaseExpired {
        tablet_id: TabletId,
        started_term: u64,
        current_term: u64,
    },

    #[error("Failed to persist metadata: {0}")]
    MetadataPersistError(String),

    #[error("Invalid rowset: {0}")]
    InvalidRowset(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Tablet {0} not found")]
    TabletNotFound(TabletId),

    #[error("Tablet {0} already exists")]
    TabletExists(TabletId),

    #[error("Rowset for version {0} not found")]
    RowsetNotFound(Version),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CooldownError {
    /// Whether the scheduler should try the same tablet again on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotCooldownOwner { .. }
                | Self::ConfigurationError(_)
                | Self::UploadFailure(_)
                | Self::LeaseExpired { .. }
                | Self::MetadataPersistError(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CooldownError>;

impl<T> From<std::sync::PoisonError<T>> for CooldownError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for CooldownError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
