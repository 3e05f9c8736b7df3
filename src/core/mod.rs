pub mod error;
pub mod types;

pub use error::{CooldownError, Result};
pub use types::{
    NO_STORAGE_POLICY, PolicyId, ReplicaId, ResourceId, RowsetId, SchemaHash, TabletId, Version,
};
