pub mod meta_store;
pub mod registry;

pub use meta_store::{FileMetaStore, TabletMetaStore};
pub use registry::{
    RegistrySnapshot, ResolvedStorage, StoragePolicy, StorageRegistry, StorageResource,
};
