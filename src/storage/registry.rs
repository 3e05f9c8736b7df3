use crate::core::{CooldownError, PolicyId, ResourceId, Result};
use crate::io::RemoteBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// A remote backend together with the version of its addressing scheme.
#[derive(Clone)]
pub struct StorageResource {
    pub backend: Arc<dyn RemoteBackend>,
    pub version: i64,
}

impl StorageResource {
    pub fn new(backend: Arc<dyn RemoteBackend>, version: i64) -> Self {
        Self { backend, version }
    }
}

impl std::fmt::Debug for StorageResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageResource")
            .field("backend", &self.backend.id())
            .field("version", &self.version)
            .finish()
    }
}

/// Named policy pointing a tablet at a storage resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePolicy {
    pub name: String,
    pub version: i64,
    pub resource_id: ResourceId,
}

impl StoragePolicy {
    pub fn new(name: impl Into<String>, version: i64, resource_id: ResourceId) -> Self {
        Self {
            name: name.into(),
            version,
            resource_id,
        }
    }
}

/// A policy resolved down to the backend it targets.
#[derive(Debug, Clone)]
pub struct ResolvedStorage {
    pub policy_id: PolicyId,
    pub policy: Arc<StoragePolicy>,
    pub resource_id: ResourceId,
    pub resource: StorageResource,
}

/// Immutable view of every registered resource and policy.
///
/// Mutations build a new map (copy-on-write), so a clone taken by a cooldown
/// attempt never changes underneath it.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    resources: Arc<HashMap<ResourceId, StorageResource>>,
    policies: Arc<HashMap<PolicyId, Arc<StoragePolicy>>>,
}

impl RegistrySnapshot {
    pub fn with_resource(self, id: ResourceId, resource: StorageResource) -> Self {
        let mut resources = (*self.resources).clone();
        resources.insert(id, resource);
        Self {
            resources: Arc::new(resources),
            policies: self.policies,
        }
    }

    pub fn without_resource(self, id: ResourceId) -> Self {
        if !self.resources.contains_key(&id) {
            return self;
        }
        let mut resources = (*self.resources).clone();
        resources.remove(&id);
        Self {
            resources: Arc::new(resources),
            policies: self.policies,
        }
    }

    pub fn with_policy(self, id: PolicyId, policy: StoragePolicy) -> Self {
        let mut policies = (*self.policies).clone();
        policies.insert(id, Arc::new(policy));
        Self {
            resources: self.resources,
            policies: Arc::new(policies),
        }
    }

    pub fn without_policy(self, id: PolicyId) -> Self {
        if !self.policies.contains_key(&id) {
            return self;
        }
        let mut policies = (*self.policies).clone();
        policies.remove(&id);
        Self {
            resources: self.resources,
            policies: Arc::new(policies),
        }
    }

    pub fn resource(&self, id: ResourceId) -> Option<&StorageResource> {
        self.resources.get(&id)
    }

    pub fn policy(&self, id: PolicyId) -> Option<&Arc<StoragePolicy>> {
        self.policies.get(&id)
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.resources.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn policy_ids(&self) -> Vec<PolicyId> {
        let mut ids: Vec<_> = self.policies.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Resolves `policy_id -> policy -> resource_id -> backend`.
    pub fn resolve(&self, policy_id: PolicyId) -> Result<ResolvedStorage> {
        let policy = self.policies.get(&policy_id).cloned().ok_or_else(|| {
            CooldownError::ConfigurationError(format!("Storage policy {} not found", policy_id))
        })?;
        let resource = self
            .resources
            .get(&policy.resource_id)
            .cloned()
            .ok_or_else(|| {
                CooldownError::ConfigurationError(format!(
                    "Storage resource {} referenced by policy '{}' ({}) not found",
                    policy.resource_id, policy.name, policy_id
                ))
            })?;
        Ok(ResolvedStorage {
            policy_id,
            resource_id: policy.resource_id,
            policy,
            resource,
        })
    }
}

/// Process-wide registry of storage resources and policies.
///
/// Owned by the engine and injected into tablets. Writers swap in a new
/// [`RegistrySnapshot`]; readers clone the current one and never observe a
/// half-applied change.
#[derive(Default)]
pub struct StorageRegistry {
    current: RwLock<RegistrySnapshot>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self.current.read()?.clone())
    }

    /// Registers or replaces a resource. A registration older than the one
    /// already present is ignored; returns whether it was applied.
    pub fn put_storage_resource(&self, id: ResourceId, resource: StorageResource) -> Result<bool> {
        let mut current = self.current.write()?;
        if let Some(existing) = current.resource(id) {
            if existing.version > resource.version {
                event!(
                    Level::DEBUG,
                    resource_id = id,
                    existing_version = existing.version,
                    offered_version = resource.version,
                    "ignoring stale storage resource registration"
                );
                return Ok(false);
            }
        }
        let next = current.clone().with_resource(id, resource);
        *current = next;
        event!(Level::INFO, resource_id = id, "storage resource registered");
        Ok(true)
    }

    /// Registers or replaces a policy, ignoring versions older than the
    /// registered one; returns whether it was applied.
    pub fn put_storage_policy(&self, id: PolicyId, policy: StoragePolicy) -> Result<bool> {
        let mut current = self.current.write()?;
        if let Some(existing) = current.policy(id) {
            if existing.version > policy.version {
                event!(
                    Level::DEBUG,
                    policy_id = id,
                    existing_version = existing.version,
                    offered_version = policy.version,
                    "ignoring stale storage policy registration"
                );
                return Ok(false);
            }
        }
        let name = policy.name.clone();
        let next = current.clone().with_policy(id, policy);
        *current = next;
        event!(Level::INFO, policy_id = id, name = %name, "storage policy registered");
        Ok(true)
    }

    pub fn delete_storage_resource(&self, id: ResourceId) -> Result<()> {
        let mut current = self.current.write()?;
        let next = current.clone().without_resource(id);
        *current = next;
        Ok(())
    }

    pub fn delete_storage_policy(&self, id: PolicyId) -> Result<()> {
        let mut current = self.current.write()?;
        let next = current.clone().without_policy(id);
        *current = next;
        Ok(())
    }

    pub fn get_storage_resource(&self, id: ResourceId) -> Result<Option<StorageResource>> {
        Ok(self.current.read()?.resource(id).cloned())
    }

    pub fn get_storage_policy(&self, id: PolicyId) -> Result<Option<Arc<StoragePolicy>>> {
        Ok(self.current.read()?.policy(id).cloned())
    }

    pub fn resolve(&self, policy_id: PolicyId) -> Result<ResolvedStorage> {
        self.snapshot()?.resolve(policy_id)
    }
}
