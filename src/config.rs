use crate::core::{CooldownError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cooldown engine configuration
///
/// Everything the engine needs that is not per-tablet state: where local data
/// and tablet metadata live, and how aggressively rowsets are migrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Root directory for local tablet data
    pub storage_root_path: PathBuf,

    /// Directory of the tablet meta store (defaults to `<root>/meta`)
    pub meta_dir: Option<PathBuf>,

    /// Minimum age of a rowset's newest write before it may be cooled
    pub retention: Duration,

    /// Maximum number of tablets cooled in parallel by one engine pass
    pub max_concurrent_cooldowns: usize,

    /// Timeout applied to individual backend operations, if any
    pub backend_op_timeout: Option<Duration>,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            storage_root_path: PathBuf::from("storage"),
            meta_dir: None,
            retention: Duration::ZERO,
            max_concurrent_cooldowns: 4,
            backend_op_timeout: None,
        }
    }
}

impl CooldownConfig {
    /// Create a configuration rooted at `storage_root_path`
    pub fn new<P: AsRef<Path>>(storage_root_path: P) -> Self {
        Self {
            storage_root_path: storage_root_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CooldownError::ConfigurationError(format!(
                "Failed to read config '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CooldownError::ConfigurationError(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the retention threshold
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the meta store directory
    pub fn meta_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.meta_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set the parallelism of an engine-wide cooldown pass
    pub fn max_concurrent_cooldowns(mut self, max: usize) -> Self {
        self.max_concurrent_cooldowns = max;
        self
    }

    /// Set the per-operation backend timeout
    pub fn backend_op_timeout(mut self, timeout: Duration) -> Self {
        self.backend_op_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_root_path.as_os_str().is_empty() {
            return Err(CooldownError::ConfigurationError(
                "storage_root_path must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_cooldowns == 0 {
            return Err(CooldownError::ConfigurationError(
                "max_concurrent_cooldowns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolved_meta_dir(&self) -> PathBuf {
        self.meta_dir
            .clone()
            .unwrap_or_else(|| self.storage_root_path.join("meta"))
    }

    /// Local directory holding the segment files of one tablet
    pub fn tablet_data_dir(&self, tablet_id: i64, schema_hash: i32) -> PathBuf {
        self.storage_root_path
            .join("data")
            .join(tablet_id.to_string())
            .join(schema_hash.to_string())
    }
}
