use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TabletId = i64;
pub type SchemaHash = i32;
pub type ReplicaId = i64;
pub type ResourceId = i64;
pub type PolicyId = i64;

/// Policy id meaning "no storage policy": the tablet stays on local disk.
pub const NO_STORAGE_POLICY: PolicyId = 0;

/// Inclusive version range `[start, end]` covered by one rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start >= 0 && self.start <= self.end
    }

    pub fn overlaps(&self, other: &Version) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl From<(i64, i64)> for Version {
    fn from((start, end): (i64, i64)) -> Self {
        Self::new(start, end)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Globally unique rowset id, rendered as 32 lowercase hex chars in file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowsetId(Uuid);

impl RowsetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RowsetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering_and_overlap() {
        let mut versions = vec![Version::new(2, 2), Version::new(0, 1), Version::new(3, 5)];
        versions.sort();
        assert_eq!(versions[0], Version::new(0, 1));
        assert_eq!(versions[2], Version::new(3, 5));

        assert!(Version::new(0, 3).overlaps(&Version::new(3, 4)));
        assert!(!Version::new(0, 1).overlaps(&Version::new(2, 2)));
        assert!(!Version::new(3, 1).is_valid());
        assert_eq!(Version::from((2, 2)).to_string(), "[2-2]");
    }

    #[test]
    fn test_rowset_id_renders_as_simple_hex() {
        let id = RowsetId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert!(!rendered.contains('-'));
    }
}
