use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::EntityKind;
use crate::errors::{MigrationError, Result};

/// Bumped only on incompatible layout changes.
pub const FORMAT_VERSION: &str = "1";

/// Per-kind accounting inside the manifest. `checksum` is the hex SHA-256
/// of the chunk bytes concatenated in chunk order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitySection {
    pub count: u64,
    pub chunk_count: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaEntry {
    pub size_bytes: u64,
    pub checksum: String,
}

/// Always the last entry written into an archive. An archive without a
/// readable manifest is invalid regardless of what else it contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub created_at: DateTime<Utc>,
    pub source_environment: String,
    pub entity_order: Vec<EntityKind>,
    pub entities: BTreeMap<String, EntitySection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub media_index: BTreeMap<String, MediaEntry>,
}

impl Manifest {
    pub fn new(source_environment: &str) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            source_environment: source_environment.to_string(),
            entity_order: EntityKind::dependency_order().to_vec(),
            entities: BTreeMap::new(),
            media_index: BTreeMap::new(),
        }
    }

    pub fn check_format(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(MigrationError::Validation(format!(
                "unsupported archive format version: {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn total_records(&self) -> u64 {
        self.entities.values().map(|s| s.count).sum()
    }

    pub fn total_media_bytes(&self) -> u64 {
        self.media_index.values().map(|m| m.size_bytes).sum()
    }

    pub fn section(&self, kind: EntityKind) -> Option<&EntitySection> {
        self.entities.get(kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manifest_carries_current_format_and_full_order() {
        let manifest = Manifest::new("staging");
        assert_eq!(manifest.format_version, FORMAT_VERSION);
        assert_eq!(
            manifest.entity_order.as_slice(),
            EntityKind::dependency_order()
        );
        assert!(manifest.check_format().is_ok());
    }

    #[test]
    fn foreign_format_version_is_rejected() {
        let mut manifest = Manifest::new("staging");
        manifest.format_version = "99".to_string();
        assert!(manifest.check_format().is_err());
    }

    #[test]
    fn totals_sum_over_sections() {
        let mut manifest = Manifest::new("prod");
        manifest.entities.insert(
            "users".into(),
            EntitySection {
                count: 10,
                chunk_count: 1,
                checksum: "ab".into(),
            },
        );
        manifest.entities.insert(
            "orders".into(),
            EntitySection {
                count: 32,
                chunk_count: 1,
                checksum: "cd".into(),
            },
        );
        assert_eq!(manifest.total_records(), 42);
        assert_eq!(manifest.total_media_bytes(), 0);
    }
}
