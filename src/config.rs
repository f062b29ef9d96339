use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{MigrationError, Result};

/// Engine tuning knobs. Everything has a default; a TOML file only needs to
/// name the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name stamped into archive manifests as `source_environment`.
    pub environment: String,
    /// Records per archive chunk.
    pub chunk_size: u64,
    /// Concurrent workers in the file transfer pool.
    pub parallel_transfers: usize,
    /// Attempts per file before a transient failure becomes terminal.
    pub max_transfer_attempts: u32,
    /// Base backoff between attempts, doubled per retry.
    pub retry_base_ms: u64,
    /// Jobs with no progress for this long are failed by the watchdog.
    pub stall_minutes: i64,
    pub checkpoint_retention_days: i64,
    pub token_default_ttl_hours: i64,
    pub archive_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub media_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            chunk_size: 1000,
            parallel_transfers: 4,
            max_transfer_attempts: 3,
            retry_base_ms: 500,
            stall_minutes: 30,
            checkpoint_retention_days: 30,
            token_default_ttl_hours: 24,
            archive_dir: PathBuf::from("data/archives"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            media_root: PathBuf::from("data/media"),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| MigrationError::Validation(format!("invalid config file: {}", e)))
    }

    /// Make sure the working directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.archive_dir)?;
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        std::fs::create_dir_all(&self.media_root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.parallel_transfers, 4);
        assert_eq!(config.max_transfer_attempts, 3);
        assert_eq!(config.stall_minutes, 30);
    }

    #[test]
    fn partial_toml_overrides_only_named_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gangway.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "environment = \"staging\"").unwrap();
        writeln!(file, "chunk_size = 250").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.parallel_transfers, 4);
    }

    #[test]
    fn malformed_toml_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "chunk_size = \"lots\"").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
