//! Gzip-compressed tar container for migration archives.
//!
//! Layout:
//!
//! ```text
//! archive.tar.gz
//! ├── data/<entity_kind>/chunk-00000.json     JSON array, bounded size
//! ├── media/<relative path>                   optional raw media bytes
//! └── manifest.json                           always the last entry
//! ```
//!
//! The manifest is written last so a truncated or interrupted write can
//! never masquerade as a complete archive.

pub mod manifest;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::catalog::EntityKind;
use crate::errors::{MigrationError, Result};

pub use manifest::{EntitySection, Manifest, MediaEntry, FORMAT_VERSION};

pub const MANIFEST_ENTRY: &str = "manifest.json";

pub fn chunk_entry_path(kind: EntityKind, index: u64) -> String {
    format!("data/{}/chunk-{:05}.json", kind.as_str(), index)
}

pub fn media_entry_path(relative: &str) -> String {
    format!("media/{}", relative)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Streaming writer for migration archives. Entries go straight into the
/// compressed tar; `finish` appends the manifest and makes the file durable.
pub struct ArchiveWriter {
    builder: tar::Builder<GzEncoder<File>>,
    path: PathBuf,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Self {
            builder: tar::Builder::new(encoder),
            path: path.to_path_buf(),
        })
    }

    pub fn append_bytes(&mut self, entry_path: &str, bytes: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder.append_data(&mut header, entry_path, bytes)?;
        Ok(())
    }

    pub fn append_chunk(
        &mut self,
        kind: EntityKind,
        index: u64,
        records: &[serde_json::Value],
    ) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(records)?;
        self.append_bytes(&chunk_entry_path(kind, index), &bytes)?;
        Ok(bytes)
    }

    pub fn append_media_file(&mut self, relative: &str, source: &Path) -> Result<MediaEntry> {
        let bytes = fs::read(source)?;
        self.append_bytes(&media_entry_path(relative), &bytes)?;
        Ok(MediaEntry {
            size_bytes: bytes.len() as u64,
            checksum: sha256_hex(&bytes),
        })
    }

    /// Append the manifest as the final entry, then flush and fsync.
    /// Returns the size of the finished archive in bytes.
    pub fn finish(mut self, manifest: &Manifest) -> Result<u64> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.append_bytes(MANIFEST_ENTRY, &bytes)?;
        let encoder = self.builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.sync_all()?;
        let size = fs::metadata(&self.path)?.len();
        Ok(size)
    }
}

/// Reader over an extracted archive. Extraction happens once into a
/// temporary directory that lives as long as the reader.
pub struct ArchiveReader {
    manifest: Manifest,
    root: tempfile::TempDir,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let root = tempfile::tempdir()?;
        archive.unpack(root.path())?;

        let manifest_path = root.path().join(MANIFEST_ENTRY);
        if !manifest_path.is_file() {
            return Err(MigrationError::Validation(
                "archive has no manifest.json; refusing incomplete archive".to_string(),
            ));
        }
        let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
        manifest.check_format()?;
        Ok(Self { manifest, root })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn read_chunk(&self, kind: EntityKind, index: u64) -> Result<Vec<serde_json::Value>> {
        let path = self.root.path().join(chunk_entry_path(kind, index));
        let bytes = fs::read(&path).map_err(|e| {
            MigrationError::Validation(format!(
                "archive chunk missing: {} ({})",
                chunk_entry_path(kind, index),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn media_path(&self, relative: &str) -> PathBuf {
        self.root.path().join(media_entry_path(relative))
    }

    /// Full structural validation before any mutation: every declared chunk
    /// must exist, per-kind checksums and record counts must match the
    /// manifest, and every indexed media file must be present with the
    /// right checksum.
    pub fn validate(&self) -> Result<()> {
        for kind in &self.manifest.entity_order {
            let section = match self.manifest.section(*kind) {
                Some(section) => section,
                None => continue,
            };
            let mut hasher = Sha256::new();
            let mut records: u64 = 0;
            for index in 0..section.chunk_count {
                let path = self.root.path().join(chunk_entry_path(*kind, index));
                let bytes = fs::read(&path).map_err(|_| {
                    MigrationError::Validation(format!(
                        "archive chunk missing: {}",
                        chunk_entry_path(*kind, index)
                    ))
                })?;
                hasher.update(&bytes);
                let chunk: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
                records += chunk.len() as u64;
            }
            let checksum = hex::encode(hasher.finalize());
            if checksum != section.checksum {
                return Err(MigrationError::Integrity(format!(
                    "checksum mismatch for {}: manifest {} computed {}",
                    kind, section.checksum, checksum
                )));
            }
            if records != section.count {
                return Err(MigrationError::Integrity(format!(
                    "record count mismatch for {}: manifest {} found {}",
                    kind, section.count, records
                )));
            }
        }

        for (relative, entry) in &self.manifest.media_index {
            let path = self.media_path(relative);
            if !path.is_file() {
                return Err(MigrationError::Validation(format!(
                    "archive media file missing: {}",
                    relative
                )));
            }
            let checksum = sha256_file(&path)?;
            if checksum != entry.checksum {
                return Err(MigrationError::Integrity(format!(
                    "media checksum mismatch for {}: manifest {} computed {}",
                    relative, entry.checksum, checksum
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_chunk(n: u64) -> Vec<serde_json::Value> {
        (0..n)
            .map(|i| json!({"id": format!("u-{i}"), "email": format!("u{i}@example.com")}))
            .collect()
    }

    fn write_archive(path: &Path, records: u64) -> Manifest {
        let mut writer = ArchiveWriter::create(path).unwrap();
        let chunk = sample_chunk(records);
        let bytes = writer.append_chunk(EntityKind::Users, 0, &chunk).unwrap();

        let mut manifest = Manifest::new("test");
        manifest.entities.insert(
            EntityKind::Users.as_str().to_string(),
            EntitySection {
                count: records,
                chunk_count: 1,
                checksum: sha256_hex(&bytes),
            },
        );
        writer.finish(&manifest).unwrap();
        manifest
    }

    #[test]
    fn round_trip_preserves_records_and_passes_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tar.gz");
        write_archive(&path, 7);

        let reader = ArchiveReader::open(&path).unwrap();
        reader.validate().unwrap();
        let chunk = reader.read_chunk(EntityKind::Users, 0).unwrap();
        assert_eq!(chunk.len(), 7);
        assert_eq!(chunk[0]["id"], "u-0");
        assert_eq!(reader.manifest().total_records(), 7);
    }

    #[test]
    fn corrupted_checksum_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tar.gz");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer
            .append_chunk(EntityKind::Users, 0, &sample_chunk(3))
            .unwrap();
        let mut manifest = Manifest::new("test");
        manifest.entities.insert(
            "users".to_string(),
            EntitySection {
                count: 3,
                chunk_count: 1,
                checksum: "deadbeef".to_string(),
            },
        );
        writer.finish(&manifest).unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        let err = reader.validate().unwrap_err();
        assert_eq!(err.error_code(), "INTEGRITY_ERROR");
    }

    #[test]
    fn declared_but_absent_chunk_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tar.gz");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        let bytes = writer
            .append_chunk(EntityKind::Users, 0, &sample_chunk(2))
            .unwrap();
        let mut manifest = Manifest::new("test");
        manifest.entities.insert(
            "users".to_string(),
            EntitySection {
                count: 4,
                chunk_count: 2,
                checksum: sha256_hex(&bytes),
            },
        );
        writer.finish(&manifest).unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert!(reader.validate().is_err());
    }

    #[test]
    fn archive_without_manifest_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.tar.gz");

        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let payload = b"[]";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "data/users/chunk-00000.json", payload.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(ArchiveReader::open(&path).is_err());
    }
}
