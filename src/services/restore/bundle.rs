//! Backup bundle container: a tar.gz with a SQLite snapshot under
//! `database/platform.db` and a media tree under `media/`. Missing either
//! sub-path is an immediate validation failure.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::errors::{MigrationError, Result};

pub const DATABASE_ENTRY: &str = "database/platform.db";
pub const MEDIA_DIR: &str = "media";

pub struct RestoreBundle {
    root: tempfile::TempDir,
}

impl RestoreBundle {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let root = tempfile::tempdir()?;
        archive.unpack(root.path())?;

        let bundle = Self { root };
        if !bundle.database_snapshot().is_file() {
            return Err(MigrationError::Validation(format!(
                "bundle has no {}",
                DATABASE_ENTRY
            )));
        }
        if !bundle.media_root().is_dir() {
            return Err(MigrationError::Validation(format!(
                "bundle has no {}/ tree",
                MEDIA_DIR
            )));
        }
        Ok(bundle)
    }

    pub fn database_snapshot(&self) -> PathBuf {
        self.root.path().join(DATABASE_ENTRY)
    }

    pub fn media_root(&self) -> PathBuf {
        self.root.path().join(MEDIA_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn build_bundle(path: &Path, with_db: bool, with_media: bool) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let append = |builder: &mut tar::Builder<GzEncoder<File>>, entry: &str, bytes: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, entry, bytes).unwrap();
        };
        if with_db {
            append(&mut builder, DATABASE_ENTRY, b"not a real sqlite file");
        }
        if with_media {
            append(&mut builder, "media/events/banner.png", b"png bytes");
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn complete_bundle_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        build_bundle(&path, true, true);
        let bundle = RestoreBundle::open(&path).unwrap();
        assert!(bundle.database_snapshot().is_file());
        assert!(bundle.media_root().join("events/banner.png").is_file());
    }

    #[test]
    fn missing_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        build_bundle(&path, false, true);
        assert!(RestoreBundle::open(&path).is_err());
    }

    #[test]
    fn missing_media_tree_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        build_bundle(&path, true, false);
        assert!(RestoreBundle::open(&path).is_err());
    }
}
