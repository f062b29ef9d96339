//! Media tree restore: sync the bundle's media files into the target media
//! root, verifying the copied-file count.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{MigrationError, Result};

fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Copy every file under `source_root` to the same relative path under
/// `target_root`. Returns the number of files copied; a shortfall against
/// the source inventory is an integrity error.
pub fn restore_media(source_root: &Path, target_root: &Path) -> Result<u64> {
    let inventory = collect_files(source_root)?;
    let expected = inventory.len() as u64;
    let mut copied: u64 = 0;
    for source in inventory {
        let relative = source.strip_prefix(source_root).map_err(|_| {
            MigrationError::FatalSystem(format!(
                "media file escaped bundle root: {}",
                source.display()
            ))
        })?;
        let target = target_root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &target)?;
        copied += 1;
    }
    if copied != expected {
        return Err(MigrationError::Integrity(format!(
            "media restore incomplete: expected {} files, copied {}",
            expected, copied
        )));
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_tree_and_counts() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("events/2026")).unwrap();
        fs::write(source.path().join("logo.png"), b"logo").unwrap();
        fs::write(source.path().join("events/2026/banner.png"), b"banner").unwrap();

        let copied = restore_media(source.path(), target.path()).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(
            fs::read(target.path().join("events/2026/banner.png")).unwrap(),
            b"banner"
        );
    }

    #[test]
    fn empty_source_copies_nothing() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        assert_eq!(restore_media(source.path(), target.path()).unwrap(), 0);
    }
}
