//! Quarantine for removed and corrupted items.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the trash directory at the root of each table.
pub const TRASH_NAME: &str = "trash";

/// Moves items out of a table's live namespace instead of deleting them.
///
/// An item at `<table>/<rel>` lands at `<table>/trash/<rel>`. If something
/// with that name was already trashed, a numeric suffix is appended so
/// nothing in the trash is ever overwritten.
#[derive(Debug, Clone)]
pub struct Trash {
    table_dir: PathBuf,
    trash_dir: PathBuf,
}

impl Trash {
    /// Create the trash for a table rooted at `table_dir`.
    pub fn new(table_dir: &Path) -> Self {
        Self {
            table_dir: table_dir.to_path_buf(),
            trash_dir: table_dir.join(TRASH_NAME),
        }
    }

    /// The trash directory.
    pub fn dir(&self) -> &Path {
        &self.trash_dir
    }

    /// Move `rel` (relative to the table root) into the trash.
    ///
    /// Returns the path it was moved to. Fails with `NotFound` if nothing
    /// lives at `rel`.
    pub fn move_path(&self, rel: &Path) -> Result<PathBuf> {
        let normal = rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if rel.as_os_str().is_empty() || rel.is_absolute() || !normal {
            return Err(Error::invalid_key(
                rel.display().to_string(),
                "trash paths must be relative and normalized",
            ));
        }

        let src = self.table_dir.join(rel);
        if fs::symlink_metadata(&src).is_err() {
            return Err(Error::not_found(rel.display().to_string()));
        }

        let dest = self.free_destination(&self.trash_dir.join(rel));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dest)?;

        warn!(from = %src.display(), to = %dest.display(), "moved to trash");
        Ok(dest)
    }

    /// First of `dest`, `dest.1`, `dest.2`, ... that does not exist yet.
    fn free_destination(&self, dest: &Path) -> PathBuf {
        if fs::symlink_metadata(dest).is_err() {
            return dest.to_path_buf();
        }
        let mut n = 1u32;
        loop {
            let mut name = OsString::from(dest.as_os_str());
            name.push(format!(".{}", n));
            let candidate = PathBuf::from(name);
            if fs::symlink_metadata(&candidate).is_err() {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Debug hook that plants a corrupt item directly in a table's live area,
/// bypassing the public write path, so self-healing can be exercised.
pub trait Corruptable {
    /// Inject one corrupt item. Returns its path relative to the table root.
    fn corrupt(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("abc")).unwrap();
        fs::write(temp_dir.path().join("abc/item"), b"data").unwrap();

        let trash = Trash::new(temp_dir.path());
        let dest = trash.move_path(Path::new("abc/item")).unwrap();

        assert_eq!(dest, temp_dir.path().join("trash/abc/item"));
        assert!(!temp_dir.path().join("abc/item").exists());
        assert_eq!(fs::read(dest).unwrap(), b"data");
    }

    #[test]
    fn test_move_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let trash = Trash::new(temp_dir.path());

        fs::write(temp_dir.path().join("item"), b"first").unwrap();
        let first = trash.move_path(Path::new("item")).unwrap();
        fs::write(temp_dir.path().join("item"), b"second").unwrap();
        let second = trash.move_path(Path::new("item")).unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(first).unwrap(), b"first");
        assert_eq!(fs::read(second).unwrap(), b"second");
    }

    #[test]
    fn test_move_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("bogus/nested")).unwrap();

        let trash = Trash::new(temp_dir.path());
        trash.move_path(Path::new("bogus")).unwrap();

        assert!(!temp_dir.path().join("bogus").exists());
        assert!(temp_dir.path().join("trash/bogus/nested").is_dir());
    }

    #[test]
    fn test_move_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let trash = Trash::new(temp_dir.path());
        let err = trash.move_path(Path::new("nothing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_move_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let trash = Trash::new(temp_dir.path());
        assert!(trash.move_path(Path::new("../outside")).is_err());
        assert!(trash.move_path(Path::new("/etc/passwd")).is_err());
    }
}
