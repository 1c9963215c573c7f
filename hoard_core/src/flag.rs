//! The persisted "fsck needed" marker.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Name of the marker file at the root of each table.
pub const NEED_FSCK_NAME: &str = "need_fsck";

/// A marker file whose presence means the table saw a structural anomaly
/// since the last complete fsck.
#[derive(Debug, Clone)]
pub struct FsckFlag {
    path: PathBuf,
}

impl FsckFlag {
    /// Create a flag stored in `table_dir`.
    pub fn new(table_dir: &Path) -> Self {
        Self {
            path: table_dir.join(NEED_FSCK_NAME),
        }
    }

    /// Set the flag.
    ///
    /// Setting happens on error paths, so a failure to persist it is logged
    /// rather than returned.
    pub fn set(&self) {
        warn!(path = %self.path.display(), "marking for fsck");
        if let Err(e) = fs::File::create(&self.path) {
            error!(path = %self.path.display(), error = %e, "failed to persist fsck flag");
        }
    }

    /// Returns true if the flag is set.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Returns true if the flag is set, warning about it.
    pub fn warn_if_set(&self) -> bool {
        let set = self.is_set();
        if set {
            warn!(path = %self.path.display(), "fsck is needed");
        }
        set
    }

    /// Clear the flag. Clearing an unset flag is a no-op.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let flag = FsckFlag::new(temp_dir.path());

        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        assert!(flag.warn_if_set());
        flag.clear().unwrap();
        assert!(!flag.is_set());
        flag.clear().unwrap();
    }
}
