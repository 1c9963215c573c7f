//! Consistency checking.
//!
//! There is no separate checking algorithm: a full enumeration of both
//! tables quarantines every structural anomaly as a side effect. On top of
//! that, blobs can be rehashed so content that no longer matches its name
//! is quarantined too. Staged writes abandoned in either table's `tmp`
//! directory are moved to the trash.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::hash::Digest;
use crate::store::Store;
use std::time::Duration;
use tracing::{info, warn};

/// Staged writes older than this were left by an interrupted write.
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

/// Outcome of an fsck pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Valid blobs remaining after the pass.
    pub blobs: usize,
    /// Valid node records remaining after the pass.
    pub nodes: usize,
    /// Blobs whose content did not match their digest, now in the trash.
    pub corrupt_blobs: Vec<Digest>,
    /// Node records whose root entry is not in the blob table. These are
    /// kept: the blob may still exist in another copy of the store.
    pub dangling_nodes: Vec<String>,
    /// Abandoned staged writes moved to the trash.
    pub stale_staged: usize,
    /// Errors that prevented part of the scan.
    pub errors: Vec<String>,
}

impl FsckReport {
    /// True if the pass completed without errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Store {
    /// Scan both tables, quarantining anything invalid.
    ///
    /// With `verify_content`, each blob is also rehashed. Runs regardless of
    /// the fsck flags, and clears them once a pass completes without errors
    /// or cancellation.
    pub fn fsck(&self, cancel: &CancelToken, verify_content: bool) -> Result<FsckReport> {
        let mut report = FsckReport::default();

        for swept in [
            self.cas().sweep_staging(STALE_STAGING_AGE),
            self.nodes().sweep_staging(STALE_STAGING_AGE),
        ] {
            match swept {
                Ok(n) => report.stale_staged += n,
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        for item in self.cas().enumerate(cancel) {
            let digest = match item {
                Ok(digest) => digest,
                Err(e) => {
                    report.errors.push(e.to_string());
                    continue;
                }
            };

            if verify_content {
                match self.cas().verify(&digest) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(digest = %digest, "content does not match digest");
                        self.cas().need_fsck();
                        match self.cas().remove(&digest.to_hex()) {
                            Ok(()) => report.corrupt_blobs.push(digest),
                            Err(e) => report.errors.push(e.to_string()),
                        }
                        continue;
                    }
                    Err(e) => {
                        report.errors.push(format!("{}: {}", digest, e));
                        continue;
                    }
                }
            }
            report.blobs += 1;
        }
        info!(blobs = report.blobs, corrupt = report.corrupt_blobs.len(), "scanned blob table");

        for item in self.nodes().enumerate(cancel) {
            match item {
                Ok(entry) => {
                    if !self.cas().contains(&entry.node.entry) {
                        warn!(item = %entry.item, entry = %entry.node.entry, "node points at a missing tree");
                        report.dangling_nodes.push(entry.item);
                    }
                    report.nodes += 1;
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }
        info!(nodes = report.nodes, dangling = report.dangling_nodes.len(), "scanned node table");

        if report.is_ok() && !cancel.is_cancelled() {
            self.cas().clear_fsck()?;
            self.nodes().clear_fsck()?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::scan::TMP_NAME;
    use crate::trash::Corruptable;
    use std::fs;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> Store {
        Store::init(temp_dir.path(), StoreConfig::default()).unwrap()
    }

    fn counts(store: &Store) -> (usize, usize) {
        let cancel = CancelToken::new();
        let blobs = store.cas().enumerate(&cancel).collect_all().unwrap();
        let nodes = store.nodes().enumerate(&cancel).collect_all().unwrap();
        (blobs.len(), nodes.len())
    }

    fn archive_tree(store: &Store) {
        store
            .archive(
                "tree1",
                "",
                [("file1", "content1"), ("dir1/dir2/file2", "content2")],
            )
            .unwrap();
    }

    #[test]
    fn test_fsck_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let report = store.fsck(&CancelToken::new(), true).unwrap();
        assert_eq!(report, FsckReport::default());
        assert_eq!(counts(&store), (0, 0));
    }

    #[test]
    fn test_fsck_corrupt_cas_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);
        assert_eq!(counts(&store), (3, 2));

        store.cas().corrupt().unwrap();
        assert_eq!(counts(&store), (4, 2));

        let report = store.fsck(&CancelToken::new(), true).unwrap();
        assert_eq!(report.corrupt_blobs.len(), 1);
        assert!(report.is_ok());

        // The node is kept even though nothing else changed about it.
        assert_eq!(counts(&store), (3, 2));
        assert!(!store.fsck_needed());
    }

    #[test]
    fn test_fsck_quick_skips_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);
        store.cas().corrupt().unwrap();

        let report = store.fsck(&CancelToken::new(), false).unwrap();
        assert!(report.corrupt_blobs.is_empty());
        assert_eq!(report.blobs, 4);
    }

    #[test]
    fn test_fsck_corrupt_node_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);

        store.nodes().corrupt().unwrap();
        let report = store.fsck(&CancelToken::new(), true).unwrap();
        assert_eq!(report.nodes, 1);

        assert_eq!(counts(&store), (3, 1));
        assert!(!store.fsck_needed());
    }

    #[test]
    fn test_fsck_heals_layout_and_clears_flag() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);

        fs::write(store.cas().dir().join("abc").join("garbage"), b"x").unwrap();
        fs::create_dir(store.nodes().dir().join("not-a-month")).unwrap();

        let report = store.fsck(&CancelToken::new(), false).unwrap();
        assert!(report.is_ok());
        assert_eq!((report.blobs, report.nodes), (3, 2));
        assert!(!store.fsck_needed());
        assert!(store.cas().trash().dir().join("abc/garbage").is_file());
        assert!(store.nodes().trash().dir().join("not-a-month").is_dir());
        store.ensure_consistent().unwrap();
    }

    #[test]
    fn test_fsck_keeps_dangling_nodes() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let archived = store.archive("tree1", "", [("file1", "content1")]).unwrap();
        store.cas().remove(&archived.node.entry.to_hex()).unwrap();

        let report = store.fsck(&CancelToken::new(), true).unwrap();
        assert_eq!(report.dangling_nodes.len(), 2);
        assert_eq!(report.nodes, 2);
        assert_eq!(counts(&store), (1, 2));
    }

    #[test]
    fn test_fsck_sweeps_abandoned_staging() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);

        let tmp_dir = store.cas().dir().join(TMP_NAME);
        let old = tmp_dir.join(".tmpOld001");
        fs::write(&old, b"half a blob").unwrap();
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 60 * 60))
            .unwrap();
        fs::write(tmp_dir.join(".tmpNew001"), b"in flight").unwrap();

        let report = store.fsck(&CancelToken::new(), true).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.stale_staged, 1);
        assert!(!old.exists());
        assert!(tmp_dir.join(".tmpNew001").is_file());
        assert!(store.cas().trash().dir().join(TMP_NAME).join(".tmpOld001").is_file());
        assert_eq!(counts(&store), (3, 2));
    }

    #[test]
    fn test_cancelled_fsck_keeps_flag() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.cas().need_fsck();

        let cancel = CancelToken::new();
        cancel.cancel();
        store.fsck(&cancel, true).unwrap();
        assert!(store.fsck_needed());

        store.fsck(&CancelToken::new(), true).unwrap();
        assert!(!store.fsck_needed());
    }
}
