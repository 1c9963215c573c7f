//! Garbage collection.

use crate::cancel::CancelToken;
use crate::entry::load_entry;
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::store::Store;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Blobs found in the blob table.
    pub blobs_scanned: usize,
    /// Node records marked from.
    pub nodes_scanned: usize,
    /// Unreachable blobs moved to the trash (or that would be, on a dry run).
    pub orphans: usize,
    /// Bytes held by those blobs.
    pub bytes_freed: u64,
    /// Digests referenced by a tree but absent from the blob table.
    pub dangling: usize,
}

/// Mark `digest` reachable, noting references to blobs that were never
/// enumerated.
fn mark(reachable: &mut HashMap<Digest, bool>, dangling: &mut usize, digest: &Digest) {
    if reachable.insert(*digest, true).is_none() {
        debug!(digest = %digest, "dangling reference");
        *dangling += 1;
    }
}

impl Store {
    /// Run garbage collection.
    ///
    /// Every valid blob starts unmarked. Each node marks its root entry and
    /// every file in that tree; unmarked blobs are then moved to the trash.
    /// If any node's tree cannot be loaded, the scan is cancelled, or either
    /// enumeration quarantined something, the run aborts before anything is
    /// removed. A failed removal sets the fsck flag. If `dry_run` is true, reports what would be removed
    /// without removing it.
    pub fn gc(&self, cancel: &CancelToken, dry_run: bool) -> Result<GcStats> {
        self.ensure_consistent()?;

        let mut stats = GcStats::default();

        let mut reachable = HashMap::new();
        for item in self.cas().enumerate(cancel) {
            match item {
                Ok(digest) => {
                    reachable.insert(digest, false);
                }
                Err(e) => {
                    self.cas().need_fsck();
                    return Err(e);
                }
            }
        }
        stats.blobs_scanned = reachable.len();
        info!(blobs = stats.blobs_scanned, "found blobs");

        for item in self.nodes().enumerate(cancel) {
            let entry = item?;
            stats.nodes_scanned += 1;

            mark(&mut reachable, &mut stats.dangling, &entry.node.entry);
            let tree = load_entry(self.cas(), &entry.node.entry)
                .map_err(|e| Error::unreachable_tree(&entry.item, e))?;
            tree.for_each_digest(&mut |digest| mark(&mut reachable, &mut stats.dangling, digest));
        }

        // A partial mark phase must never drive the sweep.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // A quarantined node record may have been the only root of a tree.
        if self.fsck_needed() {
            warn!("tables changed during gc, not sweeping");
            return Err(Error::FsckNeeded);
        }

        let mut orphans: Vec<Digest> = reachable
            .into_iter()
            .filter_map(|(digest, marked)| (!marked).then_some(digest))
            .collect();
        orphans.sort();
        info!(orphans = orphans.len(), nodes = stats.nodes_scanned, "found orphans");

        for orphan in orphans {
            let size = match self.cas().size_of(&orphan) {
                Ok(size) => size,
                Err(e) => {
                    debug!(digest = %orphan, error = %e, "could not size orphan");
                    0
                }
            };
            if !dry_run && let Err(e) = self.cas().remove(&orphan.to_hex()) {
                self.cas().need_fsck();
                return Err(e);
            }
            stats.orphans += 1;
            stats.bytes_freed += size;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, store_entry};
    use crate::nodes::Node;
    use crate::store::StoreConfig;
    use std::fs;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> Store {
        let config = StoreConfig {
            split_at: 1,
            ..StoreConfig::default()
        };
        Store::init(temp_dir.path(), config).unwrap()
    }

    fn blobs(store: &Store) -> Vec<Digest> {
        store
            .cas()
            .enumerate(&CancelToken::new())
            .collect_all()
            .unwrap()
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
    fn test_gc_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats, GcStats::default());
        assert!(blobs(&store).is_empty());
    }

    #[test]
    fn test_gc_keeps_reachable_tree() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats.blobs_scanned, 3);
        assert_eq!(stats.nodes_scanned, 2);
        assert_eq!(stats.orphans, 0);
        assert_eq!(blobs(&store).len(), 3);
    }

    #[test]
    fn test_gc_after_nodes_removed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);

        let nodes = store
            .nodes()
            .enumerate(&CancelToken::new())
            .collect_all()
            .unwrap();
        for entry in nodes {
            store.nodes().remove(&entry.item).unwrap();
        }

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats.orphans, 3);
        assert!(stats.bytes_freed > 0);
        assert!(blobs(&store).is_empty());
        assert!(!store.fsck_needed());
    }

    #[test]
    fn test_gc_removes_only_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        archive_tree(&store);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats.orphans, 1);
        assert_eq!(stats.bytes_freed, 6);
        assert!(!store.cas().contains(&orphan));
        assert_eq!(blobs(&store).len(), 3);

        // Orphans go to the trash, not away.
        let trashed = store
            .cas()
            .trash()
            .dir()
            .join(orphan.prefix(1))
            .join(orphan.suffix(1));
        assert!(trashed.is_file());
    }

    #[test]
    fn test_gc_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();

        let stats = store.gc(&CancelToken::new(), true).unwrap();
        assert_eq!(stats.orphans, 1);
        assert!(store.cas().contains(&orphan));

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats.orphans, 1);
        assert!(!store.cas().contains(&orphan));
    }

    #[test]
    fn test_gc_tolerates_dangling_leaves() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let present = store.cas().add_bytes(b"present").unwrap();
        let mut root = Entry::directory();
        root.insert("present", Entry::file(present, 7, 0)).unwrap();
        root.insert("gone", Entry::file(Digest::of_bytes(b"never stored"), 12, 0))
            .unwrap();
        let tree = store_entry(store.cas(), &root).unwrap();
        store
            .nodes()
            .add_entry(
                &Node {
                    entry: tree,
                    comment: String::new(),
                },
                "partial",
            )
            .unwrap();

        let stats = store.gc(&CancelToken::new(), false).unwrap();
        assert_eq!(stats.orphans, 0);
        // Both records reach "gone"; it is counted once.
        assert_eq!(stats.dangling, 1);
        assert!(store.cas().contains(&present));
        assert!(!store.cas().contains(&Digest::of_bytes(b"never stored")));
    }

    #[test]
    fn test_gc_aborts_on_unreadable_tree() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();
        store
            .nodes()
            .add_entry(
                &Node {
                    entry: Digest::of_bytes(b"missing tree"),
                    comment: String::new(),
                },
                "broken",
            )
            .unwrap();

        let err = store.gc(&CancelToken::new(), false).unwrap_err();
        assert!(matches!(err, Error::UnreachableTree { .. }));
        // Nothing was swept.
        assert!(store.cas().contains(&orphan));
    }

    #[test]
    fn test_gc_aborts_on_torn_node_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.archive("victim", "", [("f", "precious")]).unwrap();

        let nodes = store
            .nodes()
            .enumerate(&CancelToken::new())
            .collect_all()
            .unwrap();
        assert_eq!(nodes.len(), 2);
        for entry in &nodes {
            fs::write(store.nodes().dir().join(&entry.item), b"{ torn").unwrap();
        }

        let err = store.gc(&CancelToken::new(), false).unwrap_err();
        assert!(matches!(err, Error::FsckNeeded));
        assert!(store.nodes().fsck_needed());
        assert_eq!(blobs(&store).len(), 2);
        assert!(store.cas().contains(&Digest::of_bytes(b"precious")));
    }

    #[test]
    fn test_gc_aborts_on_quarantined_blob_shard() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();
        fs::write(store.cas().dir().join("junk"), b"x").unwrap();

        assert!(matches!(
            store.gc(&CancelToken::new(), false),
            Err(Error::FsckNeeded)
        ));
        assert!(store.cas().contains(&orphan));
    }

    #[test]
    fn test_gc_aborts_when_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(store.gc(&cancel, false), Err(Error::Cancelled)));
        assert!(store.cas().contains(&orphan));
    }

    #[test]
    fn test_gc_refuses_when_fsck_needed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let orphan = store.cas().add_bytes(b"orphan").unwrap();
        store.cas().need_fsck();

        assert!(matches!(
            store.gc(&CancelToken::new(), false),
            Err(Error::FsckNeeded)
        ));
        assert!(store.cas().contains(&orphan));
    }
}
