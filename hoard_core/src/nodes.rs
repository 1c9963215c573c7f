//! The node table: one JSON record per completed archive.
//!
//! Layout under `<root>/nodes`:
//!
//! - `<YYYY-MM>/<YYYY-MM-DD_HH-MM-SS>_<name>`: the record written by each
//!   archive run, sharded by month.
//! - `tags/<name>`: a copy of the latest record registered under `name`.
//!
//! Both kinds are enumerated and both are GC roots.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::flag::FsckFlag;
use crate::hash::Digest;
use crate::scan::{Enumeration, ShardLayout, TMP_NAME, spawn_scan, sweep_staging};
use crate::trash::{Corruptable, Trash};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Name of the node table directory under the store root.
pub const NODES_NAME: &str = "nodes";

/// Shard holding the latest record per node name.
pub const TAGS_NAME: &str = "tags";

const MONTH_FORMAT: &str = "%Y-%m";
const RECORD_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const RECORD_TIME_LENGTH: usize = 19;
const MAX_NAME_LENGTH: usize = 64;

/// A snapshot: the digest of the root [`crate::Entry`] of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Digest of the root entry blob.
    pub entry: Digest,
    /// Free-form archive metadata.
    #[serde(default)]
    pub comment: String,
}

/// A node record as found by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Record path relative to the node table, e.g. `tags/home`.
    pub item: String,
    pub node: Node,
}

/// Node names are 1 to 64 characters of `[A-Za-z0-9._-]`, not starting
/// with a dot.
pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_month_shard(name: &str) -> bool {
    name.len() == 7
        && NaiveDateTime::parse_from_str(&format!("{}-01_00-00-00", name), RECORD_TIME_FORMAT)
            .is_ok()
}

/// `<YYYY-MM-DD_HH-MM-SS>_<name>` with the date inside `shard`.
fn is_record_name(shard: &str, name: &str) -> bool {
    if !name.is_ascii() || name.len() <= RECORD_TIME_LENGTH + 1 {
        return false;
    }
    let (stamp, rest) = name.split_at(RECORD_TIME_LENGTH);
    stamp.starts_with(shard)
        && NaiveDateTime::parse_from_str(stamp, RECORD_TIME_FORMAT).is_ok()
        && rest
            .strip_prefix('_')
            .is_some_and(is_valid_node_name)
}

fn is_valid_item(shard: &str, name: &str) -> bool {
    if shard == TAGS_NAME {
        is_valid_node_name(name)
    } else {
        is_month_shard(shard) && is_record_name(shard, name)
    }
}

/// Node storage under `<root>/nodes`.
#[derive(Debug, Clone)]
pub struct NodesTable {
    nodes_dir: PathBuf,
    tmp_dir: PathBuf,
    trash: Trash,
    flag: FsckFlag,
}

impl NodesTable {
    /// Create the node table under `root`.
    pub fn init(root: &Path) -> Result<Self> {
        let table = Self::new(root);
        fs::create_dir_all(table.nodes_dir.join(TAGS_NAME))?;
        fs::create_dir_all(&table.tmp_dir)?;
        Ok(table)
    }

    /// Open the node table under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let table = Self::new(root);
        if !table.nodes_dir.is_dir() {
            return Err(Error::invalid_store(root, "nodes directory missing"));
        }
        fs::create_dir_all(&table.tmp_dir)?;
        Ok(table)
    }

    fn new(root: &Path) -> Self {
        let nodes_dir = root.join(NODES_NAME);
        Self {
            tmp_dir: nodes_dir.join(TMP_NAME),
            trash: Trash::new(&nodes_dir),
            flag: FsckFlag::new(&nodes_dir),
            nodes_dir,
        }
    }

    /// The table directory.
    pub fn dir(&self) -> &Path {
        &self.nodes_dir
    }

    /// The table's trash.
    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// Register `node` under `name`. Returns the new record's item path.
    ///
    /// The dated record is created exclusively; a second archive under the
    /// same name within the same second fails with `AlreadyExists`. The tag
    /// is replaced atomically.
    pub fn add_entry(&self, node: &Node, name: &str) -> Result<String> {
        if !is_valid_node_name(name) {
            return Err(Error::invalid_node(format!("invalid node name {:?}", name)));
        }

        let now = Utc::now();
        let shard = now.format(MONTH_FORMAT).to_string();
        let item = format!("{}/{}_{}", shard, now.format(RECORD_TIME_FORMAT), name);
        fs::create_dir_all(self.nodes_dir.join(&shard))?;

        let data = serde_json::to_vec_pretty(node)?;
        self.stage(&data)?
            .persist_noclobber(self.nodes_dir.join(&item))
            .map_err(|e| match e.error.kind() {
                std::io::ErrorKind::AlreadyExists => Error::already_exists(item.clone()),
                _ => e.into(),
            })?;

        let tags_dir = self.nodes_dir.join(TAGS_NAME);
        fs::create_dir_all(&tags_dir)?;
        self.stage(&data)?.persist(tags_dir.join(name))?;

        info!(item = %item, entry = %node.entry, "registered node");
        Ok(item)
    }

    fn stage(&self, data: &[u8]) -> Result<tempfile::NamedTempFile> {
        let mut staged = tempfile::NamedTempFile::new_in(&self.tmp_dir)?;
        staged.write_all(data)?;
        staged.flush()?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }

    fn item_path(&self, item: &str) -> Result<PathBuf> {
        match item.split_once('/') {
            Some((shard, name)) if is_valid_item(shard, name) => {
                Ok(self.nodes_dir.join(shard).join(name))
            }
            _ => Err(Error::invalid_key(item, "not a node record path")),
        }
    }

    /// Read the record at `item`.
    pub fn load_node(&self, item: &str) -> Result<Node> {
        let path = self.item_path(item)?;
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(item),
            _ => e.into(),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Move the record at `item` to the trash.
    pub fn remove(&self, item: &str) -> Result<()> {
        self.item_path(item)?;
        self.trash.move_path(Path::new(item))?;
        Ok(())
    }

    /// Stream every valid record, quarantining anything that does not fit
    /// the layout or does not decode.
    pub fn enumerate(&self, cancel: &CancelToken) -> Enumeration<NodeEntry> {
        spawn_scan(self.clone(), cancel, "nodes-scan")
    }

    /// Move staged writes older than `max_age` out of `nodes/tmp` into the
    /// trash. Returns how many were moved.
    pub fn sweep_staging(&self, max_age: Duration) -> Result<usize> {
        sweep_staging(self, max_age)
    }

    /// Set the fsck flag.
    pub fn need_fsck(&self) {
        self.flag.set();
    }

    /// Returns true if the fsck flag is set.
    pub fn fsck_needed(&self) -> bool {
        self.flag.is_set()
    }

    /// Returns true if the fsck flag is set, logging a warning.
    pub fn warn_if_fsck_needed(&self) -> bool {
        self.flag.warn_if_set()
    }

    /// Clear the fsck flag.
    pub fn clear_fsck(&self) -> Result<()> {
        self.flag.clear()
    }
}

impl ShardLayout for NodesTable {
    type Item = NodeEntry;

    fn table_dir(&self) -> &Path {
        &self.nodes_dir
    }

    fn trash(&self) -> &Trash {
        &self.trash
    }

    fn flag(&self) -> &FsckFlag {
        &self.flag
    }

    fn is_valid_shard(&self, name: &str) -> bool {
        name == TAGS_NAME || is_month_shard(name)
    }

    fn load_item(&self, shard: &str, name: &str, path: &Path) -> std::io::Result<Option<NodeEntry>> {
        if !is_valid_item(shard, name) {
            return Ok(None);
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data).ok().map(|node| NodeEntry {
            item: format!("{}/{}", shard, name),
            node,
        }))
    }
}

impl Corruptable for NodesTable {
    /// Overwrite the first record with bytes that do not decode.
    fn corrupt(&self) -> Result<String> {
        let entries = self.enumerate(&CancelToken::new()).collect_all()?;
        let first = entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("no node record to corrupt"))?;
        fs::write(self.nodes_dir.join(&first.item), b"{ this is not a node")?;
        Ok(first.item)
    }
}
