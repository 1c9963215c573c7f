//! Self-healing enumeration shared by the blob and node tables.
//!
//! Both tables are laid out as `<table>/<shard>/<item>`. A scan walks that
//! layout on its own thread and streams every valid item to the caller.
//! Anything that does not fit the layout is moved to the table's trash and
//! the table's fsck flag is set; the scan then carries on with the next
//! entry. Read failures and failed quarantines are reported in the stream
//! instead, since the entry may be fine.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::flag::{FsckFlag, NEED_FSCK_NAME};
use crate::trash::{TRASH_NAME, Trash};
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Name of the staging directory for in-flight writes.
pub const TMP_NAME: &str = "tmp";

/// Items buffered between the scanning thread and the consumer.
const CHANNEL_CAPACITY: usize = 256;

/// Names at the table root that belong to the table itself.
fn is_reserved(name: &str) -> bool {
    name == TRASH_NAME || name == TMP_NAME || name == NEED_FSCK_NAME
}

/// Describes how one table is laid out on disk.
pub(crate) trait ShardLayout: Send + 'static {
    type Item: Send + 'static;

    fn table_dir(&self) -> &Path;

    fn trash(&self) -> &Trash;

    fn flag(&self) -> &FsckFlag;

    fn is_valid_shard(&self, name: &str) -> bool;

    /// Load the regular file `path`, named `shard/name`. Returns `Ok(None)`
    /// when the item is structurally invalid and must be quarantined, and
    /// an error when it could not be read.
    fn load_item(&self, shard: &str, name: &str, path: &Path)
    -> std::io::Result<Option<Self::Item>>;
}

/// A stream of table items produced by a background scan.
///
/// The stream ends when the scan finishes or is cancelled. Dropping it
/// early stops the scan at its next item.
#[derive(Debug)]
pub struct Enumeration<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Enumeration<T> {
    /// Drain the stream, failing on the first error.
    pub fn collect_all(self) -> Result<Vec<T>> {
        self.collect()
    }
}

impl<T> Iterator for Enumeration<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Start scanning `layout` on a new thread.
pub(crate) fn spawn_scan<L: ShardLayout>(
    layout: L,
    cancel: &CancelToken,
    name: &str,
) -> Enumeration<L::Item> {
    let (tx, rx) = sync_channel(CHANNEL_CAPACITY);
    let spawn_tx = tx.clone();
    let cancel = cancel.clone();

    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || scan(&layout, &cancel, &tx));
    if let Err(e) = spawned {
        let _ = spawn_tx.send(Err(e.into()));
    }

    Enumeration { rx }
}

fn read_error(path: &Path, err: std::io::Error) -> Error {
    Error::Io {
        source: std::io::Error::new(
            err.kind(),
            format!("failed reading {}: {}", path.display(), err),
        ),
    }
}

/// List a directory, sorted by name.
fn read_sorted(dir: &Path) -> std::io::Result<Vec<(OsString, fs::FileType)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        entries.push((entry.file_name(), entry.file_type()?));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Quarantine `rel`. Returns false once the consumer has gone away.
fn quarantine<L: ShardLayout>(layout: &L, rel: &Path, tx: &SyncSender<Result<L::Item>>) -> bool {
    layout.flag().set();
    match layout.trash().move_path(rel) {
        Ok(_) => true,
        Err(e) => {
            let path = layout.table_dir().join(rel);
            let err = Error::corruption(path, format!("could not move to trash: {}", e));
            tx.send(Err(err)).is_ok()
        }
    }
}

fn scan<L: ShardLayout>(layout: &L, cancel: &CancelToken, tx: &SyncSender<Result<L::Item>>) {
    let table_dir = layout.table_dir();
    let shards = match read_sorted(table_dir) {
        Ok(shards) => shards,
        Err(e) => {
            let _ = tx.send(Err(read_error(table_dir, e)));
            return;
        }
    };

    let mut count = 0usize;
    for (shard_name, file_type) in shards {
        if cancel.is_cancelled() {
            debug!(table = %table_dir.display(), "scan cancelled");
            return;
        }

        let shard = match shard_name.to_str() {
            Some(shard) if is_reserved(shard) => continue,
            Some(shard) if file_type.is_dir() && layout.is_valid_shard(shard) => shard,
            _ => {
                if !quarantine(layout, Path::new(&shard_name), tx) {
                    return;
                }
                continue;
            }
        };

        let shard_path = table_dir.join(shard);
        let items = match read_sorted(&shard_path) {
            Ok(items) => items,
            Err(e) => {
                layout.flag().set();
                if tx.send(Err(read_error(&shard_path, e))).is_err() {
                    return;
                }
                continue;
            }
        };

        for (item_name, file_type) in items {
            if cancel.is_cancelled() {
                debug!(table = %table_dir.display(), "scan cancelled");
                return;
            }

            let loaded = match item_name.to_str() {
                Some(name) if file_type.is_file() => {
                    let path = shard_path.join(name);
                    layout
                        .load_item(shard, name, &path)
                        .map_err(|e| read_error(&path, e))
                }
                _ => Ok(None),
            };

            let keep_going = match loaded {
                Ok(Some(item)) => {
                    count += 1;
                    tx.send(Ok(item)).is_ok()
                }
                Ok(None) => quarantine(layout, &Path::new(shard).join(&item_name), tx),
                Err(e) => {
                    layout.flag().set();
                    tx.send(Err(e)).is_ok()
                }
            };
            if !keep_going {
                return;
            }
        }
    }

    debug!(table = %table_dir.display(), items = count, "scan finished");
}

/// Move staged files older than `max_age` from `<table>/tmp` to the trash.
///
/// A staged file that old was left behind by an interrupted write. Younger
/// ones may belong to a write still in progress and are left alone.
pub(crate) fn sweep_staging<L: ShardLayout>(layout: &L, max_age: Duration) -> Result<usize> {
    let tmp_dir = layout.table_dir().join(TMP_NAME);
    let entries = match read_sorted(&tmp_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(read_error(&tmp_dir, e)),
    };

    let now = SystemTime::now();
    let mut moved = 0;
    for (name, _) in entries {
        // Gone already: the write finished.
        let Ok(modified) = fs::symlink_metadata(tmp_dir.join(&name)).and_then(|m| m.modified())
        else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() < max_age {
            continue;
        }
        match layout.trash().move_path(&Path::new(TMP_NAME).join(&name)) {
            Ok(_) => moved += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    if moved > 0 {
        debug!(table = %layout.table_dir().display(), moved, "swept stale staged writes");
    }
    Ok(moved)
}
