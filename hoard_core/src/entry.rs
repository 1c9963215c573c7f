//! Snapshot trees, stored as JSON blobs in the blob table.

use crate::cas::CasTable;
use crate::error::{Error, Result};
use crate::hash::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node of a snapshot tree.
///
/// A whole tree is serialized as one JSON document and stored as one blob;
/// its digest is what a [`crate::Node`] points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntryRecord", into = "EntryRecord")]
pub enum Entry {
    /// A file whose content is the blob `digest`.
    File {
        digest: Digest,
        size: u64,
        /// Modification time, seconds since the Unix epoch.
        timestamp: i64,
    },
    /// A directory of named children.
    Directory { files: BTreeMap<String, Entry> },
}

/// Wire form: a file carries `sha1`, a directory carries `files`.
#[derive(Clone, Serialize, Deserialize)]
struct EntryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha1: Option<Digest>,
    #[serde(default, skip_serializing_if = "is_zero")]
    size: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<BTreeMap<String, Entry>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn check_child_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(format!("invalid child name {:?}", name));
    }
    Ok(())
}

impl TryFrom<EntryRecord> for Entry {
    type Error = String;

    fn try_from(record: EntryRecord) -> std::result::Result<Self, String> {
        match (record.sha1, record.files) {
            (Some(digest), None) => Ok(Entry::File {
                digest,
                size: record.size,
                timestamp: record.timestamp,
            }),
            (None, Some(files)) => {
                for name in files.keys() {
                    check_child_name(name)?;
                }
                Ok(Entry::Directory { files })
            }
            (Some(_), Some(_)) => Err("entry has both sha1 and files".to_string()),
            (None, None) => Err("entry has neither sha1 nor files".to_string()),
        }
    }
}

impl From<Entry> for EntryRecord {
    fn from(entry: Entry) -> Self {
        match entry {
            Entry::File {
                digest,
                size,
                timestamp,
            } => EntryRecord {
                sha1: Some(digest),
                size,
                timestamp,
                files: None,
            },
            Entry::Directory { files } => EntryRecord {
                sha1: None,
                size: 0,
                timestamp: 0,
                files: Some(files),
            },
        }
    }
}

impl Entry {
    /// A file entry.
    pub fn file(digest: Digest, size: u64, timestamp: i64) -> Self {
        Entry::File {
            digest,
            size,
            timestamp,
        }
    }

    /// An empty directory.
    pub fn directory() -> Self {
        Entry::Directory {
            files: BTreeMap::new(),
        }
    }

    /// Content digest of a file entry.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Entry::File { digest, .. } => Some(digest),
            Entry::Directory { .. } => None,
        }
    }

    /// Children of a directory entry.
    pub fn children(&self) -> Option<&BTreeMap<String, Entry>> {
        match self {
            Entry::File { .. } => None,
            Entry::Directory { files } => Some(files),
        }
    }

    /// Insert `entry` at the `/`-separated relative `path`, creating
    /// intermediate directories. An existing entry at `path` is replaced.
    pub fn insert(&mut self, path: &str, entry: Entry) -> Result<()> {
        let mut parts: Vec<&str> = path.split('/').collect();
        let leaf = parts.pop().unwrap_or_default();
        for part in parts.iter().chain(std::iter::once(&leaf)) {
            check_child_name(part).map_err(|reason| Error::invalid_key(path, reason))?;
        }

        let mut dir = self;
        for part in parts {
            let Entry::Directory { files } = dir else {
                return Err(Error::invalid_key(path, "parent is a file"));
            };
            dir = files.entry(part.to_string()).or_insert_with(Entry::directory);
        }

        match dir {
            Entry::Directory { files } => {
                files.insert(leaf.to_string(), entry);
                Ok(())
            }
            Entry::File { .. } => Err(Error::invalid_key(path, "parent is a file")),
        }
    }

    /// Call `f` with the content digest of every file in the tree.
    pub fn for_each_digest<F: FnMut(&Digest)>(&self, f: &mut F) {
        match self {
            Entry::File { digest, .. } => f(digest),
            Entry::Directory { files } => {
                for child in files.values() {
                    child.for_each_digest(f);
                }
            }
        }
    }

    /// Number of files in the tree.
    pub fn file_count(&self) -> usize {
        let mut count = 0;
        self.for_each_digest(&mut |_| count += 1);
        count
    }
}

/// Serialize a tree and store it as a blob. Storing a tree that is already
/// present is not an error.
pub fn store_entry(cas: &CasTable, entry: &Entry) -> Result<Digest> {
    let data = serde_json::to_vec(entry)?;
    match cas.add_bytes(&data) {
        Ok(digest) => Ok(digest),
        Err(e) if e.is_already_exists() => Ok(Digest::of_bytes(&data)),
        Err(e) => Err(e),
    }
}

/// Load and decode the tree stored under `digest`.
pub fn load_entry(cas: &CasTable, digest: &Digest) -> Result<Entry> {
    let data = cas.read(digest)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> Entry {
        let mut root = Entry::directory();
        root.insert("file1", Entry::file(Digest::of_bytes(b"content1"), 8, 1))
            .unwrap();
        root.insert(
            "dir1/dir2/file2",
            Entry::file(Digest::of_bytes(b"content2"), 8, 2),
        )
        .unwrap();
        root
    }

    #[test]
    fn test_insert_builds_directories() {
        let root = sample_tree();
        let dir1 = &root.children().unwrap()["dir1"];
        let dir2 = &dir1.children().unwrap()["dir2"];
        let file2 = &dir2.children().unwrap()["file2"];
        assert_eq!(file2.digest(), Some(&Digest::of_bytes(b"content2")));
        assert_eq!(root.file_count(), 2);
    }

    #[test]
    fn test_insert_rejects_bad_paths() {
        let mut root = sample_tree();
        let leaf = Entry::file(Digest::of_bytes(b"x"), 1, 0);
        assert!(root.insert("", leaf.clone()).is_err());
        assert!(root.insert("a//b", leaf.clone()).is_err());
        assert!(root.insert("../escape", leaf.clone()).is_err());
        assert!(root.insert("file1/child", leaf).is_err());
    }

    #[test]
    fn test_json_shape() {
        let leaf = Entry::file(Digest::of_bytes(b"content1"), 8, 42);
        let value = serde_json::to_value(&leaf).unwrap();
        assert_eq!(value["sha1"], Digest::of_bytes(b"content1").to_hex());
        assert_eq!(value["size"], 8);
        assert!(value.get("files").is_none());

        let value = serde_json::to_value(Entry::directory()).unwrap();
        assert_eq!(value, serde_json::json!({ "files": {} }));
    }

    #[test]
    fn test_decode_rejects_ambiguous_records() {
        let digest = Digest::of_bytes(b"x").to_hex();
        let both = format!(r#"{{"sha1":"{}","files":{{}}}}"#, digest);
        assert!(serde_json::from_str::<Entry>(&both).is_err());
        assert!(serde_json::from_str::<Entry>("{}").is_err());
        assert!(serde_json::from_str::<Entry>(r#"{"sha1":"nothex"}"#).is_err());
        assert!(serde_json::from_str::<Entry>(r#"{"files":{"a/b":{"files":{}}}}"#).is_err());
    }

    #[test]
    fn test_store_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasTable::init(temp_dir.path(), 1).unwrap();
        let root = sample_tree();

        let digest = store_entry(&cas, &root).unwrap();
        assert_eq!(store_entry(&cas, &root).unwrap(), digest);
        assert_eq!(load_entry(&cas, &digest).unwrap(), root);
    }

    #[test]
    fn test_load_missing_or_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasTable::init(temp_dir.path(), 1).unwrap();

        let missing = Digest::of_bytes(b"missing");
        assert!(load_entry(&cas, &missing).unwrap_err().is_not_found());

        let garbage = cas.add_bytes(b"not json").unwrap();
        assert!(matches!(
            load_entry(&cas, &garbage),
            Err(Error::Json { .. })
        ));
    }

    #[test]
    fn test_for_each_digest_visits_leaves() {
        let mut seen = Vec::new();
        sample_tree().for_each_digest(&mut |d| seen.push(*d));
        seen.sort();
        let mut expected = vec![Digest::of_bytes(b"content1"), Digest::of_bytes(b"content2")];
        expected.sort();
        assert_eq!(seen, expected);
    }
}
