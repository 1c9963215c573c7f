//! Store management: layout, configuration and the fsck gate.

use crate::cas::{CasTable, DEFAULT_SPLIT_AT, MAX_SPLIT_AT, check_split_at};
use crate::entry::{Entry, store_entry};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Digest};
use crate::nodes::{Node, NodeEntry, NodesTable};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_NAME: &str = "config";
const CONFIG_VERSION: &str = "1";

/// Parameters fixed when a store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Digest algorithm for every key in the store.
    pub algorithm: Algorithm,
    /// Hex characters of a digest used to pick its shard directory.
    pub split_at: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Sha1,
            split_at: DEFAULT_SPLIT_AT,
        }
    }
}

/// A backup store: a blob table and a node table under one root.
///
/// Creates the directory structure:
/// - `cas/` sharded blobs, with `trash/`, `tmp/` and the `need_fsck` marker
/// - `nodes/` node records, with the same
/// - `config` file with version, algorithm and shard prefix length
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    config: StoreConfig,
    cas: CasTable,
    nodes: NodesTable,
}

impl Store {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        check_split_at(&root, config.split_at)?;

        fs::create_dir_all(&root)?;

        let config_path = root.join(CONFIG_NAME);
        if config_path.exists() {
            return Err(Error::invalid_store(&root, "store already initialized"));
        }

        let cas = CasTable::init(&root, config.split_at)?;
        let nodes = NodesTable::init(&root)?;

        // Written last: a store without config was never fully created.
        let config_content = format!(
            "version={}\nalgo={}\nsplit_at={}\n",
            CONFIG_VERSION,
            config.algorithm.as_str(),
            config.split_at
        );
        fs::write(&config_path, config_content)?;

        info!(root = %root.display(), split_at = config.split_at, "initialized store");
        Ok(Self {
            root,
            config,
            cas,
            nodes,
        })
    }

    /// Open an existing store at the given path.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join(CONFIG_NAME);
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let config = Self::parse_config(&root, &config_content)?;

        let cas = CasTable::load(&root, config.split_at)?;
        let nodes = NodesTable::load(&root)?;

        Ok(Self {
            root,
            config,
            cas,
            nodes,
        })
    }

    /// Parse the config file.
    fn parse_config(root: &Path, content: &str) -> Result<StoreConfig> {
        let mut version = None;
        let mut algo = None;
        let mut split_at = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    "split_at" => split_at = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some(CONFIG_VERSION) {
            return Err(Error::invalid_store(
                root,
                format!("unsupported config version: {:?}", version),
            ));
        }

        let algorithm =
            Algorithm::parse(algo.ok_or_else(|| Error::invalid_store(root, "missing algo"))?)?;

        let split_at = split_at
            .ok_or_else(|| Error::invalid_store(root, "missing split_at"))?
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=MAX_SPLIT_AT).contains(n))
            .ok_or_else(|| Error::invalid_store(root, "invalid split_at"))?;

        Ok(StoreConfig {
            algorithm,
            split_at,
        })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the store configuration.
    pub fn config(&self) -> StoreConfig {
        self.config
    }

    /// Get the blob table.
    pub fn cas(&self) -> &CasTable {
        &self.cas
    }

    /// Get the node table.
    pub fn nodes(&self) -> &NodesTable {
        &self.nodes
    }

    /// Returns true if either table has its fsck flag set.
    pub fn fsck_needed(&self) -> bool {
        self.cas.fsck_needed() || self.nodes.fsck_needed()
    }

    /// Refuse to proceed while either table needs fsck.
    ///
    /// Every mutating operation except fsck itself calls this first.
    pub fn ensure_consistent(&self) -> Result<()> {
        let cas = self.cas.warn_if_fsck_needed();
        let nodes = self.nodes.warn_if_fsck_needed();
        if cas || nodes {
            return Err(Error::FsckNeeded);
        }
        Ok(())
    }

    /// Archive an in-memory file set as a new snapshot named `name`.
    ///
    /// Each `(path, content)` pair becomes a file at the `/`-separated
    /// relative `path`. Content already in the store is not written again.
    pub fn archive<I, P, B>(&self, name: &str, comment: &str, files: I) -> Result<NodeEntry>
    where
        I: IntoIterator<Item = (P, B)>,
        P: AsRef<str>,
        B: AsRef<[u8]>,
    {
        self.ensure_consistent()?;

        let timestamp = chrono::Utc::now().timestamp();
        let mut root = Entry::directory();
        for (path, content) in files {
            let content = content.as_ref();
            let digest = match self.cas.add_bytes(content) {
                Ok(digest) => digest,
                Err(e) if e.is_already_exists() => Digest::of_bytes(content),
                Err(e) => return Err(e),
            };
            root.insert(
                path.as_ref(),
                Entry::file(digest, content.len() as u64, timestamp),
            )?;
        }

        let node = Node {
            entry: store_entry(&self.cas, &root)?,
            comment: comment.to_string(),
        };
        let item = self.nodes.add_entry(&node, name)?;

        info!(item = %item, files = root.file_count(), "archived snapshot");
        Ok(NodeEntry { item, node })
    }
}
