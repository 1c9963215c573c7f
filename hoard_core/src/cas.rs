//! The blob table: sharded, write-once, content-addressed files.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::flag::FsckFlag;
use crate::hash::{Digest, HEX_LENGTH, is_lower_hex};
use crate::scan::{Enumeration, ShardLayout, TMP_NAME, spawn_scan, sweep_staging};
use crate::trash::{Corruptable, Trash};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the blob table directory under the store root.
pub const CAS_NAME: &str = "cas";

/// Default number of hex characters used to pick a shard (4096 shards).
pub const DEFAULT_SPLIT_AT: usize = 3;

/// Largest supported shard prefix (65536 shard directories).
pub const MAX_SPLIT_AT: usize = 4;

/// Number of shard directories for a given prefix length.
pub(crate) fn prefix_space(split_at: usize) -> usize {
    if split_at == 0 {
        return 0;
    }
    1 << (split_at * 4)
}

/// Reject shard prefixes outside `1..=MAX_SPLIT_AT`.
pub(crate) fn check_split_at(root: &Path, split_at: usize) -> Result<()> {
    if split_at == 0 || split_at > MAX_SPLIT_AT {
        return Err(Error::invalid_store(
            root,
            format!("split_at must be between 1 and {}", MAX_SPLIT_AT),
        ));
    }
    Ok(())
}

/// Blob storage under `<root>/cas`.
///
/// A blob with digest `D` lives at `cas/D[..split_at]/D[split_at..]`. Every
/// shard directory is created up front by [`CasTable::init`], so writes
/// never need to check for them.
#[derive(Debug, Clone)]
pub struct CasTable {
    cas_dir: PathBuf,
    tmp_dir: PathBuf,
    split_at: usize,
    trash: Trash,
    flag: FsckFlag,
}

impl CasTable {
    /// Create the blob table under `root`, including every shard directory.
    pub fn init(root: &Path, split_at: usize) -> Result<Self> {
        check_split_at(root, split_at)?;
        let table = Self::new(root, split_at);
        fs::create_dir_all(&table.cas_dir)?;
        fs::create_dir_all(&table.tmp_dir)?;

        for i in 0..prefix_space(split_at) {
            let prefix = format!("{:0width$x}", i, width = split_at);
            match fs::create_dir(table.cas_dir.join(prefix)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(table)
    }

    /// Open the blob table under `root`.
    pub fn load(root: &Path, split_at: usize) -> Result<Self> {
        check_split_at(root, split_at)?;
        let table = Self::new(root, split_at);
        if !table.cas_dir.is_dir() {
            return Err(Error::invalid_store(root, "cas directory missing"));
        }
        fs::create_dir_all(&table.tmp_dir)?;
        Ok(table)
    }

    fn new(root: &Path, split_at: usize) -> Self {
        let cas_dir = root.join(CAS_NAME);
        Self {
            tmp_dir: cas_dir.join(TMP_NAME),
            trash: Trash::new(&cas_dir),
            flag: FsckFlag::new(&cas_dir),
            cas_dir,
            split_at,
        }
    }

    /// The table directory.
    pub fn dir(&self) -> &Path {
        &self.cas_dir
    }

    /// Number of hex characters in a shard name.
    pub fn split_at(&self) -> usize {
        self.split_at
    }

    /// The table's trash.
    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// Path of the blob file for `digest`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.cas_dir
            .join(digest.prefix(self.split_at))
            .join(digest.suffix(self.split_at))
    }

    /// Add content whose digest the caller already computed.
    ///
    /// Fails with `AlreadyExists` if the digest is stored; since equal
    /// digests mean equal content, callers treat that as success. The
    /// content is staged under `cas/tmp` and published with a no-clobber
    /// rename, so a blob path never holds a partial write.
    pub fn add_entry<R: Read>(&self, mut source: R, digest: &Digest) -> Result<()> {
        let dst = self.blob_path(digest);
        if dst.exists() {
            return Err(Error::already_exists(digest.to_hex()));
        }

        let mut staged = tempfile::NamedTempFile::new_in(&self.tmp_dir)?;
        std::io::copy(&mut source, &mut staged)?;
        staged.flush()?;
        staged.as_file().sync_all()?;

        let staged = match staged.persist_noclobber(&dst) {
            Ok(_) => {
                debug!(digest = %digest, "added blob");
                return Ok(());
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::NotFound => {
                // The shard was quarantined; put it back.
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                e.file
            }
            Err(e) => return Err(persist_error(digest, e)),
        };

        staged
            .persist_noclobber(&dst)
            .map(|_| debug!(digest = %digest, "added blob"))
            .map_err(|e| persist_error(digest, e))
    }

    /// Hash `data` and add it. In the dedup case the `AlreadyExists` error
    /// carries the same digest a fresh add would have returned.
    pub fn add_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(data);
        self.add_entry(data, &digest)?;
        Ok(digest)
    }

    /// Open a blob for reading. An invalid key is reported as `NotFound`.
    pub fn open(&self, key: &str) -> Result<File> {
        let digest = Digest::from_hex(key).map_err(|_| Error::not_found(key))?;
        self.open_digest(&digest)
    }

    fn open_digest(&self, digest: &Digest) -> Result<File> {
        File::open(self.blob_path(digest)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(digest.to_hex()),
            _ => e.into(),
        })
    }

    /// Read a whole blob into memory.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open_digest(digest)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Resolve a read-serving path of the form `/<digest>`.
    ///
    /// Anything else, including `/<digest>/` or nested paths, is a
    /// `BadRequest`.
    pub fn serve(&self, url_path: &str) -> Result<File> {
        let digest = url_path
            .strip_prefix('/')
            .and_then(|key| Digest::from_hex(key).ok())
            .ok_or_else(|| Error::bad_request(url_path))?;
        self.open_digest(&digest)
    }

    /// Returns true if a blob is stored under `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Size in bytes of a stored blob.
    pub fn size_of(&self, digest: &Digest) -> Result<u64> {
        Ok(self.open_digest(digest)?.metadata()?.len())
    }

    /// Rehash a stored blob and compare with its name.
    pub fn verify(&self, digest: &Digest) -> Result<bool> {
        let actual = Digest::of_reader(self.open_digest(digest)?)?;
        Ok(actual == *digest)
    }

    /// Move a blob to the trash.
    ///
    /// Fails with `InvalidKey` for a malformed digest and `NotFound` if the
    /// blob is absent.
    pub fn remove(&self, key: &str) -> Result<()> {
        let digest = Digest::from_hex(key)?;
        let rel = Path::new(&digest.prefix(self.split_at)).join(digest.suffix(self.split_at));
        self.trash.move_path(&rel)?;
        Ok(())
    }

    /// Stream every valid digest in the table, quarantining anything that
    /// does not fit the layout.
    pub fn enumerate(&self, cancel: &CancelToken) -> Enumeration<Digest> {
        spawn_scan(self.clone(), cancel, "cas-scan")
    }

    /// Move staged writes older than `max_age` out of `cas/tmp` into the
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

fn persist_error(digest: &Digest, err: tempfile::PersistError) -> Error {
    if err.error.kind() == std::io::ErrorKind::AlreadyExists {
        Error::already_exists(digest.to_hex())
    } else {
        err.into()
    }
}

impl ShardLayout for CasTable {
    type Item = Digest;

    fn table_dir(&self) -> &Path {
        &self.cas_dir
    }

    fn trash(&self) -> &Trash {
        &self.trash
    }

    fn flag(&self) -> &FsckFlag {
        &self.flag
    }

    fn is_valid_shard(&self, name: &str) -> bool {
        is_lower_hex(name, self.split_at)
    }

    fn load_item(&self, shard: &str, name: &str, _path: &Path) -> std::io::Result<Option<Digest>> {
        if !is_lower_hex(name, HEX_LENGTH - self.split_at) {
            return Ok(None);
        }
        Ok(Digest::from_hex(&format!("{}{}", shard, name)).ok())
    }
}

impl Corruptable for CasTable {
    /// Plant a blob under a well-formed name whose bytes hash to something
    /// else. Enumeration lists it; content verification catches it.
    fn corrupt(&self) -> Result<String> {
        let digest = Digest::of_bytes(b"corrupted blob");
        let path = self.blob_path(&digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"these bytes do not match their name")?;
        Ok(format!(
            "{}/{}",
            digest.prefix(self.split_at),
            digest.suffix(self.split_at)
        ))
    }
}
