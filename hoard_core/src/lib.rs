//! # Hoard Core
//!
//! The storage engine of a content-addressed backup tool.
//!
//! Files are stored once, keyed by their SHA-1 digest, in a sharded blob
//! table. A snapshot is a tree of [`Entry`] values serialized as JSON and
//! stored as a blob itself; a [`Node`] record names that tree's digest.
//!
//! ## Features
//!
//! - Write-once blobs: adding stored content reports `AlreadyExists`
//! - Self-healing enumeration: anything on disk that does not fit the
//!   layout is moved to a trash and the table's fsck flag is set
//! - Mark-sweep garbage collection from every node record
//! - fsck: a full enumeration of both tables, optionally rehashing blobs
//! - Nothing is ever deleted outright; removal means moving to the trash
//!
//! ## Example
//!
//! ```no_run
//! use hoard_core::{CancelToken, Store, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::init("./my-store", StoreConfig::default())?;
//!
//! // Archive a snapshot
//! store.archive("docs", "nightly", [("notes/todo.txt", "buy milk")])?;
//!
//! // Check consistency, then collect unreferenced blobs
//! let cancel = CancelToken::new();
//! let report = store.fsck(&cancel, true)?;
//! println!("{} blobs, {} nodes", report.blobs, report.nodes);
//! let stats = store.gc(&cancel, false)?;
//! println!("Removed {} orphans", stats.orphans);
//! # Ok(())
//! # }
//! ```

mod cancel;
mod cas;
mod entry;
mod error;
mod flag;
mod fsck;
mod gc;
mod hash;
mod nodes;
mod scan;
mod store;
mod trash;

pub use cancel::CancelToken;
pub use cas::{CAS_NAME, CasTable, DEFAULT_SPLIT_AT, MAX_SPLIT_AT};
pub use entry::{Entry, load_entry, store_entry};
pub use error::{Error, Result};
pub use flag::{FsckFlag, NEED_FSCK_NAME};
pub use fsck::FsckReport;
pub use gc::GcStats;
pub use hash::{Algorithm, DIGEST_SIZE, Digest, HEX_LENGTH};
pub use nodes::{NODES_NAME, Node, NodeEntry, NodesTable, TAGS_NAME, is_valid_node_name};
pub use scan::{Enumeration, TMP_NAME};
pub use store::{Store, StoreConfig};
pub use trash::{Corruptable, TRASH_NAME, Trash};
