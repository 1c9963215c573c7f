//! Error types for hoard_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using hoard_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Content with this digest is already stored. Callers adding content
    /// treat this as success.
    #[error("Already exists: {digest}")]
    AlreadyExists { digest: String },

    /// Key is absent from the table or cannot name an item in it.
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Digest or record name failed syntax validation.
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Structural anomaly found on disk.
    #[error("Corruption at {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    /// A node's root entry could not be loaded while marking.
    #[error("Unreachable tree for node {node}: {source}")]
    UnreachableTree {
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// The consistency flag is set; fsck must run first.
    #[error("fsck is needed, run fsck first")]
    FsckNeeded,

    /// Read-serving path is not of the form `/<digest>`.
    #[error("Bad request: {path}")]
    BadRequest { path: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Node name or record content is invalid.
    #[error("Invalid node: {reason}")]
    InvalidNode { reason: String },

    /// Entry or Node record could not be encoded or decoded.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// The operation observed the cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an AlreadyExists error.
    pub fn already_exists(digest: impl Into<String>) -> Self {
        Error::AlreadyExists {
            digest: digest.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a Corruption error.
    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnreachableTree error.
    pub fn unreachable_tree(node: impl Into<String>, source: Error) -> Self {
        Error::UnreachableTree {
            node: node.into(),
            source: Box::new(source),
        }
    }

    /// Create a BadRequest error.
    pub fn bad_request(path: impl Into<String>) -> Self {
        Error::BadRequest { path: path.into() }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidNode error.
    pub fn invalid_node(reason: impl Into<String>) -> Self {
        Error::InvalidNode {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// True for the dedup signal returned when content is already stored.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True when the key was absent or could not name an item.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}
