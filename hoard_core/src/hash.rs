//! Hashing functionality using SHA-1.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest as _, Sha1};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Digest size in bytes (SHA-1 produces 160-bit hashes).
pub const DIGEST_SIZE: usize = 20;

/// Length of a digest in its hex form.
pub const HEX_LENGTH: usize = DIGEST_SIZE * 2;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// SHA-1 with 160-bit output.
    Sha1,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1-160",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha1-160" => Ok(Algorithm::Sha1),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }
}

/// Returns true if `s` is exactly `len` characters of `[a-f0-9]`.
pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A 20-byte SHA-1 digest, the key of every blob in the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Create a Digest from raw bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    /// Parse a digest from its 40 character lowercase hex form.
    ///
    /// Uppercase hex is rejected so that every digest has exactly one
    /// spelling on disk.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if !is_lower_hex(hex_str, HEX_LENGTH) {
            return Err(Error::invalid_key(
                hex_str,
                format!("expected {} characters of [a-f0-9]", HEX_LENGTH),
            ));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid_key(hex_str, format!("invalid hex: {}", e)))?;

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&bytes);
        Ok(Digest(digest))
    }

    /// Convert to hex string (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first `split_at` hex characters, naming the shard directory.
    pub fn prefix(&self, split_at: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(split_at);
        hex
    }

    /// The remaining hex characters, naming the file inside the shard.
    pub fn suffix(&self, split_at: usize) -> String {
        self.to_hex().split_off(split_at)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Hash raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        Digest(Sha1::digest(data).into())
    }

    /// Hash data from a reader.
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha1::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(Digest(hasher.finalize().into()))
    }

    /// Hash a file.
    pub fn of_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::of_reader(file)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
