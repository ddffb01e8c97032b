//! Content hashing for cache manifests.
//!
//! Every file that participates in a cache decision (the package script
//! itself plus the source of every ancestor class) is identified by its
//! SHA-256 digest. Hex encoding is the on-disk and wire form.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// SHA-256 digest used as a content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest({})",
            self.to_hex().chars().take(12).collect::<String>()
        )
    }
}

impl FromStr for Digest {
    type Err = HashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| HashError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(HashError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors from digest parsing and file hashing.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hash the contents of a file. This is the `content_hash` collaborator
/// consumed by the persistent cache.
pub fn hash_file(path: impl AsRef<Path>) -> Result<Digest, HashError> {
    let data = fs::read(path.as_ref())?;
    Ok(Digest::compute(&data))
}

/// Version stamp of the running tool, recorded into every cache entry.
pub fn tool_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
