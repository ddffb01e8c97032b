//! Two-tier result cache for loaded package definitions.
//!
//! The process tier ([`process`]) memoizes built package objects by script
//! path for the lifetime of the loader. The persistent tier ([`persist`])
//! records declared fields together with a hash manifest of every source
//! file that contributed to them, so a later process can serve metadata
//! without executing the script, and any edit to a contributing file
//! invalidates exactly the entries that depend on it.

pub mod persist;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::{Digest, HashError};
use crate::package::FieldValue;

pub use persist::PersistentCache;
pub use process::{ProcessCache, Tier};

/// Errors from the persistent cache.
///
/// `Corrupt` never escapes the cache layer: an unreadable or unparseable
/// entry is treated as a miss and rebuilt.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("corrupt cache entry at {path}")]
    Corrupt { path: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Hash(#[from] HashError),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// One file the cached fields depend on, with the digest its contents had
/// when the entry was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub digest: Digest,
}

/// A persistent cache record: the declared fields plus everything needed
/// to decide whether they are still current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Declared package fields, key-ordered for deterministic output.
    pub fields: BTreeMap<String, FieldValue>,
    /// Tool version that produced the entry; a mismatch is a miss.
    pub tool_version: String,
    /// Hash manifest, script file first, then each ancestor class source.
    pub hashes: Vec<ManifestEntry>,
}

impl CacheEntry {
    /// Build an entry for the current tool version, hashing each manifest
    /// file in the given order.
    pub fn build(
        fields: BTreeMap<String, FieldValue>,
        manifest_paths: &[PathBuf],
    ) -> CacheResult<Self> {
        let mut hashes = Vec::with_capacity(manifest_paths.len());
        for path in manifest_paths {
            hashes.push(ManifestEntry {
                path: path.clone(),
                digest: crate::hash::hash_file(path)?,
            });
        }
        Ok(Self {
            fields,
            tool_version: crate::hash::tool_version().to_string(),
            hashes,
        })
    }

    /// Is the entry still current: written by this tool version, with every
    /// manifest file hashing to its recorded digest?
    pub fn is_current(&self) -> bool {
        if self.tool_version != crate::hash::tool_version() {
            return false;
        }
        self.hashes.iter().all(|entry| {
            crate::hash::hash_file(&entry.path)
                .map(|digest| digest == entry.digest)
                .unwrap_or(false)
        })
    }
}
