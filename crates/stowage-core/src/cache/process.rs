//! Process tier: in-memory memoization of built package objects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::package::Mod;

/// Which level of detail a cached object was built with.
///
/// A `Full` object came from executing the script; a `Metadata` object may
/// have been reconstructed from the persistent cache without execution. A
/// full object always satisfies a metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Full,
    Metadata,
}

/// The in-memory cache, keyed by script path. Shared by reference across
/// loads; entries live until invalidated.
#[derive(Default)]
pub struct ProcessCache {
    full: Mutex<HashMap<PathBuf, Arc<Mod>>>,
    metadata: Mutex<HashMap<PathBuf, Arc<Mod>>>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached object at the requested tier.
    pub fn get(&self, tier: Tier, path: &Path) -> Option<Arc<Mod>> {
        if let Some(found) = self.map(Tier::Full).lock().expect("cache poisoned").get(path) {
            return Some(found.clone());
        }
        if tier == Tier::Metadata {
            return self
                .map(Tier::Metadata)
                .lock()
                .expect("cache poisoned")
                .get(path)
                .cloned();
        }
        None
    }

    pub fn insert(&self, tier: Tier, path: PathBuf, package: Arc<Mod>) {
        self.map(tier)
            .lock()
            .expect("cache poisoned")
            .insert(path, package);
    }

    /// Serve from the cache or build and remember. The builder runs without
    /// any cache lock held.
    pub fn get_or_build<E>(
        &self,
        tier: Tier,
        path: &Path,
        build: impl FnOnce() -> Result<Arc<Mod>, E>,
    ) -> Result<Arc<Mod>, E> {
        if let Some(found) = self.get(tier, path) {
            return Ok(found);
        }
        let built = build()?;
        self.insert(tier, path.to_path_buf(), built.clone());
        Ok(built)
    }

    /// Drop a script from both tiers.
    pub fn invalidate(&self, path: &Path) {
        self.full.lock().expect("cache poisoned").remove(path);
        self.metadata.lock().expect("cache poisoned").remove(path);
    }

    pub fn clear(&self) {
        self.full.lock().expect("cache poisoned").clear();
        self.metadata.lock().expect("cache poisoned").clear();
    }

    fn map(&self, tier: Tier) -> &Mutex<HashMap<PathBuf, Arc<Mod>>> {
        match tier {
            Tier::Full => &self.full,
            Tier::Metadata => &self.metadata,
        }
    }
}
