//! Persistent tier: JSON cache records under the cache root.
//!
//! Entries live at `<cache-root>/<repository-or-"installed">/<category>/
//! <script-name>`. Writes go through a temp file in the target directory
//! and an atomic rename; concurrent writers race benignly (last writer
//! wins, both wrote the same validated content).

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::cache::{CacheEntry, CacheError, CacheResult};
use crate::script::DefinitionScript;

pub struct PersistentCache {
    root: PathBuf,
}

impl PersistentCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Where the entry for `script` lives.
    pub fn entry_path(&self, script: &DefinitionScript) -> PathBuf {
        self.root
            .join(script.origin.qualifier())
            .join(&script.category)
            .join(script.cache_name())
    }

    /// Read the stored entry, if any. A record that cannot be read or
    /// parsed is a miss, not an error.
    pub fn load(&self, script: &DefinitionScript) -> Option<CacheEntry> {
        let path = self.entry_path(script);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(path = %path.display(), %err, "discarding corrupt cache entry");
                None
            }
        }
    }

    /// Read the stored entry and check it against the current tool version
    /// and manifest file contents.
    pub fn load_valid(&self, script: &DefinitionScript) -> Option<CacheEntry> {
        self.load(script).filter(CacheEntry::is_current)
    }

    /// Store an entry. Skipped when a still-valid entry already exists.
    pub fn write(&self, script: &DefinitionScript, entry: &CacheEntry) -> CacheResult<()> {
        let path = self.entry_path(script);
        if self.load_valid(script).is_some() {
            debug!(path = %path.display(), "cache entry already valid, skipping write");
            return Ok(());
        }

        let parent = path.parent().ok_or_else(|| CacheError::Corrupt {
            path: path.clone(),
        })?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec(entry)?)?;
        tmp.persist(&path).map_err(|e| CacheError::Io(e.error))?;
        debug!(path = %path.display(), files = entry.hashes.len(), "cache entry written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::FieldValue;
    use crate::script::ScriptOrigin;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn seed_script(repo: &Path, origin: ScriptOrigin) -> DefinitionScript {
        let dir = repo.join("graphics").join("herbalism");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("herbalism-1.2.pkg.lua");
        std::fs::write(&path, "-- body\n").unwrap();
        DefinitionScript::from_path(path, origin).unwrap()
    }

    fn entry_for(script: &DefinitionScript) -> CacheEntry {
        let fields = BTreeMap::from([("title".to_string(), FieldValue::Str("X".into()))]);
        CacheEntry::build(fields, &[script.path.clone()]).unwrap()
    }

    #[test]
    fn entry_path_layout() {
        let repo = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(PathBuf::from("/cache"));

        let from_repo = seed_script(repo.path(), ScriptOrigin::Repository("core".into()));
        assert_eq!(
            cache.entry_path(&from_repo),
            PathBuf::from("/cache/core/graphics/herbalism-1.2")
        );

        let installed = seed_script(repo.path(), ScriptOrigin::Installed);
        assert_eq!(
            cache.entry_path(&installed),
            PathBuf::from("/cache/installed/graphics/herbalism-1.2")
        );
    }

    #[test]
    fn write_then_load_valid() {
        let repo = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(cache_dir.path().to_path_buf());
        let script = seed_script(repo.path(), ScriptOrigin::Repository("core".into()));

        let entry = entry_for(&script);
        cache.write(&script, &entry).unwrap();
        assert_eq!(cache.load_valid(&script), Some(entry));
    }

    #[test]
    fn script_edit_invalidates() {
        let repo = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(cache_dir.path().to_path_buf());
        let script = seed_script(repo.path(), ScriptOrigin::Repository("core".into()));

        cache.write(&script, &entry_for(&script)).unwrap();
        std::fs::write(&script.path, "-- changed\n").unwrap();
        assert!(cache.load_valid(&script).is_none());
        // The raw record is still there; only validation rejects it.
        assert!(cache.load(&script).is_some());
    }

    #[test]
    fn corrupt_record_is_a_miss() {
        let repo = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(cache_dir.path().to_path_buf());
        let script = seed_script(repo.path(), ScriptOrigin::Repository("core".into()));

        let path = cache.entry_path(&script);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(cache.load(&script).is_none());
        assert!(cache.load_valid(&script).is_none());
    }

    #[test]
    fn write_skipped_while_existing_entry_valid() {
        let repo = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(cache_dir.path().to_path_buf());
        let script = seed_script(repo.path(), ScriptOrigin::Repository("core".into()));

        let first = entry_for(&script);
        cache.write(&script, &first).unwrap();

        let mut second = first.clone();
        second
            .fields
            .insert("title".to_string(), FieldValue::Str("Y".into()));
        cache.write(&script, &second).unwrap();

        // First write wins: the existing entry was still valid.
        assert_eq!(cache.load_valid(&script), Some(first));
    }
}
