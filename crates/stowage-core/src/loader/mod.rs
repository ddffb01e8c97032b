//! Loader façade: the single entry point for turning definition scripts
//! into package objects.
//!
//! Every load goes through the two-tier cache first; a miss runs the
//! sandboxed execution engine and persists the result. Batch operations
//! have a uniform partial-failure policy: per-script errors are logged
//! with the script path and skipped so the batch completes, unless
//! `strict` is configured, in which case the first error propagates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::atom::{atom_satisfies, Atom};
use crate::cache::{CacheEntry, PersistentCache, ProcessCache, Tier};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::package::Mod;
use crate::repo;
use crate::sandbox::engine::ExecutionRequest;
use crate::sandbox::{CapabilityRegistry, Sandbox};
use crate::script::{
    self, read_sidecars, DefinitionScript, InstalledSidecars, ScriptOrigin,
};

/// Result of a batch load. Failures are counted, not silently dropped.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub packages: Vec<Arc<Mod>>,
    pub failures: usize,
}

/// The loader. `Send + Sync`; script executions are serialized on the
/// sandbox runtime, cache hits are served concurrently.
pub struct Loader {
    config: LoaderConfig,
    sandbox: Sandbox,
    process: ProcessCache,
    persist: PersistentCache,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> LoadResult<Self> {
        config.validate()?;
        let sandbox = Sandbox::new(CapabilityRegistry::standard())?;
        let persist = PersistentCache::new(config.cache_root.clone());
        Ok(Self {
            config,
            sandbox,
            process: ProcessCache::new(),
            persist,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load a single script by path, fully executed.
    pub fn load_one(&self, path: &Path) -> LoadResult<Arc<Mod>> {
        let script = self.identify(path)?;
        self.load_script(&script, Tier::Full)
    }

    /// Load every matching script across all configured repositories.
    pub fn load_matching(
        &self,
        category: Option<&str>,
        name: Option<&str>,
    ) -> LoadResult<BatchOutcome> {
        let mut scripts = Vec::new();
        for repo in &self.config.repositories {
            let found = script::discover_repository(repo, category, name)
                .map_err(|e| LoadError::script(&repo.root, e))?;
            scripts.extend(found);
        }
        self.load_batch(&scripts, Tier::Metadata)
    }

    /// Load installed packages, optionally filtered by an atom.
    pub fn load_installed(&self, query: Option<&Atom>) -> LoadResult<BatchOutcome> {
        let Some(root) = &self.config.installed_root else {
            return Ok(BatchOutcome::default());
        };
        let mut scripts = script::discover(root, &ScriptOrigin::Installed, None, None)
            .map_err(|e| LoadError::script(root, e))?;
        if let Some(query) = query {
            scripts.retain(|s| atom_satisfies(&s.atom(), query));
        }
        self.load_batch(&scripts, Tier::Metadata)
    }

    /// Resolve an atom that must identify exactly one script and load it
    /// fully executed.
    pub fn load_fully_qualified(&self, query: &Atom) -> LoadResult<Arc<Mod>> {
        let mut matches = self.matching_scripts(query)?;
        match matches.len() {
            0 => Err(LoadError::NotFound {
                atom: query.to_string(),
            }),
            1 => self.load_script(&matches.remove(0), Tier::Full),
            _ => Err(LoadError::AmbiguousAtom {
                atom: query.to_string(),
                matches: matches.iter().map(|s| s.atom().to_string()).collect(),
            }),
        }
    }

    /// Drop a script from the process cache; the next load re-checks the
    /// persistent tier.
    pub fn invalidate(&self, path: &Path) {
        self.process.invalidate(path);
    }

    pub fn clear_process_cache(&self) {
        self.process.clear();
    }

    fn matching_scripts(&self, query: &Atom) -> LoadResult<Vec<DefinitionScript>> {
        let mut candidates = Vec::new();
        if query.is_installed() {
            if let Some(root) = &self.config.installed_root {
                candidates = script::discover(
                    root,
                    &ScriptOrigin::Installed,
                    Some(&query.category),
                    Some(&query.name),
                )
                .map_err(|e| LoadError::script(root, e))?;
            }
        } else {
            for repo in &self.config.repositories {
                if query
                    .repository
                    .as_deref()
                    .is_some_and(|name| name != repo.name)
                {
                    continue;
                }
                let found = script::discover_repository(
                    repo,
                    Some(&query.category),
                    Some(&query.name),
                )
                .map_err(|e| LoadError::script(&repo.root, e))?;
                candidates.extend(found);
            }
        }
        candidates.retain(|s| atom_satisfies(&s.atom(), query));
        Ok(candidates)
    }

    fn load_batch(&self, scripts: &[DefinitionScript], tier: Tier) -> LoadResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for script in scripts {
            match self.load_script(script, tier) {
                Ok(package) => outcome.packages.push(package),
                Err(err) if self.config.strict => return Err(err),
                Err(err) => {
                    outcome.failures += 1;
                    if self.config.debug {
                        warn!(script = %script.path.display(), error = ?err, "definition script failed");
                    } else {
                        warn!(script = %script.path.display(), %err, "definition script failed");
                    }
                }
            }
        }
        if outcome.failures > 0 {
            info!(
                loaded = outcome.packages.len(),
                failures = outcome.failures,
                "batch load completed with failures"
            );
        }
        Ok(outcome)
    }

    fn load_script(&self, script: &DefinitionScript, tier: Tier) -> LoadResult<Arc<Mod>> {
        self.process
            .get_or_build(tier, &script.path, || self.build(script, tier))
    }

    fn build(&self, script: &DefinitionScript, tier: Tier) -> LoadResult<Arc<Mod>> {
        let sidecars = self.sidecars(script)?;

        if tier == Tier::Metadata {
            if let Some(entry) = self.persist.load_valid(script) {
                debug!(script = %script.path.display(), "persistent cache hit");
                return Ok(Arc::new(self.assemble(script, entry.fields, &sidecars)));
            }
        }

        let repository = match &script.origin {
            ScriptOrigin::Repository(name) => Some(name.clone()),
            ScriptOrigin::Installed => sidecars.repository.clone(),
        };
        let request = ExecutionRequest {
            script,
            repo_chain: self.repo_chain(repository.as_deref()),
            work_root: self.config.work_root.clone(),
            repository,
            enabled_options: sidecars.enabled_options.clone(),
        };
        let outcome = self.sandbox.execute(&request)?;

        let mut manifest = vec![script.path.clone()];
        for source in &outcome.class_sources {
            if self.config.is_tracked(source) {
                manifest.push(source.clone());
            }
        }
        let persisted = CacheEntry::build(outcome.fields.clone(), &manifest)
            .and_then(|entry| self.persist.write(script, &entry));
        if let Err(err) = persisted {
            warn!(script = %script.path.display(), %err, "failed to persist cache entry");
        }

        Ok(Arc::new(self.assemble(script, outcome.fields, &sidecars)))
    }

    fn assemble(
        &self,
        script: &DefinitionScript,
        fields: std::collections::BTreeMap<String, crate::package::FieldValue>,
        sidecars: &InstalledSidecars,
    ) -> Mod {
        let mut package = Mod::new(script, fields);
        if script.origin == ScriptOrigin::Installed {
            package.repository = sidecars.repository.clone();
            package.enabled_options = sidecars.enabled_options.clone();
        }
        package
    }

    fn sidecars(&self, script: &DefinitionScript) -> LoadResult<InstalledSidecars> {
        if script.origin != ScriptOrigin::Installed {
            return Ok(InstalledSidecars::default());
        }
        let dir = script.path.parent().unwrap_or_else(|| Path::new(""));
        read_sidecars(dir).map_err(|e| LoadError::script(&script.path, e))
    }

    /// Repository roots searched for shared class libraries: the owning
    /// repository, then its masters. Installed scripts without a `REPO`
    /// sidecar fall back to every configured repository.
    fn repo_chain(&self, repository: Option<&str>) -> Vec<PathBuf> {
        let mut chain = Vec::new();
        if let Some(repo) = repository.and_then(|name| self.config.repository(name)) {
            chain.push(repo.root.clone());
            match repo::list_masters(&repo.root, &self.config) {
                Ok(masters) => chain.extend(masters.iter().map(|m| m.root.clone())),
                Err(err) => {
                    debug!(repo = %repo.name, %err, "no master list for repository")
                }
            }
        }
        if chain.is_empty() {
            chain.extend(self.config.repositories.iter().map(|r| r.root.clone()));
        }
        chain
    }

    /// Classify a bare path into a script with an origin.
    fn identify(&self, path: &Path) -> LoadResult<DefinitionScript> {
        let origin = if self
            .config
            .installed_root
            .as_deref()
            .is_some_and(|root| path.starts_with(root))
        {
            ScriptOrigin::Installed
        } else if let Some(repo) = self.config.repository_of(path) {
            ScriptOrigin::Repository(repo.name.clone())
        } else {
            return Err(LoadError::script(
                path,
                "path is not under a configured repository or the installed database",
            ));
        };
        DefinitionScript::from_path(path.to_path_buf(), origin)
            .map_err(|e| LoadError::script(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;

    fn config(repo_root: &Path, cache: &Path, work: &Path) -> LoaderConfig {
        LoaderConfig {
            repositories: vec![RepositoryConfig {
                name: "core".to_string(),
                root: repo_root.to_path_buf(),
            }],
            installed_root: None,
            cache_root: cache.to_path_buf(),
            work_root: work.to_path_buf(),
            debug: false,
            strict: false,
        }
    }

    fn seed(repo: &Path, category: &str, name: &str, version: &str, body: &str) -> PathBuf {
        let dir = repo.join(category).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{version}.pkg.lua"));
        std::fs::write(&path, body).unwrap();
        path
    }

    const OK_BODY: &str = "local pkg = require(\"pkg\")\n\
        Package = pkg.class(pkg.Mod)\n\
        function Package:init()\n\
          self.title = \"ok\"\n\
        end\n";

    #[test]
    fn identify_rejects_untracked_paths() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
        let err = loader
            .load_one(Path::new("/elsewhere/cat/pkg/pkg-1.pkg.lua"))
            .unwrap_err();
        assert!(matches!(err, LoadError::Script { .. }));
    }

    #[test]
    fn load_one_executes_and_caches() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let path = seed(repo.path(), "base", "thing", "1.0", OK_BODY);
        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();

        let first = loader.load_one(&path).unwrap();
        assert_eq!(
            first.field("title").and_then(|f| f.as_str()),
            Some("ok")
        );
        // Second load is served from the process tier: same Arc.
        let second = loader.load_one(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn fully_qualified_resolution() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        seed(repo.path(), "base", "thing", "1.0", OK_BODY);
        seed(repo.path(), "base", "thing", "2.0", OK_BODY);
        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();

        let exact: Atom = "base/thing-2.0".parse().unwrap();
        let found = loader.load_fully_qualified(&exact).unwrap();
        assert_eq!(found.atom.to_string(), "base/thing-2.0::core");

        let versionless: Atom = "base/thing".parse().unwrap();
        let err = loader.load_fully_qualified(&versionless).unwrap_err();
        assert!(matches!(err, LoadError::AmbiguousAtom { matches, .. } if matches.len() == 2));

        let missing: Atom = "base/nothing".parse().unwrap();
        let err = loader.load_fully_qualified(&missing).unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
    }

    #[test]
    fn batch_skips_broken_scripts_unless_strict() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        seed(repo.path(), "base", "good", "1.0", OK_BODY);
        seed(repo.path(), "base", "bad", "1.0", "this is not lua(\n");

        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
        let outcome = loader.load_matching(None, None).unwrap();
        assert_eq!(outcome.packages.len(), 1);
        assert_eq!(outcome.failures, 1);

        let mut strict = config(repo.path(), cache.path(), work.path());
        strict.strict = true;
        let loader = Loader::new(strict).unwrap();
        assert!(loader.load_matching(None, None).is_err());
    }

    #[test]
    fn load_installed_without_database_is_empty() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
        let outcome = loader.load_installed(None).unwrap();
        assert!(outcome.packages.is_empty());
        assert_eq!(outcome.failures, 0);
    }
}
