//! Loader configuration.
//!
//! Repositories, the installed database, cache and work directories, and
//! the two behaviour flags (`debug`, `strict`) live here. Configuration is
//! read from a TOML file; the flags can also be forced through the
//! `STOWAGE_DEBUG` and `STOWAGE_STRICT` environment variables.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("duplicate repository name: {0}")]
    DuplicateRepository(String),
}

/// One configured package repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository name used in atoms (`::name`) and cache paths.
    pub name: String,
    /// Filesystem root of the repository.
    pub root: PathBuf,
}

/// Top-level loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Package repositories, in priority order.
    pub repositories: Vec<RepositoryConfig>,

    /// Root of the installed-package database, if any.
    #[serde(default)]
    pub installed_root: Option<PathBuf>,

    /// Root of the persistent load cache.
    pub cache_root: PathBuf,

    /// Work area scripts may write to through the guarded filesystem.
    pub work_root: PathBuf,

    /// Log full tracebacks on script load failure.
    #[serde(default)]
    pub debug: bool,

    /// Turn per-script load failures into hard aborts.
    #[serde(default)]
    pub strict: bool,
}

impl LoaderConfig {
    /// Read configuration from a TOML file and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `STOWAGE_DEBUG` / `STOWAGE_STRICT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_flag("STOWAGE_DEBUG") {
            self.debug = v;
        }
        if let Some(v) = env_flag("STOWAGE_STRICT") {
            self.strict = v;
        }
    }

    /// Reject configurations with duplicate repository names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repositories {
            if !seen.insert(repo.name.as_str()) {
                return Err(ConfigError::DuplicateRepository(repo.name.clone()));
            }
        }
        Ok(())
    }

    /// Look up a configured repository by name.
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Resolve the repository a path belongs to, if any.
    pub fn repository_of(&self, path: &Path) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| path.starts_with(&r.root))
    }

    /// Is `path` under any tracked root (repository or installed database)?
    /// Only such files participate in cache hash manifests.
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.repository_of(path).is_some()
            || self
                .installed_root
                .as_deref()
                .is_some_and(|root| path.starts_with(root))
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> LoaderConfig {
        LoaderConfig {
            repositories: vec![
                RepositoryConfig {
                    name: "core".into(),
                    root: dir.join("core"),
                },
                RepositoryConfig {
                    name: "extras".into(),
                    root: dir.join("extras"),
                },
            ],
            installed_root: Some(dir.join("installed")),
            cache_root: dir.join("cache"),
            work_root: dir.join("work"),
            debug: false,
            strict: false,
        }
    }

    #[test]
    fn from_file_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(
            &path,
            r#"
cache_root = "/var/cache/stowage"
work_root = "/tmp/stowage-work"

[[repositories]]
name = "core"
root = "/srv/repos/core"
"#,
        )
        .unwrap();

        let config = LoaderConfig::from_file(&path).unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.repositories[0].name, "core");
        assert!(!config.strict);
        assert!(config.installed_root.is_none());
    }

    #[test]
    fn duplicate_repository_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(
            &path,
            r#"
cache_root = "/c"
work_root = "/w"

[[repositories]]
name = "core"
root = "/a"

[[repositories]]
name = "core"
root = "/b"
"#,
        )
        .unwrap();

        assert!(matches!(
            LoaderConfig::from_file(&path),
            Err(ConfigError::DuplicateRepository(_))
        ));
    }

    #[test]
    fn repository_of_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample(dir.path());
        let inside = dir.path().join("core/graphics/herbalism/x.pkg.lua");
        assert_eq!(config.repository_of(&inside).unwrap().name, "core");
        assert!(config.repository_of(Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn tracked_covers_installed_db() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample(dir.path());
        assert!(config.is_tracked(&dir.path().join("installed/graphics/x")));
        assert!(!config.is_tracked(&dir.path().join("work/scratch")));
    }
}
