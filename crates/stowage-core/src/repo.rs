//! Repository metadata collaborators.
//!
//! A repository root carries a `repo.toml` (name + master repositories) and
//! optionally a `categories` file listing one category per line. When the
//! file is absent the categories are derived from a directory scan.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::{LoaderConfig, RepositoryConfig};

/// Directory reserved for shared class libraries, never a category.
pub const LIB_DIR: &str = "lib";

/// Errors from repository metadata access.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository at {path} has no repo.toml: {source}")]
    MissingMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unknown master repository {master} referenced by {repo}")]
    UnknownMaster { repo: String, master: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct RepoMetadata {
    name: String,
    #[serde(default)]
    masters: Vec<String>,
}

fn read_metadata(root: &Path) -> Result<RepoMetadata, RepoError> {
    let path = root.join("repo.toml");
    let raw = fs::read_to_string(&path).map_err(|source| RepoError::MissingMetadata {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| RepoError::Parse { path, source })
}

/// Name of the repository rooted at `root`, read from its `repo.toml`.
pub fn repo_name(root: &Path) -> Result<String, RepoError> {
    Ok(read_metadata(root)?.name)
}

/// Master repositories of the repository at `root`, resolved against the
/// configured repository set. Masters are searched after the repository
/// itself when locating shared class libraries.
pub fn list_masters<'a>(
    root: &Path,
    config: &'a LoaderConfig,
) -> Result<Vec<&'a RepositoryConfig>, RepoError> {
    let meta = read_metadata(root)?;
    let mut masters = Vec::with_capacity(meta.masters.len());
    for master in &meta.masters {
        let repo = config
            .repository(master)
            .ok_or_else(|| RepoError::UnknownMaster {
                repo: meta.name.clone(),
                master: master.clone(),
            })?;
        masters.push(repo);
    }
    Ok(masters)
}

/// Categories of the repository at `root`.
///
/// Prefers the `categories` file (one name per line, `#` comments allowed);
/// falls back to scanning top-level directories, skipping the `lib/`
/// directory and hidden entries. The result is sorted.
pub fn list_categories(root: &Path) -> Result<Vec<String>, RepoError> {
    let listing = root.join("categories");
    let mut categories = if listing.is_file() {
        fs::read_to_string(&listing)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect::<Vec<_>>()
    } else {
        let mut found = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == LIB_DIR || name.starts_with('.') {
                continue;
            }
            found.push(name);
        }
        found
    };
    categories.sort();
    categories.dedup();
    Ok(categories)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_repo(dir: &Path, name: &str, masters: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        let masters = masters
            .iter()
            .map(|m| format!("\"{m}\""))
            .collect::<Vec<_>>()
            .join(", ");
        fs::write(
            dir.join("repo.toml"),
            format!("name = \"{name}\"\nmasters = [{masters}]\n"),
        )
        .unwrap();
    }

    #[test]
    fn repo_name_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "core", &[]);
        assert_eq!(repo_name(dir.path()).unwrap(), "core");
    }

    #[test]
    fn repo_name_missing_metadata_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            repo_name(dir.path()),
            Err(RepoError::MissingMetadata { .. })
        ));
    }

    #[test]
    fn categories_from_listing_file() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "core", &[]);
        fs::write(
            dir.path().join("categories"),
            "graphics\n# comment\n\nbase\n",
        )
        .unwrap();
        assert_eq!(list_categories(dir.path()).unwrap(), vec!["base", "graphics"]);
    }

    #[test]
    fn categories_from_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "core", &[]);
        fs::create_dir(dir.path().join("graphics")).unwrap();
        fs::create_dir(dir.path().join("base")).unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        assert_eq!(list_categories(dir.path()).unwrap(), vec!["base", "graphics"]);
    }

    #[test]
    fn masters_resolve_against_config() {
        let dir = tempfile::tempdir().unwrap();
        let core = dir.path().join("core");
        let extras = dir.path().join("extras");
        write_repo(&core, "core", &[]);
        write_repo(&extras, "extras", &["core"]);

        let config = LoaderConfig {
            repositories: vec![
                RepositoryConfig {
                    name: "core".into(),
                    root: core.clone(),
                },
                RepositoryConfig {
                    name: "extras".into(),
                    root: extras.clone(),
                },
            ],
            installed_root: None,
            cache_root: dir.path().join("cache"),
            work_root: dir.path().join("work"),
            debug: false,
            strict: false,
        };

        let masters = list_masters(&extras, &config).unwrap();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].name, "core");

        write_repo(&extras, "extras", &["ghost"]);
        assert!(matches!(
            list_masters(&extras, &config),
            Err(RepoError::UnknownMaster { .. })
        ));
    }
}
