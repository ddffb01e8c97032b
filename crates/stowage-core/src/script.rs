//! Definition-script identity and discovery.
//!
//! A definition script lives at
//! `<root>/<category>/<name>/<name>-<version>.pkg.lua` and is immutable once
//! located. Installed scripts come from the installed database and carry
//! sidecar files: `REPO` (owning repository) and `USE` (enabled options).

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::atom::{split_version, Atom, Version, INSTALLED_QUALIFIER};
use crate::config::RepositoryConfig;
use crate::repo::LIB_DIR;

/// File suffix of package definition scripts.
pub const SCRIPT_SUFFIX: &str = ".pkg.lua";

/// Errors from script discovery.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("not a package script: {0}")]
    NotAScript(PathBuf),

    #[error("script path does not follow <category>/<name>/ layout: {0}")]
    InvalidLayout(PathBuf),

    #[error("script {path} does not belong to package directory {dir}")]
    NameMismatch { path: PathBuf, dir: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a script was discovered.
///
/// Installed scripts differ structurally from repository scripts: their
/// owning repository is recorded in a sidecar rather than implied by the
/// filesystem root, and they carry an enabled-option set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOrigin {
    /// Found under a configured repository (by name).
    Repository(String),
    /// Found in the installed-package database.
    Installed,
}

impl ScriptOrigin {
    /// Qualifier used in atoms and cache paths.
    pub fn qualifier(&self) -> &str {
        match self {
            ScriptOrigin::Repository(name) => name,
            ScriptOrigin::Installed => INSTALLED_QUALIFIER,
        }
    }
}

/// A located package definition script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionScript {
    /// Absolute path of the script file.
    pub path: PathBuf,
    pub category: String,
    pub name: String,
    pub version: Option<Version>,
    pub origin: ScriptOrigin,
}

impl DefinitionScript {
    /// Identify a script from its path. The path must end in
    /// [`SCRIPT_SUFFIX`] and sit inside a `<category>/<name>/` directory
    /// pair whose `<name>` prefixes the file name.
    pub fn from_path(path: PathBuf, origin: ScriptOrigin) -> Result<Self, ScriptError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ScriptError::NotAScript(path.clone()))?;
        let stem = file_name
            .strip_suffix(SCRIPT_SUFFIX)
            .ok_or_else(|| ScriptError::NotAScript(path.clone()))?;

        let pkg_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(|| ScriptError::InvalidLayout(path.clone()))?
            .to_string();
        let category = path
            .parent()
            .and_then(|p| p.parent())
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(|| ScriptError::InvalidLayout(path.clone()))?
            .to_string();

        let (name, version) = match split_version(stem) {
            Some((name, ver)) => (
                name.to_string(),
                Some(Version::parse(ver).map_err(|_| ScriptError::NotAScript(path.clone()))?),
            ),
            None => (stem.to_string(), None),
        };

        if name != pkg_dir {
            return Err(ScriptError::NameMismatch {
                path,
                dir: pkg_dir,
            });
        }

        Ok(Self {
            path,
            category,
            name,
            version,
            origin,
        })
    }

    /// The fully qualified atom of this script.
    pub fn atom(&self) -> Atom {
        Atom {
            category: self.category.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            repository: Some(self.origin.qualifier().to_string()),
        }
    }

    /// File name without the script suffix, used as the cache entry name.
    pub fn cache_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}-{v}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Enabled options and owning repository of an installed package, read from
/// the `USE` and `REPO` sidecar files next to the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledSidecars {
    pub repository: Option<String>,
    pub enabled_options: Vec<String>,
}

/// Read the installed-database sidecars from the script's directory.
/// Missing sidecars are not an error; they simply yield empty data.
pub fn read_sidecars(script_dir: &Path) -> Result<InstalledSidecars, ScriptError> {
    let mut sidecars = InstalledSidecars::default();

    let repo_file = script_dir.join("REPO");
    if repo_file.is_file() {
        let raw = fs::read_to_string(&repo_file)?;
        let name = raw.trim();
        if !name.is_empty() {
            sidecars.repository = Some(name.to_string());
        }
    }

    let use_file = script_dir.join("USE");
    if use_file.is_file() {
        let raw = fs::read_to_string(&use_file)?;
        sidecars.enabled_options = raw.split_whitespace().map(str::to_string).collect();
        sidecars.enabled_options.sort();
        sidecars.enabled_options.dedup();
    }

    Ok(sidecars)
}

/// Discover scripts under one root, optionally filtered by category and
/// package name. Results are sorted by path for stable batch ordering.
pub fn discover(
    root: &Path,
    origin: &ScriptOrigin,
    category: Option<&str>,
    name: Option<&str>,
) -> Result<Vec<DefinitionScript>, ScriptError> {
    let mut scripts = Vec::new();
    if !root.is_dir() {
        return Ok(scripts);
    }

    for cat_entry in sorted_dirs(root)? {
        let cat_name = cat_entry
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if cat_name == LIB_DIR || cat_name.starts_with('.') {
            continue;
        }
        if category.is_some_and(|c| c != cat_name) {
            continue;
        }

        for pkg_entry in sorted_dirs(&cat_entry)? {
            let pkg_name = pkg_entry
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if name.is_some_and(|n| n != pkg_name) {
                continue;
            }

            let mut files: Vec<PathBuf> = fs::read_dir(&pkg_entry)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.ends_with(SCRIPT_SUFFIX))
                })
                .collect();
            files.sort();

            for file in files {
                scripts.push(DefinitionScript::from_path(file, origin.clone())?);
            }
        }
    }

    Ok(scripts)
}

/// Discover scripts in a configured repository.
pub fn discover_repository(
    repo: &RepositoryConfig,
    category: Option<&str>,
    name: Option<&str>,
) -> Result<Vec<DefinitionScript>, ScriptError> {
    discover(
        &repo.root,
        &ScriptOrigin::Repository(repo.name.clone()),
        category,
        name,
    )
}

fn sorted_dirs(root: &Path) -> Result<Vec<PathBuf>, ScriptError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_script(root: &Path, category: &str, name: &str, version: &str) -> PathBuf {
        let dir = root.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{version}{SCRIPT_SUFFIX}"));
        fs::write(&path, "-- package\n").unwrap();
        path
    }

    #[test]
    fn from_path_derives_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_script(dir.path(), "graphics", "herbalism", "1.2");
        let script =
            DefinitionScript::from_path(path, ScriptOrigin::Repository("core".into())).unwrap();
        assert_eq!(script.category, "graphics");
        assert_eq!(script.name, "herbalism");
        assert_eq!(script.version.as_ref().unwrap().as_str(), "1.2");
        assert_eq!(script.atom().to_string(), "graphics/herbalism-1.2::core");
        assert_eq!(script.cache_name(), "herbalism-1.2");
    }

    #[test]
    fn from_path_rejects_wrong_suffix() {
        let err = DefinitionScript::from_path(
            PathBuf::from("/r/cat/pkg/pkg-1.0.lua"),
            ScriptOrigin::Installed,
        );
        assert!(matches!(err, Err(ScriptError::NotAScript(_))));
    }

    #[test]
    fn from_path_rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_dir = dir.path().join("graphics").join("herbalism");
        fs::create_dir_all(&pkg_dir).unwrap();
        let path = pkg_dir.join(format!("other-1.0{SCRIPT_SUFFIX}"));
        fs::write(&path, "").unwrap();
        assert!(matches!(
            DefinitionScript::from_path(path, ScriptOrigin::Installed),
            Err(ScriptError::NameMismatch { .. })
        ));
    }

    #[test]
    fn installed_atom_uses_installed_qualifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_script(dir.path(), "graphics", "herbalism", "1.2");
        let script = DefinitionScript::from_path(path, ScriptOrigin::Installed).unwrap();
        assert!(script.atom().is_installed());
    }

    #[test]
    fn discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        seed_script(dir.path(), "graphics", "herbalism", "1.0");
        seed_script(dir.path(), "graphics", "herbalism", "2.0");
        seed_script(dir.path(), "base", "morrowind", "0.1");
        fs::create_dir_all(dir.path().join("lib")).unwrap();

        let origin = ScriptOrigin::Repository("core".into());
        let all = discover(dir.path(), &origin, None, None).unwrap();
        assert_eq!(all.len(), 3);

        let graphics = discover(dir.path(), &origin, Some("graphics"), None).unwrap();
        assert_eq!(graphics.len(), 2);
        assert!(graphics[0].path < graphics[1].path);

        let named = discover(dir.path(), &origin, None, Some("morrowind")).unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].category, "base");
    }

    #[test]
    fn sidecars_parse_repo_and_use() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("REPO"), "core\n").unwrap();
        fs::write(dir.path().join("USE"), "textures  sound textures\n").unwrap();

        let sidecars = read_sidecars(dir.path()).unwrap();
        assert_eq!(sidecars.repository.as_deref(), Some("core"));
        assert_eq!(sidecars.enabled_options, vec!["sound", "textures"]);
    }

    #[test]
    fn sidecars_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sidecars = read_sidecars(dir.path()).unwrap();
        assert_eq!(sidecars, InstalledSidecars::default());
    }
}
