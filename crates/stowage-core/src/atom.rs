//! Package atoms: `category/name[-version][::repository]`.
//!
//! An atom names a package; a fully-qualified atom additionally pins the
//! version and the origin repository. Installed packages use the reserved
//! `::installed` qualifier.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved repository qualifier for packages from the installed database.
pub const INSTALLED_QUALIFIER: &str = "installed";

/// Errors from atom parsing.
#[derive(Debug, Error)]
pub enum AtomError {
    #[error("atom missing category: {0}")]
    MissingCategory(String),

    #[error("atom has empty package name: {0}")]
    EmptyName(String),

    #[error("invalid version in atom: {0}")]
    InvalidVersion(String),
}

/// A package version: dot-separated numeric components with an optional
/// alphanumeric suffix (`1.2.3`, `2.0b`, `0.46.1`).
///
/// Ordering compares numeric components first, then the suffix lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version {
    raw: String,
}

impl Version {
    /// Parse a version string. The first character must be a digit.
    pub fn parse(s: &str) -> Result<Self, AtomError> {
        if !s.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Err(AtomError::InvalidVersion(s.to_string()));
        }
        Ok(Self { raw: s.to_string() })
    }

    /// The raw version string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn components(&self) -> (Vec<u64>, String) {
        let mut nums = Vec::new();
        let mut suffix = String::new();
        for part in self.raw.split('.') {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            let rest: String = part.chars().skip_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<u64>() {
                nums.push(n);
            }
            if !rest.is_empty() {
                suffix.push_str(&rest);
            }
        }
        (nums, suffix)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a_nums, a_suffix) = self.components();
        let (b_nums, b_suffix) = other.components();
        a_nums.cmp(&b_nums).then_with(|| a_suffix.cmp(&b_suffix))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A package atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    pub category: String,
    pub name: String,
    pub version: Option<Version>,
    /// Origin qualifier: a repository name, or [`INSTALLED_QUALIFIER`].
    pub repository: Option<String>,
}

impl Atom {
    /// Build an unversioned, unqualified atom.
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            version: None,
            repository: None,
        }
    }

    /// Whether this atom is qualified with the installed-database origin.
    pub fn is_installed(&self) -> bool {
        self.repository.as_deref() == Some(INSTALLED_QUALIFIER)
    }

    /// `category/name` without version or qualifier.
    pub fn base(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }
}

impl FromStr for Atom {
    type Err = AtomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, repository) = match s.split_once("::") {
            Some((body, repo)) => (body, Some(repo.to_string())),
            None => (s, None),
        };

        let (category, rest) = body
            .split_once('/')
            .ok_or_else(|| AtomError::MissingCategory(s.to_string()))?;
        if rest.is_empty() {
            return Err(AtomError::EmptyName(s.to_string()));
        }

        // The version starts at the last '-' that is followed by a digit.
        let (name, version) = match split_version(rest) {
            Some((name, ver)) => (name.to_string(), Some(Version::parse(ver)?)),
            None => (rest.to_string(), None),
        };

        if name.is_empty() {
            return Err(AtomError::EmptyName(s.to_string()));
        }

        Ok(Self {
            category: category.to_string(),
            name,
            version,
            repository,
        })
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)?;
        if let Some(v) = &self.version {
            write!(f, "-{v}")?;
        }
        if let Some(r) = &self.repository {
            write!(f, "::{r}")?;
        }
        Ok(())
    }
}

/// Split `name-1.2.3` into (`name`, `1.2.3`). Returns `None` when there is
/// no version component.
pub fn split_version(s: &str) -> Option<(&str, &str)> {
    for (idx, _) in s.match_indices('-').collect::<Vec<_>>().into_iter().rev() {
        let candidate = &s[idx + 1..];
        if candidate.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Some((&s[..idx], candidate));
        }
    }
    None
}

/// Does `candidate` satisfy `query`?
///
/// Category and name must match exactly. A version in the query pins the
/// candidate version; a repository qualifier in the query pins the origin.
/// Fields absent from the query match anything.
pub fn atom_satisfies(candidate: &Atom, query: &Atom) -> bool {
    if candidate.category != query.category || candidate.name != query.name {
        return false;
    }
    if let Some(qv) = &query.version {
        if candidate.version.as_ref() != Some(qv) {
            return false;
        }
    }
    if let Some(qr) = &query.repository {
        if candidate.repository.as_deref() != Some(qr.as_str()) {
            return false;
        }
    }
    true
}
