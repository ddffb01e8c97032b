//! Loader-level error taxonomy.

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::sandbox::SandboxError;

/// Errors surfaced by the loader façade.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A sandbox failure: capability violation, policy violation or script
    /// runtime error.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A script that could not be loaded for reasons outside the sandbox
    /// (bad layout, unreadable sidecars, untracked path).
    #[error("script '{path}': {message}")]
    Script { path: PathBuf, message: String },

    /// A fully-qualified atom matched more than one script.
    #[error("atom '{atom}' is ambiguous, matches: {}", matches.join(", "))]
    AmbiguousAtom { atom: String, matches: Vec<String> },

    /// A fully-qualified atom matched nothing.
    #[error("no package matches '{atom}'")]
    NotFound { atom: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Wrap an arbitrary per-script failure with the script path.
    pub fn script(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Script {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Does this error come from the capability-violation family?
    pub fn is_capability_violation(&self) -> bool {
        matches!(self, LoadError::Sandbox(e) if e.is_capability_violation())
    }
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_classification_carries_through() {
        let err = LoadError::from(SandboxError::DeniedImport {
            module: "os".into(),
        });
        assert!(err.is_capability_violation());

        let err = LoadError::from(SandboxError::Runtime("boom".into()));
        assert!(!err.is_capability_violation());
    }

    #[test]
    fn ambiguous_atom_names_every_match() {
        let err = LoadError::AmbiguousAtom {
            atom: "base/pkg".into(),
            matches: vec!["base/pkg-1.0::a".into(), "base/pkg-1.0::b".into()],
        };
        let text = err.to_string();
        assert!(text.contains("::a"));
        assert!(text.contains("::b"));
    }
}
