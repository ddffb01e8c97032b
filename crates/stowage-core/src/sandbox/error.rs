//! Error types for the sandbox layer.
//!
//! The `DeniedImport` / `PolicyViolation` / `GuardedWrite` / `FsDenied`
//! variants form the capability-violation family: always fatal for the
//! current script, never downgraded to a warning.

use std::path::PathBuf;

/// Errors produced while transforming or executing a definition script.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("import of module '{module}' denied by capability registry")]
    DeniedImport { module: String },

    #[error("policy violation at line {line}: {reason}")]
    PolicyViolation { line: usize, reason: String },

    #[error("script source failed to parse: {reason}")]
    Parse { reason: String },

    #[error("write to guarded object rejected (key '{key}')")]
    GuardedWrite { key: String },

    #[error("filesystem {operation} denied for {path}")]
    FsDenied { operation: FsOperation, path: PathBuf },

    #[error("library module '{module}' not found in the repository search path")]
    LibraryNotFound { module: String },

    #[error("import cycle detected while loading '{module}'")]
    ImportCycle { module: String },

    #[error("script did not declare a 'Package' class")]
    MissingPackageClass,

    #[error("base initialization did not run for the Package class")]
    BaseInitSkipped,

    #[error("script runtime error: {0}")]
    Runtime(String),
}

impl SandboxError {
    /// Is this a capability violation (as opposed to an ordinary script
    /// failure)? Capability violations are reported distinctly and are
    /// never retried.
    pub fn is_capability_violation(&self) -> bool {
        matches!(
            self,
            SandboxError::DeniedImport { .. }
                | SandboxError::PolicyViolation { .. }
                | SandboxError::GuardedWrite { .. }
                | SandboxError::FsDenied { .. }
        )
    }
}

/// Filesystem operations checked independently by the guarded I/O surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOperation {
    Read,
    Write,
    List,
}

impl std::fmt::Display for FsOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsOperation::Read => write!(f, "read"),
            FsOperation::Write => write!(f, "write"),
            FsOperation::List => write!(f, "list"),
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

impl From<SandboxError> for mlua::Error {
    fn from(err: SandboxError) -> Self {
        mlua::Error::external(err)
    }
}

/// Recover a [`SandboxError`] raised from inside a Lua callback, walking
/// through mlua's callback-error wrapping.
pub fn from_lua_error(err: &mlua::Error) -> Option<&SandboxError> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<SandboxError>(),
        mlua::Error::CallbackError { cause, .. } => from_lua_error(cause),
        mlua::Error::WithContext { cause, .. } => from_lua_error(cause),
        _ => None,
    }
}
