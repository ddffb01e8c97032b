//! Stowage Core Library
//!
//! Sandboxed loading of Lua package definition scripts: capability-checked
//! imports, write-guarded shared state, AST-level policy enforcement and a
//! two-tier result cache.
//!
//! The sandbox is defense-in-depth for scripts from semi-trusted
//! repositories, not a hard boundary against a resource-unconstrained
//! attacker.

pub mod atom;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod loader;
pub mod package;
pub mod repo;
pub mod sandbox;
pub mod script;
pub mod telemetry;

pub use atom::{atom_satisfies, Atom, AtomError, Version, INSTALLED_QUALIFIER};

pub use cache::{CacheEntry, CacheError, ManifestEntry, PersistentCache, ProcessCache, Tier};

pub use config::{ConfigError, LoaderConfig, RepositoryConfig};

pub use error::{LoadError, LoadResult};

pub use hash::{hash_file, tool_version, Digest, HashError};

pub use loader::{BatchOutcome, Loader};

pub use package::{FieldTooDeep, FieldValue, Mod, MAX_FIELD_DEPTH};

pub use sandbox::{
    Capability, CapabilityRegistry, FsOperation, Sandbox, SandboxError, SandboxResult,
};

pub use script::{DefinitionScript, InstalledSidecars, ScriptOrigin, SCRIPT_SUFFIX};

/// Version of the stowage core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
