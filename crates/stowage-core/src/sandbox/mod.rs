//! Sandboxed execution of package definition scripts.
//!
//! A definition script never runs with ambient authority. Its source is
//! validated and rewritten by the [`policy`] transformer, compiled into a
//! restricted environment built by the [`engine`], and its imports go
//! through the [`importer`], which consults the capability [`registry`] and
//! hands back write-[`guard`]ed views of shared state. Everything the
//! script can reach is either its own, cloned for it, or read-only.

pub mod engine;
pub mod error;
pub mod guard;
pub mod importer;
pub mod policy;
pub mod registry;

pub use engine::{ExecutionOutcome, Sandbox};
pub use error::{from_lua_error, FsOperation, SandboxError, SandboxResult};
pub use guard::{guard, GUARDED_SET_HOOK};
pub use importer::{ImportCtx, Importer};
pub use registry::{Capability, CapabilityRegistry, LIB_NAMESPACE, SANDBOX_PREFIX};

/// Raw field marking a table as a class object (set by `pkg.class`).
pub(crate) const CLASS_MARKER: &str = "__is_class";

/// Raw field linking a class to its base class.
pub(crate) const CLASS_PARENT: &str = "__parent";

/// Raw field recording the file a class was defined in. Stamped by the
/// importer on library exports; the execution engine collects it along the
/// parent chain to build the cache hash manifest.
pub(crate) const CLASS_SOURCE: &str = "__source";

/// Raw field marking a snapshot table as a module namespace.
pub(crate) const MODULE_MARKER: &str = "__is_module";

/// Raw field set on a package instance by the base `init`, proving the
/// injected super-call chain reached the root.
pub(crate) const BASE_INIT_MARKER: &str = "__base_init_done";
