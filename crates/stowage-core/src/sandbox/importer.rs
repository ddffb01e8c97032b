//! Sandboxed importer: resolves `require` to isolated module views.
//!
//! Module resolution has two layers. A per-process snapshot cache holds
//! each allowed module exactly once: host modules are seeded at engine
//! construction, library modules (`lib.<x>`) are located in the repository
//! search path and executed a single time. Snapshots never leave the cache
//! directly; each script gets a view built from the snapshot, with plain
//! value tables deep-cloned into a per-script clone cache and classes
//! re-derived as trivial subclasses. Two scripts importing the same module
//! therefore never share mutable value state, while repeated imports within
//! one script return the same view.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mlua::{Function, Lua, RegistryKey, Table, Value};
use tracing::debug;

use crate::repo::LIB_DIR;
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::policy;
use crate::sandbox::registry::{Capability, CapabilityRegistry, LIB_NAMESPACE, SANDBOX_PREFIX};
use crate::sandbox::{CLASS_MARKER, CLASS_PARENT, CLASS_SOURCE, MODULE_MARKER};

/// Value tables nested deeper than this fail to clone instead of looping
/// on cyclic data.
const MAX_CLONE_DEPTH: usize = 32;

/// Per-load import context: everything resolution needs that varies from
/// one script (or library module) execution to the next.
pub struct ImportCtx {
    /// Synthetic name of the importing module, for resolving leading-dot
    /// relative requires (`.sibling` inside `lib.a` means `lib.sibling`).
    pub module_name: String,
    /// Repository roots searched for library files, owning repository
    /// first, then its masters.
    pub repo_chain: Vec<PathBuf>,
    /// Per-load host modules (the wrapped `fs` and `env` proxies), already
    /// guarded by the engine. Not snapshot-cached: their contents depend on
    /// the script being loaded.
    pub locals: HashMap<String, RegistryKey>,
    /// Lua table mapping canonical module name to this load's view.
    pub clone_cache: RegistryKey,
}

/// Builds the restricted environment a library module executes in. Supplied
/// by the execution engine so the importer stays ignorant of namespace
/// construction.
pub type EnvBuilder = Arc<dyn Fn(&Lua, Arc<ImportCtx>) -> mlua::Result<Table> + Send + Sync>;

#[derive(Default)]
struct ImporterState {
    /// Canonical module name to snapshot table.
    snapshots: HashMap<String, RegistryKey>,
    /// Source file of each executed library module, for cache manifests.
    sources: HashMap<String, PathBuf>,
    /// Library modules currently executing, for cycle detection.
    loading: HashSet<String>,
}

/// The process-wide import resolver.
#[derive(Clone)]
pub struct Importer {
    registry: CapabilityRegistry,
    state: Arc<Mutex<ImporterState>>,
}

impl Importer {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(ImporterState::default())),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Register an engine-built host module under `name`. The exports are
    /// snapshotted like a library's would be, so classes a host module
    /// exposes go through the same subclass derivation.
    pub fn seed_host_module(&self, lua: &Lua, name: &str, exports: &Table) -> mlua::Result<()> {
        let snapshot = derive_snapshot(lua, &self.registry, name, exports)?;
        let key = lua.create_registry_value(snapshot)?;
        self.lock().snapshots.insert(name.to_string(), key);
        Ok(())
    }

    /// Source file of an executed library module, if `module` is one.
    pub fn source_of(&self, module: &str) -> Option<PathBuf> {
        self.lock().sources.get(module).cloned()
    }

    /// Resolve a `require` target to the current load's view of the module.
    pub fn resolve(
        &self,
        lua: &Lua,
        ctx: &Arc<ImportCtx>,
        env_builder: &EnvBuilder,
        name: &str,
    ) -> mlua::Result<Table> {
        let stripped = name.strip_prefix(SANDBOX_PREFIX).unwrap_or(name);
        let canonical = if stripped.starts_with('.') {
            resolve_relative(stripped, &ctx.module_name)?
        } else {
            stripped.to_string()
        };

        let clone_cache: Table = lua.registry_value(&ctx.clone_cache)?;
        if let Value::Table(cached) = clone_cache.raw_get::<Value>(canonical.as_str())? {
            return Ok(cached);
        }

        if let Some(key) = ctx.locals.get(&canonical) {
            return lua.registry_value(key);
        }

        let capability = self.registry.require_allowed(&canonical)?;

        let cached = self.lock().snapshots.contains_key(&canonical);
        if !cached {
            match capability {
                Capability::Library => self.load_library(lua, ctx, env_builder, &canonical)?,
                _ => {
                    return Err(SandboxError::Runtime(format!(
                        "module '{canonical}' is not available in this context"
                    ))
                    .into())
                }
            }
        }

        let snapshot: Table = {
            let state = self.lock();
            let key = state.snapshots.get(&canonical).ok_or_else(|| {
                SandboxError::Runtime(format!("snapshot for '{canonical}' disappeared"))
            })?;
            lua.registry_value(key)?
        };
        let view = build_view(lua, &snapshot)?;
        clone_cache.raw_set(canonical.as_str(), view.clone())?;
        Ok(view)
    }

    /// Locate, transform and execute a library file, then snapshot its
    /// exports. Runs at most once per module name per process.
    fn load_library(
        &self,
        lua: &Lua,
        ctx: &Arc<ImportCtx>,
        env_builder: &EnvBuilder,
        canonical: &str,
    ) -> mlua::Result<()> {
        let rel = canonical.strip_prefix(LIB_NAMESPACE).unwrap_or(canonical);
        let rel_path: PathBuf = rel.split('.').collect();
        let file = ctx
            .repo_chain
            .iter()
            .map(|root| root.join(LIB_DIR).join(&rel_path).with_extension("lua"))
            .find(|p| p.is_file())
            .ok_or_else(|| SandboxError::LibraryNotFound {
                module: canonical.to_string(),
            })?;

        if !self.lock().loading.insert(canonical.to_string()) {
            return Err(SandboxError::ImportCycle {
                module: canonical.to_string(),
            }
            .into());
        }
        let result = self.execute_library(lua, ctx, env_builder, canonical, &file);
        self.lock().loading.remove(canonical);
        result
    }

    fn execute_library(
        &self,
        lua: &Lua,
        ctx: &Arc<ImportCtx>,
        env_builder: &EnvBuilder,
        canonical: &str,
        file: &Path,
    ) -> mlua::Result<()> {
        let source = std::fs::read_to_string(file).map_err(|e| {
            SandboxError::Runtime(format!("failed to read library '{}': {e}", file.display()))
        })?;
        let transformed = policy::transform(&source, &self.registry)?;

        let lib_ctx = Arc::new(ImportCtx {
            module_name: canonical.to_string(),
            repo_chain: ctx.repo_chain.clone(),
            locals: HashMap::new(),
            clone_cache: lua.create_registry_value(lua.create_table()?)?,
        });
        let env = env_builder(lua, lib_ctx)?;

        let exports: Value = lua
            .load(&transformed)
            .set_name(canonical)
            .set_environment(env)
            .eval()?;
        let Value::Table(exports) = exports else {
            return Err(SandboxError::Runtime(format!(
                "library '{canonical}' did not return a table"
            ))
            .into());
        };

        stamp_sources(&exports, file)?;
        let snapshot = derive_snapshot(lua, &self.registry, canonical, &exports)?;
        let key = lua.create_registry_value(snapshot)?;

        let mut state = self.lock();
        state.snapshots.insert(canonical.to_string(), key);
        state.sources.insert(canonical.to_string(), file.to_path_buf());
        debug!(module = canonical, file = %file.display(), "library module loaded");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ImporterState> {
        self.state.lock().expect("importer state poisoned")
    }
}

/// Create the `require` function for one load.
pub fn make_require(
    lua: &Lua,
    importer: Importer,
    ctx: Arc<ImportCtx>,
    env_builder: EnvBuilder,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, name: String| {
        importer.resolve(lua, &ctx, &env_builder, &name)
    })
}

/// Resolve a leading-dot relative name against the importing module.
fn resolve_relative(name: &str, from: &str) -> SandboxResult<String> {
    let dots = name.chars().take_while(|c| *c == '.').count();
    let rest = &name[dots..];
    let mut parts: Vec<&str> = from.split('.').collect();
    if rest.is_empty() || dots > parts.len() {
        return Err(SandboxError::DeniedImport {
            module: name.to_string(),
        });
    }
    parts.truncate(parts.len() - dots);
    if parts.is_empty() {
        Ok(rest.to_string())
    } else {
        Ok(format!("{}.{rest}", parts.join(".")))
    }
}

pub(crate) fn is_class(table: &Table) -> mlua::Result<bool> {
    Ok(matches!(
        table.raw_get::<Value>(CLASS_MARKER)?,
        Value::Boolean(true)
    ))
}

fn is_module(table: &Table) -> mlua::Result<bool> {
    Ok(matches!(
        table.raw_get::<Value>(MODULE_MARKER)?,
        Value::Boolean(true)
    ))
}

/// A trivial subclass of `class`: empty, delegating every lookup. Scripts
/// mutate the subclass, never the module's own class object.
fn derive_subclass(lua: &Lua, class: &Table) -> mlua::Result<Table> {
    let sub = lua.create_table()?;
    let mt = lua.create_table()?;
    mt.set("__index", class.clone())?;
    let _ = sub.set_metatable(Some(mt));
    sub.raw_set(CLASS_MARKER, true)?;
    sub.raw_set(CLASS_PARENT, class.clone())?;
    let source: Value = class.raw_get(CLASS_SOURCE)?;
    if !matches!(source, Value::Nil) {
        sub.raw_set(CLASS_SOURCE, source)?;
    }
    Ok(sub)
}

/// Build the process-wide snapshot of a module's exports: classes become
/// subclasses, nested module namespaces recurse if the registry allows
/// them (and are dropped otherwise), everything else is carried as-is and
/// handled at view time.
fn derive_snapshot(
    lua: &Lua,
    registry: &CapabilityRegistry,
    module_name: &str,
    exports: &Table,
) -> mlua::Result<Table> {
    let snap = lua.create_table()?;
    snap.raw_set(MODULE_MARKER, true)?;
    for pair in exports.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let Value::String(key) = key else { continue };
        let name = key.to_string_lossy().to_string();
        if name.starts_with("__") {
            continue;
        }
        match value {
            Value::Table(t) => {
                if is_class(&t)? {
                    snap.raw_set(name, derive_subclass(lua, &t)?)?;
                } else if is_module(&t)? {
                    let full = format!("{module_name}.{name}");
                    if registry.is_allowed(&full) != Capability::Denied {
                        snap.raw_set(name, derive_snapshot(lua, registry, &full, &t)?)?;
                    }
                } else {
                    snap.raw_set(name, t)?;
                }
            }
            other => snap.raw_set(name, other)?,
        }
    }
    Ok(snap)
}

/// One load's view of a snapshot: classes and nested modules are shared,
/// plain value tables are deep-cloned so scripts cannot leak mutations to
/// each other through module data.
fn build_view(lua: &Lua, snapshot: &Table) -> mlua::Result<Table> {
    let view = lua.create_table()?;
    for pair in snapshot.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        if let Value::String(name) = &key {
            if name.to_string_lossy().starts_with("__") {
                continue;
            }
        }
        match value {
            Value::Table(t) => {
                if is_class(&t)? || is_module(&t)? {
                    view.raw_set(key, t)?;
                } else {
                    view.raw_set(key, deep_clone(lua, &t, 0)?)?;
                }
            }
            other => view.raw_set(key, other)?,
        }
    }
    Ok(view)
}

fn deep_clone(lua: &Lua, table: &Table, depth: usize) -> mlua::Result<Table> {
    if depth > MAX_CLONE_DEPTH {
        return Err(
            SandboxError::Runtime("module value nesting too deep to clone".to_string()).into(),
        );
    }
    let out = lua.create_table()?;
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        match value {
            Value::Table(t) => out.raw_set(key, deep_clone(lua, &t, depth + 1)?)?,
            other => out.raw_set(key, other)?,
        }
    }
    Ok(out)
}

/// Record the defining file on exported classes that do not carry one yet.
/// Re-exported classes keep the file they were first defined in.
fn stamp_sources(exports: &Table, file: &Path) -> mlua::Result<()> {
    let path = file.to_string_lossy().to_string();
    for pair in exports.clone().pairs::<Value, Value>() {
        let (_, value) = pair?;
        if let Value::Table(t) = value {
            if is_class(&t)? && matches!(t.raw_get::<Value>(CLASS_SOURCE)?, Value::Nil) {
                t.raw_set(CLASS_SOURCE, path.as_str())?;
            }
        }
    }
    Ok(())
}
