//! Execution engine: runs a transformed definition script to a package
//! object.
//!
//! One Lua runtime is shared by every load behind a mutex, which is what
//! makes the per-process import snapshots worth having. Each script still
//! executes in its own environment table: a bounded set of builtins,
//! guarded views of the `string`/`table`/`math` libraries, a per-load
//! `require`, and nothing else. `print` goes to the debug log.
//!
//! The pipeline per script is parse, transform, build namespace, run,
//! extract: the script must leave a `Package` class in its environment;
//! the engine instantiates it, runs `init`, verifies the injected
//! super-call chain reached the base class, and converts the instance's
//! declared fields to a deterministic value tree.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use mlua::{Function, Lua, MultiValue, Table, Value};
use tracing::debug;

use crate::atom::{atom_satisfies, Atom, Version};
use crate::package::FieldValue;
use crate::sandbox::error::{from_lua_error, FsOperation, SandboxError, SandboxResult};
use crate::sandbox::guard::guard;
use crate::sandbox::importer::{is_class, make_require, EnvBuilder, ImportCtx, Importer};
use crate::sandbox::policy;
use crate::sandbox::registry::CapabilityRegistry;
use crate::sandbox::{BASE_INIT_MARKER, CLASS_MARKER, CLASS_PARENT, CLASS_SOURCE};
use crate::script::DefinitionScript;

/// Builtins copied from the host globals into every script environment.
/// No `pcall`/`xpcall` (capability violations must stay fatal), no raw
/// table access, no metatable access.
const SAFE_BUILTINS: &[&str] = &[
    "tostring", "tonumber", "type", "ipairs", "pairs", "next", "select", "error", "assert",
];

/// Standard library tables exposed through write guards.
const GUARDED_LIBS: &[&str] = &["string", "table", "math"];

/// Ancestor chains longer than this are treated as forged. `__parent` is a
/// raw field a script can overwrite, so the walk must terminate on a cycle.
const MAX_CLASS_DEPTH: usize = 64;

/// Everything the engine needs to run one script.
pub struct ExecutionRequest<'a> {
    pub script: &'a DefinitionScript,
    /// Owning repository root first, then its masters.
    pub repo_chain: Vec<PathBuf>,
    /// Scratch area scripts may write under through `fs`.
    pub work_root: PathBuf,
    /// Resolved owning repository name, if known.
    pub repository: Option<String>,
    /// Enabled options, populated for installed packages.
    pub enabled_options: Vec<String>,
}

/// What a successful execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The package instance's declared fields, class defaults included.
    pub fields: BTreeMap<String, FieldValue>,
    /// Source files of every ancestor class, for the cache hash manifest.
    /// The script file itself is not in this list.
    pub class_sources: Vec<PathBuf>,
}

/// The sandboxed execution engine. `Send + Sync`; loads are serialized on
/// the inner runtime.
pub struct Sandbox {
    inner: Mutex<Runtime>,
}

struct Runtime {
    lua: Lua,
    importer: Importer,
}

impl Sandbox {
    /// Build the runtime and seed the host modules.
    pub fn new(registry: CapabilityRegistry) -> SandboxResult<Self> {
        let lua = Lua::new();
        let importer = Importer::new(registry);

        let pkg = build_pkg_module(&lua).map_err(as_sandbox_error)?;
        importer
            .seed_host_module(&lua, "pkg", &pkg)
            .map_err(as_sandbox_error)?;
        let version = build_version_module(&lua).map_err(as_sandbox_error)?;
        importer
            .seed_host_module(&lua, "version", &version)
            .map_err(as_sandbox_error)?;

        Ok(Self {
            inner: Mutex::new(Runtime { lua, importer }),
        })
    }

    /// Run one definition script through the full pipeline.
    pub fn execute(&self, request: &ExecutionRequest<'_>) -> SandboxResult<ExecutionOutcome> {
        let runtime = self.inner.lock().expect("sandbox runtime poisoned");
        runtime.run(request).map_err(as_sandbox_error)
    }

    /// Source file of an executed library module (for manifests).
    pub fn library_source(&self, module: &str) -> Option<PathBuf> {
        let runtime = self.inner.lock().expect("sandbox runtime poisoned");
        runtime.importer.source_of(module)
    }
}

impl Runtime {
    fn run(&self, request: &ExecutionRequest<'_>) -> mlua::Result<ExecutionOutcome> {
        let script = request.script;
        let source = std::fs::read_to_string(&script.path).map_err(|e| {
            SandboxError::Runtime(format!("failed to read '{}': {e}", script.path.display()))
        })?;
        let transformed = policy::transform(&source, self.importer.registry())?;

        let mut locals = HashMap::new();
        let fs = build_fs_module(&self.lua, FsPolicy::for_request(request))?;
        locals.insert(
            "fs".to_string(),
            self.lua.create_registry_value(guard(&self.lua, fs)?)?,
        );
        let env_module = build_env_module(&self.lua, request)?;
        locals.insert(
            "env".to_string(),
            self.lua
                .create_registry_value(guard(&self.lua, env_module)?)?,
        );

        let ctx = Arc::new(ImportCtx {
            module_name: script.name.clone(),
            repo_chain: request.repo_chain.clone(),
            locals,
            clone_cache: self.lua.create_registry_value(self.lua.create_table()?)?,
        });

        let label = script.atom().to_string();
        let env = build_env(&self.lua, &self.importer, ctx, &label)?;

        debug!(script = %label, path = %script.path.display(), "executing definition script");
        self.lua
            .load(&transformed)
            .set_name(label.as_str())
            .set_environment(env.clone())
            .exec()?;

        extract(&self.lua, &env)
    }
}

/// Instantiate the script's `Package` class and pull out its fields.
fn extract(lua: &Lua, env: &Table) -> mlua::Result<ExecutionOutcome> {
    let package: Value = env.get("Package")?;
    let Value::Table(class) = package else {
        return Err(SandboxError::MissingPackageClass.into());
    };
    if !is_class(&class)? {
        return Err(SandboxError::MissingPackageClass.into());
    }

    let instance = lua.create_table()?;
    let mt = lua.create_table()?;
    mt.set("__index", class.clone())?;
    let _ = instance.set_metatable(Some(mt));

    if let Value::Function(init) = class.get::<Value>("init")? {
        init.call::<()>(instance.clone())?;
    }
    if !matches!(
        instance.raw_get::<Value>(BASE_INIT_MARKER)?,
        Value::Boolean(true)
    ) {
        return Err(SandboxError::BaseInitSkipped.into());
    }

    // Root-first through the ancestor chain, instance last, so nearer
    // definitions override farther ones.
    let mut chain = Vec::new();
    let mut current = Some(class);
    while let Some(c) = current {
        if chain.len() >= MAX_CLASS_DEPTH {
            return Err(SandboxError::Runtime(format!(
                "class ancestor chain exceeds {MAX_CLASS_DEPTH} levels; cyclic parent link"
            ))
            .into());
        }
        current = match c.raw_get::<Value>(CLASS_PARENT)? {
            Value::Table(parent) => Some(parent),
            _ => None,
        };
        chain.push(c);
    }

    let mut fields = BTreeMap::new();
    for c in chain.iter().rev() {
        collect_fields(c, &mut fields)?;
    }
    collect_fields(&instance, &mut fields)?;

    let mut class_sources = Vec::new();
    for c in &chain {
        if let Value::String(s) = c.raw_get::<Value>(CLASS_SOURCE)? {
            let path = PathBuf::from(s.to_string_lossy().to_string());
            if !class_sources.contains(&path) {
                class_sources.push(path);
            }
        }
    }

    Ok(ExecutionOutcome {
        fields,
        class_sources,
    })
}

fn collect_fields(table: &Table, out: &mut BTreeMap<String, FieldValue>) -> mlua::Result<()> {
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let Value::String(key) = key else { continue };
        let name = key.to_string_lossy().to_string();
        if name.starts_with("__") || name == "init" || name == "super_init" {
            continue;
        }
        if let Value::Table(t) = &value {
            if is_class(t)? {
                continue;
            }
        }
        let converted = FieldValue::from_lua(&value).map_err(|e| {
            mlua::Error::from(SandboxError::Runtime(format!("field '{name}': {e}")))
        })?;
        if let Some(field) = converted {
            out.insert(name, field);
        }
    }
    Ok(())
}

/// Build one load's environment table.
fn build_env(lua: &Lua, importer: &Importer, ctx: Arc<ImportCtx>, label: &str) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    install_builtins(lua, &env, label)?;
    let require = make_require(
        lua,
        importer.clone(),
        ctx,
        library_env_builder(importer.clone()),
    )?;
    env.set("require", require)?;
    Ok(env)
}

/// Library modules execute in the same kind of environment as scripts,
/// minus the per-load `fs`/`env` modules.
fn library_env_builder(importer: Importer) -> EnvBuilder {
    Arc::new(move |lua, ctx| {
        let label = ctx.module_name.clone();
        build_env(lua, &importer, ctx, &label)
    })
}

fn install_builtins(lua: &Lua, env: &Table, label: &str) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in SAFE_BUILTINS {
        env.set(*name, globals.get::<Value>(*name)?)?;
    }
    for name in GUARDED_LIBS {
        let lib: Table = globals.get(*name)?;
        env.set(*name, guard(lua, lib)?)?;
    }

    let label = label.to_string();
    env.set(
        "print",
        lua.create_function(move |lua, args: MultiValue| {
            let tostring: Function = lua.globals().get("tostring")?;
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                parts.push(tostring.call::<String>(value)?);
            }
            debug!(script = %label, "{}", parts.join("\t"));
            Ok(())
        })?,
    )?;
    Ok(())
}

/// The `pkg` host module: the `Mod` base class and the `class` constructor.
fn build_pkg_module(lua: &Lua) -> mlua::Result<Table> {
    let pkg = lua.create_table()?;

    let base = lua.create_table()?;
    base.raw_set(CLASS_MARKER, true)?;
    base.raw_set(
        "init",
        lua.create_function(|_, this: Table| this.raw_set(BASE_INIT_MARKER, true))?,
    )?;
    pkg.set("Mod", base)?;

    pkg.set(
        "class",
        lua.create_function(|lua, base: Value| pkg_class(lua, base))?,
    )?;
    Ok(pkg)
}

/// `pkg.class(base)`: a fresh class delegating to `base`, with its
/// `super_init` bound to the base captured here. The policy transformer
/// injects `<Class>.super_init(self)` into every declared `init`, and this
/// static binding is what keeps multi-level chains from looping.
fn pkg_class(lua: &Lua, base: Value) -> mlua::Result<Table> {
    let class = lua.create_table()?;
    class.raw_set(CLASS_MARKER, true)?;
    match base {
        Value::Table(base) => {
            if !is_class(&base)? {
                return Err(
                    SandboxError::Runtime("pkg.class expects a class or nil".to_string()).into(),
                );
            }
            let mt = lua.create_table()?;
            mt.set("__index", base.clone())?;
            let _ = class.set_metatable(Some(mt));
            class.raw_set(CLASS_PARENT, base.clone())?;
            class.raw_set(
                "super_init",
                lua.create_function(move |_, this: Table| {
                    match base.get::<Value>("init")? {
                        Value::Function(init) => init.call::<()>(this),
                        _ => Ok(()),
                    }
                })?,
            )?;
        }
        Value::Nil => {
            class.raw_set("super_init", lua.create_function(|_, _: Table| Ok(()))?)?;
        }
        _ => {
            return Err(
                SandboxError::Runtime("pkg.class expects a class or nil".to_string()).into(),
            )
        }
    }
    Ok(class)
}

/// The `version` host module: comparison helpers over version strings and
/// atoms.
fn build_version_module(lua: &Lua) -> mlua::Result<Table> {
    let version = lua.create_table()?;
    version.set(
        "compare",
        lua.create_function(|_, (a, b): (String, String)| {
            let a = Version::parse(&a).map_err(mlua::Error::external)?;
            let b = Version::parse(&b).map_err(mlua::Error::external)?;
            Ok(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })
        })?,
    )?;
    version.set(
        "satisfies",
        lua.create_function(|_, (candidate, query): (String, String)| {
            let candidate: Atom = candidate.parse().map_err(mlua::Error::external)?;
            let query: Atom = query.parse().map_err(mlua::Error::external)?;
            Ok(atom_satisfies(&candidate, &query))
        })?,
    )?;
    Ok(version)
}

/// Filesystem bounds for one script: reads inside the repository chain
/// (and the work area), writes only inside the work area. Each operation
/// is checked independently.
struct FsPolicy {
    base: PathBuf,
    read_roots: Vec<PathBuf>,
    write_root: PathBuf,
}

impl FsPolicy {
    fn for_request(request: &ExecutionRequest<'_>) -> Self {
        let base = request
            .script
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut read_roots = request.repo_chain.clone();
        read_roots.push(base.clone());
        read_roots.push(request.work_root.clone());
        Self {
            base,
            read_roots,
            write_root: request.work_root.clone(),
        }
    }

    fn check(&self, operation: FsOperation, path: &Path) -> Result<PathBuf, SandboxError> {
        let denied = || SandboxError::FsDenied {
            operation,
            path: path.to_path_buf(),
        };
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(denied());
        }
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        };
        let allowed = match operation {
            FsOperation::Read | FsOperation::List => {
                self.read_roots.iter().any(|root| abs.starts_with(root))
            }
            FsOperation::Write => abs.starts_with(&self.write_root),
        };
        if allowed {
            Ok(abs)
        } else {
            Err(denied())
        }
    }
}

/// The wrapped `fs` host module. The returned table is write-guarded by
/// the caller.
fn build_fs_module(lua: &Lua, policy: FsPolicy) -> mlua::Result<Table> {
    let fs = lua.create_table()?;
    let policy = Arc::new(policy);

    {
        let policy = policy.clone();
        fs.set(
            "read",
            lua.create_function(move |_, path: String| {
                let abs = policy.check(FsOperation::Read, Path::new(&path))?;
                std::fs::read_to_string(&abs).map_err(|e| {
                    mlua::Error::from(SandboxError::Runtime(format!(
                        "fs.read '{}': {e}",
                        abs.display()
                    )))
                })
            })?,
        )?;
    }
    {
        let policy = policy.clone();
        fs.set(
            "exists",
            lua.create_function(move |_, path: String| {
                let abs = policy.check(FsOperation::Read, Path::new(&path))?;
                Ok(abs.exists())
            })?,
        )?;
    }
    {
        let policy = policy.clone();
        fs.set(
            "list",
            lua.create_function(move |lua, path: String| {
                let abs = policy.check(FsOperation::List, Path::new(&path))?;
                let mut names = Vec::new();
                let entries = std::fs::read_dir(&abs).map_err(|e| {
                    mlua::Error::from(SandboxError::Runtime(format!(
                        "fs.list '{}': {e}",
                        abs.display()
                    )))
                })?;
                for entry in entries.flatten() {
                    names.push(entry.file_name().to_string_lossy().to_string());
                }
                names.sort();
                let out = lua.create_table()?;
                for (i, name) in names.into_iter().enumerate() {
                    out.raw_set(i + 1, name)?;
                }
                Ok(out)
            })?,
        )?;
    }
    {
        let policy = policy.clone();
        fs.set(
            "write",
            lua.create_function(move |_, (path, data): (String, String)| {
                let abs = policy.check(FsOperation::Write, Path::new(&path))?;
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        mlua::Error::from(SandboxError::Runtime(format!(
                            "fs.write '{}': {e}",
                            abs.display()
                        )))
                    })?;
                }
                std::fs::write(&abs, data).map_err(|e| {
                    mlua::Error::from(SandboxError::Runtime(format!(
                        "fs.write '{}': {e}",
                        abs.display()
                    )))
                })
            })?,
        )?;
    }
    Ok(fs)
}

/// The wrapped `env` host module: the identity of the script being loaded.
fn build_env_module(lua: &Lua, request: &ExecutionRequest<'_>) -> mlua::Result<Table> {
    let script = request.script;
    let env = lua.create_table()?;
    env.set("category", script.category.as_str())?;
    env.set("name", script.name.as_str())?;
    if let Some(version) = &script.version {
        env.set("version", version.as_str())?;
    }
    if let Some(repository) = &request.repository {
        env.set("repository", repository.as_str())?;
    }
    env.set("installed", script.atom().is_installed())?;
    let options = lua.create_table()?;
    for (i, option) in request.enabled_options.iter().enumerate() {
        options.raw_set(i + 1, option.as_str())?;
    }
    env.set("options", options)?;
    Ok(env)
}

/// Recover the sandbox error carried through mlua's wrapping, or fold the
/// raw Lua error into a runtime failure.
fn as_sandbox_error(err: mlua::Error) -> SandboxError {
    match from_lua_error(&err) {
        Some(sandbox) => sandbox.clone(),
        None => SandboxError::Runtime(err.to_string()),
    }
}
