//! Write guard: read-only proxy views over shared Lua tables.
//!
//! Any shared mutable table handed to a script (host modules, library
//! snapshots, the guarded standard libraries) goes through [`guard`]. Reads
//! delegate to the underlying table; writes and deletes raise a capability
//! error unless the underlying table carries the [`GUARDED_SET_HOOK`]
//! function. The hook is installed only by the execution engine on tables
//! it builds itself; scripts cannot reach it because writing it through the
//! guard is itself a guarded write.
//!
//! Key iteration (`pairs`) is not supported on guarded views; scripts read
//! module members by name.

use mlua::{Lua, MetaMethod, Table, Value};

use crate::sandbox::error::SandboxError;

/// Name of the explicit guarded-mutation hook on an underlying table.
pub const GUARDED_SET_HOOK: &str = "__guarded_set";

/// Wrap `target` in a read-only proxy table.
///
/// Aliasing is intentional: the proxy holds the real table, so guarding is
/// cheap and the underlying module state stays shared (and unwritable).
pub fn guard(lua: &Lua, target: Table) -> mlua::Result<Table> {
    let proxy = lua.create_table()?;
    let mt = lua.create_table()?;

    mt.set(MetaMethod::Index.name(), target.clone())?;

    let write_target = target.clone();
    mt.set(
        MetaMethod::NewIndex.name(),
        lua.create_function(move |_, (_proxy, key, value): (Table, Value, Value)| {
            let hook: Value = write_target.raw_get(GUARDED_SET_HOOK)?;
            if let Value::Function(hook) = hook {
                hook.call::<()>((write_target.clone(), key, value))
            } else {
                Err(SandboxError::GuardedWrite {
                    key: describe_key(&key),
                }
                .into())
            }
        })?,
    )?;

    let len_target = target;
    mt.set(
        MetaMethod::Len.name(),
        lua.create_function(move |_, _proxy: Table| Ok(len_target.raw_len()))?,
    )?;

    // Hide the metatable so scripts cannot peel the proxy off.
    mt.set("__metatable", false)?;

    let _ = proxy.set_metatable(Some(mt));
    Ok(proxy)
}

fn describe_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Integer(i) => i.to_string(),
        other => format!("{other:?}"),
    }
}
