//! The package object produced by executing a definition script.
//!
//! Declared fields are modelled as [`FieldValue`]s — a deterministic value
//! tree (`BTreeMap` keys, no functions) so that serializing the same load
//! twice yields byte-identical cache entries.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::script::{DefinitionScript, ScriptOrigin};

/// Field value trees deeper than this are treated as cyclic. Matches the
/// importer's clone depth cap.
pub const MAX_FIELD_DEPTH: usize = 32;

/// A declared field nests past [`MAX_FIELD_DEPTH`], which a finite literal
/// in a definition script never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("field value nests deeper than {MAX_FIELD_DEPTH} levels")]
pub struct FieldTooDeep;

/// A declared field value extracted from the script's package instance.
///
/// Untagged so the persistent cache reads as plain JSON. Lua tables become
/// lists when their keys are the contiguous integers `1..=n`, maps (string
/// keys only) otherwise. Functions and userdata are never field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Convert a Lua value. Returns `Ok(None)` for values that cannot be a
    /// declared field (functions, userdata, threads, non-string table keys
    /// are skipped inside maps) and [`FieldTooDeep`] when the table graph
    /// nests past the depth cap, as a self-referencing table does.
    pub fn from_lua(value: &mlua::Value) -> Result<Option<Self>, FieldTooDeep> {
        Self::from_lua_at(value, 0)
    }

    fn from_lua_at(value: &mlua::Value, depth: usize) -> Result<Option<Self>, FieldTooDeep> {
        match value {
            mlua::Value::Nil => Ok(Some(FieldValue::Null)),
            mlua::Value::Boolean(b) => Ok(Some(FieldValue::Bool(*b))),
            mlua::Value::Integer(i) => Ok(Some(FieldValue::Int(*i))),
            mlua::Value::Number(n) => Ok(Some(FieldValue::Float(*n))),
            mlua::Value::String(s) => Ok(Some(FieldValue::Str(s.to_string_lossy().to_string()))),
            mlua::Value::Table(t) => {
                if depth >= MAX_FIELD_DEPTH {
                    return Err(FieldTooDeep);
                }
                Ok(Some(Self::from_table(t, depth)?))
            }
            _ => Ok(None),
        }
    }

    fn from_table(table: &mlua::Table, depth: usize) -> Result<Self, FieldTooDeep> {
        let mut int_entries: BTreeMap<i64, FieldValue> = BTreeMap::new();
        let mut str_entries: BTreeMap<String, FieldValue> = BTreeMap::new();

        for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
            let Ok((key, value)) = pair else { continue };
            let Some(converted) = Self::from_lua_at(&value, depth + 1)? else {
                continue;
            };
            match key {
                mlua::Value::Integer(i) => {
                    int_entries.insert(i, converted);
                }
                mlua::Value::String(s) => {
                    str_entries.insert(s.to_string_lossy().to_string(), converted);
                }
                _ => {}
            }
        }

        // Contiguous 1..=n integer keys and nothing else: a list.
        let is_list = str_entries.is_empty()
            && int_entries
                .keys()
                .enumerate()
                .all(|(idx, k)| *k == idx as i64 + 1);
        Ok(if is_list && !int_entries.is_empty() {
            FieldValue::List(int_entries.into_values().collect())
        } else if int_entries.is_empty() && str_entries.is_empty() {
            // Ambiguous empty table; treat as an empty list.
            FieldValue::List(Vec::new())
        } else {
            // Mixed or string-keyed: map form, integer keys rendered as strings.
            for (k, v) in int_entries {
                str_entries.insert(k.to_string(), v);
            }
            FieldValue::Map(str_entries)
        })
    }

    /// Borrow the string contents, if this is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The result of loading one definition script ("Mod").
#[derive(Debug, Clone, PartialEq)]
pub struct Mod {
    /// Fully qualified atom of the package.
    pub atom: Atom,
    /// Path of the definition script this object came from.
    pub path: PathBuf,
    /// Resolved owning repository. For repository scripts this is the
    /// repository itself; for installed scripts it is the `REPO` sidecar
    /// value when present.
    pub repository: Option<String>,
    /// Enabled options (`USE` sidecar); only populated for installed
    /// packages.
    pub enabled_options: Vec<String>,
    /// The script's declared public fields.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Mod {
    /// Build a package object for `script` with the given declared fields.
    pub fn new(script: &DefinitionScript, fields: BTreeMap<String, FieldValue>) -> Self {
        let repository = match &script.origin {
            ScriptOrigin::Repository(name) => Some(name.clone()),
            ScriptOrigin::Installed => None,
        };
        Self {
            atom: script.atom(),
            path: script.path.clone(),
            repository,
            enabled_options: Vec::new(),
            fields,
        }
    }

    /// Look up a declared field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
