//! Script-environment values shared between the engine and evaluated scripts.
//!
//! The engine maintains a cumulative map of variables which every project and
//! package script sees as Lua globals, and which stage invocations also
//! receive as process environment variables. Values keep their native type on
//! the Lua side and are rendered to strings for the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mlua::prelude::*;

/// A value exposed to definition and stage scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
  Bool(bool),
  Int(i64),
  Str(String),
  Path(PathBuf),
}

impl ScriptValue {
  /// Render the value for the process environment.
  ///
  /// Booleans map to `1`/`0`; paths use their platform display form.
  pub fn to_env(&self) -> String {
    match self {
      ScriptValue::Bool(true) => "1".to_string(),
      ScriptValue::Bool(false) => "0".to_string(),
      ScriptValue::Int(v) => v.to_string(),
      ScriptValue::Str(v) => v.clone(),
      ScriptValue::Path(v) => v.display().to_string(),
    }
  }
}

impl From<bool> for ScriptValue {
  fn from(v: bool) -> Self {
    ScriptValue::Bool(v)
  }
}

impl From<i64> for ScriptValue {
  fn from(v: i64) -> Self {
    ScriptValue::Int(v)
  }
}

impl From<usize> for ScriptValue {
  fn from(v: usize) -> Self {
    ScriptValue::Int(v as i64)
  }
}

impl From<&str> for ScriptValue {
  fn from(v: &str) -> Self {
    ScriptValue::Str(v.to_string())
  }
}

impl From<String> for ScriptValue {
  fn from(v: String) -> Self {
    ScriptValue::Str(v)
  }
}

impl From<&Path> for ScriptValue {
  fn from(v: &Path) -> Self {
    ScriptValue::Path(v.to_path_buf())
  }
}

impl From<PathBuf> for ScriptValue {
  fn from(v: PathBuf) -> Self {
    ScriptValue::Path(v)
  }
}

impl IntoLua for ScriptValue {
  fn into_lua(self, lua: &Lua) -> LuaResult<LuaValue> {
    match self {
      ScriptValue::Bool(v) => Ok(LuaValue::Boolean(v)),
      ScriptValue::Int(v) => Ok(LuaValue::Integer(v)),
      ScriptValue::Str(v) => Ok(LuaValue::String(lua.create_string(&v)?)),
      ScriptValue::Path(v) => Ok(LuaValue::String(lua.create_string(v.display().to_string())?)),
    }
  }
}

/// Cumulative script variables, ordered for deterministic injection.
pub type ScriptEnv = BTreeMap<String, ScriptValue>;

/// Render a script environment into process-environment string pairs.
pub fn to_process_env(env: &ScriptEnv) -> BTreeMap<String, String> {
  env.iter().map(|(k, v)| (k.clone(), v.to_env())).collect()
}
