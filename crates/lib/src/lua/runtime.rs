//! Lua runtime creation and script file evaluation.
//!
//! Every definition or stage script evaluates in a fresh runtime seeded with
//! the `releng` helper table and the cumulative script environment. After
//! evaluation, callers read attributes straight from the runtime globals.

use std::path::Path;

use mlua::prelude::*;

use crate::lua::globals;
use crate::script_env::ScriptEnv;

/// Registry key holding the VOID sentinel table.
pub(crate) const VOID_REGISTRY_KEY: &str = "releng.void";

/// A prepared Lua runtime for one script evaluation pass.
pub struct ScriptRuntime {
  lua: Lua,
}

impl ScriptRuntime {
  /// Create a runtime with the `releng` helper table registered.
  ///
  /// When a project root is given, its directory joins the Lua module search
  /// path so scripts can `require` shared project modules.
  pub fn new(root: Option<&Path>) -> LuaResult<Self> {
    let lua = Lua::new();

    if let Some(root) = root {
      let package: LuaTable = lua.globals().get("package")?;
      let path: String = package.get("path")?;
      let root = root.display();
      package.set("path", format!("{root}/?.lua;{root}/?/init.lua;{path}"))?;
    }

    globals::register_helpers(&lua)?;

    Ok(ScriptRuntime { lua })
  }

  /// The underlying Lua state.
  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  /// Install script-environment values as globals.
  pub fn apply_env(&self, env: &ScriptEnv) -> LuaResult<()> {
    let globals = self.lua.globals();
    for (key, value) in env {
      globals.set(key.as_str(), value.clone())?;
    }
    Ok(())
  }

  /// Evaluate a script file in this runtime's globals.
  ///
  /// Sets `releng.dir` to the script's directory for the duration of the
  /// evaluation so relative helper paths resolve next to the script.
  pub fn eval_file(&self, path: &Path) -> LuaResult<()> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| LuaError::external(format!("cannot read '{}': {}", path.display(), e)))?;

    let releng: LuaTable = self.lua.globals().get("releng")?;
    releng.set(
      "dir",
      path
        .parent()
        .unwrap_or(Path::new(""))
        .to_string_lossy()
        .to_string(),
    )?;

    self
      .lua
      .load(&content)
      .set_name(format!("@{}", path.display()))
      .exec()
  }

  /// Read a global by name; absent globals return `LuaValue::Nil`.
  pub fn get(&self, key: &str) -> LuaResult<LuaValue> {
    self.lua.globals().get(key)
  }

  /// Whether a value is the `releng.VOID` sentinel.
  pub fn is_void(&self, value: &LuaValue) -> bool {
    let Ok(sentinel) = self.lua.named_registry_value::<LuaTable>(VOID_REGISTRY_KEY) else {
      return false;
    };
    match value {
      LuaValue::Table(t) => t.to_pointer() == sentinel.to_pointer(),
      _ => false,
    }
  }
}
