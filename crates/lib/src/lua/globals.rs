//! The `releng` helper table exposed to every evaluated script.
//!
//! Helpers cover the operations definition and stage scripts routinely
//! need: running tools, light filesystem work and including sibling scripts.
//! `releng.VOID` is the sentinel value OPTS-typed attributes accept for
//! "flag without value" entries.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mlua::prelude::*;

use crate::exec::{self, RunOpts};
use crate::lua::runtime::VOID_REGISTRY_KEY;

/// Register the `releng` global table.
pub fn register_helpers(lua: &Lua) -> LuaResult<()> {
  let releng = lua.create_table()?;

  // VOID sentinel, also kept in the registry for identity checks.
  let void = lua.create_table()?;
  lua.set_named_registry_value(VOID_REGISTRY_KEY, &void)?;
  releng.set("VOID", void)?;

  releng.set("include", lua.create_function(include)?)?;
  releng.set("execute", lua.create_function(execute)?)?;
  releng.set("mkdir", lua.create_function(mkdir)?)?;
  releng.set("copy", lua.create_function(copy)?)?;
  releng.set("exists", lua.create_function(exists)?)?;
  releng.set("remove", lua.create_function(remove)?)?;
  releng.set("touch", lua.create_function(touch)?)?;
  releng.set("join", lua.create_function(join)?)?;

  lua.globals().set("releng", releng)?;
  Ok(())
}

/// Resolve a helper path argument against `releng.dir` when relative.
fn resolve(lua: &Lua, path: &str) -> LuaResult<PathBuf> {
  let path = PathBuf::from(path);
  if path.is_absolute() {
    return Ok(path);
  }

  let releng: LuaTable = lua.globals().get("releng")?;
  match releng.get::<Option<String>>("dir")? {
    Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join(path)),
    _ => Ok(path),
  }
}

fn external(e: io::Error, what: &str, path: &Path) -> LuaError {
  LuaError::external(format!("{what} '{}' failed: {e}", path.display()))
}

/// `releng.include(path)`: evaluate another script in the same globals.
fn include(lua: &Lua, path: String) -> LuaResult<()> {
  let path = resolve(lua, &path)?;
  let content =
    fs::read_to_string(&path).map_err(|e| LuaError::external(format!("cannot read '{}': {e}", path.display())))?;

  // Point releng.dir at the included script while it runs, then restore.
  let releng: LuaTable = lua.globals().get("releng")?;
  let previous: Option<String> = releng.get("dir")?;
  releng.set(
    "dir",
    path.parent().unwrap_or(Path::new("")).to_string_lossy().to_string(),
  )?;

  let result = lua.load(&content).set_name(format!("@{}", path.display())).exec();

  releng.set("dir", previous)?;
  result
}

/// `releng.execute(args [, opts])`: run an external command.
///
/// `args` is a sequence of strings. `opts` may set `cwd` (string), `capture`
/// (boolean) and `env` (string map). Returns captured stdout when capturing,
/// `true` otherwise; a non-zero exit raises an error, failing the stage.
fn execute(lua: &Lua, (args, opts): (LuaTable, Option<LuaTable>)) -> LuaResult<LuaValue> {
  let mut argv = Vec::new();
  for value in args.sequence_values::<String>() {
    argv.push(value?);
  }

  let mut cwd = None;
  let mut capture = false;
  let mut env: Option<BTreeMap<String, String>> = None;

  if let Some(opts) = opts {
    cwd = opts.get::<Option<String>>("cwd")?;
    capture = opts.get::<Option<bool>>("capture")?.unwrap_or(false);
    if let Some(env_table) = opts.get::<Option<LuaTable>>("env")? {
      let mut map = BTreeMap::new();
      for pair in env_table.pairs::<String, String>() {
        let (key, value) = pair?;
        map.insert(key, value);
      }
      env = Some(map);
    }
  }

  let cwd_path = cwd.map(PathBuf::from);
  let run_opts = RunOpts {
    cwd: cwd_path.as_deref(),
    env: env.as_ref(),
    capture,
  };

  let output = exec::run(&argv, &run_opts).map_err(LuaError::external)?;

  if capture {
    Ok(LuaValue::String(lua.create_string(&output)?))
  } else {
    Ok(LuaValue::Boolean(true))
  }
}

/// `releng.mkdir(path)`: create a directory and its parents.
fn mkdir(lua: &Lua, path: String) -> LuaResult<()> {
  let path = resolve(lua, &path)?;
  fs::create_dir_all(&path).map_err(|e| external(e, "mkdir", &path))
}

/// `releng.copy(src, dst)`: copy a file or directory tree.
///
/// Copying a file onto an existing directory places the file inside it;
/// trailing separators on `dst` are not significant.
fn copy(lua: &Lua, (src, dst): (String, String)) -> LuaResult<()> {
  let src = resolve(lua, &src)?;
  let dst = resolve(lua, &dst)?;
  copy_path(&src, &dst).map_err(|e| external(e, "copy", &src))
}

fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
  if src.is_dir() {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
      let entry = entry?;
      copy_path(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
  } else {
    let target = if dst.is_dir() {
      match src.file_name() {
        Some(name) => dst.join(name),
        None => dst.to_path_buf(),
      }
    } else {
      dst.to_path_buf()
    };
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::copy(src, &target)?;
    Ok(())
  }
}

/// `releng.exists(path)`: whether a path exists.
fn exists(lua: &Lua, path: String) -> LuaResult<bool> {
  Ok(resolve(lua, &path)?.exists())
}

/// `releng.remove(path)`: remove a file or directory tree.
fn remove(lua: &Lua, path: String) -> LuaResult<()> {
  let path = resolve(lua, &path)?;
  let result = if path.is_dir() {
    fs::remove_dir_all(&path)
  } else {
    match fs::remove_file(&path) {
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      other => other,
    }
  };
  result.map_err(|e| external(e, "remove", &path))
}

/// `releng.touch(path)`: create an empty file (parents included).
fn touch(lua: &Lua, path: String) -> LuaResult<()> {
  let path = resolve(lua, &path)?;
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(|e| external(e, "touch", &path))?;
  }
  fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(&path)
    .map(|_| ())
    .map_err(|e| external(e, "touch", &path))
}

/// `releng.join(...)`: join path segments with the platform separator.
fn join(_lua: &Lua, parts: LuaMultiValue) -> LuaResult<String> {
  let mut path = PathBuf::new();
  for part in parts {
    let segment = match part {
      LuaValue::String(s) => s.to_string_lossy().to_string(),
      other => {
        return Err(LuaError::external(format!(
          "releng.join expects strings, got {}",
          other.type_name()
        )));
      }
    };
    path.push(segment);
  }
  Ok(path.display().to_string())
}
