//! Typed attribute extraction from evaluated package definitions.
//!
//! After a definition script runs, its attributes live in the runtime
//! globals keyed `<PKGNAME>_<ATTR>`. [`PkgReader`] reads them back with one
//! accessor per registered type tag; every accessor rejects values of the
//! wrong shape with an invalid-package-key-value error naming the key and
//! the expected form.

use std::collections::BTreeMap;

use mlua::prelude::*;

use crate::errors::PkgError;
use crate::lua::ScriptRuntime;

/// A configure/build/install option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
  /// The key is a bare flag without a value.
  Void,
  Str(String),
}

/// Ordered option map (OPTS type tag).
pub type OptsMap = BTreeMap<String, OptValue>;

/// A value that is either a plain string or a string map
/// (DICT_STR_STR_OR_STR type tag; used by revision and site attributes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrOrMap {
  Str(String),
  Map(BTreeMap<String, String>),
}

/// Attribute key prefix for a package name: uppercased, with every
/// non-alphanumeric character mapped to `_`.
pub fn key_prefix(name: &str) -> String {
  name
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() {
        c.to_ascii_uppercase()
      } else {
        '_'
      }
    })
    .collect()
}

/// Typed reader over a package's evaluated globals.
pub struct PkgReader<'a> {
  runtime: &'a ScriptRuntime,
  pkg: String,
  prefix: String,
}

impl<'a> PkgReader<'a> {
  pub fn new(runtime: &'a ScriptRuntime, pkg: &str) -> Self {
    PkgReader {
      runtime,
      pkg: pkg.to_string(),
      prefix: key_prefix(pkg),
    }
  }

  fn raw(&self, key: &str) -> Result<LuaValue, PkgError> {
    self
      .runtime
      .get(&format!("{}_{}", self.prefix, key))
      .map_err(|_| self.invalid(key, "readable value"))
  }

  fn invalid(&self, key: &str, expected: &'static str) -> PkgError {
    PkgError::InvalidKeyValue {
      pkg: self.pkg.clone(),
      key: key.to_string(),
      expected,
    }
  }

  /// BOOL: a boolean.
  pub fn bool(&self, key: &str) -> Result<Option<bool>, PkgError> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Boolean(v) => Ok(Some(v)),
      _ => Err(self.invalid(key, "a boolean")),
    }
  }

  /// STR / PSTR: a string (paths arrive as strings from Lua).
  pub fn string(&self, key: &str) -> Result<Option<String>, PkgError> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::String(s) => Ok(Some(s.to_string_lossy().to_string())),
      _ => Err(self.invalid(key, "a string")),
    }
  }

  /// STRS: a string or a sequence of strings; a bare string becomes a
  /// one-element list.
  pub fn strs(&self, key: &str) -> Result<Option<Vec<String>>, PkgError> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::String(s) => Ok(Some(vec![s.to_string_lossy().to_string()])),
      LuaValue::Table(table) => {
        let mut values = Vec::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
          let (k, v) = pair.map_err(|_| self.invalid(key, "a string or sequence of strings"))?;
          if !matches!(k, LuaValue::Integer(_)) {
            return Err(self.invalid(key, "a string or sequence of strings"));
          }
          match v {
            LuaValue::String(s) => values.push(s.to_string_lossy().to_string()),
            _ => return Err(self.invalid(key, "a string or sequence of strings")),
          }
        }
        Ok(Some(values))
      }
      _ => Err(self.invalid(key, "a string or sequence of strings")),
    }
  }

  /// DICT_STR_PSTR: a map with string keys and string values; a `false`
  /// value marks the key as explicitly unset.
  pub fn dict_str_pstr(&self, key: &str) -> Result<Option<BTreeMap<String, Option<String>>>, PkgError> {
    const EXPECTED: &str = "a map of strings to strings";
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Table(table) => {
        let mut map = BTreeMap::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
          let (k, v) = pair.map_err(|_| self.invalid(key, EXPECTED))?;
          let LuaValue::String(k) = k else {
            return Err(self.invalid(key, EXPECTED));
          };
          let entry = match v {
            LuaValue::String(s) => Some(s.to_string_lossy().to_string()),
            LuaValue::Boolean(false) => None,
            _ => return Err(self.invalid(key, EXPECTED)),
          };
          map.insert(k.to_string_lossy().to_string(), entry);
        }
        Ok(Some(map))
      }
      _ => Err(self.invalid(key, EXPECTED)),
    }
  }

  /// DICT_STR_STR_OR_STR: a string, or a map of strings to strings.
  pub fn str_or_map(&self, key: &str) -> Result<Option<StrOrMap>, PkgError> {
    const EXPECTED: &str = "a string or a map of strings to strings";
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::String(s) => Ok(Some(StrOrMap::Str(s.to_string_lossy().to_string()))),
      LuaValue::Table(table) => {
        let mut map = BTreeMap::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
          let (k, v) = pair.map_err(|_| self.invalid(key, EXPECTED))?;
          match (k, v) {
            (LuaValue::String(k), LuaValue::String(v)) => {
              map.insert(k.to_string_lossy().to_string(), v.to_string_lossy().to_string());
            }
            _ => return Err(self.invalid(key, EXPECTED)),
          }
        }
        Ok(Some(StrOrMap::Map(map)))
      }
      _ => Err(self.invalid(key, EXPECTED)),
    }
  }

  /// OPTS: a string (one bare flag), a sequence of strings (bare flags), or
  /// a map whose values are strings or the VOID sentinel.
  pub fn opts(&self, key: &str) -> Result<Option<OptsMap>, PkgError> {
    const EXPECTED: &str = "a string, sequence of strings, or option map";
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::String(s) => {
        let mut map = OptsMap::new();
        map.insert(s.to_string_lossy().to_string(), OptValue::Void);
        Ok(Some(map))
      }
      LuaValue::Table(table) => {
        let mut map = OptsMap::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
          let (k, v) = pair.map_err(|_| self.invalid(key, EXPECTED))?;
          match k {
            // Sequence entries are bare flags.
            LuaValue::Integer(_) => match v {
              LuaValue::String(s) => {
                map.insert(s.to_string_lossy().to_string(), OptValue::Void);
              }
              _ => return Err(self.invalid(key, EXPECTED)),
            },
            LuaValue::String(k) => {
              let entry = if self.runtime.is_void(&v) {
                OptValue::Void
              } else {
                match v {
                  LuaValue::String(s) => OptValue::Str(s.to_string_lossy().to_string()),
                  LuaValue::Boolean(true) => OptValue::Void,
                  _ => return Err(self.invalid(key, EXPECTED)),
                }
              };
              map.insert(k.to_string_lossy().to_string(), entry);
            }
            _ => return Err(self.invalid(key, EXPECTED)),
          }
        }
        Ok(Some(map))
      }
      _ => Err(self.invalid(key, EXPECTED)),
    }
  }

  /// INT_NONNEGATIVE: an integer greater than or equal to zero.
  pub fn int_nonnegative(&self, key: &str) -> Result<Option<usize>, PkgError> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Integer(v) if v >= 0 => Ok(Some(v as usize)),
      _ => Err(self.invalid(key, "a non-negative integer")),
    }
  }

  /// INT_POSITIVE: an integer greater than zero.
  pub fn int_positive(&self, key: &str) -> Result<Option<usize>, PkgError> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Integer(v) if v > 0 => Ok(Some(v as usize)),
      _ => Err(self.invalid(key, "a positive integer")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn runtime_with(script: &str) -> ScriptRuntime {
    let runtime = ScriptRuntime::new(None).unwrap();
    runtime.lua().load(script).exec().unwrap();
    runtime
  }

  #[test]
  fn key_prefix_mapping() {
    assert_eq!(key_prefix("libfoo"), "LIBFOO");
    assert_eq!(key_prefix("lib-foo2"), "LIB_FOO2");
    assert_eq!(key_prefix("lib.foo"), "LIB_FOO");
  }

  #[test]
  fn bool_accepts_only_booleans() {
    let rt = runtime_with("DEMO_INTERNAL = true\nDEMO_EXTERNAL = 'yes'\n");
    let reader = PkgReader::new(&rt, "demo");

    assert_eq!(reader.bool("INTERNAL").unwrap(), Some(true));
    assert_eq!(reader.bool("MISSING").unwrap(), None);
    assert!(matches!(
      reader.bool("EXTERNAL"),
      Err(PkgError::InvalidKeyValue { .. })
    ));
  }

  #[test]
  fn strs_promotes_bare_string() {
    let rt = runtime_with("DEMO_NEEDS = 'liba'\nDEMO_LICENSE = {'MIT', 'Apache-2.0'}\nDEMO_BAD = {1, 2}\n");
    let reader = PkgReader::new(&rt, "demo");

    assert_eq!(reader.strs("NEEDS").unwrap(), Some(vec!["liba".to_string()]));
    assert_eq!(
      reader.strs("LICENSE").unwrap(),
      Some(vec!["MIT".to_string(), "Apache-2.0".to_string()])
    );
    assert!(reader.strs("BAD").is_err());
  }

  #[test]
  fn dict_str_pstr_supports_unset_marker() {
    let rt = runtime_with("DEMO_ENV = {CC = 'gcc', LD = false}\n");
    let reader = PkgReader::new(&rt, "demo");

    let env = reader.dict_str_pstr("ENV").unwrap().unwrap();
    assert_eq!(env.get("CC"), Some(&Some("gcc".to_string())));
    assert_eq!(env.get("LD"), Some(&None));
  }

  #[test]
  fn str_or_map_both_forms() {
    let rt = runtime_with("DEMO_REVISION = 'v1.0'\nDEMO_SITE = {dev = 'https://a', ['*'] = 'https://b'}\n");
    let reader = PkgReader::new(&rt, "demo");

    assert_eq!(
      reader.str_or_map("REVISION").unwrap(),
      Some(StrOrMap::Str("v1.0".to_string()))
    );
    let StrOrMap::Map(map) = reader.str_or_map("SITE").unwrap().unwrap() else {
      panic!("expected map");
    };
    assert_eq!(map.get("dev"), Some(&"https://a".to_string()));
    assert_eq!(map.get("*"), Some(&"https://b".to_string()));
  }

  #[test]
  fn opts_accepts_all_documented_shapes() {
    let rt = runtime_with(
      r#"
        DEMO_CONF_OPTS = '--enable-x'
        DEMO_BUILD_OPTS = {'--quiet', '--fast'}
        DEMO_INSTALL_OPTS = {['--prefix'] = '/usr', ['--strip'] = releng.VOID}
        DEMO_BAD = {'--ok', 42}
      "#,
    );
    let reader = PkgReader::new(&rt, "demo");

    let conf = reader.opts("CONF_OPTS").unwrap().unwrap();
    assert_eq!(conf.get("--enable-x"), Some(&OptValue::Void));

    let build = reader.opts("BUILD_OPTS").unwrap().unwrap();
    assert_eq!(build.len(), 2);
    assert_eq!(build.get("--quiet"), Some(&OptValue::Void));

    let install = reader.opts("INSTALL_OPTS").unwrap().unwrap();
    assert_eq!(install.get("--prefix"), Some(&OptValue::Str("/usr".to_string())));
    assert_eq!(install.get("--strip"), Some(&OptValue::Void));

    assert!(reader.opts("BAD").is_err());
  }

  #[test]
  fn int_range_checks() {
    let rt = runtime_with("DEMO_STRIP_COUNT = 0\nDEMO_FIXED_JOBS = 4\nDEMO_NEG = -1\n");
    let reader = PkgReader::new(&rt, "demo");

    assert_eq!(reader.int_nonnegative("STRIP_COUNT").unwrap(), Some(0));
    assert_eq!(reader.int_positive("FIXED_JOBS").unwrap(), Some(4));
    assert!(reader.int_nonnegative("NEG").is_err());
    assert!(reader.int_positive("STRIP_COUNT").is_err());
  }
}
