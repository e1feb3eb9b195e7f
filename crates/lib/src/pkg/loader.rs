//! Package definition discovery, evaluation and resolution.
//!
//! Loading a package is a script evaluation: the definition file runs in a
//! runtime seeded with the releng helpers plus the cumulative script
//! environment, then attributes are read back by `<PKGNAME>_<ATTR>` key and
//! resolved into a [`Pkg`] with every derived path computed and every
//! invariant checked.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use mlua::prelude::*;
use tracing::{debug, warn};

use crate::consts;
use crate::dvcsdb::DvcsDb;
use crate::errors::{PkgError, RelengError};
use crate::lua::ScriptRuntime;
use crate::opts::{Devmode, EngineOpts};
use crate::pkg::attrs::{PkgReader, StrOrMap};
use crate::pkg::site::parse_site;
use crate::pkg::sort::sort_names;
use crate::pkg::{CacheKind, InstallType, PYTHON_SETUP_TYPES, Pkg, PackageType, VcsType, name_version};
use crate::registry::Registry;
use crate::script_env::{ScriptEnv, ScriptValue};

/// Stage-script suffixes that make a directory a def-less package.
const STAGE_SCRIPT_TAGS: &[&str] = &["bootstrap", "configure", "build", "install", "post"];

/// Package subactions, included in "did you mean" lookups.
const SUBACTIONS: &[&str] = &[
  "build",
  "clean",
  "configure",
  "distclean",
  "exec",
  "extract",
  "fetch",
  "fetch_full",
  "fresh",
  "install",
  "license",
  "patch",
  "rebuild",
  "rebuild_only",
  "reconfigure",
  "reconfigure_only",
  "reinstall",
];

/// Archive extensions spanning two path components.
const DOUBLE_EXTENSIONS: &[&str] = &["tar.bz2", "tar.gz", "tar.lz", "tar.xz", "tar.zst"];

/// Loads package definitions into validated [`Pkg`] records.
pub struct PkgLoader<'a> {
  opts: &'a EngineOpts,
  registry: &'a Registry,
  dvcsdb: &'a mut DvcsDb,
}

impl<'a> PkgLoader<'a> {
  pub fn new(opts: &'a EngineOpts, registry: &'a Registry, dvcsdb: &'a mut DvcsDb) -> Self {
    PkgLoader { opts, registry, dvcsdb }
  }

  /// Load the named packages and, transitively, every dependency they name.
  /// Returns the packages in dependency order.
  pub fn load_all(&mut self, names: &[String], script_env: &mut ScriptEnv) -> Result<Vec<Pkg>, RelengError> {
    let mut queue: Vec<String> = Vec::new();
    for name in names {
      if !queue.contains(name) {
        queue.push(name.clone());
      }
    }

    let mut loaded: Vec<Pkg> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut cursor = 0;

    while cursor < queue.len() {
      let name = queue[cursor].clone();
      cursor += 1;

      if !seen.insert(name.clone()) {
        continue;
      }

      let pkg = self.load_one(&name, script_env)?;

      // A dependency on an unloaded name triggers implicit loading.
      for dep in &pkg.deps {
        if !seen.contains(dep) && !queue.contains(dep) {
          debug!(pkg = %name, dep = %dep, "implicitly loading dependency");
          queue.push(dep.clone());
        }
      }

      loaded.push(pkg);
    }

    let declared: Vec<(String, Vec<String>)> = loaded.iter().map(|p| (p.name.clone(), p.deps.clone())).collect();
    let order = sort_names(&declared)?;

    let mut by_name: BTreeMap<String, Pkg> = loaded.into_iter().map(|p| (p.name.clone(), p)).collect();
    Ok(
      order
        .iter()
        .map(|name| by_name.remove(name).expect("sorted name was loaded"))
        .collect(),
    )
  }

  /// Load and resolve a single package definition.
  pub fn load_one(&mut self, name: &str, script_env: &mut ScriptEnv) -> Result<Pkg, RelengError> {
    let (def_dir, def_file) = self.find_definition(name)?;

    let runtime = ScriptRuntime::new(Some(&self.opts.root_dir)).map_err(|e| PkgError::InvalidPackageScript {
      name: name.to_string(),
      source: e,
    })?;
    runtime.apply_env(script_env).map_err(|e| PkgError::InvalidPackageScript {
      name: name.to_string(),
      source: e,
    })?;

    if let Some(def_file) = &def_file {
      let before = global_names(&runtime);
      runtime.eval_file(def_file).map_err(|e| PkgError::InvalidPackageScript {
        name: name.to_string(),
        source: e,
      })?;
      absorb_new_globals(&runtime, &before, script_env);
    }

    let reader = PkgReader::new(&runtime, name);
    self.resolve(name, &def_dir, &reader)
  }

  /// Package search directories: extension directories first, then the
  /// project default.
  fn pkg_dirs(&self) -> Vec<PathBuf> {
    let mut dirs = self.opts.external_pkg_dirs.clone();
    dirs.push(self.opts.default_pkg_dir.clone());
    dirs
  }

  /// Locate a package's definition directory and, when present, its
  /// definition file. A directory with only stage scripts is a def-less
  /// package (`Ok((dir, None))`).
  fn find_definition(&self, name: &str) -> Result<(PathBuf, Option<PathBuf>), PkgError> {
    if name.is_empty() {
      return Err(PkgError::MissingPackageScript {
        name: String::new(),
        hint: String::new(),
      });
    }

    for base in self.pkg_dirs() {
      let dir = base.join(name);
      if !dir.is_dir() {
        continue;
      }

      let preferred = dir.join(format!("{name}.{}", consts::DEF_EXT));
      if preferred.is_file() {
        return Ok((dir, Some(preferred)));
      }

      for legacy in [name.to_string(), format!("{name}.releng")] {
        let candidate = dir.join(&legacy);
        if candidate.is_file() {
          warn!(pkg = name, file = %legacy, "deprecated definition file name; rename to '{name}.{}'", consts::DEF_EXT);
          return Ok((dir, Some(candidate)));
        }
      }

      for tag in STAGE_SCRIPT_TAGS {
        if dir.join(format!("{name}-{tag}.{}", consts::DEF_EXT)).is_file() {
          return Ok((dir, None));
        }
      }
    }

    Err(PkgError::MissingPackageScript {
      name: name.to_string(),
      hint: self.suggestion_hint(name),
    })
  }

  /// Close-match lookup over available package names and subaction keywords.
  fn suggestion_hint(&self, name: &str) -> String {
    let mut candidates: Vec<String> = SUBACTIONS.iter().map(|s| s.to_string()).collect();
    for base in self.pkg_dirs() {
      let Ok(entries) = fs::read_dir(&base) else {
        continue;
      };
      for entry in entries.flatten() {
        if entry.path().is_dir()
          && let Some(entry_name) = entry.file_name().to_str()
        {
          candidates.push(entry_name.to_string());
        }
      }
    }

    let best = candidates
      .into_iter()
      .map(|candidate| (levenshtein(name, &candidate), candidate))
      .filter(|(distance, _)| *distance > 0 && *distance <= 2)
      .min();

    match best {
      Some((_, candidate)) => format!("; did you mean '{candidate}'?"),
      None => String::new(),
    }
  }

  /// Emit a loader warning, escalating under warnings-as-errors.
  fn warn(&self, pkg: &str, message: &str) -> Result<(), RelengError> {
    if self.opts.werror {
      return Err(RelengError::WarningAsError(format!("{pkg}: {message}")));
    }
    warn!(pkg, "{message}");
    Ok(())
  }

  /// Resolve evaluated attributes into a validated package record.
  fn resolve(&mut self, name: &str, def_dir: &Path, reader: &PkgReader<'_>) -> Result<Pkg, RelengError> {
    let mut version = reader.string("VERSION")?.unwrap_or_default();

    // Site: project overrides win; maps resolve by devmode name.
    let site_value = match self.opts.override_sites.get(name) {
      Some(over) => Some(over.clone()),
      None => match reader.str_or_map("SITE")? {
        Some(StrOrMap::Str(site)) => Some(site),
        Some(StrOrMap::Map(map)) => devmode_lookup(&map, self.opts.devmode.as_ref()).map(|(v, _)| v),
        None => None,
      },
    };

    // A site prefix can select the VCS type and is stripped either way.
    let parsed_site = site_value.as_deref().map(parse_site);
    let (site, implied_vcs) = match parsed_site {
      Some(info) => (Some(info.site), info.vcs),
      None => (None, None),
    };
    let site = site.filter(|s| !s.is_empty());

    let vcs_type = match reader.string("VCS_TYPE")? {
      Some(value) => match VcsType::parse(&value) {
        Some(VcsType::Ext(ext_name)) => {
          if self.registry.fetch_type(&ext_name).is_some() {
            VcsType::Ext(ext_name)
          } else {
            return Err(
              PkgError::UnknownVcsType {
                pkg: name.to_string(),
                value,
              }
              .into(),
            );
          }
        }
        Some(vcs) => vcs,
        None => {
          return Err(
            PkgError::UnknownVcsType {
              pkg: name.to_string(),
              value,
            }
            .into(),
          );
        }
      },
      None => match (&implied_vcs, &site) {
        (Some(vcs), _) => vcs.clone(),
        (None, Some(_)) => VcsType::Url,
        (None, None) => VcsType::None,
      },
    };

    // Revision: overrides beat devmode entries beat the version fallback.
    let legacy_devmode_revision = reader.string("DEVMODE_REVISION")?;
    if legacy_devmode_revision.is_some() {
      self.warn(name, "DEVMODE_REVISION is deprecated; use a REVISION map with devmode keys")?;
    }

    let mut from_devmode = false;
    let mut revision = match self.opts.override_revisions.get(name) {
      Some(over) => over.clone(),
      None => match reader.str_or_map("REVISION")? {
        Some(StrOrMap::Str(revision)) => revision,
        Some(StrOrMap::Map(map)) => match devmode_lookup(&map, self.opts.devmode.as_ref()) {
          Some((value, named)) => {
            from_devmode = named;
            value
          }
          None => String::new(),
        },
        None => String::new(),
      },
    };

    if revision.is_empty()
      && self.opts.in_devmode()
      && let Some(legacy) = legacy_devmode_revision
    {
      revision = legacy;
      from_devmode = true;
    }
    if revision.is_empty() {
      revision = version.clone();
    }
    if from_devmode {
      // Development revisions stand in for the version everywhere the
      // version surfaces (slugs, reports, script variables).
      version = revision.clone();
    }

    if vcs_type.requires_revision() && revision.is_empty() {
      return Err(PkgError::MissingRevision(name.to_string()).into());
    }
    if vcs_type.requires_site() && site.is_none() {
      return Err(PkgError::MissingSite(name.to_string()).into());
    }

    // Policy flags.
    let internal_attr = reader.bool("INTERNAL")?;
    let external_attr = reader.bool("EXTERNAL")?;
    if internal_attr == Some(true) && external_attr == Some(true) {
      return Err(
        PkgError::ConflictingConfiguration {
          pkg: name.to_string(),
          message: "package marked both internal and external".to_string(),
        }
        .into(),
      );
    }
    let internal = match (internal_attr, external_attr) {
      (Some(internal), _) => internal,
      (None, Some(external)) => !external,
      (None, None) => self.opts.default_internal,
    };

    // Dependencies: NEEDS is current, DEPS deprecated; NEEDS wins when both.
    let deps_attr = reader.strs("DEPS")?;
    let needs_attr = reader.strs("NEEDS")?;
    if deps_attr.is_some() && needs_attr.is_some() {
      self.warn(name, "both DEPS and NEEDS are set; using NEEDS")?;
    } else if deps_attr.is_some() {
      self.warn(name, "DEPS is deprecated; use NEEDS")?;
    }
    let deps = needs_attr.or(deps_attr).unwrap_or_default();

    // Build recipe.
    let pkg_type = match reader.string("TYPE")? {
      Some(value) => match PackageType::parse(&value) {
        Some(PackageType::Ext(ext_name)) => {
          if self.registry.package_type(&ext_name).is_some() {
            PackageType::Ext(ext_name)
          } else {
            return Err(
              PkgError::UnknownPackageType {
                pkg: name.to_string(),
                value,
              }
              .into(),
            );
          }
        }
        Some(pkg_type) => pkg_type,
        None => {
          return Err(
            PkgError::UnknownPackageType {
              pkg: name.to_string(),
              value,
            }
            .into(),
          );
        }
      },
      None => PackageType::Script,
    };

    let install_type = match reader.string("INSTALL_TYPE")? {
      Some(value) => InstallType::parse(&value).ok_or_else(|| PkgError::UnknownInstallType {
        pkg: name.to_string(),
        value,
      })?,
      None => InstallType::default(),
    };

    let extract_type = reader.string("EXTRACT_TYPE")?;
    if let Some(value) = &extract_type
      && self.registry.extract_type(value).is_none()
    {
      return Err(
        PkgError::UnknownExtractType {
          pkg: name.to_string(),
          value: value.clone(),
        }
        .into(),
      );
    }

    let python_setup_type = reader.string("PYTHON_SETUP_TYPE")?;
    if let Some(value) = &python_setup_type
      && !PYTHON_SETUP_TYPES.contains(&value.to_lowercase().as_str())
    {
      return Err(
        PkgError::UnknownPythonSetupType {
          pkg: name.to_string(),
          value: value.clone(),
        }
        .into(),
      );
    }

    // Paths.
    let nv = name_version(name, &version);
    let mut build_dir = self.opts.build_dir.join(&nv);
    let mut local_srcs = false;

    if vcs_type == VcsType::Local {
      // Local packages build in-tree; no extraction happens.
      build_dir = def_dir.join(consts::LOCAL_SRC_DIR);
    }

    if internal && !self.opts.local_srcs.is_empty() {
      let rebased = self
        .opts
        .local_srcs
        .get(name)
        .cloned()
        .or_else(|| self.opts.local_srcs.get("*").map(|base| base.join(name)));
      if let Some(path) = rebased {
        if path == self.opts.root_dir {
          return Err(
            PkgError::ConflictingLocalSrcsPath {
              pkg: name.to_string(),
              path,
            }
            .into(),
          );
        }
        build_dir = path;
        local_srcs = true;
      }
    }

    let build_output_dir = if pkg_type.out_of_source() {
      build_dir.join(consts::OUT_OF_SOURCE_DIR)
    } else {
      build_dir.clone()
    };

    let build_subdir = match reader.string("BUILD_SUBDIR")? {
      Some(value) => Some(contained_subpath(&value).ok_or(PkgError::PathTraversal {
        pkg: name.to_string(),
        key: "BUILD_SUBDIR",
      })?),
      None => None,
    };
    let patch_subdir = match reader.string("PATCH_SUBDIR")? {
      Some(value) => Some(contained_subpath(&value).ok_or(PkgError::PathTraversal {
        pkg: name.to_string(),
        key: "PATCH_SUBDIR",
      })?),
      None => None,
    };

    let prefix = reader.string("PREFIX")?;
    if let Some(prefix) = &prefix
      && Path::new(prefix).components().any(|c| c == Component::ParentDir)
    {
      return Err(
        PkgError::PathTraversal {
          pkg: name.to_string(),
          key: "PREFIX",
        }
        .into(),
      );
    }

    // Cache location and archive extension.
    let extension = reader.string("EXTENSION")?.map(|e| e.trim_start_matches('.').to_string());
    let (cache_dir, cache_file) = match vcs_type.cache_kind() {
      CacheKind::Dir if vcs_type.is_dvcs() => {
        let site = site.as_deref().expect("dvcs site checked above");
        let dir_name = self.dvcsdb.cache_dir_for(site, name);
        (self.opts.cache_dir.join(dir_name), None)
      }
      CacheKind::Dir | CacheKind::None => (self.opts.cache_dir.join(name), None),
      CacheKind::File => {
        let ext = match &extension {
          Some(ext) => ext.clone(),
          None => infer_extension(site.as_deref(), &self.opts.cache_ext),
        };
        let file_name = if ext.is_empty() { nv.clone() } else { format!("{nv}.{ext}") };
        (self.opts.cache_dir.join(name), Some(self.opts.dl_dir.join(file_name)))
      }
    };

    let pkg = Pkg {
      name: name.to_string(),
      nv,
      version,
      revision,
      site,
      vcs_type,
      fetch_opts: reader.opts("FETCH_OPTS")?.unwrap_or_default(),
      extension,
      extract_type,
      strip_count: reader.int_nonnegative("STRIP_COUNT")?.unwrap_or(1),
      devmode_ignore_cache: reader
        .bool("DEVMODE_IGNORE_CACHE")?
        .unwrap_or(self.opts.default_devmode_ignore_cache),
      pkg_type,
      install_type,
      conf_opts: reader.opts("CONF_OPTS")?.unwrap_or_default(),
      conf_env: reader.dict_str_pstr("CONF_ENV")?.unwrap_or_default(),
      conf_defs: reader.dict_str_pstr("CONF_DEFS")?.unwrap_or_default(),
      build_opts: reader.opts("BUILD_OPTS")?.unwrap_or_default(),
      build_env: reader.dict_str_pstr("BUILD_ENV")?.unwrap_or_default(),
      build_defs: reader.dict_str_pstr("BUILD_DEFS")?.unwrap_or_default(),
      install_opts: reader.opts("INSTALL_OPTS")?.unwrap_or_default(),
      install_env: reader.dict_str_pstr("INSTALL_ENV")?.unwrap_or_default(),
      install_defs: reader.dict_str_pstr("INSTALL_DEFS")?.unwrap_or_default(),
      env: reader.dict_str_pstr("ENV")?.unwrap_or_default(),
      fixed_jobs: reader.int_positive("FIXED_JOBS")?,
      cargo_name: reader.string("CARGO_NAME")?,
      python_setup_type,
      license: reader.strs("LICENSE")?.unwrap_or_default(),
      license_files: reader.strs("LICENSE_FILES")?.unwrap_or_default(),
      def_dir: def_dir.to_path_buf(),
      build_dir,
      build_output_dir,
      build_subdir,
      patch_subdir,
      cache_dir,
      cache_file,
      hash_file: def_dir.join(format!("{name}.hash")),
      asc_file: def_dir.join(format!("{name}.asc")),
      prefix,
      internal,
      local_srcs,
      no_extraction: reader.bool("NO_EXTRACTION")?.unwrap_or(false),
      skip_remote_config: reader.bool("SKIP_REMOTE_CONFIG")?.unwrap_or(false),
      skip_remote_scripts: reader.bool("SKIP_REMOTE_SCRIPTS")?.unwrap_or(false),
      devmode: from_devmode,
      host_provides: reader.strs("HOST_PROVIDES")?.unwrap_or_default(),
      deps,
    };

    debug!(
      pkg = %pkg.name,
      vcs = %pkg.vcs_type.name(),
      version = %pkg.version,
      revision = %pkg.revision,
      "loaded package"
    );
    Ok(pkg)
  }
}

/// Resolve a devmode-keyed map: the current devmode name first, the `*`
/// fallback second. The boolean reports whether a devmode-specific (named)
/// entry was used.
fn devmode_lookup(map: &BTreeMap<String, String>, devmode: Option<&Devmode>) -> Option<(String, bool)> {
  if let Some(devmode) = devmode
    && let Some(name) = devmode.name()
    && let Some(value) = map.get(name)
  {
    return Some((value.clone(), true));
  }
  map.get("*").map(|value| (value.clone(), false))
}

/// Normalise a subdirectory value, rejecting anything that would resolve
/// outside its base (absolute paths, net parent traversal).
fn contained_subpath(value: &str) -> Option<PathBuf> {
  let path = Path::new(value);
  if path.is_absolute() {
    return None;
  }

  let mut cleaned = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => cleaned.push(part),
      Component::CurDir => {}
      Component::ParentDir => {
        if !cleaned.pop() {
          return None;
        }
      }
      Component::RootDir | Component::Prefix(_) => return None,
    }
  }

  if cleaned.as_os_str().is_empty() {
    None
  } else {
    Some(cleaned)
  }
}

/// Infer a cache-file extension from a site URL.
///
/// Project-level `cache_ext` suffix mappings are consulted first, then the
/// URL basename is interpreted (multi-part tar extensions before plain
/// ones).
fn infer_extension(site: Option<&str>, cache_ext: &BTreeMap<String, String>) -> String {
  let Some(site) = site else {
    return String::new();
  };

  for (suffix, ext) in cache_ext {
    if site.ends_with(suffix.as_str()) {
      return ext.trim_start_matches('.').to_string();
    }
  }

  let path = site.split(['?', '#']).next().unwrap_or(site);
  let basename = path.rsplit('/').next().unwrap_or(path);

  for double in DOUBLE_EXTENSIONS {
    if basename.ends_with(&format!(".{double}")) {
      return double.to_string();
    }
  }

  match basename.rsplit_once('.') {
    Some((stem, ext))
      if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
    {
      ext.to_string()
    }
    _ => String::new(),
  }
}

/// Names of every global currently defined in a runtime.
pub(crate) fn global_names(runtime: &ScriptRuntime) -> BTreeSet<String> {
  let mut names = BTreeSet::new();
  for pair in runtime.lua().globals().pairs::<LuaValue, LuaValue>() {
    if let Ok((LuaValue::String(key), _)) = pair {
      names.insert(key.to_string_lossy().to_string());
    }
  }
  names
}

/// Fold scalar globals a script introduced into the cumulative script
/// environment, so later package scripts observe them.
pub(crate) fn absorb_new_globals(runtime: &ScriptRuntime, before: &BTreeSet<String>, script_env: &mut ScriptEnv) {
  for pair in runtime.lua().globals().pairs::<LuaValue, LuaValue>() {
    let Ok((LuaValue::String(key), value)) = pair else {
      continue;
    };
    let key = key.to_string_lossy().to_string();
    if before.contains(&key) || key.starts_with('_') {
      continue;
    }

    let script_value = match value {
      LuaValue::Boolean(v) => ScriptValue::Bool(v),
      LuaValue::Integer(v) => ScriptValue::Int(v),
      LuaValue::String(v) => ScriptValue::Str(v.to_string_lossy().to_string()),
      _ => continue,
    };
    script_env.insert(key, script_value);
  }
}

/// Levenshtein edit distance, used for "did you mean" suggestions.
fn levenshtein(a: &str, b: &str) -> usize {
  let a_chars: Vec<char> = a.chars().collect();
  let b_chars: Vec<char> = b.chars().collect();

  let m = a_chars.len();
  let n = b_chars.len();
  if m == 0 {
    return n;
  }
  if n == 0 {
    return m;
  }

  let mut matrix = vec![vec![0usize; n + 1]; m + 1];
  for (i, row) in matrix.iter_mut().enumerate() {
    row[0] = i;
  }
  for j in 0..=n {
    matrix[0][j] = j;
  }

  for i in 1..=m {
    for j in 1..=n {
      let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
      matrix[i][j] = (matrix[i - 1][j] + 1)
        .min(matrix[i][j - 1] + 1)
        .min(matrix[i - 1][j - 1] + cost);
    }
  }

  matrix[m][n]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::opts::EngineOpts;

  struct Fixture {
    _tmp: tempfile::TempDir,
    opts: EngineOpts,
    registry: Registry,
  }

  impl Fixture {
    fn new() -> Self {
      let tmp = tempfile::tempdir().unwrap();
      let mut opts = EngineOpts::new(tmp.path());
      opts.finalize();
      Fixture {
        _tmp: tmp,
        opts,
        registry: Registry::new(),
      }
    }

    fn add_pkg(&self, name: &str, content: &str) {
      let dir = self.opts.default_pkg_dir.join(name);
      fs::create_dir_all(&dir).unwrap();
      fs::write(dir.join(format!("{name}.rt")), content).unwrap();
    }

    fn load(&mut self, names: &[&str]) -> Result<Vec<Pkg>, RelengError> {
      let mut dvcsdb = DvcsDb::load(&self.opts.cache_dir);
      let mut env = ScriptEnv::new();
      let mut loader = PkgLoader::new(&self.opts, &self.registry, &mut dvcsdb);
      loader.load_all(&names.iter().map(|n| n.to_string()).collect::<Vec<_>>(), &mut env)
    }

    fn load_single(&mut self, name: &str) -> Result<Pkg, RelengError> {
      Ok(self.load(&[name])?.remove(0))
    }
  }

  #[test]
  fn url_package_derives_cache_file() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'https://example.com/demo-1.0.tar.gz'\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.vcs_type, VcsType::Url);
    assert_eq!(pkg.nv, "demo-1.0");
    assert_eq!(pkg.build_dir, fx.opts.build_dir.join("demo-1.0"));
    assert_eq!(pkg.build_output_dir, pkg.build_dir);
    assert_eq!(pkg.cache_file, Some(fx.opts.dl_dir.join("demo-1.0.tar.gz")));
    assert_eq!(pkg.revision, "1.0");
  }

  #[test]
  fn explicit_extension_wins() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'https://example.com/dl?id=42'\nDEMO_EXTENSION = '.tar.xz'\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.cache_file, Some(fx.opts.dl_dir.join("demo-1.0.tar.xz")));
  }

  #[test]
  fn git_prefix_selects_vcs_and_strips() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'git+https://example.com/demo'\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.vcs_type, VcsType::Git);
    assert_eq!(pkg.site.as_deref(), Some("https://example.com/demo"));
    assert!(pkg.cache_file.is_none());
  }

  #[test]
  fn missing_site_for_git_fails() {
    let mut fx = Fixture::new();
    fx.add_pkg("demo", "DEMO_VERSION = '1.0'\nDEMO_VCS_TYPE = 'git'\n");

    let err = fx.load_single("demo").unwrap_err();
    assert!(matches!(err, RelengError::Pkg(PkgError::MissingSite(_))));
  }

  #[test]
  fn missing_revision_for_svn_fails() {
    let mut fx = Fixture::new();
    fx.add_pkg("demo", "DEMO_VCS_TYPE = 'svn'\nDEMO_SITE = 'https://example.com/svn/demo'\n");

    let err = fx.load_single("demo").unwrap_err();
    assert!(matches!(err, RelengError::Pkg(PkgError::MissingRevision(_))));
  }

  #[test]
  fn devmode_revision_map_marks_package() {
    let mut fx = Fixture::new();
    fx.opts.devmode = Some(Devmode::Named("dev".to_string()));
    fx.add_pkg(
      "demo",
      "DEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = {dev = 'main', ['*'] = 'v1.0'}\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.revision, "main");
    assert_eq!(pkg.version, "main");
    assert!(pkg.devmode);
  }

  #[test]
  fn revision_map_fallback_outside_devmode() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = {dev = 'main', ['*'] = 'v1.0'}\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.revision, "v1.0");
    assert!(!pkg.devmode);
  }

  #[test]
  fn override_revision_beats_devmode_entries() {
    let mut fx = Fixture::new();
    fx.opts.devmode = Some(Devmode::Named("dev".to_string()));
    fx.opts.override_revisions.insert("demo".to_string(), "pinned".to_string());
    fx.add_pkg(
      "demo",
      "DEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = {dev = 'main', ['*'] = 'v1.0'}\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.revision, "pinned");
  }

  #[test]
  fn build_subdir_traversal_fails() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'https://example.com/demo.tgz'\nDEMO_BUILD_SUBDIR = '../escape'\n",
    );

    let err = fx.load_single("demo").unwrap_err();
    assert!(matches!(
      err,
      RelengError::Pkg(PkgError::PathTraversal { key: "BUILD_SUBDIR", .. })
    ));
  }

  #[test]
  fn internal_external_conflict_fails() {
    let mut fx = Fixture::new();
    fx.add_pkg("demo", "DEMO_INTERNAL = true\nDEMO_EXTERNAL = true\n");

    let err = fx.load_single("demo").unwrap_err();
    assert!(matches!(
      err,
      RelengError::Pkg(PkgError::ConflictingConfiguration { .. })
    ));
  }

  #[test]
  fn defless_package_loads_with_defaults() {
    let mut fx = Fixture::new();
    let dir = fx.opts.default_pkg_dir.join("demo");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("demo-build.rt"), "releng.touch('out')\n").unwrap();

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.vcs_type, VcsType::None);
    assert_eq!(pkg.pkg_type, PackageType::Script);
    assert_eq!(pkg.version, "");
  }

  #[test]
  fn unknown_package_suggests_close_match() {
    let mut fx = Fixture::new();
    fx.add_pkg("libfoo", "LIBFOO_VCS_TYPE = 'none'\n");

    let err = fx.load_single("libfool").unwrap_err();
    let RelengError::Pkg(PkgError::MissingPackageScript { hint, .. }) = err else {
      panic!("expected missing package error");
    };
    assert_eq!(hint, "; did you mean 'libfoo'?");
  }

  #[test]
  fn needs_triggers_implicit_load_in_order() {
    let mut fx = Fixture::new();
    fx.add_pkg("a", "A_VCS_TYPE = 'none'\n");
    fx.add_pkg("b", "B_VCS_TYPE = 'none'\nB_NEEDS = {'a'}\n");
    fx.add_pkg("c", "C_VCS_TYPE = 'none'\nC_NEEDS = {'b'}\n");

    let pkgs = fx.load(&["c"]).unwrap();
    let names: Vec<_> = pkgs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
  }

  #[test]
  fn dependency_cycle_fails() {
    let mut fx = Fixture::new();
    fx.add_pkg("a", "A_VCS_TYPE = 'none'\nA_NEEDS = {'b'}\n");
    fx.add_pkg("b", "B_VCS_TYPE = 'none'\nB_NEEDS = {'a'}\n");

    let err = fx.load(&["a"]).unwrap_err();
    assert!(matches!(err, RelengError::Pkg(PkgError::CyclicDependency(_))));
  }

  #[test]
  fn deps_and_needs_picks_needs_with_warning() {
    let mut fx = Fixture::new();
    fx.add_pkg("a", "A_VCS_TYPE = 'none'\n");
    fx.add_pkg("b", "B_VCS_TYPE = 'none'\n");
    fx.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\nDEMO_DEPS = {'a'}\nDEMO_NEEDS = {'b'}\n");

    let pkgs = fx.load(&["demo"]).unwrap();
    let demo = pkgs.iter().find(|p| p.name == "demo").unwrap();
    assert_eq!(demo.deps, vec!["b"]);
  }

  #[test]
  fn deps_and_needs_fails_under_werror() {
    let mut fx = Fixture::new();
    fx.opts.werror = true;
    fx.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\nDEMO_DEPS = {'a'}\nDEMO_NEEDS = {'b'}\n");

    let err = fx.load(&["demo"]).unwrap_err();
    assert!(matches!(err, RelengError::WarningAsError(_)));
  }

  #[test]
  fn shared_dvcs_site_shares_cache_dir() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "liba",
      "LIBA_VERSION = '1'\nLIBA_SITE = 'https://example.com/mono.git'\nLIBA_REVISION = 'v1'\n",
    );
    fx.add_pkg(
      "libb",
      "LIBB_VERSION = '1'\nLIBB_SITE = 'https://example.com/mono.git'\nLIBB_REVISION = 'v1'\n",
    );

    let pkgs = fx.load(&["liba", "libb"]).unwrap();
    assert_eq!(pkgs[0].cache_dir, pkgs[1].cache_dir);
  }

  #[test]
  fn local_sources_rebinds_internal_package() {
    let mut fx = Fixture::new();
    fx.opts.local_srcs.insert("lib".to_string(), PathBuf::from("/tmp/src"));
    fx.add_pkg("lib", "LIB_VCS_TYPE = 'none'\nLIB_INTERNAL = true\n");

    let pkg = fx.load_single("lib").unwrap();
    assert_eq!(pkg.build_dir, PathBuf::from("/tmp/src"));
    assert!(pkg.local_srcs);
  }

  #[test]
  fn local_sources_at_root_conflicts() {
    let mut fx = Fixture::new();
    let root = fx.opts.root_dir.clone();
    fx.opts.local_srcs.insert("lib".to_string(), root);
    fx.add_pkg("lib", "LIB_VCS_TYPE = 'none'\nLIB_INTERNAL = true\n");

    let err = fx.load_single("lib").unwrap_err();
    assert!(matches!(
      err,
      RelengError::Pkg(PkgError::ConflictingLocalSrcsPath { .. })
    ));
  }

  #[test]
  fn local_vcs_builds_in_tree() {
    let mut fx = Fixture::new();
    fx.add_pkg("demo", "DEMO_VCS_TYPE = 'local'\n");

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.build_dir, fx.opts.default_pkg_dir.join("demo").join("local"));
  }

  #[test]
  fn cmake_package_is_out_of_source() {
    let mut fx = Fixture::new();
    fx.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'https://example.com/demo.tgz'\nDEMO_TYPE = 'cmake'\n",
    );

    let pkg = fx.load_single("demo").unwrap();
    assert_eq!(pkg.build_output_dir, pkg.build_dir.join(consts::OUT_OF_SOURCE_DIR));
    assert_eq!(pkg.build_tree(), pkg.build_output_dir);
  }

  #[test]
  fn script_globals_accumulate_across_packages() {
    let mut fx = Fixture::new();
    fx.add_pkg("a", "A_VCS_TYPE = 'none'\nSHARED_TOKEN = 'from-a'\n");
    fx.add_pkg(
      "b",
      "B_VCS_TYPE = 'none'\nassert(SHARED_TOKEN == 'from-a')\nB_NEEDS = {'a'}\n",
    );

    // b's assertion only holds if a's global was carried over.
    fx.load(&["a", "b"]).unwrap();
  }

  #[test]
  fn contained_subpath_normalises() {
    assert_eq!(contained_subpath("src/lib"), Some(PathBuf::from("src/lib")));
    assert_eq!(contained_subpath("./src/./lib"), Some(PathBuf::from("src/lib")));
    assert_eq!(contained_subpath("src/../lib"), Some(PathBuf::from("lib")));
    assert_eq!(contained_subpath("../out"), None);
    assert_eq!(contained_subpath("src/../../out"), None);
    assert_eq!(contained_subpath("/abs"), None);
  }

  #[test]
  fn extension_inference_order() {
    let mut cache_ext = BTreeMap::new();
    assert_eq!(
      infer_extension(Some("https://example.com/a-1.0.tar.gz"), &cache_ext),
      "tar.gz"
    );
    assert_eq!(infer_extension(Some("https://example.com/a-1.0.zip?dl=1"), &cache_ext), "zip");
    assert_eq!(infer_extension(Some("https://example.com/download"), &cache_ext), "");

    cache_ext.insert("/special-dl".to_string(), "tar.xz".to_string());
    assert_eq!(infer_extension(Some("https://example.com/special-dl"), &cache_ext), "tar.xz");
  }

  #[test]
  fn levenshtein_distance() {
    assert_eq!(levenshtein("abc", "abc"), 0);
    assert_eq!(levenshtein("abc", "abd"), 1);
    assert_eq!(levenshtein("abc", ""), 3);
    assert_eq!(levenshtein("kitten", "sitting"), 3);
  }
}
