//! The engine driver: top-level sequencing of one run.
//!
//! `run()` locates and evaluates the project configuration, loads and sorts
//! the declared packages, handles clean-style actions, then drives the stage
//! pipeline over the working set. Stage failures are caught here and mapped
//! to an unsuccessful return; validation errors propagate to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use mlua::prelude::*;
use tracing::{debug, error, info, warn};

use crate::clean;
use crate::consts;
use crate::dvcsdb::DvcsDb;
use crate::errors::{ConfigError, RelengError, Result};
use crate::exec;
use crate::extract::{ExtractStore, Extractor};
use crate::fetch::{FetchStore, Fetcher};
use crate::flags;
use crate::license::{self, LicenseCache};
use crate::lua::ScriptRuntime;
use crate::opts::{EngineAction, EngineOpts, GlobalAction, PkgAction};
use crate::pipeline::{PackageTypeHandler, Pipeline, PipelineResult};
use crate::pkg::loader::{absorb_new_globals, global_names};
use crate::pkg::{PackageType, Pkg, PkgLoader, VcsType};
use crate::registry::{
  EVENT_CONFIG_LOADED, EVENT_POST_BUILD_FINISHED, EVENT_POST_BUILD_STARTED, EventPayload, Registry,
};
use crate::sbom::{self, SbomCache};
use crate::script_env::ScriptEnv;
use crate::spdx::SpdxDb;
use crate::stage_env::{self, ScopedEnv};

/// The release-engineering build orchestrator.
///
/// Construct with finalized [`EngineOpts`], install protocol fetchers,
/// extractors and build-system drivers as needed, then call [`Engine::run`].
/// The license and SBOM caches built during a run stay available afterwards
/// for external renderers.
pub struct Engine {
  opts: EngineOpts,
  registry: Registry,
  fetch_store: FetchStore,
  extract_store: ExtractStore,
  pkg_handlers: Vec<(PackageType, Rc<dyn PackageTypeHandler>)>,
  spdx: SpdxDb,
  license_cache: Option<LicenseCache>,
  sbom_cache: Option<SbomCache>,
}

impl Engine {
  pub fn new(mut opts: EngineOpts) -> Self {
    opts.finalize();
    let fetch_store = FetchStore::new(&opts);
    Engine {
      opts,
      registry: Registry::new(),
      fetch_store,
      extract_store: ExtractStore::new(),
      pkg_handlers: Vec::new(),
      spdx: SpdxDb::new(),
      license_cache: None,
      sbom_cache: None,
    }
  }

  pub fn opts(&self) -> &EngineOpts {
    &self.opts
  }

  /// The extension registry, for wiring up extensions before a run.
  pub fn registry_mut(&mut self) -> &mut Registry {
    &mut self.registry
  }

  /// Install the fetcher for a recognised VCS type (git, svn, ...).
  pub fn set_fetcher(&mut self, vcs: &VcsType, fetcher: Rc<dyn Fetcher>) {
    self.fetch_store.set_fetcher(vcs, fetcher);
  }

  /// Install the extractor for a recognised VCS type.
  pub fn set_extractor(&mut self, vcs: &VcsType, extractor: Rc<dyn Extractor>) {
    self.extract_store.set_extractor(vcs, extractor);
  }

  /// Install the build-system driver for a package type.
  pub fn set_package_handler(&mut self, pkg_type: PackageType, handler: Rc<dyn PackageTypeHandler>) {
    self.pkg_handlers.push((pkg_type, handler));
  }

  /// The license cache built by the last run, if one was built.
  pub fn license_cache(&self) -> Option<&LicenseCache> {
    self.license_cache.as_ref()
  }

  /// The SBOM cache built by the last run, if one was built.
  pub fn sbom_cache(&self) -> Option<&SbomCache> {
    self.sbom_cache.as_ref()
  }

  /// Execute the configured action.
  ///
  /// `Ok(true)` means the action completed; `Ok(false)` means a stage or
  /// prerequisite failed (already reported). Validation errors are returned
  /// to the caller for presentation.
  pub fn run(&mut self) -> Result<bool> {
    let started = Instant::now();

    // Sample-project initialisation belongs to the front-end.
    if matches!(self.opts.action, EngineAction::Global(GlobalAction::Init)) {
      info!("project initialisation is handled outside the engine");
      return Ok(true);
    }

    let config_path = self.find_config()?;

    self.process_mode_flags()?;

    if matches!(self.opts.action, EngineAction::Global(GlobalAction::State)) {
      self.dump_state();
      return Ok(true);
    }

    // Project configuration runs as a script; its settings are read back
    // from the resulting globals and its scalar globals become part of the
    // cumulative script environment every package script observes.
    let mut script_env = stage_env::base_env(&self.opts);
    script_env.extend(stage_env::action_env(&self.opts));

    let runtime = script_runtime(&self.opts, &config_path)?;
    runtime.apply_env(&script_env).map_err(|e| ConfigError::InvalidScript {
      path: config_path.clone(),
      source: e,
    })?;

    let before = global_names(&runtime);
    runtime.eval_file(&config_path).map_err(|e| ConfigError::InvalidScript {
      path: config_path.clone(),
      source: e,
    })?;

    let packages = self.extract_settings(&runtime)?;

    let overrides_path = self.opts.root_dir.join(consts::CONFIG_OVERRIDES_NAME);
    if overrides_path.is_file() {
      runtime
        .eval_file(&overrides_path)
        .map_err(|e| ConfigError::InvalidOverrideScript {
          path: overrides_path.clone(),
          source: e,
        })?;
      self.extract_override_settings(&runtime)?;
    }

    absorb_new_globals(&runtime, &before, &mut script_env);
    drop(runtime);

    self.spdx = SpdxDb::with_extras(&self.opts.extra_licenses, &self.opts.extra_license_exceptions);

    self.registry.emit(
      EVENT_CONFIG_LOADED,
      &EventPayload {
        pkg: None,
        script_env: &script_env,
      },
    );

    // Host tools installed by earlier packages must be callable by later
    // stages; project environment settings apply for the rest of the run.
    exec::register_path(&self.opts.host_dir);
    exec::register_path(&stage_env::prefix_join(&self.opts.host_dir, &self.opts.sysroot_prefix).join("bin"));
    let _project_env = ScopedEnv::apply(&self.opts.environment);

    let pkgs = self.load_packages(&packages, &mut script_env)?;

    if let EngineAction::Global(action) = &self.opts.action {
      match action {
        GlobalAction::Clean => {
          clean::clean(&self.opts)?;
          return Ok(true);
        }
        GlobalAction::Mrproper => {
          clean::mrproper(&self.opts)?;
          return Ok(true);
        }
        GlobalAction::Distclean => {
          clean::distclean(&self.opts)?;
          return Ok(true);
        }
        _ => {}
      }
    }

    if let EngineAction::Package { name, action } = &self.opts.action
      && matches!(action, PkgAction::Clean | PkgAction::Distclean | PkgAction::Fresh)
    {
      let pkg = pkgs.iter().find(|p| &p.name == name).expect("target was loaded");
      match action {
        PkgAction::Clean => clean::clean_pkg(&self.opts, pkg)?,
        PkgAction::Distclean => clean::distclean_pkg(&self.opts, pkg)?,
        PkgAction::Fresh => clean::fresh_pkg(&self.opts, pkg)?,
        _ => unreachable!(),
      }
      return Ok(true);
    }

    let sbom_only = matches!(self.opts.action, EngineAction::Global(GlobalAction::Sbom));
    if !sbom_only && !self.check_prerequisites() {
      return Ok(false);
    }

    if sbom_only {
      self.sbom_cache = Some(sbom::build_sbom_cache(&pkgs));
      info!(packages = pkgs.len(), "sbom cache built");
      return Ok(true);
    }

    // A package action processes the target and its dependency closure only.
    let work: Vec<&Pkg> = match &self.opts.action {
      EngineAction::Package { name, .. } => dependency_closure(&pkgs, name),
      _ => pkgs.iter().collect(),
    };

    let mut pipeline = Pipeline::new(&self.opts, &self.registry, &self.fetch_store, &self.extract_store);
    for (pkg_type, handler) in &self.pkg_handlers {
      pipeline.set_handler(pkg_type, handler.clone());
    }

    // The flag-initialisation pass runs to completion before any stage, so
    // a punch clears every package's flags up front.
    for pkg in &work {
      pipeline.init_flags(pkg)?;
    }

    let mut ok = true;

    if !self.opts.action.is_pre_configure() {
      match pipeline.preprocess_cargo(&pkgs, &script_env) {
        Ok(()) => {}
        Err(RelengError::Stage(e)) => {
          error!(error = %e, "stage failure");
          ok = false;
        }
        Err(e) => return Err(e),
      }
    }

    if ok {
      for pkg in &work {
        match pipeline.process(pkg, &script_env) {
          Ok(PipelineResult::Continue) => {}
          Ok(PipelineResult::Stop) => break,
          Err(RelengError::Stage(e)) => {
            error!(pkg = %pkg.name, error = %e, "stage failure");
            ok = false;
            break;
          }
          Err(e) => return Err(e),
        }
      }
    }

    if ok {
      match &self.opts.action {
        EngineAction::Full | EngineAction::Global(GlobalAction::Punch) => {
          self.sbom_cache = Some(sbom::build_sbom_cache(&pkgs));
          self.license_cache = Some(license::build_license_cache(&pkgs, &self.opts, &self.spdx)?);
          ok = self.run_post_build(&script_env)?;
        }
        EngineAction::Global(GlobalAction::Licenses) => {
          self.license_cache = Some(license::build_license_cache(&pkgs, &self.opts, &self.spdx)?);
        }
        EngineAction::Package {
          name,
          action: PkgAction::License,
        } => {
          let target: Vec<Pkg> = pkgs.iter().filter(|p| &p.name == name).cloned().collect();
          self.license_cache = Some(license::build_license_cache(&target, &self.opts, &self.spdx)?);
        }
        _ => {}
      }
    }

    info!(
      packages = work.len(),
      stages = pipeline.stages_run(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      success = ok,
      "run finished"
    );
    Ok(ok)
  }

  /// Locate the project configuration file, accepting legacy names with a
  /// deprecation warning.
  fn find_config(&self) -> Result<PathBuf> {
    let preferred = self.opts.root_dir.join(consts::CONFIG_NAME);
    if preferred.is_file() {
      return Ok(preferred);
    }

    for legacy in consts::CONFIG_NAMES_LEGACY {
      let candidate = self.opts.root_dir.join(legacy);
      if candidate.is_file() {
        let message = format!("configuration file '{legacy}' is deprecated; rename to '{}'", consts::CONFIG_NAME);
        if self.opts.werror {
          return Err(RelengError::WarningAsError(message));
        }
        warn!("{message}");
        return Ok(candidate);
      }
    }

    Err(ConfigError::MissingConfiguration(self.opts.root_dir.clone()).into())
  }

  /// Reconcile the requested run modes with their persisted flag files:
  /// an explicit mode persists, an absent one is restored from disk.
  fn process_mode_flags(&mut self) -> Result<()> {
    if let Some(devmode) = &self.opts.devmode {
      flags::write_devmode_flag(&self.opts.root_dir, devmode)?;
    } else if let Some(devmode) = flags::read_devmode_flag(&self.opts.root_dir)? {
      debug!(?devmode, "restored development mode from flag file");
      self.opts.devmode = Some(devmode);
    }

    if self.opts.local_srcs.is_empty() {
      let persisted = flags::read_local_srcs_flag(&self.opts.root_dir)?;
      if !persisted.is_empty() {
        debug!(entries = persisted.len(), "restored local-sources map from flag file");
        self.opts.local_srcs = persisted;
      }
    } else {
      flags::write_local_srcs_flag(&self.opts.root_dir, &self.opts.local_srcs)?;
    }

    Ok(())
  }

  fn dump_state(&self) {
    info!(root = %self.opts.root_dir.display(), "project root");
    info!(output = %self.opts.out_dir.display(), cache = %self.opts.cache_dir.display(), dl = %self.opts.dl_dir.display(), "directories");
    match &self.opts.devmode {
      Some(devmode) => info!(?devmode, "development mode active"),
      None => info!("development mode inactive"),
    }
    for (name, path) in &self.opts.local_srcs {
      info!(pkg = %name, path = %path.display(), "local sources");
    }
  }

  /// Read and validate project settings from the evaluated configuration.
  /// Returns the declared package list.
  fn extract_settings(&mut self, runtime: &ScriptRuntime) -> Result<Vec<String>> {
    let reader = ConfigReader { runtime };

    let packages = reader.strs("packages")?.unwrap_or_default();
    if packages.is_empty() {
      return Err(ConfigError::MissingPackages.into());
    }

    if let Some(value) = reader.strs("prerequisites")? {
      self.opts.prerequisites = value;
    }
    if let Some(value) = reader.strs("quirks")? {
      self.opts.quirks = value;
    }
    if let Some(value) = reader.dict("environment")? {
      self.opts.environment = value;
    }
    if let Some(value) = reader.strs("extensions")? {
      self.opts.extensions = value;
    }
    if let Some(value) = reader.strs("external_packages")? {
      self.opts.external_pkg_dirs = value.into_iter().map(PathBuf::from).collect();
    }
    if let Some(value) = reader.strs("extra_licenses")? {
      self.opts.extra_licenses = value;
    }
    if let Some(value) = reader.strs("extra_license_exceptions")? {
      self.opts.extra_license_exceptions = value;
    }
    if let Some(value) = reader.string("license_header")? {
      self.opts.license_header = Some(value);
    }
    // Front-end-provided overrides win over configuration entries.
    if let Some(value) = reader.dict("override_revisions")? {
      for (key, entry) in value {
        self.opts.override_revisions.entry(key).or_insert(entry);
      }
    }
    if let Some(value) = reader.dict("override_sites")? {
      for (key, entry) in value {
        self.opts.override_sites.entry(key).or_insert(entry);
      }
    }
    if let Some(value) = reader.dict("override_extract_tools")? {
      for (ext, command) in value {
        self
          .opts
          .extract_override
          .entry(ext)
          .or_insert_with(|| command.split_whitespace().map(str::to_string).collect());
      }
    }
    if let Some(value) = reader.strs("sbom_format")? {
      self.opts.sbom_format = value;
    }
    if let Some(value) = reader.string("sysroot_prefix")? {
      self.opts.sysroot_prefix = value;
    }
    if let Some(value) = reader.string("url_mirror")? {
      self.opts.url_mirror = Some(value);
    }
    if let Some(value) = reader.bool("only_mirror")? {
      self.opts.only_mirror = value;
    }
    if let Some(value) = reader.dict("cache_ext")? {
      self.opts.cache_ext = value;
    }
    if let Some(value) = reader.bool("default_internal")? {
      self.opts.default_internal = value;
    }
    if let Some(value) = reader.bool("default_devmode_ignore_cache")? {
      self.opts.default_devmode_ignore_cache = value;
    }

    // Accepted for compatibility; consumed by front-end collaborators.
    reader.any("urlopen_context")?;
    if reader.any("vsdevcmd")?.is_some() || reader.any("vsdevcmd_products")?.is_some() {
      debug!("vsdevcmd settings are handled by a platform package driver");
    }

    Ok(packages)
  }

  /// Re-read the override maps after the overrides script ran; its entries
  /// replace earlier values.
  fn extract_override_settings(&mut self, runtime: &ScriptRuntime) -> Result<()> {
    let reader = ConfigReader { runtime };
    if let Some(value) = reader.dict("override_revisions")? {
      self.opts.override_revisions.extend(value);
    }
    if let Some(value) = reader.dict("override_sites")? {
      self.opts.override_sites.extend(value);
    }
    Ok(())
  }

  fn load_packages(&mut self, names: &[String], script_env: &mut ScriptEnv) -> Result<Vec<Pkg>> {
    let mut names: Vec<String> = names.to_vec();
    if let EngineAction::Package { name, .. } = &self.opts.action
      && !names.contains(name)
    {
      names.push(name.clone());
    }

    let mut dvcsdb = DvcsDb::load(&self.opts.cache_dir);
    let pkgs = {
      let mut loader = PkgLoader::new(&self.opts, &self.registry, &mut dvcsdb);
      loader.load_all(&names, script_env)?
    };
    dvcsdb.save()?;

    debug!(count = pkgs.len(), "packages loaded");
    Ok(pkgs)
  }

  /// Check that every declared prerequisite host tool is on the search
  /// path. Skipped entirely under the disabling quirk.
  fn check_prerequisites(&self) -> bool {
    if self.opts.has_quirk(consts::QUIRK_NO_PREREQUISITES) {
      return true;
    }

    let mut ok = true;
    for tool in &self.opts.prerequisites {
      if exec::find_on_path(tool).is_none() {
        error!(tool = %tool, "prerequisite host tool not found");
        ok = false;
      }
    }
    ok
  }

  /// Run the project post-build script, if present, between its lifecycle
  /// events. A script failure fails the run without raising.
  fn run_post_build(&self, script_env: &ScriptEnv) -> Result<bool> {
    let path = self.opts.root_dir.join(consts::POST_BUILD_NAME);
    if !path.is_file() {
      return Ok(true);
    }

    let payload = EventPayload {
      pkg: None,
      script_env,
    };
    self.registry.emit(EVENT_POST_BUILD_STARTED, &payload);

    info!(script = %path.display(), "running post-build script");
    let result = ScriptRuntime::new(Some(&self.opts.root_dir))
      .and_then(|rt| rt.apply_env(script_env).map(|()| rt))
      .and_then(|rt| rt.eval_file(&path));

    match result {
      Ok(()) => {
        self.registry.emit(EVENT_POST_BUILD_FINISHED, &payload);
        Ok(true)
      }
      Err(e) => {
        error!(error = %e, "post-build script failed");
        Ok(false)
      }
    }
  }
}

fn script_runtime(opts: &EngineOpts, path: &Path) -> Result<ScriptRuntime> {
  ScriptRuntime::new(Some(&opts.root_dir)).map_err(|e| {
    ConfigError::InvalidScript {
      path: path.to_path_buf(),
      source: e,
    }
    .into()
  })
}

/// The target package plus every package it transitively depends on, in the
/// original (sorted) order.
fn dependency_closure<'p>(pkgs: &'p [Pkg], target: &str) -> Vec<&'p Pkg> {
  let by_name: BTreeMap<&str, &Pkg> = pkgs.iter().map(|p| (p.name.as_str(), p)).collect();

  let mut wanted: BTreeSet<&str> = BTreeSet::new();
  let mut stack = vec![target];
  while let Some(name) = stack.pop() {
    if !wanted.insert(name) {
      continue;
    }
    if let Some(pkg) = by_name.get(name) {
      for dep in &pkg.deps {
        stack.push(dep);
      }
    }
  }

  pkgs.iter().filter(|p| wanted.contains(p.name.as_str())).collect()
}

/// Typed reader over evaluated project configuration globals.
struct ConfigReader<'a> {
  runtime: &'a ScriptRuntime,
}

impl ConfigReader<'_> {
  fn raw(&self, key: &str) -> Result<LuaValue> {
    self.runtime.get(key).map_err(|_| {
      ConfigError::InvalidSettings {
        key: key.to_string(),
        expected: "a readable value",
      }
      .into()
    })
  }

  fn invalid(&self, key: &str, expected: &'static str) -> RelengError {
    ConfigError::InvalidSettings {
      key: key.to_string(),
      expected,
    }
    .into()
  }

  fn any(&self, key: &str) -> Result<Option<LuaValue>> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      value => Ok(Some(value)),
    }
  }

  fn string(&self, key: &str) -> Result<Option<String>> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::String(s) => Ok(Some(s.to_string_lossy().to_string())),
      _ => Err(self.invalid(key, "a string")),
    }
  }

  fn bool(&self, key: &str) -> Result<Option<bool>> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Boolean(v) => Ok(Some(v)),
      _ => Err(self.invalid(key, "a boolean")),
    }
  }

  fn strs(&self, key: &str) -> Result<Option<Vec<String>>> {
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

  fn dict(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
    match self.raw(key)? {
      LuaValue::Nil => Ok(None),
      LuaValue::Table(table) => {
        let mut map = BTreeMap::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
          let (k, v) = pair.map_err(|_| self.invalid(key, "a string-to-string map"))?;
          match (k, v) {
            (LuaValue::String(k), LuaValue::String(v)) => {
              map.insert(k.to_string_lossy().to_string(), v.to_string_lossy().to_string());
            }
            _ => return Err(self.invalid(key, "a string-to-string map")),
          }
        }
        Ok(Some(map))
      }
      _ => Err(self.invalid(key, "a string-to-string map")),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use serial_test::serial;

  use super::*;
  use crate::errors::PkgError;
  use crate::stage::Stage;

  struct Project {
    _tmp: tempfile::TempDir,
    root: PathBuf,
  }

  impl Project {
    fn new(config: &str) -> Self {
      let tmp = tempfile::tempdir().unwrap();
      let root = tmp.path().to_path_buf();
      fs::write(root.join(consts::CONFIG_NAME), config).unwrap();
      Project { _tmp: tmp, root }
    }

    fn add_pkg(&self, name: &str, content: &str) {
      let dir = self.root.join(consts::PKG_DIR).join(name);
      fs::create_dir_all(&dir).unwrap();
      fs::write(dir.join(format!("{name}.rt")), content).unwrap();
    }

    fn add_stage_script(&self, name: &str, stage: &str, content: &str) {
      let dir = self.root.join(consts::PKG_DIR).join(name);
      fs::create_dir_all(&dir).unwrap();
      fs::write(dir.join(format!("{name}-{stage}.rt")), content).unwrap();
    }

    fn engine(&self) -> Engine {
      Engine::new(EngineOpts::new(&self.root))
    }

    fn engine_with(&self, adjust: impl FnOnce(&mut EngineOpts)) -> Engine {
      let mut opts = EngineOpts::new(&self.root);
      adjust(&mut opts);
      Engine::new(opts)
    }
  }

  fn stage_flags(engine: &Engine, nv: &str) -> Vec<Stage> {
    let out_dir = engine.opts().build_dir.join(nv);
    let mut present = Vec::new();
    for stage in Stage::ALL {
      let flag = match stage {
        Stage::Fetch => engine
          .opts()
          .build_dir
          .join(consts::STATE_DIR)
          .join(format!("{}fetch-{nv}", consts::STAGE_FLAG_PREFIX)),
        _ => out_dir.join(format!("{}{}", consts::STAGE_FLAG_PREFIX, stage.name())),
      };
      if flag.exists() {
        present.push(stage);
      }
    }
    present
  }

  #[test]
  #[serial]
  fn missing_configuration_is_a_typed_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(EngineOpts::new(tmp.path()));
    let err = engine.run().unwrap_err();
    assert!(matches!(err, RelengError::Config(ConfigError::MissingConfiguration(_))));
  }

  #[test]
  #[serial]
  fn empty_package_list_fails() {
    let project = Project::new("packages = {}\n");
    let err = project.engine().run().unwrap_err();
    assert!(matches!(err, RelengError::Config(ConfigError::MissingPackages)));
  }

  #[test]
  #[serial]
  fn mistyped_setting_fails() {
    let project = Project::new("packages = 'demo'\nsysroot_prefix = 42\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    let err = project.engine().run().unwrap_err();
    assert!(matches!(
      err,
      RelengError::Config(ConfigError::InvalidSettings { key, .. }) if key == "sysroot_prefix"
    ));
  }

  #[test]
  #[serial]
  fn unknown_package_propagates_loader_error() {
    let project = Project::new("packages = {'ghost'}\n");
    let err = project.engine().run().unwrap_err();
    assert!(matches!(err, RelengError::Pkg(PkgError::MissingPackageScript { .. })));
  }

  #[test]
  #[serial]
  fn full_run_flags_every_stage_and_reruns_nothing() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    project.add_stage_script(
      "demo",
      "build",
      "local f = io.open(releng.join(PKG_BUILD_DIR, 'count'), 'a')\nf:write('x')\nf:close()\n",
    );

    let mut engine = project.engine();
    assert!(engine.run().unwrap());
    assert_eq!(stage_flags(&engine, "demo").len(), Stage::ALL.len());

    // Second run with unchanged inputs performs zero stage executions.
    let mut engine = project.engine();
    assert!(engine.run().unwrap());
    let count = fs::read_to_string(engine.opts().build_dir.join("demo").join("count")).unwrap();
    assert_eq!(count, "x");
  }

  #[test]
  #[serial]
  fn punch_reruns_every_stage() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    project.add_stage_script(
      "demo",
      "build",
      "local f = io.open(releng.join(PKG_BUILD_DIR, 'count'), 'a')\nf:write('x')\nf:close()\n",
    );

    assert!(project.engine().run().unwrap());

    let mut engine = project.engine_with(|opts| {
      opts.action = EngineAction::Global(GlobalAction::Punch);
    });
    assert!(engine.run().unwrap());

    let count = fs::read_to_string(engine.opts().build_dir.join("demo").join("count")).unwrap();
    assert_eq!(count, "xx");
  }

  #[test]
  #[serial]
  fn dependencies_install_before_dependents_configure() {
    // b's configure script proves a's install ran first.
    let project = Project::new("packages = {'b'}\n");
    project.add_pkg("a", "A_VCS_TYPE = 'none'\n");
    project.add_stage_script("a", "install", "releng.touch(releng.join(STAGING_DIR, 'a-installed'))\n");
    project.add_pkg("b", "B_VCS_TYPE = 'none'\nB_NEEDS = {'a'}\n");
    project.add_stage_script(
      "b",
      "configure",
      "assert(releng.exists(releng.join(STAGING_DIR, 'a-installed')))\n",
    );

    assert!(project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn package_build_action_stops_after_build() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");

    let mut engine = project.engine_with(|opts| {
      opts.action = EngineAction::Package {
        name: "demo".to_string(),
        action: PkgAction::Build,
      };
    });
    assert!(engine.run().unwrap());

    let present = stage_flags(&engine, "demo");
    assert!(present.contains(&Stage::Build));
    assert!(!present.contains(&Stage::Install));
  }

  #[test]
  #[serial]
  fn stage_failure_returns_false_not_err() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    project.add_stage_script("demo", "build", "error('broken build')\n");

    assert!(!project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn clean_action_removes_output_trees() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");

    let mut engine = project.engine();
    assert!(engine.run().unwrap());
    assert!(engine.opts().build_dir.exists());

    let mut engine = project.engine_with(|opts| {
      opts.action = EngineAction::Global(GlobalAction::Clean);
    });
    assert!(engine.run().unwrap());
    assert!(!engine.opts().build_dir.exists());
  }

  #[test]
  #[serial]
  fn sbom_action_builds_cache_without_processing() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VERSION = '1.0'\nDEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'MIT'}\n");

    let mut engine = project.engine_with(|opts| {
      opts.action = EngineAction::Global(GlobalAction::Sbom);
    });
    assert!(engine.run().unwrap());

    let cache = engine.sbom_cache().unwrap();
    assert_eq!(cache.entries.len(), 1);
    assert_eq!(cache.entries[0].licenses, vec!["MIT"]);
    assert!(stage_flags(&engine, "demo-1.0").is_empty());
  }

  #[test]
  #[serial]
  fn full_run_builds_license_cache() {
    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'MIT'}\n",
    );

    let mut engine = project.engine();
    assert!(engine.run().unwrap());
    assert!(engine.license_cache().unwrap().contains_key("demo"));
  }

  #[test]
  #[serial]
  fn post_build_script_runs_between_events() {
    use std::cell::RefCell;

    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    fs::write(
      project.root.join(consts::POST_BUILD_NAME),
      "releng.touch(releng.join(OUTPUT_DIR, 'post-build-ran'))\n",
    )
    .unwrap();

    let mut engine = project.engine();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    for (event, tag) in [
      (EVENT_POST_BUILD_STARTED, "started"),
      (EVENT_POST_BUILD_FINISHED, "finished"),
    ] {
      let log = order.clone();
      engine.registry_mut().subscribe(event, 0, Box::new(move |_| log.borrow_mut().push(tag)));
    }

    assert!(engine.run().unwrap());
    assert!(engine.opts().out_dir.join("post-build-ran").is_file());
    assert_eq!(*order.borrow(), vec!["started", "finished"]);
  }

  #[test]
  #[serial]
  fn missing_prerequisite_fails_the_run() {
    let project = Project::new("packages = {'demo'}\nprerequisites = {'releng-no-such-tool'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    assert!(!project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn prerequisite_quirk_disables_the_check() {
    let project = Project::new(
      "packages = {'demo'}\nprerequisites = {'releng-no-such-tool'}\nquirks = {'releng.disable_prerequisites_check'}\n",
    );
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    assert!(project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn devmode_is_persisted_and_restored() {
    use crate::opts::Devmode;

    let project = Project::new("packages = {'demo'}\n");
    project.add_pkg(
      "demo",
      "DEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = {dev = 'main', ['*'] = 'v1.0'}\n",
    );
    // No git fetcher is installed; fresh returns before any fetch.
    let action = EngineAction::Package {
      name: "demo".to_string(),
      action: PkgAction::Fresh,
    };

    let mut engine = project.engine_with(|opts| {
      opts.devmode = Some(Devmode::Named("dev".to_string()));
      opts.action = action.clone();
    });
    assert!(engine.run().unwrap());

    // A later run without an explicit mode restores it from the flag file.
    assert_eq!(
      flags::read_devmode_flag(&project.root).unwrap(),
      Some(Devmode::Named("dev".to_string()))
    );
    let mut engine = project.engine_with(|opts| opts.action = action.clone());
    assert!(engine.run().unwrap());
    assert!(engine.opts().in_devmode());
  }

  #[test]
  #[serial]
  fn project_environment_applies_to_stage_scripts() {
    let project = Project::new("packages = {'demo'}\nenvironment = {DEMO_FLAVOUR = 'salted'}\n");
    project.add_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    project.add_stage_script(
      "demo",
      "build",
      "assert(os.getenv('DEMO_FLAVOUR') == 'salted')\n",
    );

    assert!(project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn config_globals_reach_package_scripts() {
    let project = Project::new("packages = {'demo'}\nPROJECT_CODENAME = 'osprey'\n");
    project.add_pkg("demo", "assert(PROJECT_CODENAME == 'osprey')\nDEMO_VCS_TYPE = 'none'\n");
    assert!(project.engine().run().unwrap());
  }

  #[test]
  #[serial]
  fn legacy_config_name_is_accepted_with_warning() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("releng"), "packages = {'demo'}\n").unwrap();
    let dir = tmp.path().join(consts::PKG_DIR).join("demo");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("demo.rt"), "DEMO_VCS_TYPE = 'none'\n").unwrap();

    let mut engine = Engine::new(EngineOpts::new(tmp.path()));
    assert!(engine.run().unwrap());

    // Under werror the deprecation escalates.
    let mut opts = EngineOpts::new(tmp.path());
    opts.werror = true;
    let mut engine = Engine::new(opts);
    assert!(matches!(engine.run().unwrap_err(), RelengError::WarningAsError(_)));
  }

  #[test]
  fn dependency_closure_filters_and_keeps_order() {
    let project = Project::new("packages = {'app', 'tool'}\n");
    project.add_pkg("lib", "LIB_VCS_TYPE = 'none'\n");
    project.add_pkg("app", "APP_VCS_TYPE = 'none'\nAPP_NEEDS = {'lib'}\n");
    project.add_pkg("tool", "TOOL_VCS_TYPE = 'none'\n");

    let mut engine = project.engine();
    let mut env = ScriptEnv::new();
    let pkgs = engine
      .load_packages(&["app".to_string(), "tool".to_string()], &mut env)
      .unwrap();

    let work = dependency_closure(&pkgs, "app");
    let names: Vec<_> = work.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["lib", "app"]);
  }
}
