//! The per-package stage pipeline.
//!
//! Drives the fetch → extract → patch → license → bootstrap → configure →
//! build → install → post sequence for one package at a time. Each stage is
//! gated by its completion flag: present means skip, absent means run and
//! flag on success. The run action decides where the sequence stops and
//! whether processing continues with the next package.
//!
//! Normal progression uses tagged results ([`PipelineResult`]); stage
//! failures surface as [`StageError`] values the driver maps to an
//! unsuccessful run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, info};

use crate::errors::{RelengError, StageError};
use crate::exec::{self, RunOpts};
use crate::extract::ExtractStore;
use crate::fetch::FetchStore;
use crate::flags;
use crate::license;
use crate::lua::ScriptRuntime;
use crate::opts::{EngineAction, EngineOpts, GlobalAction, PkgAction};
use crate::patch;
use crate::pkg::{PackageType, Pkg};
use crate::registry::{EventPayload, Registry, stage_event};
use crate::script_env::{ScriptEnv, to_process_env};
use crate::stage::Stage;
use crate::stage_env::{ScopedEnv, stage_env};

/// Outcome of processing one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineResult {
  /// Move on to the next package.
  Continue,
  /// The run action is satisfied; end the run.
  Stop,
}

/// Inputs handed to a package-type handler for one stage invocation.
///
/// The composed stage environment is already installed in the process
/// environment when a handler runs; `script_env` carries the same values for
/// handlers that evaluate scripts.
pub struct BuildContext<'a> {
  pub pkg: &'a Pkg,
  pub opts: &'a EngineOpts,
  pub stage: Stage,
  pub script_env: &'a ScriptEnv,
  /// Dependency path overrides collected by the cargo pre-pass, keyed by
  /// crate name.
  pub cargo_paths: &'a BTreeMap<String, PathBuf>,
}

/// Build-system driver contract.
///
/// Concrete drivers (autotools, cmake, meson, ...) plug in per package type;
/// the built-in [`ScriptHandler`] covers free-form stage scripts. A handler
/// is invoked once per bootstrap/configure/build/install/post stage.
pub trait PackageTypeHandler {
  fn run_stage(&self, ctx: &BuildContext<'_>) -> Result<(), StageError>;
}

/// The `script` package type: per-stage Lua scripts in the package
/// definition directory (`<name>-configure.rt`, ...). A missing script means
/// the stage has nothing to do.
pub struct ScriptHandler;

impl PackageTypeHandler for ScriptHandler {
  fn run_stage(&self, ctx: &BuildContext<'_>) -> Result<(), StageError> {
    let script = ctx
      .pkg
      .def_dir
      .join(format!("{}-{}.{}", ctx.pkg.name, ctx.stage.name(), crate::consts::DEF_EXT));
    if !script.is_file() {
      debug!(pkg = %ctx.pkg.name, stage = %ctx.stage, "no stage script");
      return Ok(());
    }

    let runtime = ScriptRuntime::new(Some(&ctx.opts.root_dir))
      .and_then(|rt| rt.apply_env(ctx.script_env).map(|()| rt))
      .map_err(|e| StageError::failed(ctx.stage, &ctx.pkg.name, e))?;
    runtime
      .eval_file(&script)
      .map_err(|e| StageError::failed(ctx.stage, &ctx.pkg.name, e))?;
    Ok(())
  }
}

/// Drives the stage sequence for packages in dependency order.
pub struct Pipeline<'a> {
  opts: &'a EngineOpts,
  registry: &'a Registry,
  fetch: &'a FetchStore,
  extract: &'a ExtractStore,
  handlers: BTreeMap<String, Rc<dyn PackageTypeHandler>>,
  cargo_paths: BTreeMap<String, PathBuf>,
  stages_run: usize,
}

impl<'a> Pipeline<'a> {
  /// Create a pipeline with the built-in script handler installed.
  pub fn new(opts: &'a EngineOpts, registry: &'a Registry, fetch: &'a FetchStore, extract: &'a ExtractStore) -> Self {
    let mut handlers: BTreeMap<String, Rc<dyn PackageTypeHandler>> = BTreeMap::new();
    handlers.insert(PackageType::Script.name().to_string(), Rc::new(ScriptHandler));
    Pipeline {
      opts,
      registry,
      fetch,
      extract,
      handlers,
      cargo_paths: BTreeMap::new(),
      stages_run: 0,
    }
  }

  /// Install (or replace) the driver for a package type. This is how
  /// build-system drivers plug in.
  pub fn set_handler(&mut self, pkg_type: &PackageType, handler: Rc<dyn PackageTypeHandler>) {
    self.handlers.insert(pkg_type.name().to_string(), handler);
  }

  /// How many stages actually executed (skipped stages excluded).
  pub fn stages_run(&self) -> usize {
    self.stages_run
  }

  /// Prepare a package's stage flags for the run: punch clears everything,
  /// re-run actions clear their invalidated stages on the target, and
  /// `force` clears the action's stop stage.
  pub fn init_flags(&self, pkg: &Pkg) -> Result<(), RelengError> {
    match &self.opts.action {
      EngineAction::Global(GlobalAction::Punch) => {
        flags::clear_pkg_flags(self.opts, pkg)?;
      }
      EngineAction::Global(action) => {
        if self.opts.force
          && let Some(stop) = action.stop_stage()
        {
          flags::clear_flag(&flags::stage_flag_path(self.opts, pkg, stop))?;
        }
      }
      EngineAction::Package { name, action } if name == &pkg.name => {
        for stage in action.invalidates() {
          flags::clear_flag(&flags::stage_flag_path(self.opts, pkg, *stage))?;
        }
        if self.opts.force
          && let Some(stop) = action.stop_stage()
        {
          flags::clear_flag(&flags::stage_flag_path(self.opts, pkg, stop))?;
        }
      }
      _ => {}
    }
    Ok(())
  }

  /// Run cargo packages through their patch stage and collect the
  /// dependency path-override map their configure stages consume.
  pub fn preprocess_cargo(&mut self, pkgs: &[Pkg], script_env: &ScriptEnv) -> Result<(), RelengError> {
    let cargo: Vec<&Pkg> = pkgs.iter().filter(|p| p.pkg_type == PackageType::Cargo).collect();
    if cargo.is_empty() {
      return Ok(());
    }

    info!(count = cargo.len(), "preparing cargo package sources");
    for pkg in &cargo {
      for stage in [Stage::Fetch, Stage::Extract, Stage::Patch] {
        self.run_gated(pkg, stage, script_env)?;
      }
    }

    for pkg in cargo {
      let crate_name = pkg.cargo_name.clone().unwrap_or_else(|| pkg.name.clone());
      self.cargo_paths.insert(crate_name, pkg.source_tree());
    }
    Ok(())
  }

  /// Process one package through its stage sequence.
  pub fn process(&mut self, pkg: &Pkg, script_env: &ScriptEnv) -> Result<PipelineResult, RelengError> {
    let (last, outcome) = self.plan(pkg);
    let exec_target = self.is_target(pkg) && matches!(&self.opts.action, EngineAction::Package { action: PkgAction::Exec, .. });

    debug!(pkg = %pkg.name, last = %last, "processing package");

    for stage in Stage::ALL {
      // Exec replaces everything after patch with the user command.
      if exec_target && stage == Stage::License {
        self.run_exec(pkg, script_env)?;
        return Ok(PipelineResult::Stop);
      }

      self.run_gated(pkg, stage, script_env)?;

      if stage == last {
        break;
      }
    }

    Ok(outcome)
  }

  /// The last stage to run for a package and the result to report when it
  /// completes. A restricted global action stops every package at the same
  /// stage; a package action stops the run once its target is done, while
  /// the target's dependencies run through install.
  fn plan(&self, pkg: &Pkg) -> (Stage, PipelineResult) {
    match &self.opts.action {
      EngineAction::Full => (Stage::Post, PipelineResult::Continue),
      EngineAction::Global(action) => (action.stop_stage().unwrap_or(Stage::Post), PipelineResult::Continue),
      EngineAction::Package { name, action } => {
        if name == &pkg.name {
          (action.stop_stage().unwrap_or(Stage::Post), PipelineResult::Stop)
        } else {
          (Stage::Install, PipelineResult::Continue)
        }
      }
    }
  }

  fn is_target(&self, pkg: &Pkg) -> bool {
    matches!(&self.opts.action, EngineAction::Package { name, .. } if name == &pkg.name)
  }

  /// Run one stage unless its completion flag is present.
  fn run_gated(&mut self, pkg: &Pkg, stage: Stage, script_env: &ScriptEnv) -> Result<(), RelengError> {
    // Developer-provided sources: nothing to acquire, populate or patch.
    if pkg.local_srcs && matches!(stage, Stage::Fetch | Stage::Extract | Stage::Patch) {
      debug!(pkg = %pkg.name, stage = %stage, "local sources; skipping");
      return Ok(());
    }

    let flag = flags::stage_flag_path(self.opts, pkg, stage);
    if flag.exists() && !(stage == Stage::Fetch && self.refetch(pkg)) {
      debug!(pkg = %pkg.name, stage = %stage, "stage already complete");
      return Ok(());
    }

    self.run_stage(pkg, stage, script_env)?;
    self.stages_run += 1;

    flags::set_flag(&flag).map_err(|e| StageError::FlagWrite {
      stage,
      pkg: pkg.name.clone(),
      source: e,
    })?;
    Ok(())
  }

  /// Whether a completed fetch must run again anyway: an explicit fetch
  /// action, or devmode ignoring cached state for this package.
  fn refetch(&self, pkg: &Pkg) -> bool {
    let explicit = match &self.opts.action {
      EngineAction::Global(GlobalAction::Fetch | GlobalAction::FetchFull) => true,
      EngineAction::Package { name, action } => {
        name == &pkg.name && matches!(action, PkgAction::Fetch | PkgAction::FetchFull)
      }
      _ => false,
    };
    explicit || (self.opts.in_devmode() && pkg.devmode_ignore_cache)
  }

  fn run_stage(&mut self, pkg: &Pkg, stage: Stage, script_env: &ScriptEnv) -> Result<(), RelengError> {
    match stage {
      Stage::Fetch => {
        self
          .fetch
          .fetch(pkg, self.opts, self.registry)
          .map_err(|e| StageError::failed(stage, &pkg.name, e))?;

        if self.fetch_full(pkg) {
          self
            .fetch
            .fetch_post(pkg, self.opts, self.registry)
            .map_err(|e| StageError::FetchPost {
              pkg: pkg.name.clone(),
              message: e.to_string(),
            })?;
          flags::set_flag(&flags::fetch_post_flag_path(self.opts, pkg)).map_err(|e| StageError::FlagWrite {
            stage,
            pkg: pkg.name.clone(),
            source: e,
          })?;
        }
        Ok(())
      }
      Stage::Extract => self
        .extract
        .extract(pkg, self.opts, self.registry)
        .map_err(|e| StageError::failed(stage, &pkg.name, e).into()),
      Stage::Patch => patch::apply_pkg_patches(pkg)
        .map(|_| ())
        .map_err(|e| StageError::failed(stage, &pkg.name, e).into()),
      Stage::License => license::install_pkg_licenses(pkg, self.opts)
        .map(|_| ())
        .map_err(|e| StageError::failed(stage, &pkg.name, e).into()),
      Stage::Bootstrap | Stage::Configure | Stage::Build | Stage::Install | Stage::Post => {
        self.run_handler_stage(pkg, stage, script_env)
      }
    }
  }

  fn fetch_full(&self, pkg: &Pkg) -> bool {
    match &self.opts.action {
      EngineAction::Global(GlobalAction::FetchFull) => true,
      EngineAction::Package { name, action } => name == &pkg.name && matches!(action, PkgAction::FetchFull),
      _ => false,
    }
  }

  /// Run a build-system stage through the package's type handler, with the
  /// composed stage environment installed for its duration.
  fn run_handler_stage(&mut self, pkg: &Pkg, stage: Stage, script_env: &ScriptEnv) -> Result<(), RelengError> {
    let handler = match &pkg.pkg_type {
      PackageType::Ext(name) => self
        .registry
        .package_type(name)
        .ok_or_else(|| StageError::failed(stage, &pkg.name, format!("no handler for package type '{name}'")))?,
      other => self
        .handlers
        .get(other.name())
        .cloned()
        .ok_or_else(|| StageError::failed(stage, &pkg.name, format!("no driver installed for package type '{}'", other.name())))?,
    };

    let full_env = self.composed_env(pkg, stage, script_env);
    let process_env = self.composed_process_env(pkg, stage, &full_env);

    info!(pkg = %pkg.name, stage = %stage, "running stage");
    let _guard = ScopedEnv::apply(&process_env);

    self.emit_stage_event(pkg, stage, &full_env, false);

    let ctx = BuildContext {
      pkg,
      opts: self.opts,
      stage,
      script_env: &full_env,
      cargo_paths: &self.cargo_paths,
    };
    handler.run_stage(&ctx)?;

    self.emit_stage_event(pkg, stage, &full_env, true);
    Ok(())
  }

  /// The cumulative script environment extended with the package's stage
  /// variables.
  fn composed_env(&self, pkg: &Pkg, _stage: Stage, script_env: &ScriptEnv) -> ScriptEnv {
    let mut env = script_env.clone();
    env.extend(stage_env(pkg, self.opts));
    env
  }

  /// Process-environment rendering of the stage environment, layered with
  /// the package-wide and stage-specific environment maps.
  fn composed_process_env(&self, pkg: &Pkg, stage: Stage, full_env: &ScriptEnv) -> BTreeMap<String, String> {
    let mut process_env = to_process_env(full_env);

    let stage_specific = match stage {
      Stage::Configure => Some(&pkg.conf_env),
      Stage::Build => Some(&pkg.build_env),
      Stage::Install => Some(&pkg.install_env),
      _ => None,
    };
    for map in [Some(&pkg.env), stage_specific].into_iter().flatten() {
      for (key, value) in map {
        if let Some(value) = value {
          process_env.insert(key.clone(), value.clone());
        } else {
          process_env.remove(key);
        }
      }
    }
    process_env
  }

  fn emit_stage_event(&self, pkg: &Pkg, stage: Stage, script_env: &ScriptEnv, finished: bool) {
    if let Some(event) = stage_event(stage, finished) {
      self.registry.emit(
        &event,
        &EventPayload {
          pkg: Some(&pkg.name),
          script_env,
        },
      );
    }
  }

  /// Run the user-supplied exec command in the package's build tree.
  fn run_exec(&mut self, pkg: &Pkg, script_env: &ScriptEnv) -> Result<(), RelengError> {
    let command = self
      .opts
      .exec_command
      .clone()
      .ok_or_else(|| StageError::MissingExecCommand(pkg.name.clone()))?;

    let full_env = self.composed_env(pkg, Stage::Build, script_env);
    let process_env = self.composed_process_env(pkg, Stage::Build, &full_env);

    info!(pkg = %pkg.name, cmd = %command.join(" "), "running exec command");
    let _guard = ScopedEnv::apply(&process_env);
    exec::run(
      &command,
      &RunOpts {
        cwd: Some(&pkg.build_tree()),
        ..RunOpts::default()
      },
    )
    .map_err(|e| StageError::ExecFailed {
      pkg: pkg.name.clone(),
      message: e.to_string(),
    })?;
    Ok(())
  }
}
