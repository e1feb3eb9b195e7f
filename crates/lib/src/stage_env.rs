//! Per-stage environment composition and scoped restoration.
//!
//! Two scopes compose for every stage invocation: the package-wide variables
//! (`PKG_*`) and the late-stage install-tree variables (`PREFIX`,
//! `PREFIXED_*`, per-tree bin/include/lib/share paths, job counts). The same
//! values are installed both into the process environment (for external
//! tools) and into the script globals (for stage scripts).
//!
//! Process-environment mutation happens only through [`ScopedEnv`], which
//! snapshots every variable it touches and restores the snapshot on drop,
//! on every exit path. The engine is single-threaded; this is the invariant
//! that makes the `std::env` mutation below sound.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::consts;
use crate::opts::{EngineAction, EngineOpts, GlobalAction, PkgAction};
use crate::pkg::Pkg;
use crate::script_env::{ScriptEnv, ScriptValue};

/// Scoped process-environment guard.
///
/// Applies a set of variables and restores the prior state (value or unset)
/// when dropped.
pub struct ScopedEnv {
  saved: Vec<(String, Option<OsString>)>,
}

impl ScopedEnv {
  /// Snapshot and set the given variables.
  pub fn apply(vars: &BTreeMap<String, String>) -> Self {
    let mut saved = Vec::with_capacity(vars.len());
    for (key, value) in vars {
      saved.push((key.clone(), env::var_os(key)));
      unsafe { env::set_var(key, value) };
    }
    ScopedEnv { saved }
  }
}

impl Drop for ScopedEnv {
  fn drop(&mut self) {
    for (key, old) in self.saved.drain(..).rev() {
      match old {
        Some(value) => unsafe { env::set_var(&key, value) },
        None => unsafe { env::remove_var(&key) },
      }
    }
  }
}

/// Project-level variables every script sees.
pub fn base_env(opts: &EngineOpts) -> ScriptEnv {
  let mut env = ScriptEnv::new();
  env.insert("RELENG_VERSION".into(), consts::ENGINE_VERSION.into());
  env.insert("ROOT_DIR".into(), opts.root_dir.clone().into());
  env.insert("OUTPUT_DIR".into(), opts.out_dir.clone().into());
  env.insert("BUILD_DIR".into(), opts.build_dir.clone().into());
  env.insert("CACHE_DIR".into(), opts.cache_dir.clone().into());
  env.insert("DL_DIR".into(), opts.dl_dir.clone().into());
  env.insert("HOST_DIR".into(), opts.host_dir.clone().into());
  env.insert("IMAGES_DIR".into(), opts.images_dir.clone().into());
  env.insert("LICENSE_DIR".into(), opts.license_dir.clone().into());
  env.insert("STAGING_DIR".into(), opts.staging_dir.clone().into());
  env.insert("SYMBOLS_DIR".into(), opts.symbols_dir.clone().into());
  env.insert("TARGET_DIR".into(), opts.target_dir.clone().into());
  env
}

/// Package-wide variables (scope 1 of the stage environment).
pub fn pkg_env(pkg: &Pkg) -> ScriptEnv {
  let mut env = ScriptEnv::new();
  env.insert("PKG_NAME".into(), pkg.name.clone().into());
  env.insert("PKG_VERSION".into(), pkg.version.clone().into());
  env.insert("PKG_REVISION".into(), pkg.revision.clone().into());
  if let Some(site) = &pkg.site {
    env.insert("PKG_SITE".into(), site.clone().into());
  }
  env.insert("PKG_DEFDIR".into(), pkg.def_dir.clone().into());
  env.insert("PKG_CACHE_DIR".into(), pkg.cache_dir.clone().into());
  if let Some(cache_file) = &pkg.cache_file {
    env.insert("PKG_CACHE_FILE".into(), cache_file.clone().into());
  }
  env.insert("PKG_BUILD_BASE_DIR".into(), pkg.build_dir.clone().into());
  env.insert("PKG_BUILD_DIR".into(), pkg.source_tree().into());
  env.insert("PKG_BUILD_OUTPUT_DIR".into(), pkg.build_output_dir.clone().into());
  // Presence flags: exported only when true.
  if pkg.devmode {
    env.insert("PKG_DEVMODE".into(), ScriptValue::Bool(true));
  }
  if pkg.internal {
    env.insert("PKG_INTERNAL".into(), ScriptValue::Bool(true));
  }
  if pkg.local_srcs {
    env.insert("PKG_LOCALSRCS".into(), ScriptValue::Bool(true));
  }
  env
}

/// Install-tree variables (scope 2 of the stage environment).
pub fn late_stage_env(pkg: &Pkg, opts: &EngineOpts) -> ScriptEnv {
  let prefix = pkg.prefix.as_deref().unwrap_or(&opts.sysroot_prefix);

  let prefixed_host = prefix_join(&opts.host_dir, prefix);
  let prefixed_staging = prefix_join(&opts.staging_dir, prefix);
  let prefixed_target = prefix_join(&opts.target_dir, prefix);

  let mut env = ScriptEnv::new();
  env.insert("PREFIX".into(), prefix.into());
  env.insert("PREFIXED_HOST_DIR".into(), prefixed_host.clone().into());
  env.insert("PREFIXED_STAGING_DIR".into(), prefixed_staging.clone().into());
  env.insert("PREFIXED_TARGET_DIR".into(), prefixed_target.clone().into());

  for (tag, root) in [
    ("HOST", &prefixed_host),
    ("STAGING", &prefixed_staging),
    ("TARGET", &prefixed_target),
  ] {
    env.insert(format!("{tag}_BIN_DIR"), root.join("bin").into());
    env.insert(format!("{tag}_INCLUDE_DIR"), root.join("include").into());
    env.insert(format!("{tag}_LIB_DIR"), root.join("lib").into());
    env.insert(format!("{tag}_SHARE_DIR"), root.join("share").into());
  }

  let njobs = pkg.fixed_jobs.unwrap_or(opts.njobs);
  let njobsconf = pkg.fixed_jobs.unwrap_or(opts.njobsconf);
  env.insert("NJOBS".into(), njobs.into());
  env.insert("NJOBSCONF".into(), njobsconf.into());

  env
}

/// Global action phase flags; set only when their condition holds.
pub fn action_env(opts: &EngineOpts) -> ScriptEnv {
  let mut env = ScriptEnv::new();
  let on = ScriptValue::Bool(true);

  match &opts.action {
    EngineAction::Global(action) => match action {
      GlobalAction::Clean => {
        env.insert("RELENG_CLEAN".into(), on.clone());
      }
      GlobalAction::Mrproper => {
        env.insert("RELENG_CLEAN".into(), on.clone());
        env.insert("RELENG_MRPROPER".into(), on.clone());
      }
      GlobalAction::Distclean => {
        env.insert("RELENG_CLEAN".into(), on.clone());
        env.insert("RELENG_DISTCLEAN".into(), on.clone());
      }
      _ => {}
    },
    EngineAction::Package { name, action } => {
      env.insert("RELENG_TARGET_PKG".into(), name.clone().into());
      match action {
        PkgAction::Clean => {
          env.insert("RELENG_CLEAN".into(), on.clone());
        }
        PkgAction::Distclean => {
          env.insert("RELENG_CLEAN".into(), on.clone());
          env.insert("RELENG_DISTCLEAN".into(), on.clone());
        }
        PkgAction::Exec => {
          env.insert("RELENG_EXEC".into(), on.clone());
        }
        PkgAction::Rebuild | PkgAction::RebuildOnly => {
          env.insert("RELENG_REBUILD".into(), on.clone());
        }
        PkgAction::Reconfigure | PkgAction::ReconfigureOnly => {
          env.insert("RELENG_RECONFIGURE".into(), on.clone());
        }
        PkgAction::Reinstall => {
          env.insert("RELENG_REINSTALL".into(), on.clone());
        }
        _ => {}
      }
    }
    EngineAction::Full => {}
  }

  if opts.in_devmode() {
    env.insert("RELENG_DEVMODE".into(), on.clone());
  }
  if !opts.profiles.is_empty() {
    env.insert("RELENG_PROFILES".into(), opts.profiles.join(";").into());
  }

  env
}

/// The full script environment for one stage invocation of a package.
pub fn stage_env(pkg: &Pkg, opts: &EngineOpts) -> ScriptEnv {
  let mut env = base_env(opts);
  env.extend(action_env(opts));
  env.extend(pkg_env(pkg));
  env.extend(late_stage_env(pkg, opts));
  env
}

/// Join a sysroot prefix onto an install-tree root.
///
/// The prefix's leading separator is stripped so it nests under the root; an
/// empty prefix yields the root itself.
pub fn prefix_join(base: &Path, prefix: &str) -> PathBuf {
  let trimmed = prefix.trim_start_matches(['/', '\\']);
  if trimmed.is_empty() {
    base.to_path_buf()
  } else {
    base.join(trimmed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn prefix_join_nests_under_base() {
    assert_eq!(prefix_join(Path::new("/out/host"), "/usr"), PathBuf::from("/out/host/usr"));
    assert_eq!(prefix_join(Path::new("/out/host"), ""), PathBuf::from("/out/host"));
  }

  #[test]
  #[serial]
  fn scoped_env_restores_prior_values() {
    let key = "RELENG_SCOPED_ENV_TEST";
    unsafe { env::set_var(key, "before") };

    {
      let mut vars = BTreeMap::new();
      vars.insert(key.to_string(), "during".to_string());
      let _guard = ScopedEnv::apply(&vars);
      assert_eq!(env::var(key).unwrap(), "during");
    }

    assert_eq!(env::var(key).unwrap(), "before");
    unsafe { env::remove_var(key) };
  }

  #[test]
  #[serial]
  fn scoped_env_unsets_previously_absent_values() {
    let key = "RELENG_SCOPED_ENV_ABSENT";
    unsafe { env::remove_var(key) };

    {
      let mut vars = BTreeMap::new();
      vars.insert(key.to_string(), "during".to_string());
      let _guard = ScopedEnv::apply(&vars);
      assert_eq!(env::var(key).unwrap(), "during");
    }

    assert!(env::var_os(key).is_none());
  }

  #[test]
  #[serial]
  fn scoped_env_restores_on_panic() {
    let key = "RELENG_SCOPED_ENV_PANIC";
    unsafe { env::set_var(key, "before") };

    let result = std::panic::catch_unwind(|| {
      let mut vars = BTreeMap::new();
      vars.insert(key.to_string(), "during".to_string());
      let _guard = ScopedEnv::apply(&vars);
      panic!("stage blew up");
    });

    assert!(result.is_err());
    assert_eq!(env::var(key).unwrap(), "before");
    unsafe { env::remove_var(key) };
  }
}
