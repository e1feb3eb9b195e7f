//! Engine options: run action, mode flags and the resolved directory layout.
//!
//! Options are built once by the front-end, finalized with [`EngineOpts::finalize`]
//! and then passed by reference to every component. Environment variables act
//! as fallbacks for directories the front-end leaves unset.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::consts;
use crate::stage::Stage;

/// Development mode requested for a run.
///
/// Named modes select devmode-specific entries in package revision and site
/// maps; the generic mode only matches the `*` fallback entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Devmode {
  Generic,
  Named(String),
}

impl Devmode {
  /// The devmode name used for map lookups, if any.
  pub fn name(&self) -> Option<&str> {
    match self {
      Devmode::Generic => None,
      Devmode::Named(name) => Some(name.as_str()),
    }
  }
}

/// Global engine actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalAction {
  Clean,
  Distclean,
  Extract,
  Fetch,
  FetchFull,
  Init,
  Licenses,
  Mrproper,
  Patch,
  Punch,
  Sbom,
  State,
}

impl GlobalAction {
  /// The stage after which a global action stops the pipeline, if it runs
  /// the pipeline at all.
  pub fn stop_stage(self) -> Option<Stage> {
    match self {
      GlobalAction::Fetch | GlobalAction::FetchFull => Some(Stage::Fetch),
      GlobalAction::Extract => Some(Stage::Extract),
      GlobalAction::Patch => Some(Stage::Patch),
      GlobalAction::Licenses => Some(Stage::License),
      _ => None,
    }
  }
}

/// Package-scoped actions (`<pkg>-<subaction>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgAction {
  Build,
  Clean,
  Configure,
  Distclean,
  Exec,
  Extract,
  Fetch,
  FetchFull,
  Fresh,
  Install,
  License,
  Patch,
  Rebuild,
  RebuildOnly,
  Reconfigure,
  ReconfigureOnly,
  Reinstall,
}

impl PkgAction {
  /// The stage after which the pipeline stops for the target package.
  pub fn stop_stage(self) -> Option<Stage> {
    match self {
      PkgAction::Fetch | PkgAction::FetchFull => Some(Stage::Fetch),
      PkgAction::Extract => Some(Stage::Extract),
      PkgAction::Patch => Some(Stage::Patch),
      PkgAction::License => Some(Stage::License),
      PkgAction::Configure | PkgAction::Reconfigure | PkgAction::ReconfigureOnly => Some(Stage::Configure),
      PkgAction::Build | PkgAction::Rebuild | PkgAction::RebuildOnly => Some(Stage::Build),
      PkgAction::Install | PkgAction::Reinstall | PkgAction::Exec => Some(Stage::Install),
      PkgAction::Clean | PkgAction::Distclean | PkgAction::Fresh => None,
    }
  }

  /// Stage flags to clear on the target package before the run, forcing
  /// re-execution from that point.
  ///
  /// The `_only` variants clear just their named stage; later stages keep
  /// their flags, so a following full run does not repeat them.
  pub fn invalidates(self) -> &'static [Stage] {
    match self {
      PkgAction::Rebuild => &[Stage::Build, Stage::Install, Stage::Post],
      PkgAction::RebuildOnly => &[Stage::Build],
      PkgAction::Reconfigure => &[Stage::Configure, Stage::Build, Stage::Install, Stage::Post],
      PkgAction::ReconfigureOnly => &[Stage::Configure],
      PkgAction::Reinstall => &[Stage::Install, Stage::Post],
      _ => &[],
    }
  }
}

/// What a run should do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineAction {
  /// Full run including post-processing.
  #[default]
  Full,
  Global(GlobalAction),
  Package { name: String, action: PkgAction },
}

impl EngineAction {
  /// Whether this action restricts the pipeline to pre-configure work, which
  /// skips the cargo pre-pass and the post-run cache builders.
  pub fn is_pre_configure(&self) -> bool {
    match self {
      EngineAction::Global(action) => {
        matches!(
          action,
          GlobalAction::Fetch
            | GlobalAction::FetchFull
            | GlobalAction::Extract
            | GlobalAction::Patch
            | GlobalAction::Licenses
            | GlobalAction::Sbom
        )
      }
      EngineAction::Package { action, .. } => {
        matches!(
          action,
          PkgAction::Fetch
            | PkgAction::FetchFull
            | PkgAction::Extract
            | PkgAction::Patch
            | PkgAction::License
            | PkgAction::Fresh
        )
      }
      EngineAction::Full => false,
    }
  }
}

/// Process-wide configuration record.
///
/// Fields up to the resolved-layout section are inputs the front-end (or the
/// project configuration) fills in; the remainder is computed by
/// [`EngineOpts::finalize`].
#[derive(Debug, Clone)]
pub struct EngineOpts {
  /// Project root directory.
  pub root_dir: PathBuf,

  // Directory overrides; environment variables apply when unset.
  pub assets_dir: Option<PathBuf>,
  pub cache_dir_override: Option<PathBuf>,
  pub dl_dir_override: Option<PathBuf>,
  pub images_dir_override: Option<PathBuf>,
  pub output_dir_override: Option<PathBuf>,

  /// Requested job count; `0` selects the detected CPU count.
  pub jobs: usize,

  pub action: EngineAction,
  pub devmode: Option<Devmode>,
  /// Local-sources mode: package name (or `*`) to source directory.
  pub local_srcs: BTreeMap<String, PathBuf>,
  /// Force-clear completion flags for the target action.
  pub force: bool,
  pub werror: bool,
  pub color: bool,
  pub ignore_unknown_args: bool,
  /// Command for a `<pkg>-exec` action.
  pub exec_command: Option<Vec<String>>,
  /// Named profiles passed into the run and exposed to scripts.
  pub profiles: Vec<String>,

  // Project configuration settings, populated by the driver after the
  // configuration script is evaluated.
  pub environment: BTreeMap<String, String>,
  pub extensions: Vec<String>,
  pub external_pkg_dirs: Vec<PathBuf>,
  pub extra_licenses: Vec<String>,
  pub extra_license_exceptions: Vec<String>,
  pub license_header: Option<String>,
  pub override_revisions: BTreeMap<String, String>,
  pub override_sites: BTreeMap<String, String>,
  /// Archive extension to external extraction command template
  /// (`{file}`/`{dir}` placeholders).
  pub extract_override: BTreeMap<String, Vec<String>>,
  pub sbom_format: Vec<String>,
  pub sysroot_prefix: String,
  pub url_mirror: Option<String>,
  pub only_mirror: bool,
  /// URL suffix to cache-file extension mapping.
  pub cache_ext: BTreeMap<String, String>,
  pub default_internal: bool,
  pub default_devmode_ignore_cache: bool,
  pub prerequisites: Vec<String>,
  pub quirks: Vec<String>,

  // Resolved layout, computed by finalize().
  pub out_dir: PathBuf,
  pub cache_dir: PathBuf,
  pub dl_dir: PathBuf,
  pub build_dir: PathBuf,
  pub host_dir: PathBuf,
  pub images_dir: PathBuf,
  pub license_dir: PathBuf,
  pub staging_dir: PathBuf,
  pub symbols_dir: PathBuf,
  pub target_dir: PathBuf,
  pub default_pkg_dir: PathBuf,
  /// Resolved job count, at least one.
  pub njobs: usize,
  /// Configured job count; equals `njobs` when jobs were auto-detected.
  pub njobsconf: usize,
}

impl EngineOpts {
  /// Create options rooted at a project directory, with defaults everywhere
  /// else. Call [`EngineOpts::finalize`] after applying front-end overrides.
  pub fn new(root_dir: impl Into<PathBuf>) -> Self {
    let root_dir = root_dir.into();
    EngineOpts {
      root_dir,
      assets_dir: None,
      cache_dir_override: None,
      dl_dir_override: None,
      images_dir_override: None,
      output_dir_override: None,
      jobs: 0,
      action: EngineAction::Full,
      devmode: None,
      local_srcs: BTreeMap::new(),
      force: false,
      werror: false,
      color: true,
      ignore_unknown_args: false,
      exec_command: None,
      profiles: Vec::new(),
      environment: BTreeMap::new(),
      extensions: Vec::new(),
      external_pkg_dirs: Vec::new(),
      extra_licenses: Vec::new(),
      extra_license_exceptions: Vec::new(),
      license_header: None,
      override_revisions: BTreeMap::new(),
      override_sites: BTreeMap::new(),
      extract_override: BTreeMap::new(),
      sbom_format: Vec::new(),
      sysroot_prefix: consts::DEFAULT_SYSROOT_PREFIX.to_string(),
      url_mirror: None,
      only_mirror: false,
      cache_ext: BTreeMap::new(),
      default_internal: false,
      default_devmode_ignore_cache: false,
      prerequisites: Vec::new(),
      quirks: Vec::new(),
      out_dir: PathBuf::new(),
      cache_dir: PathBuf::new(),
      dl_dir: PathBuf::new(),
      build_dir: PathBuf::new(),
      host_dir: PathBuf::new(),
      images_dir: PathBuf::new(),
      license_dir: PathBuf::new(),
      staging_dir: PathBuf::new(),
      symbols_dir: PathBuf::new(),
      target_dir: PathBuf::new(),
      default_pkg_dir: PathBuf::new(),
      njobs: 1,
      njobsconf: 1,
    }
  }

  /// Resolve environment fallbacks and compute the directory layout.
  pub fn finalize(&mut self) {
    if self.assets_dir.is_none() {
      self.assets_dir = env_path("RELENG_ASSETS_DIR");
    }
    if self.cache_dir_override.is_none() {
      self.cache_dir_override = env_path("RELENG_CACHE_DIR");
    }
    if self.dl_dir_override.is_none() {
      self.dl_dir_override = env_path("RELENG_DL_DIR");
    }
    if self.images_dir_override.is_none() {
      self.images_dir_override = env_path("RELENG_IMAGES_DIR");
    }
    if self.output_dir_override.is_none() {
      self.output_dir_override = env_path("RELENG_OUTPUT_DIR");
    }
    if self.jobs == 0
      && let Some(level) = env::var("RELENG_PARALLEL_LEVEL").ok().and_then(|v| v.parse().ok())
    {
      self.jobs = level;
    }
    if env::var_os("RELENG_IGNORE_UNKNOWN_ARGS").is_some() {
      self.ignore_unknown_args = true;
    }
    // FORCE_COLOR wins over NO_COLOR when both are set.
    if env::var_os("NO_COLOR").is_some() {
      self.color = false;
    }
    if env::var_os("FORCE_COLOR").is_some() {
      self.color = true;
    }

    self.out_dir = match &self.output_dir_override {
      Some(dir) => dir.clone(),
      None => match env_path("RELENG_GLOBAL_OUTPUT_CONTAINER_DIR") {
        Some(container) => container.join(project_folder_name(&self.root_dir)),
        None => self.root_dir.join(consts::OUTPUT_DIR),
      },
    };

    let assets_root = self.assets_dir.as_deref().unwrap_or(&self.root_dir);
    self.cache_dir = self
      .cache_dir_override
      .clone()
      .unwrap_or_else(|| assets_root.join(consts::CACHE_DIR));
    self.dl_dir = self
      .dl_dir_override
      .clone()
      .unwrap_or_else(|| assets_root.join(consts::DL_DIR));

    self.build_dir = self.out_dir.join(consts::BUILD_DIR);
    self.host_dir = self.out_dir.join(consts::HOST_DIR);
    self.images_dir = self
      .images_dir_override
      .clone()
      .unwrap_or_else(|| self.out_dir.join(consts::IMAGES_DIR));
    self.license_dir = self.out_dir.join(consts::LICENSE_DIR);
    self.staging_dir = self.out_dir.join(consts::STAGING_DIR);
    self.symbols_dir = self.out_dir.join(consts::SYMBOLS_DIR);
    self.target_dir = self.out_dir.join(consts::TARGET_DIR);
    self.default_pkg_dir = self.root_dir.join(consts::PKG_DIR);

    self.njobs = if self.jobs > 0 { self.jobs } else { detected_jobs() };
    self.njobsconf = if self.jobs > 0 { self.jobs } else { self.njobs };
  }

  /// Whether a quirk flag is active.
  pub fn has_quirk(&self, name: &str) -> bool {
    self.quirks.iter().any(|q| q == name)
  }

  /// Whether the engine runs in any development mode.
  pub fn in_devmode(&self) -> bool {
    self.devmode.is_some()
  }
}

/// Read an environment variable as a path, treating empty values as unset.
fn env_path(name: &str) -> Option<PathBuf> {
  match env::var_os(name) {
    Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
    _ => None,
  }
}

/// Folder name the project output uses inside a global output container.
fn project_folder_name(root: &Path) -> String {
  root
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_else(|| "releng".to_string())
}

/// Detect the number of CPUs available to this process.
///
/// `available_parallelism` honours CPU affinity masks on Linux, which is the
/// count external build tools should be handed.
fn detected_jobs() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  fn resolved(root: &str) -> EngineOpts {
    let mut opts = EngineOpts::new(root);
    opts.finalize();
    opts
  }

  #[test]
  #[serial]
  fn default_layout() {
    temp_env::with_vars_unset(
      [
        "RELENG_ASSETS_DIR",
        "RELENG_CACHE_DIR",
        "RELENG_DL_DIR",
        "RELENG_OUTPUT_DIR",
        "RELENG_GLOBAL_OUTPUT_CONTAINER_DIR",
      ],
      || {
        let opts = resolved("/proj");
        assert_eq!(opts.out_dir, PathBuf::from("/proj/output"));
        assert_eq!(opts.cache_dir, PathBuf::from("/proj/cache"));
        assert_eq!(opts.dl_dir, PathBuf::from("/proj/dl"));
        assert_eq!(opts.build_dir, PathBuf::from("/proj/output/build"));
        assert_eq!(opts.host_dir, PathBuf::from("/proj/output/host"));
        assert_eq!(opts.staging_dir, PathBuf::from("/proj/output/staging"));
        assert_eq!(opts.target_dir, PathBuf::from("/proj/output/target"));
        assert_eq!(opts.default_pkg_dir, PathBuf::from("/proj/package"));
      },
    );
  }

  #[test]
  #[serial]
  fn assets_dir_rebinds_cache_and_dl() {
    temp_env::with_vars_unset(["RELENG_CACHE_DIR", "RELENG_DL_DIR"], || {
      let mut opts = EngineOpts::new("/proj");
      opts.assets_dir = Some(PathBuf::from("/assets"));
      opts.finalize();
      assert_eq!(opts.cache_dir, PathBuf::from("/assets/cache"));
      assert_eq!(opts.dl_dir, PathBuf::from("/assets/dl"));
    });
  }

  #[test]
  #[serial]
  fn output_container_places_project_folder() {
    temp_env::with_vars(
      [
        ("RELENG_GLOBAL_OUTPUT_CONTAINER_DIR", Some("/big/out")),
        ("RELENG_OUTPUT_DIR", None),
      ],
      || {
        let opts = resolved("/work/myproj");
        assert_eq!(opts.out_dir, PathBuf::from("/big/out/myproj"));
      },
    );
  }

  #[test]
  #[serial]
  fn explicit_output_beats_container() {
    temp_env::with_vars(
      [
        ("RELENG_GLOBAL_OUTPUT_CONTAINER_DIR", Some("/big/out")),
        ("RELENG_OUTPUT_DIR", None),
      ],
      || {
        let mut opts = EngineOpts::new("/work/myproj");
        opts.output_dir_override = Some(PathBuf::from("/explicit"));
        opts.finalize();
        assert_eq!(opts.out_dir, PathBuf::from("/explicit"));
      },
    );
  }

  #[test]
  #[serial]
  fn explicit_jobs_honoured() {
    temp_env::with_var_unset("RELENG_PARALLEL_LEVEL", || {
      let mut opts = EngineOpts::new("/proj");
      opts.jobs = 7;
      opts.finalize();
      assert_eq!(opts.njobs, 7);
      assert_eq!(opts.njobsconf, 7);
    });
  }

  #[test]
  #[serial]
  fn auto_jobs_is_positive() {
    temp_env::with_var_unset("RELENG_PARALLEL_LEVEL", || {
      let opts = resolved("/proj");
      assert!(opts.njobs >= 1);
      assert_eq!(opts.njobs, opts.njobsconf);
    });
  }

  #[test]
  fn pkg_action_stop_stages() {
    assert_eq!(PkgAction::Fetch.stop_stage(), Some(Stage::Fetch));
    assert_eq!(PkgAction::Rebuild.stop_stage(), Some(Stage::Build));
    assert_eq!(PkgAction::Reinstall.stop_stage(), Some(Stage::Install));
    assert_eq!(PkgAction::Clean.stop_stage(), None);
  }

  #[test]
  fn reconfigure_invalidates_downstream_stages() {
    let cleared = PkgAction::Reconfigure.invalidates();
    assert!(cleared.contains(&Stage::Configure));
    assert!(cleared.contains(&Stage::Build));
    assert!(cleared.contains(&Stage::Install));
    assert!(!cleared.contains(&Stage::Extract));
  }
}
