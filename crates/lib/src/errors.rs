//! Cross-cutting error types for the engine.
//!
//! Validation errors (configuration, package definitions, registry misuse)
//! propagate out of [`crate::Engine::run`] to the caller. Stage failures are
//! caught at the driver boundary and mapped to an unsuccessful-but-clean
//! return, matching the propagation policy of the engine contract.

use std::path::PathBuf;

use thiserror::Error;

use crate::stage::Stage;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, RelengError>;

/// Errors raised while locating or evaluating project-level configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// No project configuration file could be found.
  #[error("missing configuration file under '{0}'")]
  MissingConfiguration(PathBuf),

  /// The configuration script failed to evaluate.
  #[error("invalid configuration script '{path}': {source}")]
  InvalidScript {
    path: PathBuf,
    #[source]
    source: mlua::Error,
  },

  /// A configuration setting failed type validation.
  #[error("invalid configuration value for '{key}': expected {expected}")]
  InvalidSettings { key: String, expected: &'static str },

  /// The configuration overrides script failed to evaluate.
  #[error("invalid override configuration script '{path}': {source}")]
  InvalidOverrideScript {
    path: PathBuf,
    #[source]
    source: mlua::Error,
  },

  /// The configuration declared no packages.
  #[error("configuration defines no packages")]
  MissingPackages,
}

/// Errors raised while loading and validating package definitions.
#[derive(Debug, Error)]
pub enum PkgError {
  /// No definition file or stage script was found for a requested name.
  ///
  /// `hint` carries a pre-formatted "; did you mean ..." suffix when a close
  /// match exists, or is empty.
  #[error("unknown package '{name}'{hint}")]
  MissingPackageScript { name: String, hint: String },

  /// The package definition script failed to evaluate.
  #[error("invalid package script for '{name}': {source}")]
  InvalidPackageScript {
    name: String,
    #[source]
    source: mlua::Error,
  },

  /// A package attribute failed type validation.
  #[error("invalid value for package key '{pkg}.{key}': expected {expected}")]
  InvalidKeyValue {
    pkg: String,
    key: String,
    expected: &'static str,
  },

  /// A VCS type requiring a revision has neither revision nor version.
  #[error("package '{0}' defines no revision (or version fallback)")]
  MissingRevision(String),

  /// A VCS type requiring a remote has no site.
  #[error("package '{0}' defines no site")]
  MissingSite(String),

  /// A computed subdirectory escapes the package build directory.
  #[error("package '{pkg}' key '{key}' escapes the build directory")]
  PathTraversal { pkg: String, key: &'static str },

  /// Contradictory flags on a package.
  #[error("conflicting configuration for package '{pkg}': {message}")]
  ConflictingConfiguration { pkg: String, message: String },

  /// A local-sources path collides with the project root.
  #[error("local-sources path for package '{pkg}' matches the project root: {path}")]
  ConflictingLocalSrcsPath { pkg: String, path: PathBuf },

  /// The dependency graph contains a cycle.
  #[error("cyclic package dependency detected involving '{0}'")]
  CyclicDependency(String),

  #[error("package '{pkg}' uses unknown vcs type '{value}'")]
  UnknownVcsType { pkg: String, value: String },

  #[error("package '{pkg}' uses unknown extract type '{value}'")]
  UnknownExtractType { pkg: String, value: String },

  #[error("package '{pkg}' uses unknown install type '{value}'")]
  UnknownInstallType { pkg: String, value: String },

  #[error("package '{pkg}' uses unknown package type '{value}'")]
  UnknownPackageType { pkg: String, value: String },

  #[error("package '{pkg}' uses unknown python setup type '{value}'")]
  UnknownPythonSetupType { pkg: String, value: String },
}

/// Errors raised by the extension registry.
#[derive(Debug, Error)]
pub enum RegistryError {
  /// Extension type names must begin with the `ext-` prefix.
  #[error("extension type name '{0}' must begin with 'ext-'")]
  InvalidTypeName(String),

  /// A fetch, extract or package type was registered twice.
  #[error("duplicate registration of {kind} type '{name}'")]
  DuplicateType { kind: &'static str, name: String },

  /// The extension requires a newer engine.
  #[error("extension '{name}' requires engine {required}, running {running}")]
  IncompatibleVersion {
    name: String,
    required: String,
    running: String,
  },

  /// The extension version requirement could not be parsed.
  #[error("extension '{name}' declares invalid version requirement '{required}'")]
  InvalidVersionRequirement { name: String, required: String },
}

/// A failure inside one pipeline stage.
///
/// The pipeline converts fetch, extract, patch and runner errors into this
/// type so the driver can report them uniformly and return failure.
#[derive(Debug, Error)]
pub enum StageError {
  /// The stage's work reported an error.
  #[error("{stage} stage failure for package '{pkg}': {message}")]
  Failed {
    stage: Stage,
    pkg: String,
    message: String,
  },

  /// The stage succeeded but its completion flag could not be written.
  #[error("cannot mark {stage} stage complete for package '{pkg}': {source}")]
  FlagWrite {
    stage: Stage,
    pkg: String,
    #[source]
    source: std::io::Error,
  },

  /// The fetch-post step reported an error.
  #[error("fetch-post stage failure for package '{pkg}': {message}")]
  FetchPost { pkg: String, message: String },

  /// The user-supplied exec command reported an error.
  #[error("exec stage failure for package '{pkg}': {message}")]
  ExecFailed { pkg: String, message: String },

  /// A `<pkg>-exec` action was requested without a command.
  #[error("exec action for package '{0}' is missing a command")]
  MissingExecCommand(String),
}

impl StageError {
  /// Build a stage failure from any displayable cause.
  pub fn failed(stage: Stage, pkg: &str, cause: impl std::fmt::Display) -> Self {
    StageError::Failed {
      stage,
      pkg: pkg.to_string(),
      message: cause.to_string(),
    }
  }
}

/// Top-level error type returned by the engine.
#[derive(Debug, Error)]
pub enum RelengError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Pkg(#[from] PkgError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Stage(#[from] StageError),

  /// A warning was emitted while warnings-as-errors is active.
  #[error("warning treated as error: {0}")]
  WarningAsError(String),

  #[error(transparent)]
  Flag(#[from] crate::flags::FlagError),

  #[error(transparent)]
  DvcsDb(#[from] crate::dvcsdb::DvcsDbError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
