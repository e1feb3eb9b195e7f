//! Package model: declarative attributes, derived paths and policy flags.

pub mod attrs;
pub mod loader;
pub mod site;
pub mod sort;

pub use attrs::{OptValue, OptsMap, StrOrMap};
pub use loader::PkgLoader;

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Version-control kind of a package source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsType {
  Brz,
  Bzr,
  Cvs,
  File,
  Git,
  Hg,
  Local,
  None,
  Perforce,
  Rsync,
  Scp,
  Svn,
  Url,
  /// Extension-registered fetch type (`ext-` prefixed).
  Ext(String),
}

/// How a VCS type stores fetched content in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
  /// A per-package cache directory (DVCS clones).
  Dir,
  /// A single cache file (archives).
  File,
  /// Nothing is cached (local or source-less packages).
  None,
}

impl VcsType {
  /// Parse a recognised VCS type tag; `ext-` names parse as extensions.
  pub fn parse(value: &str) -> Option<VcsType> {
    let tag = value.to_lowercase();
    Some(match tag.as_str() {
      "brz" => VcsType::Brz,
      "bzr" => VcsType::Bzr,
      "cvs" => VcsType::Cvs,
      "file" => VcsType::File,
      "git" => VcsType::Git,
      "hg" => VcsType::Hg,
      "local" => VcsType::Local,
      "none" => VcsType::None,
      "p4" | "perforce" => VcsType::Perforce,
      "rsync" => VcsType::Rsync,
      "scp" => VcsType::Scp,
      "svn" => VcsType::Svn,
      "url" => VcsType::Url,
      _ if tag.starts_with(crate::consts::EXT_PREFIX) => VcsType::Ext(tag),
      _ => return None,
    })
  }

  /// VCS types that must carry a revision (version acts as fallback).
  pub fn requires_revision(&self) -> bool {
    matches!(
      self,
      VcsType::Brz | VcsType::Bzr | VcsType::Cvs | VcsType::Git | VcsType::Hg | VcsType::Svn
    )
  }

  /// VCS types that must carry a site (all except local and none).
  pub fn requires_site(&self) -> bool {
    !matches!(self, VcsType::Local | VcsType::None)
  }

  /// Distributed VCS types share local clones through the cache index.
  pub fn is_dvcs(&self) -> bool {
    matches!(self, VcsType::Git | VcsType::Hg)
  }

  pub fn cache_kind(&self) -> CacheKind {
    match self {
      VcsType::Git | VcsType::Hg => CacheKind::Dir,
      VcsType::Local | VcsType::None => CacheKind::None,
      _ => CacheKind::File,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      VcsType::Brz => "brz",
      VcsType::Bzr => "bzr",
      VcsType::Cvs => "cvs",
      VcsType::File => "file",
      VcsType::Git => "git",
      VcsType::Hg => "hg",
      VcsType::Local => "local",
      VcsType::None => "none",
      VcsType::Perforce => "perforce",
      VcsType::Rsync => "rsync",
      VcsType::Scp => "scp",
      VcsType::Svn => "svn",
      VcsType::Url => "url",
      VcsType::Ext(name) => name,
    }
  }
}

/// Build recipe kind of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageType {
  /// Free-form stage scripts (`<name>-configure.rt`, ...). The default.
  Script,
  Autotools,
  Cargo,
  Cmake,
  Make,
  Meson,
  Python,
  Scons,
  /// Extension-registered package type (`ext-` prefixed).
  Ext(String),
}

impl PackageType {
  pub fn parse(value: &str) -> Option<PackageType> {
    let tag = value.to_lowercase();
    Some(match tag.as_str() {
      "script" => PackageType::Script,
      "autotools" => PackageType::Autotools,
      "cargo" => PackageType::Cargo,
      "cmake" => PackageType::Cmake,
      "make" => PackageType::Make,
      "meson" => PackageType::Meson,
      "python" => PackageType::Python,
      "scons" => PackageType::Scons,
      _ if tag.starts_with(crate::consts::EXT_PREFIX) => PackageType::Ext(tag),
      _ => return None,
    })
  }

  /// Whether this builder works out-of-source, placing its build output in a
  /// dedicated directory next to the sources.
  pub fn out_of_source(&self) -> bool {
    matches!(self, PackageType::Cmake | PackageType::Meson)
  }

  pub fn name(&self) -> &str {
    match self {
      PackageType::Script => "script",
      PackageType::Autotools => "autotools",
      PackageType::Cargo => "cargo",
      PackageType::Cmake => "cmake",
      PackageType::Make => "make",
      PackageType::Meson => "meson",
      PackageType::Python => "python",
      PackageType::Scons => "scons",
      PackageType::Ext(name) => name,
    }
  }
}

/// Which install tree(s) a package's install stage writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallType {
  Host,
  Images,
  Staging,
  StagingAndTarget,
  #[default]
  Target,
}

impl InstallType {
  pub fn parse(value: &str) -> Option<InstallType> {
    Some(match value.to_lowercase().as_str() {
      "host" => InstallType::Host,
      "images" => InstallType::Images,
      "staging" => InstallType::Staging,
      "staging_and_target" => InstallType::StagingAndTarget,
      "target" => InstallType::Target,
      _ => return None,
    })
  }
}

/// Python setup drivers recognised by the python package type.
pub const PYTHON_SETUP_TYPES: &[&str] = &["distutils", "flit", "hatch", "pdm", "pep517", "poetry", "setuptools"];

/// A loaded package: one unit of the build.
///
/// Instances are produced by [`PkgLoader`] with every derived path resolved
/// and every invariant checked; downstream components treat them as
/// read-only.
#[derive(Debug, Clone)]
pub struct Pkg {
  /// Unique package name.
  pub name: String,
  /// Name-version slug used for build directories and flag files.
  pub nv: String,

  // Source identity.
  pub version: String,
  pub revision: String,
  pub site: Option<String>,
  pub vcs_type: VcsType,

  // Retrieval options.
  pub fetch_opts: OptsMap,
  /// Explicit cache-file extension (without the leading dot).
  pub extension: Option<String>,
  pub extract_type: Option<String>,
  pub strip_count: usize,
  pub devmode_ignore_cache: bool,

  // Build recipe.
  pub pkg_type: PackageType,
  pub install_type: InstallType,
  pub conf_opts: OptsMap,
  pub conf_env: BTreeMap<String, Option<String>>,
  pub conf_defs: BTreeMap<String, Option<String>>,
  pub build_opts: OptsMap,
  pub build_env: BTreeMap<String, Option<String>>,
  pub build_defs: BTreeMap<String, Option<String>>,
  pub install_opts: OptsMap,
  pub install_env: BTreeMap<String, Option<String>>,
  pub install_defs: BTreeMap<String, Option<String>>,
  /// Environment applied to every stage of this package.
  pub env: BTreeMap<String, Option<String>>,
  pub fixed_jobs: Option<usize>,
  pub cargo_name: Option<String>,
  pub python_setup_type: Option<String>,

  // Licensing.
  pub license: Vec<String>,
  pub license_files: Vec<String>,

  // Paths.
  pub def_dir: PathBuf,
  pub build_dir: PathBuf,
  pub build_output_dir: PathBuf,
  /// Relative subdirectory inside the build directory, when set.
  pub build_subdir: Option<PathBuf>,
  pub patch_subdir: Option<PathBuf>,
  pub cache_dir: PathBuf,
  pub cache_file: Option<PathBuf>,
  pub hash_file: PathBuf,
  pub asc_file: PathBuf,
  pub prefix: Option<String>,

  // Policy flags.
  pub internal: bool,
  pub local_srcs: bool,
  pub no_extraction: bool,
  pub skip_remote_config: bool,
  pub skip_remote_scripts: bool,
  pub devmode: bool,
  pub host_provides: Vec<String>,

  // Dependencies.
  pub deps: Vec<String>,
}

impl Pkg {
  /// The source tree: the build directory, descended into `build_subdir`
  /// when one is set.
  pub fn source_tree(&self) -> PathBuf {
    match &self.build_subdir {
      Some(subdir) => self.build_dir.join(subdir),
      None => self.build_dir.clone(),
    }
  }

  /// The tree build commands run in: the build-output directory for
  /// out-of-source builders, the source tree otherwise.
  pub fn build_tree(&self) -> PathBuf {
    if self.pkg_type.out_of_source() {
      self.build_output_dir.clone()
    } else {
      self.source_tree()
    }
  }

  /// The directory patches apply in: the source tree, rebased onto
  /// `patch_subdir` when one is set.
  pub fn patch_tree(&self) -> PathBuf {
    match &self.patch_subdir {
      Some(subdir) => self.build_dir.join(subdir),
      None => self.source_tree(),
    }
  }
}

/// Build the name-version slug, sanitising the version to `[A-Za-z0-9._-]`.
pub fn name_version(name: &str, version: &str) -> String {
  if version.is_empty() {
    return name.to_string();
  }

  let sanitized: String = version
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
        c
      } else {
        '-'
      }
    })
    .collect();
  format!("{name}-{sanitized}")
}
