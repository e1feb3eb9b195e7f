//! License gathering: the per-package license stage and the project-wide
//! license cache consumed by external report renderers.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::RelengError;
use crate::opts::EngineOpts;
use crate::pkg::Pkg;
use crate::spdx::{SpdxDb, expression_tokens};

/// Cache entry for one package's licensing information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseEntry {
  /// Declared license files, resolved against the package sources.
  pub files: Vec<PathBuf>,
  pub version: String,
  /// SPDX identifiers from the package's license expressions.
  pub licenses: Vec<String>,
}

/// In-memory license cache keyed by package name.
pub type LicenseCache = BTreeMap<String, LicenseEntry>;

/// Copy a package's declared license files into the project license tree
/// (`<licenses>/<name-version>/`). Returns how many files were installed.
pub fn install_pkg_licenses(pkg: &Pkg, opts: &EngineOpts) -> io::Result<usize> {
  if pkg.license_files.is_empty() {
    return Ok(0);
  }

  let dest_dir = opts.license_dir.join(&pkg.nv);
  fs::create_dir_all(&dest_dir)?;

  let mut installed = 0;
  for file in &pkg.license_files {
    let source = pkg.source_tree().join(file);
    let flat_name = file.replace(['/', '\\'], "_");

    if source.is_dir() {
      // A declared directory contributes every file inside it.
      for entry in WalkDir::new(&source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
      {
        let relative = entry
          .path()
          .strip_prefix(&source)
          .unwrap_or(entry.path())
          .to_string_lossy()
          .replace(['/', '\\'], "_");
        fs::copy(entry.path(), dest_dir.join(format!("{flat_name}_{relative}")))?;
        installed += 1;
      }
      continue;
    }

    if !source.is_file() {
      warn!(pkg = %pkg.name, file = %file, "declared license file not found");
      continue;
    }

    fs::copy(&source, dest_dir.join(flat_name))?;
    installed += 1;
  }

  debug!(pkg = %pkg.name, installed, "license files installed");
  Ok(installed)
}

/// Build the license cache for the sorted package list, validating SPDX
/// tokens against the bundled data plus project extras.
///
/// Unknown and deprecated tokens warn, escalating to errors under werror.
pub fn build_license_cache(pkgs: &[Pkg], opts: &EngineOpts, spdx: &SpdxDb) -> Result<LicenseCache, RelengError> {
  let mut cache = LicenseCache::new();

  for pkg in pkgs {
    if pkg.license.is_empty() && pkg.license_files.is_empty() {
      continue;
    }

    let mut licenses = Vec::new();
    for expression in &pkg.license {
      let tokens = expression_tokens(expression);

      for id in &tokens.licenses {
        if let Some(replacement) = spdx.deprecated_replacement(id) {
          emit(
            opts,
            format!("{}: deprecated license id '{id}'; use '{replacement}'", pkg.name),
          )?;
        } else if !spdx.known_license(id) {
          emit(opts, format!("{}: unknown license id '{id}'", pkg.name))?;
        }
      }
      for id in &tokens.exceptions {
        if !spdx.known_exception(id) {
          emit(opts, format!("{}: unknown license exception '{id}'", pkg.name))?;
        }
      }

      licenses.extend(tokens.licenses);
    }

    let files = pkg
      .license_files
      .iter()
      .map(|file| pkg.source_tree().join(file))
      .collect();

    cache.insert(
      pkg.name.clone(),
      LicenseEntry {
        files,
        version: pkg.version.clone(),
        licenses,
      },
    );
  }

  Ok(cache)
}

fn emit(opts: &EngineOpts, message: String) -> Result<(), RelengError> {
  if opts.werror {
    return Err(RelengError::WarningAsError(message));
  }
  warn!("{message}");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dvcsdb::DvcsDb;
  use crate::pkg::PkgLoader;
  use crate::registry::Registry;
  use crate::script_env::ScriptEnv;

  struct Fixture {
    _tmp: tempfile::TempDir,
    opts: EngineOpts,
  }

  impl Fixture {
    fn new() -> Self {
      let tmp = tempfile::tempdir().unwrap();
      let mut opts = EngineOpts::new(tmp.path());
      opts.finalize();
      Fixture { _tmp: tmp, opts }
    }

    fn load_pkg(&self, name: &str, content: &str) -> Pkg {
      let dir = self.opts.default_pkg_dir.join(name);
      fs::create_dir_all(&dir).unwrap();
      fs::write(dir.join(format!("{name}.rt")), content).unwrap();

      let registry = Registry::new();
      let mut dvcsdb = DvcsDb::load(&self.opts.cache_dir);
      let mut env = ScriptEnv::new();
      let mut loader = PkgLoader::new(&self.opts, &registry, &mut dvcsdb);
      loader.load_one(name, &mut env).unwrap()
    }
  }

  #[test]
  fn cache_collects_files_versions_and_ids() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      r#"
        DEMO_VERSION = '1.0'
        DEMO_VCS_TYPE = 'none'
        DEMO_LICENSE = {'MIT OR Apache-2.0'}
        DEMO_LICENSE_FILES = {'COPYING'}
      "#,
    );

    let cache = build_license_cache(&[pkg.clone()], &fx.opts, &SpdxDb::new()).unwrap();
    let entry = &cache["demo"];
    assert_eq!(entry.version, "1.0");
    assert_eq!(entry.licenses, vec!["MIT", "Apache-2.0"]);
    assert_eq!(entry.files, vec![pkg.source_tree().join("COPYING")]);
  }

  #[test]
  fn packages_without_licensing_are_omitted() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");
    let cache = build_license_cache(&[pkg], &fx.opts, &SpdxDb::new()).unwrap();
    assert!(cache.is_empty());
  }

  #[test]
  fn unknown_license_warns_but_loads() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'Corp-Secret-1.0'}\n",
    );
    let cache = build_license_cache(&[pkg], &fx.opts, &SpdxDb::new()).unwrap();
    assert_eq!(cache["demo"].licenses, vec!["Corp-Secret-1.0"]);
  }

  #[test]
  fn unknown_license_fails_under_werror() {
    let mut fx = Fixture::new();
    fx.opts.werror = true;
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'Corp-Secret-1.0'}\n",
    );
    let err = build_license_cache(&[pkg], &fx.opts, &SpdxDb::new()).unwrap_err();
    assert!(matches!(err, RelengError::WarningAsError(_)));
  }

  #[test]
  fn extras_silence_unknown_warnings_under_werror() {
    let mut fx = Fixture::new();
    fx.opts.werror = true;
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'Corp-Secret-1.0'}\n",
    );
    let spdx = SpdxDb::with_extras(&["Corp-Secret-1.0".to_string()], &[]);
    build_license_cache(&[pkg], &fx.opts, &spdx).unwrap();
  }

  #[test]
  fn deprecated_license_fails_under_werror() {
    let mut fx = Fixture::new();
    fx.opts.werror = true;
    let pkg = fx.load_pkg("demo", "DEMO_VCS_TYPE = 'none'\nDEMO_LICENSE = {'GPL-2.0'}\n");
    let err = build_license_cache(&[pkg], &fx.opts, &SpdxDb::new()).unwrap_err();
    assert!(matches!(err, RelengError::WarningAsError(_)));
  }

  #[test]
  fn install_walks_declared_directories() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_VCS_TYPE = 'none'\nDEMO_LICENSE_FILES = {'licenses'}\n",
    );

    let licenses = pkg.source_tree().join("licenses");
    fs::create_dir_all(licenses.join("vendored")).unwrap();
    fs::write(licenses.join("MIT.txt"), "mit").unwrap();
    fs::write(licenses.join("vendored").join("BSD.txt"), "bsd").unwrap();

    let installed = install_pkg_licenses(&pkg, &fx.opts).unwrap();
    assert_eq!(installed, 2);

    let dest = fx.opts.license_dir.join("demo-1.0");
    assert!(dest.join("licenses_MIT.txt").is_file());
    assert!(dest.join("licenses_vendored_BSD.txt").is_file());
  }

  #[test]
  fn install_copies_declared_files() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_VCS_TYPE = 'none'\nDEMO_LICENSE_FILES = {'COPYING', 'docs/LICENSE'}\n",
    );

    fs::create_dir_all(pkg.source_tree().join("docs")).unwrap();
    fs::write(pkg.source_tree().join("COPYING"), "license text").unwrap();
    fs::write(pkg.source_tree().join("docs/LICENSE"), "more text").unwrap();

    let installed = install_pkg_licenses(&pkg, &fx.opts).unwrap();
    assert_eq!(installed, 2);

    let dest = fx.opts.license_dir.join("demo-1.0");
    assert!(dest.join("COPYING").is_file());
    assert!(dest.join("docs_LICENSE").is_file());
  }
}
