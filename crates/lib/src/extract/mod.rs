//! Extract store: populating build directories from package caches.
//!
//! Dispatch order: `no_extraction` and local packages short-circuit;
//! extension extract types go to their registry handler; project
//! `extract_override` command templates run for matching extensions;
//! directory caches use injected VCS extractors; everything else is handled
//! by the built-in archive extractor.

pub mod archive;
pub mod types;

pub use archive::ArchiveExtractor;
pub use types::{ExtractError, ExtractOptions, Extractor};

use std::collections::BTreeMap;
use std::fs;
use std::rc::Rc;

use tracing::{debug, info};

use crate::exec::{self, RunOpts};
use crate::opts::EngineOpts;
use crate::pkg::{CacheKind, Pkg, VcsType};
use crate::registry::Registry;

/// Dispatches extraction requests per package.
pub struct ExtractStore {
  vcs_extractors: BTreeMap<String, Rc<dyn Extractor>>,
  archive: Rc<ArchiveExtractor>,
}

impl Default for ExtractStore {
  fn default() -> Self {
    ExtractStore::new()
  }
}

impl ExtractStore {
  pub fn new() -> Self {
    ExtractStore {
      vcs_extractors: BTreeMap::new(),
      archive: Rc::new(ArchiveExtractor),
    }
  }

  /// Install (or replace) the extractor for a recognised VCS type. This is
  /// how DVCS checkout handlers plug in.
  pub fn set_extractor(&mut self, vcs: &VcsType, extractor: Rc<dyn Extractor>) {
    self.vcs_extractors.insert(vcs.name().to_string(), extractor);
  }

  /// Populate a package's build directory from its cache.
  pub fn extract(&self, pkg: &Pkg, opts: &EngineOpts, registry: &Registry) -> Result<(), ExtractError> {
    if pkg.vcs_type == VcsType::Local || pkg.local_srcs {
      // In-tree or developer-provided sources; nothing to populate, but the
      // directory must exist.
      if !pkg.build_dir.is_dir() {
        return Err(ExtractError::MissingSources {
          pkg: pkg.name.clone(),
          path: pkg.build_dir.clone(),
        });
      }
      debug!(pkg = %pkg.name, "sources are in place; skipping extraction");
      return Ok(());
    }

    if pkg.no_extraction {
      fs::create_dir_all(&pkg.build_dir)?;
      debug!(pkg = %pkg.name, "extraction disabled for package");
      return Ok(());
    }

    if pkg.vcs_type == VcsType::None {
      fs::create_dir_all(&pkg.build_dir)?;
      return Ok(());
    }

    let extract_opts = ExtractOptions {
      name: &pkg.name,
      cache_dir: &pkg.cache_dir,
      cache_file: pkg.cache_file.as_deref(),
      revision: &pkg.revision,
      strip_count: pkg.strip_count,
      work_dir: &pkg.build_dir,
    };

    // Extension extract types take precedence over built-in handling.
    if let Some(ext_type) = &pkg.extract_type {
      let extractor = registry
        .extract_type(ext_type)
        .ok_or_else(|| ExtractError::Unsupported(pkg.build_dir.clone()))?;
      return extractor.extract(&extract_opts);
    }

    // Project-level external tool overrides, matched by extension.
    if let Some(cache_file) = &pkg.cache_file
      && let Some(command) = match_override(opts, cache_file)
    {
      fs::create_dir_all(&pkg.build_dir)?;
      let args: Vec<String> = command
        .iter()
        .map(|part| {
          part
            .replace("{file}", &cache_file.display().to_string())
            .replace("{dir}", &pkg.build_dir.display().to_string())
        })
        .collect();
      info!(pkg = %pkg.name, tool = %args.first().cloned().unwrap_or_default(), "extracting with override tool");
      exec::run(&args, &RunOpts::default())?;
      return Ok(());
    }

    match pkg.vcs_type.cache_kind() {
      CacheKind::Dir => {
        let extractor =
          self
            .vcs_extractors
            .get(pkg.vcs_type.name())
            .ok_or_else(|| ExtractError::MissingCache {
              pkg: pkg.name.clone(),
              path: pkg.cache_dir.clone(),
            })?;
        extractor.extract(&extract_opts)
      }
      CacheKind::File => self.archive.extract(&extract_opts),
      CacheKind::None => Ok(()),
    }
  }
}

/// Find an extract-override command for a cache file's extension.
fn match_override<'a>(opts: &'a EngineOpts, cache_file: &std::path::Path) -> Option<&'a Vec<String>> {
  let name = cache_file.file_name()?.to_str()?;
  opts
    .extract_override
    .iter()
    .find(|(ext, _)| name.ends_with(&format!(".{}", ext.trim_start_matches('.'))))
    .map(|(_, command)| command)
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use super::*;
  use crate::dvcsdb::DvcsDb;
  use crate::pkg::PkgLoader;
  use crate::script_env::ScriptEnv;

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

    fn load_pkg(&self, name: &str, content: &str) -> Pkg {
      let dir = self.opts.default_pkg_dir.join(name);
      fs::create_dir_all(&dir).unwrap();
      fs::write(dir.join(format!("{name}.rt")), content).unwrap();

      let mut dvcsdb = DvcsDb::load(&self.opts.cache_dir);
      let mut env = ScriptEnv::new();
      let mut loader = PkgLoader::new(&self.opts, &self.registry, &mut dvcsdb);
      loader.load_one(name, &mut env).unwrap()
    }
  }

  #[test]
  fn source_less_package_creates_empty_build_dir() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg("demo", "DEMO_VCS_TYPE = 'none'\n");

    let store = ExtractStore::new();
    store.extract(&pkg, &fx.opts, &fx.registry).unwrap();
    assert!(pkg.build_dir.is_dir());
  }

  #[test]
  fn local_package_requires_populated_sources() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg("demo", "DEMO_VCS_TYPE = 'local'\n");

    let store = ExtractStore::new();
    let err = store.extract(&pkg, &fx.opts, &fx.registry).unwrap_err();
    assert!(matches!(err, ExtractError::MissingSources { .. }));

    fs::create_dir_all(&pkg.build_dir).unwrap();
    store.extract(&pkg, &fx.opts, &fx.registry).unwrap();
  }

  #[test]
  fn dir_cache_without_extractor_fails() {
    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VERSION = '1'\nDEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = 'v1'\n",
    );

    let store = ExtractStore::new();
    assert!(store.extract(&pkg, &fx.opts, &fx.registry).is_err());
  }

  #[test]
  fn injected_vcs_extractor_is_used() {
    struct CheckoutStub {
      called: RefCell<bool>,
    }

    impl Extractor for CheckoutStub {
      fn extract(&self, opts: &ExtractOptions<'_>) -> Result<(), ExtractError> {
        *self.called.borrow_mut() = true;
        fs::create_dir_all(opts.work_dir)?;
        Ok(())
      }
    }

    let fx = Fixture::new();
    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VERSION = '1'\nDEMO_SITE = 'https://example.com/demo.git'\nDEMO_REVISION = 'v1'\n",
    );

    let stub = Rc::new(CheckoutStub {
      called: RefCell::new(false),
    });
    let mut store = ExtractStore::new();
    store.set_extractor(&VcsType::Git, stub.clone());

    store.extract(&pkg, &fx.opts, &fx.registry).unwrap();
    assert!(*stub.called.borrow());
  }

  #[cfg(unix)]
  #[test]
  fn extract_override_runs_external_tool() {
    let mut fx = Fixture::new();
    fx.opts.extract_override.insert(
      "tar.zzz".to_string(),
      vec![
        "cp".to_string(),
        "{file}".to_string(),
        "{dir}".to_string(),
      ],
    );

    let pkg = fx.load_pkg(
      "demo",
      "DEMO_VERSION = '1.0'\nDEMO_SITE = 'https://example.com/demo-1.0.tar.zzz'\nDEMO_EXTENSION = 'tar.zzz'\n",
    );

    let cache_file = pkg.cache_file.clone().unwrap();
    fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
    fs::write(&cache_file, b"blob").unwrap();

    let store = ExtractStore::new();
    store.extract(&pkg, &fx.opts, &fx.registry).unwrap();
    assert!(pkg.build_dir.join("demo-1.0.tar.zzz").is_file());
  }
}
