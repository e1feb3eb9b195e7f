//! Fetch store: source acquisition with integrity checks.
//!
//! Dispatches each package to the fetcher for its VCS type (built-in URL and
//! file handlers; injected handlers for DVCS protocols; registry handlers
//! for extension types), then verifies cache files against the package hash
//! file. Hash checks are skipped for DVCS, local and source-less types, and
//! may be relaxed for devmode-pinned internal packages that opt in.

pub mod types;
pub mod url;

pub use types::{FetchError, FetchOptions, Fetcher};

use std::collections::BTreeMap;
use std::fs;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::hashcheck::{self, HashVerify};
use crate::opts::EngineOpts;
use crate::pkg::{CacheKind, Pkg, VcsType};
use crate::registry::Registry;

/// Dispatches fetch requests per VCS type.
pub struct FetchStore {
  fetchers: BTreeMap<String, Rc<dyn Fetcher>>,
}

impl FetchStore {
  /// Create a store with the built-in URL and file fetchers installed.
  pub fn new(opts: &EngineOpts) -> Self {
    let mut fetchers: BTreeMap<String, Rc<dyn Fetcher>> = BTreeMap::new();
    fetchers.insert(
      VcsType::Url.name().to_string(),
      Rc::new(url::UrlFetcher::new(opts.url_mirror.clone(), opts.only_mirror)),
    );
    fetchers.insert(VcsType::File.name().to_string(), Rc::new(url::FileFetcher));
    FetchStore { fetchers }
  }

  /// Install (or replace) the fetcher for a recognised VCS type. This is
  /// how protocol fetchers for git, svn and friends plug in.
  pub fn set_fetcher(&mut self, vcs: &VcsType, fetcher: Rc<dyn Fetcher>) {
    self.fetchers.insert(vcs.name().to_string(), fetcher);
  }

  /// Acquire a package's sources into its cache and verify integrity.
  ///
  /// On success the package's cache file or cache directory exists and is
  /// valid for its VCS type.
  pub fn fetch(&self, pkg: &Pkg, opts: &EngineOpts, registry: &Registry) -> Result<(), FetchError> {
    if matches!(pkg.vcs_type.cache_kind(), CacheKind::None) {
      debug!(pkg = %pkg.name, "no sources to fetch");
      return Ok(());
    }

    let ignore_cache = opts.in_devmode() && pkg.devmode_ignore_cache;

    // A cache file that already verifies needs no refetch; one that fails
    // verification is discarded and fetched again.
    if let Some(cache_file) = &pkg.cache_file
      && cache_file.is_file()
      && !ignore_cache
    {
      match self.verify(pkg, opts) {
        Ok(()) => {
          debug!(pkg = %pkg.name, file = %cache_file.display(), "cache file already present");
          return Ok(());
        }
        Err(e) => {
          warn!(pkg = %pkg.name, error = %e, "cached file failed verification; refetching");
          fs::remove_file(cache_file)?;
        }
      }
    }

    let fetcher = self.fetcher_for(&pkg.vcs_type, registry)?;

    let site = pkg.site.as_deref().unwrap_or_default();
    let fetch_opts = FetchOptions {
      name: &pkg.name,
      site,
      version: &pkg.version,
      revision: &pkg.revision,
      cache_dir: &pkg.cache_dir,
      cache_file: pkg.cache_file.as_deref(),
      ignore_cache,
      fetch_opts: &pkg.fetch_opts,
    };

    info!(pkg = %pkg.name, vcs = %pkg.vcs_type.name(), site, "fetching");
    fetcher.fetch(&fetch_opts)?;

    // Contract: the cache location exists after a successful fetch.
    match pkg.vcs_type.cache_kind() {
      CacheKind::File => {
        let cache_file = pkg.cache_file.as_deref().expect("file-kind package has a cache file");
        if !cache_file.is_file() {
          return Err(FetchError::MissingCache {
            pkg: pkg.name.clone(),
            path: cache_file.to_path_buf(),
          });
        }
        self.verify(pkg, opts)?;
      }
      CacheKind::Dir => {
        if !pkg.cache_dir.is_dir() {
          return Err(FetchError::MissingCache {
            pkg: pkg.name.clone(),
            path: pkg.cache_dir.clone(),
          });
        }
      }
      CacheKind::None => {}
    }

    Ok(())
  }

  /// Run the fetch-post step for a package (DVCS follow-up work).
  pub fn fetch_post(&self, pkg: &Pkg, opts: &EngineOpts, registry: &Registry) -> Result<(), FetchError> {
    if matches!(pkg.vcs_type.cache_kind(), CacheKind::None) {
      return Ok(());
    }

    let fetcher = self.fetcher_for(&pkg.vcs_type, registry)?;
    let site = pkg.site.as_deref().unwrap_or_default();
    let fetch_opts = FetchOptions {
      name: &pkg.name,
      site,
      version: &pkg.version,
      revision: &pkg.revision,
      cache_dir: &pkg.cache_dir,
      cache_file: pkg.cache_file.as_deref(),
      ignore_cache: opts.in_devmode() && pkg.devmode_ignore_cache,
      fetch_opts: &pkg.fetch_opts,
    };
    fetcher.fetch_post(&fetch_opts)
  }

  fn fetcher_for(&self, vcs: &VcsType, registry: &Registry) -> Result<Rc<dyn Fetcher>, FetchError> {
    if let VcsType::Ext(name) = vcs {
      return registry
        .fetch_type(name)
        .ok_or_else(|| FetchError::UnsupportedVcs(name.clone()));
    }

    self
      .fetchers
      .get(vcs.name())
      .cloned()
      .ok_or_else(|| FetchError::UnsupportedVcs(vcs.name().to_string()))
  }

  /// Verify a package cache file against its hash file, honouring the
  /// devmode relaxation rule.
  fn verify(&self, pkg: &Pkg, opts: &EngineOpts) -> Result<(), FetchError> {
    // DVCS, local and source-less types carry no cache file to verify.
    let Some(cache_file) = &pkg.cache_file else {
      return Ok(());
    };

    // Relaxation requires every condition: devmode engine, devmode-pinned
    // revision, internal package, explicit opt-in.
    if opts.in_devmode() && pkg.devmode && pkg.internal && pkg.devmode_ignore_cache {
      debug!(pkg = %pkg.name, "integrity check relaxed in devmode");
      return Ok(());
    }

    match hashcheck::verify_file(&pkg.hash_file, cache_file)? {
      HashVerify::Verified => Ok(()),
      HashVerify::NoHashFile => Ok(()),
    }
  }
}
