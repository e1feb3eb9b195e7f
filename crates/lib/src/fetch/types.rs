//! The fetcher contract.
//!
//! Protocol fetchers (git, svn, cvs, ...) plug in behind the [`Fetcher`]
//! trait; built-in URL and file handlers live alongside. On a successful
//! fetch, the package's cache file or cache directory exists and is valid
//! for its VCS type.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::exec::ExecError;
use crate::hashcheck::HashError;
use crate::pkg::OptsMap;

/// Errors from the fetch store or a fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("request for '{url}' failed: {message}")]
  Http { url: String, message: String },

  #[error("no fetcher available for vcs type '{0}'")]
  UnsupportedVcs(String),

  #[error("fetch for '{pkg}' completed without producing '{path}'")]
  MissingCache { pkg: String, path: PathBuf },

  #[error("site '{site}' is not usable for a {vcs} fetch")]
  InvalidSite { site: String, vcs: String },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error(transparent)]
  Tool(#[from] ExecError),

  #[error("io error during fetch: {0}")]
  Io(#[from] io::Error),
}

/// Inputs handed to a fetcher for one package.
#[derive(Debug)]
pub struct FetchOptions<'a> {
  pub name: &'a str,
  pub site: &'a str,
  pub version: &'a str,
  pub revision: &'a str,
  pub cache_dir: &'a Path,
  pub cache_file: Option<&'a Path>,
  /// Cached state should be refreshed even if it looks current.
  pub ignore_cache: bool,
  pub fetch_opts: &'a OptsMap,
}

/// Acquires a package's sources into its cache.
pub trait Fetcher {
  /// Fetch into the cache file or cache directory named in `opts`.
  fn fetch(&self, opts: &FetchOptions<'_>) -> Result<(), FetchError>;

  /// Post-fetch follow-up work (submodule population and similar). The
  /// default does nothing.
  fn fetch_post(&self, _opts: &FetchOptions<'_>) -> Result<(), FetchError> {
    Ok(())
  }
}
