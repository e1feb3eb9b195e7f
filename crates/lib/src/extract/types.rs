//! The extractor contract.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::exec::ExecError;

/// Errors from the extract store or an extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("cannot open archive '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("archive '{path}' is corrupt: {message}")]
  Archive { path: PathBuf, message: String },

  #[error("no extractor for '{0}'")]
  Unsupported(PathBuf),

  #[error("archive member '{0}' escapes the extraction directory")]
  Traversal(String),

  #[error("cache for package '{pkg}' is missing: {path}")]
  MissingCache { pkg: String, path: PathBuf },

  #[error("build directory for package '{pkg}' is not populated: {path}")]
  MissingSources { pkg: String, path: PathBuf },

  #[error(transparent)]
  Tool(#[from] ExecError),

  #[error("io error during extraction: {0}")]
  Io(#[from] io::Error),
}

/// Inputs handed to an extractor for one package.
#[derive(Debug)]
pub struct ExtractOptions<'a> {
  pub name: &'a str,
  pub cache_dir: &'a Path,
  pub cache_file: Option<&'a Path>,
  pub revision: &'a str,
  /// Leading path components stripped from every archive member.
  pub strip_count: usize,
  /// Directory to populate.
  pub work_dir: &'a Path,
}

/// Populates a package's build directory from its cache.
pub trait Extractor {
  fn extract(&self, opts: &ExtractOptions<'_>) -> Result<(), ExtractError>;
}
