//! Patch application for package sources.
//!
//! Patches are `*.patch` files in the package definition directory, applied
//! in lexicographic order with the standard `patch` tool. The first failure
//! aborts the stage.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::exec::{self, ExecError, RunOpts};
use crate::pkg::Pkg;

/// Errors from the patch stage.
#[derive(Debug, Error)]
pub enum PatchError {
  #[error("cannot enumerate patches in '{path}': {source}")]
  List {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("patch '{patch}' failed to apply: {source}")]
  Apply {
    patch: PathBuf,
    #[source]
    source: ExecError,
  },
}

/// Apply a package's patches to its patch tree. Returns how many applied.
pub fn apply_pkg_patches(pkg: &Pkg) -> Result<usize, PatchError> {
  let patches = list_patches(pkg)?;
  if patches.is_empty() {
    return Ok(0);
  }

  let target = pkg.patch_tree();
  for patch in &patches {
    info!(pkg = %pkg.name, patch = %patch.display(), "applying patch");

    let args = vec![
      "patch".to_string(),
      "--forward".to_string(),
      "--strip=1".to_string(),
      "--input".to_string(),
      patch.display().to_string(),
    ];
    exec::run(
      &args,
      &RunOpts {
        cwd: Some(&target),
        ..RunOpts::default()
      },
    )
    .map_err(|e| PatchError::Apply {
      patch: patch.clone(),
      source: e,
    })?;
  }

  Ok(patches.len())
}

/// Patches in the package definition directory, lexicographically ordered.
fn list_patches(pkg: &Pkg) -> Result<Vec<PathBuf>, PatchError> {
  let entries = match fs::read_dir(&pkg.def_dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => {
      return Err(PatchError::List {
        path: pkg.def_dir.clone(),
        source: e,
      });
    }
  };

  let mut patches: Vec<PathBuf> = entries
    .flatten()
    .map(|entry| entry.path())
    .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "patch"))
    .collect();
  patches.sort();
  Ok(patches)
}
