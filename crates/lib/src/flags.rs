//! Stage completion flags and run-mode flag files.
//!
//! Stage flags are zero-length marker files; their existence means "this
//! stage has completed for this package state". Most live under the package
//! build-output directory. The fetch and fetch-post flags live under a global
//! build-state directory instead, keyed by the package name-version slug, so
//! they survive a package build directory being removed.
//!
//! The devmode and local-sources run modes persist as small JSON blobs at the
//! project root.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts;
use crate::opts::{Devmode, EngineOpts};
use crate::pkg::Pkg;
use crate::stage::Stage;

/// Errors reading or writing run-mode flag files.
#[derive(Debug, Error)]
pub enum FlagError {
  #[error("failed to read flag file '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse flag file '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write flag file '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Global build-state directory holding fetch flags.
pub fn global_state_dir(opts: &EngineOpts) -> PathBuf {
  opts.build_dir.join(consts::STATE_DIR)
}

/// Marker file path for a stage of a package.
pub fn stage_flag_path(opts: &EngineOpts, pkg: &Pkg, stage: Stage) -> PathBuf {
  match stage {
    Stage::Fetch => global_state_dir(opts).join(format!("{}fetch-{}", consts::STAGE_FLAG_PREFIX, pkg.nv)),
    _ => pkg
      .build_output_dir
      .join(format!("{}{}", consts::STAGE_FLAG_PREFIX, stage.name())),
  }
}

/// Marker file path for the fetch-post step of a package.
pub fn fetch_post_flag_path(opts: &EngineOpts, pkg: &Pkg) -> PathBuf {
  global_state_dir(opts).join(format!("{}fetch-post-{}", consts::STAGE_FLAG_PREFIX, pkg.nv))
}

/// Create a zero-length marker file, creating parent directories as needed.
pub fn set_flag(path: &Path) -> io::Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::File::create(path)?;
  Ok(())
}

/// Remove a marker file; a missing file is not an error.
pub fn clear_flag(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Remove every stage flag of a package, including fetch and fetch-post.
pub fn clear_pkg_flags(opts: &EngineOpts, pkg: &Pkg) -> io::Result<()> {
  for stage in Stage::ALL {
    clear_flag(&stage_flag_path(opts, pkg, stage))?;
  }
  clear_flag(&fetch_post_flag_path(opts, pkg))?;
  debug!(pkg = %pkg.name, "cleared stage flags");
  Ok(())
}

#[derive(Serialize, Deserialize)]
struct DevmodeBlob {
  mode: serde_json::Value,
}

fn devmode_flag_path(root: &Path) -> PathBuf {
  root.join(consts::DEVMODE_FLAG)
}

/// Read the persisted development mode, if any.
///
/// The flag file holds `{"mode": true}` for the generic mode or
/// `{"mode": "<name>"}` for a named mode.
pub fn read_devmode_flag(root: &Path) -> Result<Option<Devmode>, FlagError> {
  let path = devmode_flag_path(root);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(FlagError::Read { path, source: e }),
  };

  let blob: DevmodeBlob = serde_json::from_str(&content).map_err(|e| FlagError::Parse {
    path: path.clone(),
    source: e,
  })?;

  match blob.mode {
    serde_json::Value::Bool(true) => Ok(Some(Devmode::Generic)),
    serde_json::Value::String(name) => Ok(Some(Devmode::Named(name))),
    _ => Ok(None),
  }
}

/// Persist the development mode at the project root.
pub fn write_devmode_flag(root: &Path, devmode: &Devmode) -> Result<(), FlagError> {
  let path = devmode_flag_path(root);
  let mode = match devmode {
    Devmode::Generic => serde_json::Value::Bool(true),
    Devmode::Named(name) => serde_json::Value::String(name.clone()),
  };
  let blob = DevmodeBlob { mode };
  let content = serde_json::to_string(&blob).expect("devmode blob serializes");
  fs::write(&path, content).map_err(|e| FlagError::Write { path, source: e })
}

/// Remove the persisted development mode.
pub fn clear_devmode_flag(root: &Path) -> io::Result<()> {
  clear_flag(&devmode_flag_path(root))
}

fn local_srcs_flag_path(root: &Path) -> PathBuf {
  root.join(consts::LOCAL_SRCS_FLAG)
}

/// Read the persisted local-sources map; the `*` key is the default entry.
pub fn read_local_srcs_flag(root: &Path) -> Result<BTreeMap<String, PathBuf>, FlagError> {
  let path = local_srcs_flag_path(root);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
    Err(e) => return Err(FlagError::Read { path, source: e }),
  };

  serde_json::from_str(&content).map_err(|e| FlagError::Parse { path, source: e })
}

/// Persist the local-sources map at the project root.
pub fn write_local_srcs_flag(root: &Path, map: &BTreeMap<String, PathBuf>) -> Result<(), FlagError> {
  let path = local_srcs_flag_path(root);
  let content = serde_json::to_string(map).expect("local-sources map serializes");
  fs::write(&path, content).map_err(|e| FlagError::Write { path, source: e })
}

/// Remove the persisted local-sources map.
pub fn clear_local_srcs_flag(root: &Path) -> io::Result<()> {
  clear_flag(&local_srcs_flag_path(root))
}
