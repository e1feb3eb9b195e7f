//! Built-in archive extraction: tar, gzip-compressed tar and zip.
//!
//! Every native handler strips the configured number of leading path
//! components and rejects members that would resolve outside the extraction
//! directory. The traversal guard is mandatory; it cannot be disabled per
//! package. Tar compressions without a native decoder (bzip2, xz, lzip,
//! zstd) hand off to the host `tar` tool, which applies the strip count
//! itself.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::info;

use crate::exec::{self, RunOpts};
use crate::extract::types::{ExtractError, ExtractOptions, Extractor};

/// Tar suffixes delegated to the host tar tool.
const TAR_TOOL_SUFFIXES: &[&str] = &[".tar.bz2", ".tar.lz", ".tar.xz", ".tar.zst"];

/// Extracts archive cache files, dispatching on the file extension.
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
  fn extract(&self, opts: &ExtractOptions<'_>) -> Result<(), ExtractError> {
    let archive = opts.cache_file.ok_or_else(|| ExtractError::MissingCache {
      pkg: opts.name.to_string(),
      path: opts.cache_dir.to_path_buf(),
    })?;
    if !archive.is_file() {
      return Err(ExtractError::MissingCache {
        pkg: opts.name.to_string(),
        path: archive.to_path_buf(),
      });
    }

    fs::create_dir_all(opts.work_dir)?;

    let name = archive.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      let file = open(archive)?;
      unpack_tar(GzDecoder::new(BufReader::new(file)), archive, opts)?;
    } else if name.ends_with(".tar") {
      let file = open(archive)?;
      unpack_tar(BufReader::new(file), archive, opts)?;
    } else if name.ends_with(".zip") {
      unpack_zip(archive, opts)?;
    } else if TAR_TOOL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
      unpack_with_tar_tool(archive, opts)?;
    } else {
      return Err(ExtractError::Unsupported(archive.to_path_buf()));
    }

    info!(pkg = opts.name, dir = %opts.work_dir.display(), "extracted");
    Ok(())
  }
}

fn open(path: &Path) -> Result<File, ExtractError> {
  File::open(path).map_err(|e| ExtractError::Open {
    path: path.to_path_buf(),
    source: e,
  })
}

fn unpack_tar<R: Read>(reader: R, archive: &Path, opts: &ExtractOptions<'_>) -> Result<(), ExtractError> {
  let mut tar = tar::Archive::new(reader);

  let entries = tar.entries().map_err(|e| ExtractError::Archive {
    path: archive.to_path_buf(),
    message: e.to_string(),
  })?;

  for entry in entries {
    let mut entry = entry.map_err(|e| ExtractError::Archive {
      path: archive.to_path_buf(),
      message: e.to_string(),
    })?;

    let member = entry
      .path()
      .map_err(|e| ExtractError::Archive {
        path: archive.to_path_buf(),
        message: e.to_string(),
      })?
      .into_owned();

    let Some(dest) = member_target(opts.work_dir, &member, opts.strip_count)? else {
      continue;
    };

    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    entry.unpack(&dest).map_err(|e| ExtractError::Archive {
      path: archive.to_path_buf(),
      message: e.to_string(),
    })?;
  }

  Ok(())
}

fn unpack_zip(archive: &Path, opts: &ExtractOptions<'_>) -> Result<(), ExtractError> {
  let file = open(archive)?;
  let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractError::Archive {
    path: archive.to_path_buf(),
    message: e.to_string(),
  })?;

  for index in 0..zip.len() {
    let mut member = zip.by_index(index).map_err(|e| ExtractError::Archive {
      path: archive.to_path_buf(),
      message: e.to_string(),
    })?;

    // enclosed_name already refuses absolute and parent-escaping names;
    // member_target re-checks after stripping.
    let member_path = member
      .enclosed_name()
      .ok_or_else(|| ExtractError::Traversal(member.name().to_string()))?;

    let Some(dest) = member_target(opts.work_dir, &member_path, opts.strip_count)? else {
      continue;
    };

    if member.is_dir() {
      fs::create_dir_all(&dest)?;
      continue;
    }

    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut out = File::create(&dest)?;
    std::io::copy(&mut member, &mut out)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = member.unix_mode() {
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
      }
    }
  }

  Ok(())
}

fn unpack_with_tar_tool(archive: &Path, opts: &ExtractOptions<'_>) -> Result<(), ExtractError> {
  let args = vec![
    "tar".to_string(),
    "--extract".to_string(),
    format!("--strip-components={}", opts.strip_count),
    "--directory".to_string(),
    opts.work_dir.display().to_string(),
    "--file".to_string(),
    archive.display().to_string(),
  ];
  exec::run(&args, &RunOpts::default())?;
  Ok(())
}

/// Resolve an archive member to its extraction target.
///
/// Strips `strip_count` leading components; returns `None` for members fully
/// consumed by stripping. Absolute members and any parent-directory
/// component are traversal errors.
pub(crate) fn member_target(dest: &Path, member: &Path, strip_count: usize) -> Result<Option<PathBuf>, ExtractError> {
  let mut parts = Vec::new();

  for component in member.components() {
    match component {
      Component::Normal(part) => parts.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
        return Err(ExtractError::Traversal(member.to_string_lossy().to_string()));
      }
    }
  }

  if parts.len() <= strip_count {
    return Ok(None);
  }

  let mut target = dest.to_path_buf();
  for part in &parts[strip_count..] {
    target.push(part);
  }
  Ok(Some(target))
}
