//! Clean actions: project-wide and per-package tree removal.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::flags;
use crate::opts::EngineOpts;
use crate::pkg::Pkg;

/// Remove a directory tree; a missing tree is not an error.
fn remove_tree(path: &Path) -> io::Result<()> {
  match fs::remove_dir_all(path) {
    Ok(()) => {
      debug!(path = %path.display(), "removed");
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// `clean`: remove the build, host, staging, symbols, target and license
/// trees. Caches and downloads survive.
pub fn clean(opts: &EngineOpts) -> io::Result<()> {
  info!("cleaning output trees");
  remove_tree(&opts.build_dir)?;
  remove_tree(&opts.host_dir)?;
  remove_tree(&opts.license_dir)?;
  remove_tree(&opts.staging_dir)?;
  remove_tree(&opts.symbols_dir)?;
  remove_tree(&opts.target_dir)?;
  Ok(())
}

/// `mrproper`: `clean` plus the whole output directory and the persisted
/// run-mode flags.
pub fn mrproper(opts: &EngineOpts) -> io::Result<()> {
  clean(opts)?;
  info!("removing output directory and mode flags");
  remove_tree(&opts.out_dir)?;
  flags::clear_devmode_flag(&opts.root_dir)?;
  flags::clear_local_srcs_flag(&opts.root_dir)?;
  Ok(())
}

/// `distclean`: `mrproper` plus the cache and download directories.
pub fn distclean(opts: &EngineOpts) -> io::Result<()> {
  mrproper(opts)?;
  info!("removing cache and download directories");
  remove_tree(&opts.cache_dir)?;
  remove_tree(&opts.dl_dir)?;
  Ok(())
}

/// `<pkg>-clean`: remove the package's build directory and stage flags.
pub fn clean_pkg(opts: &EngineOpts, pkg: &Pkg) -> io::Result<()> {
  info!(pkg = %pkg.name, "cleaning package");
  if !pkg.local_srcs && pkg.vcs_type != crate::pkg::VcsType::Local {
    remove_tree(&pkg.build_dir)?;
  }
  flags::clear_pkg_flags(opts, pkg)
}

/// `<pkg>-distclean`: `<pkg>-clean` plus the package's cache.
pub fn distclean_pkg(opts: &EngineOpts, pkg: &Pkg) -> io::Result<()> {
  clean_pkg(opts, pkg)?;
  info!(pkg = %pkg.name, "removing package cache");
  if let Some(cache_file) = &pkg.cache_file {
    match fs::remove_file(cache_file) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }
  }
  remove_tree(&pkg.cache_dir)
}

/// `<pkg>-fresh`: clear the package's stage flags so every stage re-runs;
/// on-disk state is left alone.
pub fn fresh_pkg(opts: &EngineOpts, pkg: &Pkg) -> io::Result<()> {
  info!(pkg = %pkg.name, "resetting package stage flags");
  flags::clear_pkg_flags(opts, pkg)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn opts_with_trees() -> (tempfile::TempDir, EngineOpts) {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = EngineOpts::new(tmp.path());
    opts.finalize();

    for dir in [
      &opts.build_dir,
      &opts.host_dir,
      &opts.staging_dir,
      &opts.target_dir,
      &opts.cache_dir,
      &opts.dl_dir,
    ] {
      fs::create_dir_all(dir).unwrap();
      fs::write(dir.join("marker"), "x").unwrap();
    }
    (tmp, opts)
  }

  #[test]
  fn clean_spares_caches() {
    let (_tmp, opts) = opts_with_trees();
    clean(&opts).unwrap();

    assert!(!opts.build_dir.exists());
    assert!(!opts.host_dir.exists());
    assert!(!opts.target_dir.exists());
    assert!(opts.cache_dir.exists());
    assert!(opts.dl_dir.exists());
  }

  #[test]
  fn mrproper_removes_output_and_mode_flags() {
    let (_tmp, opts) = opts_with_trees();
    flags::write_devmode_flag(&opts.root_dir, &crate::opts::Devmode::Generic).unwrap();

    mrproper(&opts).unwrap();

    assert!(!opts.out_dir.exists());
    assert_eq!(flags::read_devmode_flag(&opts.root_dir).unwrap(), None);
    assert!(opts.cache_dir.exists());
  }

  #[test]
  fn distclean_removes_everything() {
    let (_tmp, opts) = opts_with_trees();
    distclean(&opts).unwrap();

    assert!(!opts.out_dir.exists());
    assert!(!opts.cache_dir.exists());
    assert!(!opts.dl_dir.exists());
  }
}
