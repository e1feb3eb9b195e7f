//! Shared DVCS cache index.
//!
//! Two packages fetching from the same DVCS URL share a single local clone.
//! The index maps a hash of the site URL to the cache directory name claimed
//! by the first package that used it; it is loaded once at engine start and
//! persisted after every load-time mutation.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts;

/// Characters of the site hash kept for index keys.
const SITE_KEY_LEN: usize = 20;

/// Errors persisting the index.
#[derive(Debug, Error)]
pub enum DvcsDbError {
  #[error("failed to write dvcs index '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbBlob {
  #[serde(default)]
  entries: BTreeMap<String, String>,
}

/// Persistent site-hash to cache-directory-name mapping.
#[derive(Debug)]
pub struct DvcsDb {
  path: PathBuf,
  entries: BTreeMap<String, String>,
  dirty: bool,
}

impl DvcsDb {
  /// Load the index from the cache root; a missing or unreadable index
  /// starts empty (a corrupt one is reported and discarded).
  pub fn load(cache_root: &Path) -> Self {
    let path = cache_root.join(consts::DVCS_DB);

    let entries = match fs::read_to_string(&path) {
      Ok(content) => match serde_json::from_str::<DbBlob>(&content) {
        Ok(blob) => blob.entries,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "discarding corrupt dvcs index");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "cannot read dvcs index");
        BTreeMap::new()
      }
    };

    DvcsDb {
      path,
      entries,
      dirty: false,
    }
  }

  /// The cache directory name a site should use.
  ///
  /// An indexed site returns the directory recorded by the first package
  /// that used it; an unindexed site records and returns `name`.
  pub fn cache_dir_for(&mut self, site: &str, name: &str) -> String {
    let key = site_key(site);
    if let Some(existing) = self.entries.get(&key) {
      if existing != name {
        debug!(site, pkg = name, shared = %existing, "sharing dvcs cache");
      }
      return existing.clone();
    }

    self.entries.insert(key, name.to_string());
    self.dirty = true;
    name.to_string()
  }

  /// Persist the index if it changed since load. Writes go through a
  /// temporary file renamed into place.
  pub fn save(&mut self) -> Result<(), DvcsDbError> {
    if !self.dirty {
      return Ok(());
    }

    let blob = DbBlob {
      entries: self.entries.clone(),
    };
    let content = serde_json::to_string(&blob).expect("dvcs index serializes");

    let parent = self.path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| DvcsDbError::Write {
      path: self.path.clone(),
      source: e,
    })?;

    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| DvcsDbError::Write {
      path: self.path.clone(),
      source: e,
    })?;
    fs::write(tmp.path(), content).map_err(|e| DvcsDbError::Write {
      path: self.path.clone(),
      source: e,
    })?;
    tmp.persist(&self.path).map_err(|e| DvcsDbError::Write {
      path: self.path.clone(),
      source: e.error,
    })?;

    self.dirty = false;
    Ok(())
  }
}

/// Truncated site-URL hash used as an index key.
fn site_key(site: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(site.as_bytes());
  let full = hex::encode(hasher.finalize());
  full[..SITE_KEY_LEN].to_string()
}
