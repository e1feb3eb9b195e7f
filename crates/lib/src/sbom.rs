//! SBOM cache construction.
//!
//! The cache is the in-memory inventory of every loaded package; rendering
//! to CSV/HTML/JSON/SPDX documents is the consumer's concern.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::consts;
use crate::pkg::Pkg;
use crate::spdx::expression_tokens;

/// One package's inventory entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SbomEntry {
  pub name: String,
  pub version: String,
  pub revision: String,
  pub site: Option<String>,
  /// SPDX identifiers extracted from the package's license expressions.
  pub licenses: Vec<String>,
}

/// The in-memory SBOM cache for one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct SbomCache {
  /// Engine version that produced the inventory.
  pub generator: String,
  pub generated_at: DateTime<Utc>,
  /// Entries in dependency order.
  pub entries: Vec<SbomEntry>,
}

/// Build the SBOM cache from the sorted package list.
pub fn build_sbom_cache(pkgs: &[Pkg]) -> SbomCache {
  let entries = pkgs
    .iter()
    .map(|pkg| SbomEntry {
      name: pkg.name.clone(),
      version: pkg.version.clone(),
      revision: pkg.revision.clone(),
      site: pkg.site.clone(),
      licenses: pkg
        .license
        .iter()
        .flat_map(|expr| expression_tokens(expr).licenses)
        .collect(),
    })
    .collect();

  SbomCache {
    generator: format!("releng {}", consts::ENGINE_VERSION),
    generated_at: Utc::now(),
    entries,
  }
}
