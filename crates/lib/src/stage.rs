//! Stage vocabulary for the per-package pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a package's lifecycle.
///
/// Stages run strictly in the order of [`Stage::ALL`]. Each stage is gated by
/// a marker file whose existence means the stage has completed for the
/// package's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
  Fetch,
  Extract,
  Patch,
  License,
  Bootstrap,
  Configure,
  Build,
  Install,
  Post,
}

impl Stage {
  /// All stages, in execution order.
  pub const ALL: [Stage; 9] = [
    Stage::Fetch,
    Stage::Extract,
    Stage::Patch,
    Stage::License,
    Stage::Bootstrap,
    Stage::Configure,
    Stage::Build,
    Stage::Install,
    Stage::Post,
  ];

  /// Stage name as used in flag files and event names.
  pub fn name(self) -> &'static str {
    match self {
      Stage::Fetch => "fetch",
      Stage::Extract => "extract",
      Stage::Patch => "patch",
      Stage::License => "license",
      Stage::Bootstrap => "bootstrap",
      Stage::Configure => "configure",
      Stage::Build => "build",
      Stage::Install => "install",
      Stage::Post => "post",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}
