//! Subprocess execution for external tools and stage commands.
//!
//! All invocations run synchronously. Output is either streamed to the
//! parent's stdio (the default for build tools, so users watch progress) or
//! captured for callers that consume it. Non-zero exit statuses surface as
//! [`ExecError::ExitStatus`], which stages map to their typed failures.

use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

/// Errors from subprocess execution.
#[derive(Debug, Error)]
pub enum ExecError {
  #[error("empty command")]
  EmptyCommand,

  #[error("failed to spawn '{cmd}': {source}")]
  Spawn {
    cmd: String,
    #[source]
    source: io::Error,
  },

  #[error("command failed with exit code {code:?}: {cmd}")]
  ExitStatus { cmd: String, code: Option<i32> },
}

/// Invocation options for [`run`].
#[derive(Debug, Default)]
pub struct RunOpts<'a> {
  /// Working directory; inherits the process working directory when unset.
  pub cwd: Option<&'a Path>,
  /// Extra environment variables layered over the process environment.
  pub env: Option<&'a BTreeMap<String, String>>,
  /// Capture stdout instead of streaming it.
  pub capture: bool,
}

/// Run an external command to completion.
///
/// Returns captured stdout when [`RunOpts::capture`] is set, an empty string
/// otherwise. A non-zero exit status is an error either way.
pub fn run(args: &[String], opts: &RunOpts<'_>) -> Result<String, ExecError> {
  let (program, rest) = args.split_first().ok_or(ExecError::EmptyCommand)?;
  let display_cmd = args.join(" ");

  let mut command = Command::new(program);
  command.args(rest);

  if let Some(cwd) = opts.cwd {
    command.current_dir(cwd);
  }
  if let Some(extra) = opts.env {
    for (key, value) in extra {
      command.env(key, value);
    }
  }

  debug!(cmd = %display_cmd, cwd = ?opts.cwd, "running command");

  let output = if opts.capture {
    command.stderr(Stdio::inherit()).output()
  } else {
    command.status().map(|status| std::process::Output {
      status,
      stdout: Vec::new(),
      stderr: Vec::new(),
    })
  }
  .map_err(|e| ExecError::Spawn {
    cmd: display_cmd.clone(),
    source: e,
  })?;

  if !output.status.success() {
    return Err(ExecError::ExitStatus {
      cmd: display_cmd,
      code: output.status.code(),
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Locate a tool on the process search path.
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
  let paths = env::var_os("PATH")?;
  for dir in env::split_paths(&paths) {
    let candidate = dir.join(tool);
    if candidate.is_file() {
      return Some(candidate);
    }
    #[cfg(windows)]
    {
      let exe = dir.join(format!("{tool}.exe"));
      if exe.is_file() {
        return Some(exe);
      }
    }
  }
  None
}

/// Prepend a directory to the process search path.
///
/// Used to expose the host tools installed by earlier packages to later
/// stages. The engine is single-threaded; environment mutation is confined
/// to the driver and the scoped guards.
pub fn register_path(dir: &Path) {
  let current = env::var_os("PATH").unwrap_or_default();
  let mut parts = vec![dir.to_path_buf()];
  parts.extend(env::split_paths(&current));
  if let Ok(joined) = env::join_paths(parts) {
    unsafe { env::set_var("PATH", joined) };
  }
}
