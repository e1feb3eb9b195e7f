//! Hash-file parsing and cache-file verification.
//!
//! A package's hash file lists one entry per line: `<algorithm> <digest>
//! <filename>`. Blank lines and `#` comments are tolerated. Verification of
//! a cache file computes every digest listed for that file name and compares
//! them; a file with no matching entry fails rather than passing silently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use thiserror::Error;
use tracing::debug;

/// Errors from hash verification.
#[derive(Debug, Error)]
pub enum HashError {
  #[error("cannot read hash file '{path}': {source}")]
  ReadHashFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot read '{path}': {source}")]
  ReadTarget {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("hash file '{path}' line {line} is malformed (expected: <algorithm> <digest> <file>)")]
  Malformed { path: PathBuf, line: usize },

  #[error("unsupported hash algorithm '{algorithm}' in '{path}'")]
  UnsupportedAlgorithm { path: PathBuf, algorithm: String },

  #[error("no hash entry for '{file}' in '{path}'")]
  MissingEntry { path: PathBuf, file: String },

  #[error("hash mismatch for '{file}': {algorithm} expected {expected}, got {actual}")]
  Mismatch {
    file: String,
    algorithm: String,
    expected: String,
    actual: String,
  },
}

/// Outcome of a verification request.
#[derive(Debug, PartialEq, Eq)]
pub enum HashVerify {
  /// Every listed digest matched.
  Verified,
  /// The package defines no hash file; nothing was checked.
  NoHashFile,
}

#[derive(Debug)]
struct HashEntry {
  algorithm: String,
  digest: String,
  file: String,
}

/// Verify a cache file against the package hash file.
pub fn verify_file(hash_file: &Path, target: &Path) -> Result<HashVerify, HashError> {
  let content = match fs::read_to_string(hash_file) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashVerify::NoHashFile),
    Err(e) => {
      return Err(HashError::ReadHashFile {
        path: hash_file.to_path_buf(),
        source: e,
      });
    }
  };

  let entries = parse_entries(hash_file, &content)?;
  let target_name = target
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();

  let matching: Vec<&HashEntry> = entries.iter().filter(|e| e.file == target_name).collect();
  if matching.is_empty() {
    return Err(HashError::MissingEntry {
      path: hash_file.to_path_buf(),
      file: target_name,
    });
  }

  let data = fs::read(target).map_err(|e| HashError::ReadTarget {
    path: target.to_path_buf(),
    source: e,
  })?;

  for entry in matching {
    let actual = compute_digest(hash_file, &entry.algorithm, &data)?;
    let expected = entry.digest.to_lowercase();
    if actual != expected {
      return Err(HashError::Mismatch {
        file: target_name,
        algorithm: entry.algorithm.clone(),
        expected,
        actual,
      });
    }
    debug!(file = %target_name, algorithm = %entry.algorithm, "hash verified");
  }

  Ok(HashVerify::Verified)
}

fn parse_entries(path: &Path, content: &str) -> Result<Vec<HashEntry>, HashError> {
  let mut entries = Vec::new();

  for (idx, line) in content.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let [algorithm, digest, file] = fields[..] else {
      return Err(HashError::Malformed {
        path: path.to_path_buf(),
        line: idx + 1,
      });
    };

    entries.push(HashEntry {
      algorithm: algorithm.to_lowercase(),
      digest: digest.to_string(),
      file: file.to_string(),
    });
  }

  Ok(entries)
}

fn compute_digest(path: &Path, algorithm: &str, data: &[u8]) -> Result<String, HashError> {
  let digest = match algorithm {
    "sha1" => hex::encode(Sha1::digest(data)),
    "sha224" => hex::encode(Sha224::digest(data)),
    "sha256" => hex::encode(Sha256::digest(data)),
    "sha384" => hex::encode(Sha384::digest(data)),
    "sha512" => hex::encode(Sha512::digest(data)),
    other => {
      return Err(HashError::UnsupportedAlgorithm {
        path: path.to_path_buf(),
        algorithm: other.to_string(),
      });
    }
  };
  Ok(digest)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_target(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
  }

  #[test]
  fn missing_hash_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");
    let result = verify_file(&dir.path().join("pkg.hash"), &target).unwrap();
    assert_eq!(result, HashVerify::NoHashFile);
  }

  #[test]
  fn matching_sha256_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");
    let digest = hex::encode(Sha256::digest(b"data"));

    let hash_file = dir.path().join("pkg.hash");
    fs::write(&hash_file, format!("# checksums\n\nsha256 {digest} pkg-1.0.tgz\n")).unwrap();

    assert_eq!(verify_file(&hash_file, &target).unwrap(), HashVerify::Verified);
  }

  #[test]
  fn mismatch_is_reported_with_both_digests() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");

    let hash_file = dir.path().join("pkg.hash");
    fs::write(&hash_file, format!("sha1 {} pkg-1.0.tgz\n", "de".repeat(20))).unwrap();

    let err = verify_file(&hash_file, &target).unwrap_err();
    assert!(matches!(err, HashError::Mismatch { algorithm, .. } if algorithm == "sha1"));
  }

  #[test]
  fn multiple_algorithms_all_checked() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");

    let hash_file = dir.path().join("pkg.hash");
    fs::write(
      &hash_file,
      format!(
        "sha256 {} pkg-1.0.tgz\nsha512 {} pkg-1.0.tgz\n",
        hex::encode(Sha256::digest(b"data")),
        hex::encode(Sha512::digest(b"data"))
      ),
    )
    .unwrap();

    assert_eq!(verify_file(&hash_file, &target).unwrap(), HashVerify::Verified);
  }

  #[test]
  fn entry_for_other_file_does_not_count() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");

    let hash_file = dir.path().join("pkg.hash");
    fs::write(
      &hash_file,
      format!("sha256 {} other-2.0.tgz\n", hex::encode(Sha256::digest(b"data"))),
    )
    .unwrap();

    assert!(matches!(
      verify_file(&hash_file, &target),
      Err(HashError::MissingEntry { .. })
    ));
  }

  #[test]
  fn unknown_algorithm_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");

    let hash_file = dir.path().join("pkg.hash");
    fs::write(&hash_file, "crc32 deadbeef pkg-1.0.tgz\n").unwrap();

    assert!(matches!(
      verify_file(&hash_file, &target),
      Err(HashError::UnsupportedAlgorithm { .. })
    ));
  }

  #[test]
  fn malformed_line_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_target(dir.path(), "pkg-1.0.tgz", b"data");

    let hash_file = dir.path().join("pkg.hash");
    fs::write(&hash_file, "sha256 onlytwo\n").unwrap();

    assert!(matches!(
      verify_file(&hash_file, &target),
      Err(HashError::Malformed { line: 1, .. })
    ));
  }
}
