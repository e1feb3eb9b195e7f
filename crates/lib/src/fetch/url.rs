//! Built-in URL and file fetchers.
//!
//! The URL fetcher downloads over HTTP(S) with bounded retries for
//! transient failures and optional mirror preference. The file fetcher
//! copies from `file://` URLs or plain paths.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::consts;
use crate::fetch::types::{FetchError, FetchOptions, Fetcher};

/// Delay between transient-failure retries, scaled by attempt.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fetches archive files over HTTP(S).
pub struct UrlFetcher {
  mirror: Option<String>,
  only_mirror: bool,
}

impl UrlFetcher {
  pub fn new(mirror: Option<String>, only_mirror: bool) -> Self {
    UrlFetcher { mirror, only_mirror }
  }

  /// Candidate URLs in request order: the expanded mirror first, then the
  /// original site unless `only_mirror` forbids the fallback.
  fn candidates(&self, opts: &FetchOptions<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(mirror) = &self.mirror {
      urls.push(expand_mirror(mirror, opts));
    }
    if !(self.only_mirror && self.mirror.is_some()) {
      urls.push(opts.site.to_string());
    }
    urls
  }
}

impl Fetcher for UrlFetcher {
  fn fetch(&self, opts: &FetchOptions<'_>) -> Result<(), FetchError> {
    let cache_file = opts.cache_file.ok_or_else(|| FetchError::InvalidSite {
      site: opts.site.to_string(),
      vcs: "url".to_string(),
    })?;

    let mut last_err = None;
    for url in self.candidates(opts) {
      match download(&url, cache_file) {
        Ok(()) => return Ok(()),
        Err(e) => {
          warn!(pkg = opts.name, url = %url, error = %e, "download failed");
          last_err = Some(e);
        }
      }
    }

    Err(last_err.unwrap_or_else(|| FetchError::InvalidSite {
      site: opts.site.to_string(),
      vcs: "url".to_string(),
    }))
  }
}

/// Expand a mirror base URL for a package.
///
/// `{name}` and `{version}` placeholders substitute; a mirror without
/// placeholders has the site's basename appended.
fn expand_mirror(mirror: &str, opts: &FetchOptions<'_>) -> String {
  if mirror.contains("{name}") || mirror.contains("{version}") {
    mirror.replace("{name}", opts.name).replace("{version}", opts.version)
  } else {
    let path = opts.site.split(['?', '#']).next().unwrap_or(opts.site);
    let basename = path.rsplit('/').next().unwrap_or(path);
    format!("{}/{}", mirror.trim_end_matches('/'), basename)
  }
}

/// Download a URL into the cache file, retrying transient failures.
///
/// 5xx responses and transport errors retry with bounded attempts; other
/// error statuses fail immediately. The payload lands in a temporary file
/// renamed into place so interrupted downloads never look cached.
fn download(url: &str, cache_file: &Path) -> Result<(), FetchError> {
  let mut last_message = String::new();

  for attempt in 1..=consts::FETCH_ATTEMPTS {
    if attempt > 1 {
      std::thread::sleep(RETRY_DELAY * (attempt - 1));
      debug!(url, attempt, "retrying download");
    }

    match request(url, cache_file) {
      Ok(()) => {
        info!(url, file = %cache_file.display(), "downloaded");
        return Ok(());
      }
      Err(Transient::Retryable(message)) => last_message = message,
      Err(Transient::Fatal(message)) => {
        return Err(FetchError::Http {
          url: url.to_string(),
          message,
        });
      }
    }
  }

  Err(FetchError::Http {
    url: url.to_string(),
    message: last_message,
  })
}

enum Transient {
  Retryable(String),
  Fatal(String),
}

fn request(url: &str, cache_file: &Path) -> Result<(), Transient> {
  let response = reqwest::blocking::get(url).map_err(|e| Transient::Retryable(e.to_string()))?;

  let status = response.status();
  if status.is_server_error() {
    return Err(Transient::Retryable(format!("server error: {status}")));
  }
  if !status.is_success() {
    return Err(Transient::Fatal(format!("unexpected status: {status}")));
  }

  let bytes = response.bytes().map_err(|e| Transient::Retryable(e.to_string()))?;

  let parent = cache_file.parent().unwrap_or(Path::new("."));
  fs::create_dir_all(parent).map_err(|e| Transient::Fatal(e.to_string()))?;
  let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Transient::Fatal(e.to_string()))?;
  fs::write(tmp.path(), &bytes).map_err(|e| Transient::Fatal(e.to_string()))?;
  tmp
    .persist(cache_file)
    .map_err(|e| Transient::Fatal(e.error.to_string()))?;

  Ok(())
}

/// Copies archives from `file://` URLs or plain filesystem paths.
pub struct FileFetcher;

impl Fetcher for FileFetcher {
  fn fetch(&self, opts: &FetchOptions<'_>) -> Result<(), FetchError> {
    let cache_file = opts.cache_file.ok_or_else(|| FetchError::InvalidSite {
      site: opts.site.to_string(),
      vcs: "file".to_string(),
    })?;

    let source = opts.site.strip_prefix("file://").unwrap_or(opts.site);
    let source = Path::new(source);
    if !source.is_file() {
      return Err(FetchError::InvalidSite {
        site: opts.site.to_string(),
        vcs: "file".to_string(),
      });
    }

    if let Some(parent) = cache_file.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::copy(source, cache_file)?;
    info!(pkg = opts.name, file = %cache_file.display(), "copied local archive");
    Ok(())
  }
}
