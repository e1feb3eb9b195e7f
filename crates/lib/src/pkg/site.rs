//! Site string interpretation: VCS prefixes and implied types.

use crate::pkg::VcsType;

/// Result of interpreting a raw site value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
  /// VCS type implied by the site, if any.
  pub vcs: Option<VcsType>,
  /// The site with any `<vcs>+` prefix stripped.
  pub site: String,
}

/// `<tag>+` prefixes that both select a VCS type and are stripped.
const PREFIXES: &[(&str, VcsType)] = &[
  ("brz+", VcsType::Brz),
  ("bzr+", VcsType::Bzr),
  ("cvs+", VcsType::Cvs),
  ("file+", VcsType::File),
  ("git+", VcsType::Git),
  ("hg+", VcsType::Hg),
  ("p4+", VcsType::Perforce),
  ("rsync+", VcsType::Rsync),
  ("scp+", VcsType::Scp),
  ("svn+", VcsType::Svn),
];

/// CVS connection-method prefixes; these stay part of the site.
const CVS_ROOTS: &[&str] = &[":ext:", ":extssh:", ":gserver:", ":kserver:", ":pserver:", ":server:"];

/// Interpret a raw site value.
///
/// `git+https://...` style prefixes select the VCS type and are stripped.
/// CVSROOT-style prefixes, `file://` URLs and a `.git` suffix imply a type
/// without altering the site.
pub fn parse_site(raw: &str) -> SiteInfo {
  for (prefix, vcs) in PREFIXES {
    if let Some(stripped) = raw.strip_prefix(prefix) {
      return SiteInfo {
        vcs: Some(vcs.clone()),
        site: stripped.to_string(),
      };
    }
  }

  if CVS_ROOTS.iter().any(|root| raw.starts_with(root)) {
    return SiteInfo {
      vcs: Some(VcsType::Cvs),
      site: raw.to_string(),
    };
  }

  if raw.starts_with("file://") {
    return SiteInfo {
      vcs: Some(VcsType::File),
      site: raw.to_string(),
    };
  }

  if raw.ends_with(".git") {
    return SiteInfo {
      vcs: Some(VcsType::Git),
      site: raw.to_string(),
    };
  }

  SiteInfo {
    vcs: None,
    site: raw.to_string(),
  }
}
