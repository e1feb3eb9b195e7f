//! Bundled SPDX license data and expression token validation.
//!
//! The bundled set covers the identifiers routinely seen in third-party
//! firmware components; projects extend it through the `extra_licenses` and
//! `extra_license_exceptions` configuration settings.

use std::collections::BTreeSet;

/// SPDX license identifiers bundled with the engine.
const LICENSES: &[&str] = &[
  "0BSD",
  "AFL-3.0",
  "AGPL-3.0-only",
  "AGPL-3.0-or-later",
  "Apache-1.1",
  "Apache-2.0",
  "Artistic-1.0",
  "Artistic-2.0",
  "BSD-1-Clause",
  "BSD-2-Clause",
  "BSD-2-Clause-Patent",
  "BSD-3-Clause",
  "BSD-3-Clause-Clear",
  "BSD-4-Clause",
  "BSD-4-Clause-UC",
  "BSL-1.0",
  "CC-BY-3.0",
  "CC-BY-4.0",
  "CC-BY-SA-3.0",
  "CC-BY-SA-4.0",
  "CC0-1.0",
  "CDDL-1.0",
  "CDDL-1.1",
  "CPL-1.0",
  "curl",
  "EPL-1.0",
  "EPL-2.0",
  "EUPL-1.2",
  "FSFAP",
  "FTL",
  "GFDL-1.3-only",
  "GFDL-1.3-or-later",
  "GPL-1.0-only",
  "GPL-1.0-or-later",
  "GPL-2.0-only",
  "GPL-2.0-or-later",
  "GPL-3.0-only",
  "GPL-3.0-or-later",
  "HPND",
  "ICU",
  "IJG",
  "ISC",
  "LGPL-2.0-only",
  "LGPL-2.0-or-later",
  "LGPL-2.1-only",
  "LGPL-2.1-or-later",
  "LGPL-3.0-only",
  "LGPL-3.0-or-later",
  "Libpng",
  "libtiff",
  "MIT",
  "MIT-0",
  "MPL-1.1",
  "MPL-2.0",
  "NCSA",
  "OFL-1.1",
  "OLDAP-2.8",
  "OpenSSL",
  "PSF-2.0",
  "Python-2.0",
  "Ruby",
  "SSH-OpenSSH",
  "Unicode-3.0",
  "Unicode-DFS-2016",
  "Unlicense",
  "Vim",
  "W3C",
  "WTFPL",
  "X11",
  "Zlib",
  "zlib-acknowledgement",
  "ZPL-2.1",
];

/// Deprecated SPDX license identifiers and their replacements.
const DEPRECATED: &[(&str, &str)] = &[
  ("AGPL-3.0", "AGPL-3.0-only"),
  ("GFDL-1.3", "GFDL-1.3-only"),
  ("GPL-1.0", "GPL-1.0-only"),
  ("GPL-2.0", "GPL-2.0-only"),
  ("GPL-2.0+", "GPL-2.0-or-later"),
  ("GPL-3.0", "GPL-3.0-only"),
  ("GPL-3.0+", "GPL-3.0-or-later"),
  ("LGPL-2.0", "LGPL-2.0-only"),
  ("LGPL-2.1", "LGPL-2.1-only"),
  ("LGPL-2.1+", "LGPL-2.1-or-later"),
  ("LGPL-3.0", "LGPL-3.0-only"),
];

/// SPDX license exception identifiers bundled with the engine.
const EXCEPTIONS: &[&str] = &[
  "Autoconf-exception-2.0",
  "Autoconf-exception-3.0",
  "Bison-exception-2.2",
  "Classpath-exception-2.0",
  "GCC-exception-2.0",
  "GCC-exception-3.1",
  "LLVM-exception",
  "Linux-syscall-note",
  "OpenSSL-exception",
  "WxWindows-exception-3.1",
];

/// Bundled SPDX data augmented with project-declared extras.
#[derive(Debug, Default)]
pub struct SpdxDb {
  extra_licenses: BTreeSet<String>,
  extra_exceptions: BTreeSet<String>,
}

impl SpdxDb {
  pub fn new() -> Self {
    SpdxDb::default()
  }

  /// Augment the bundled data with project-declared identifiers.
  pub fn with_extras(extra_licenses: &[String], extra_exceptions: &[String]) -> Self {
    SpdxDb {
      extra_licenses: extra_licenses.iter().cloned().collect(),
      extra_exceptions: extra_exceptions.iter().cloned().collect(),
    }
  }

  pub fn known_license(&self, id: &str) -> bool {
    LICENSES.contains(&id) || DEPRECATED.iter().any(|(old, _)| *old == id) || self.extra_licenses.contains(id)
  }

  pub fn known_exception(&self, id: &str) -> bool {
    EXCEPTIONS.contains(&id) || self.extra_exceptions.contains(id)
  }

  /// The replacement identifier for a deprecated license id, if deprecated.
  pub fn deprecated_replacement(&self, id: &str) -> Option<&'static str> {
    DEPRECATED
      .iter()
      .find(|(old, _)| *old == id)
      .map(|(_, replacement)| *replacement)
  }
}

/// License and exception tokens of an SPDX expression.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpressionTokens {
  pub licenses: Vec<String>,
  pub exceptions: Vec<String>,
}

/// Split an SPDX expression into its license and exception identifiers.
///
/// Operators (`AND`, `OR`, `WITH`) and parentheses are structural; the token
/// following `WITH` is an exception. A trailing `+` is stripped from license
/// ids (the or-later marker, not part of the identifier).
pub fn expression_tokens(expression: &str) -> ExpressionTokens {
  let mut tokens = ExpressionTokens::default();
  let mut expect_exception = false;

  for raw in expression.replace(['(', ')'], " ").split_whitespace() {
    match raw {
      "AND" | "OR" => {}
      "WITH" => expect_exception = true,
      token => {
        if expect_exception {
          tokens.exceptions.push(token.to_string());
          expect_exception = false;
        } else {
          let token = token.strip_suffix('+').filter(|t| !t.is_empty()).unwrap_or(token);
          tokens.licenses.push(token.to_string());
        }
      }
    }
  }

  tokens
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bundled_ids_are_known() {
    let db = SpdxDb::new();
    assert!(db.known_license("MIT"));
    assert!(db.known_license("GPL-2.0-or-later"));
    assert!(db.known_exception("Classpath-exception-2.0"));
    assert!(!db.known_license("Made-Up-1.0"));
  }

  #[test]
  fn deprecated_ids_resolve_to_replacements() {
    let db = SpdxDb::new();
    assert_eq!(db.deprecated_replacement("GPL-2.0"), Some("GPL-2.0-only"));
    assert_eq!(db.deprecated_replacement("MIT"), None);
    // deprecated ids still count as known for recognition purposes
    assert!(db.known_license("GPL-2.0"));
  }

  #[test]
  fn extras_extend_the_bundled_set() {
    let db = SpdxDb::with_extras(&["Corp-Proprietary-1.0".to_string()], &["Corp-exception".to_string()]);
    assert!(db.known_license("Corp-Proprietary-1.0"));
    assert!(db.known_exception("Corp-exception"));
  }

  #[test]
  fn expression_token_extraction() {
    let tokens = expression_tokens("(MIT OR Apache-2.0) AND GPL-2.0-only WITH Classpath-exception-2.0");
    assert_eq!(tokens.licenses, vec!["MIT", "Apache-2.0", "GPL-2.0-only"]);
    assert_eq!(tokens.exceptions, vec!["Classpath-exception-2.0"]);
  }

  #[test]
  fn or_later_suffix_is_stripped() {
    let tokens = expression_tokens("GPL-2.0+");
    assert_eq!(tokens.licenses, vec!["GPL-2.0"]);
  }
}
