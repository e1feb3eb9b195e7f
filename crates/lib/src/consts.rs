//! Engine-wide constants: version, file names and the default layout.

/// Engine version used for extension minimum-version checks.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Preferred project configuration file name.
pub const CONFIG_NAME: &str = "releng-tool.rt";

/// Legacy configuration file names, recognised with a deprecation warning.
pub const CONFIG_NAMES_LEGACY: &[&str] = &["releng-tool", "releng"];

/// Optional configuration overrides script, evaluated after the configuration.
pub const CONFIG_OVERRIDES_NAME: &str = "releng-tool-overrides.rt";

/// Project post-build script name.
pub const POST_BUILD_NAME: &str = "releng-tool-post-build.rt";

/// Default package definition directory under the project root.
pub const PKG_DIR: &str = "package";

/// Definition and script file extension.
pub const DEF_EXT: &str = "rt";

// Default directory layout, relative to the resolved root.
pub const CACHE_DIR: &str = "cache";
pub const DL_DIR: &str = "dl";
pub const OUTPUT_DIR: &str = "output";
pub const BUILD_DIR: &str = "build";
pub const HOST_DIR: &str = "host";
pub const IMAGES_DIR: &str = "images";
pub const LICENSE_DIR: &str = "licenses";
pub const STAGING_DIR: &str = "staging";
pub const SYMBOLS_DIR: &str = "symbols";
pub const TARGET_DIR: &str = "target";

/// Prefix for per-stage marker files.
pub const STAGE_FLAG_PREFIX: &str = ".releng_tool-stage-";

/// Global build-state directory under the build output root; holds fetch
/// flags, which must survive the removal of a package build directory.
pub const STATE_DIR: &str = ".releng-tool";

/// Development-mode flag file at the project root.
pub const DEVMODE_FLAG: &str = ".releng-flag-devmode";

/// Local-sources flag file at the project root.
pub const LOCAL_SRCS_FLAG: &str = ".releng-flag-local-sources";

/// DVCS shared-cache index file under the cache root.
pub const DVCS_DB: &str = ".dvcsdb";

/// Build-output directory created inside the build directory for
/// out-of-source package types.
pub const OUT_OF_SOURCE_DIR: &str = "releng-output";

/// Directory holding in-tree sources for local-VCS packages, relative to the
/// package definition directory.
pub const LOCAL_SRC_DIR: &str = "local";

/// Sysroot prefix applied to the install trees unless a package overrides it.
#[cfg(not(windows))]
pub const DEFAULT_SYSROOT_PREFIX: &str = "/usr";
#[cfg(windows)]
pub const DEFAULT_SYSROOT_PREFIX: &str = "";

/// Name prefix required for extension-registered fetch, extract and package
/// types.
pub const EXT_PREFIX: &str = "ext-";

/// Bounded attempt count for transient URL fetch failures.
pub const FETCH_ATTEMPTS: u32 = 3;

/// Quirk flag disabling the prerequisite host-tools check.
pub const QUIRK_NO_PREREQUISITES: &str = "releng.disable_prerequisites_check";
