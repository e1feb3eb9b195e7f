//! releng-lib: release-engineering build orchestration engine.
//!
//! Given a project declaring a set of packages, each with a version-control
//! source, optional patches and a build recipe, the engine fetches, extracts,
//! patches, configures, builds and installs every package in dependency
//! order, producing populated host, staging, target and images trees.
//!
//! The main entry point is [`Engine`], configured through [`EngineOpts`].
//! Project and package definitions are Lua scripts evaluated in a prepared
//! runtime (see the `lua` module); protocol fetchers, archive extractors and
//! build-system drivers plug in through the `registry` and the `fetch`,
//! `extract` and `pipeline` traits.

pub mod clean;
pub mod consts;
pub mod dvcsdb;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod extract;
pub mod fetch;
pub mod flags;
pub mod hashcheck;
pub mod license;
pub mod lua;
pub mod opts;
pub mod patch;
pub mod pipeline;
pub mod pkg;
pub mod registry;
pub mod sbom;
pub mod script_env;
pub mod spdx;
pub mod stage;
pub mod stage_env;

pub use engine::Engine;
pub use errors::{RelengError, Result};
pub use opts::{Devmode, EngineAction, EngineOpts, GlobalAction, PkgAction};
pub use stage::Stage;
