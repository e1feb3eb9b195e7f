//! Extension registry and lifecycle event dispatch.
//!
//! Extensions contribute custom fetch, extract and package types (names must
//! begin with `ext-`) and may subscribe to lifecycle events. Event listeners
//! carry an integer priority; lower values dispatch earlier and equal
//! priorities preserve subscription order. Every subscription is assigned a
//! monotonic id usable for disconnection.

use std::collections::BTreeMap;
use std::rc::Rc;

use semver::{Version, VersionReq};
use tracing::{debug, warn};

use crate::consts;
use crate::errors::RegistryError;
use crate::extract::Extractor;
use crate::fetch::Fetcher;
use crate::pipeline::PackageTypeHandler;
use crate::script_env::ScriptEnv;
use crate::stage::Stage;

/// Event emitted after the project configuration is parsed.
pub const EVENT_CONFIG_LOADED: &str = "config-loaded";
/// Event emitted before the post-build script runs.
pub const EVENT_POST_BUILD_STARTED: &str = "post-build-started";
/// Event emitted after the post-build script runs.
pub const EVENT_POST_BUILD_FINISHED: &str = "post-build-finished";

/// Name of the per-stage started/finished event, for stages that emit one.
pub fn stage_event(stage: Stage, finished: bool) -> Option<String> {
  let tag = match stage {
    Stage::Bootstrap => "bootstrap",
    Stage::Configure => "configure",
    Stage::Build => "build",
    Stage::Install => "install",
    Stage::Post => "postprocess",
    _ => return None,
  };
  let suffix = if finished { "finished" } else { "started" };
  Some(format!("package-{tag}-{suffix}"))
}

/// Keyword-style payload handed to event subscribers.
#[derive(Debug)]
pub struct EventPayload<'a> {
  /// Package the event concerns, when package-scoped.
  pub pkg: Option<&'a str>,
  /// The script environment active at emission time.
  pub script_env: &'a ScriptEnv,
}

/// An event subscriber.
pub type EventHandler = Box<dyn Fn(&EventPayload<'_>)>;

struct Listener {
  id: u64,
  priority: i32,
  seq: u64,
  handler: EventHandler,
}

/// A pluggable engine extension.
///
/// Implementations register their types and subscriptions in
/// [`Extension::setup`]; the engine rejects (with a warning, continuing the
/// run) extensions whose minimum engine version is not met.
pub trait Extension {
  /// Extension name, used in diagnostics.
  fn name(&self) -> &str;

  /// Minimum engine version requirement, as a semver requirement string.
  fn minimum_version(&self) -> Option<&str> {
    None
  }

  /// Register types and event subscriptions.
  fn setup(&self, registry: &mut Registry) -> Result<(), RegistryError>;
}

/// Tracks extension-contributed types and event subscribers.
#[derive(Default)]
pub struct Registry {
  fetch_types: BTreeMap<String, Rc<dyn Fetcher>>,
  extract_types: BTreeMap<String, Rc<dyn Extractor>>,
  package_types: BTreeMap<String, Rc<dyn PackageTypeHandler>>,
  listeners: BTreeMap<String, Vec<Listener>>,
  next_id: u64,
}

impl Registry {
  pub fn new() -> Self {
    Registry::default()
  }

  /// Register an extension, honouring its minimum engine version.
  ///
  /// Version-incompatible extensions are skipped with a warning; the engine
  /// continues without them.
  pub fn register_extension(&mut self, ext: &dyn Extension) -> Result<(), RegistryError> {
    if let Some(required) = ext.minimum_version() {
      if let Err(e) = check_version(ext.name(), required) {
        warn!(extension = ext.name(), error = %e, "skipping incompatible extension");
        return Ok(());
      }
    }

    debug!(extension = ext.name(), "registering extension");
    ext.setup(self)
  }

  /// Register a custom fetch type. The name must begin with `ext-` and be
  /// unique across fetch types.
  pub fn register_fetch_type(&mut self, name: &str, fetcher: Rc<dyn Fetcher>) -> Result<(), RegistryError> {
    check_ext_name(name)?;
    if self.fetch_types.contains_key(name) {
      return Err(RegistryError::DuplicateType {
        kind: "fetch",
        name: name.to_string(),
      });
    }
    self.fetch_types.insert(name.to_string(), fetcher);
    Ok(())
  }

  /// Register a custom extract type. The name must begin with `ext-` and be
  /// unique across extract types.
  pub fn register_extract_type(&mut self, name: &str, extractor: Rc<dyn Extractor>) -> Result<(), RegistryError> {
    check_ext_name(name)?;
    if self.extract_types.contains_key(name) {
      return Err(RegistryError::DuplicateType {
        kind: "extract",
        name: name.to_string(),
      });
    }
    self.extract_types.insert(name.to_string(), extractor);
    Ok(())
  }

  /// Register a custom package type. The name must begin with `ext-` and be
  /// unique across package types.
  pub fn register_package_type(
    &mut self,
    name: &str,
    handler: Rc<dyn PackageTypeHandler>,
  ) -> Result<(), RegistryError> {
    check_ext_name(name)?;
    if self.package_types.contains_key(name) {
      return Err(RegistryError::DuplicateType {
        kind: "package",
        name: name.to_string(),
      });
    }
    self.package_types.insert(name.to_string(), handler);
    Ok(())
  }

  /// Look up an extension fetch type.
  pub fn fetch_type(&self, name: &str) -> Option<Rc<dyn Fetcher>> {
    self.fetch_types.get(name).cloned()
  }

  /// Look up an extension extract type.
  pub fn extract_type(&self, name: &str) -> Option<Rc<dyn Extractor>> {
    self.extract_types.get(name).cloned()
  }

  /// Look up an extension package type.
  pub fn package_type(&self, name: &str) -> Option<Rc<dyn PackageTypeHandler>> {
    self.package_types.get(name).cloned()
  }

  /// Subscribe to a named event. Returns the listener id.
  pub fn subscribe(&mut self, event: &str, priority: i32, handler: EventHandler) -> u64 {
    self.next_id += 1;
    let id = self.next_id;
    let seq = self.next_id;

    let listeners = self.listeners.entry(event.to_string()).or_default();
    listeners.push(Listener {
      id,
      priority,
      seq,
      handler,
    });
    listeners.sort_by_key(|l| (l.priority, l.seq));
    id
  }

  /// Remove a previously registered listener. Returns whether it existed.
  pub fn unsubscribe(&mut self, id: u64) -> bool {
    for listeners in self.listeners.values_mut() {
      if let Some(pos) = listeners.iter().position(|l| l.id == id) {
        listeners.remove(pos);
        return true;
      }
    }
    false
  }

  /// Dispatch an event to its subscribers in priority order.
  pub fn emit(&self, event: &str, payload: &EventPayload<'_>) {
    if let Some(listeners) = self.listeners.get(event) {
      debug!(event, subscribers = listeners.len(), "dispatching event");
      for listener in listeners {
        (listener.handler)(payload);
      }
    }
  }
}

fn check_ext_name(name: &str) -> Result<(), RegistryError> {
  if name.starts_with(consts::EXT_PREFIX) {
    Ok(())
  } else {
    Err(RegistryError::InvalidTypeName(name.to_string()))
  }
}

/// Verify an extension's minimum engine version requirement.
fn check_version(name: &str, required: &str) -> Result<(), RegistryError> {
  let req = VersionReq::parse(&format!(">={required}")).map_err(|_| RegistryError::InvalidVersionRequirement {
    name: name.to_string(),
    required: required.to_string(),
  })?;
  let running = Version::parse(consts::ENGINE_VERSION).expect("engine version parses");

  if req.matches(&running) {
    Ok(())
  } else {
    Err(RegistryError::IncompatibleVersion {
      name: name.to_string(),
      required: required.to_string(),
      running: running.to_string(),
    })
  }
}
