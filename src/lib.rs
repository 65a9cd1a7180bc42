#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod capability;
mod engine;
mod error;
mod node;
mod plan;
mod scope;
mod template;
#[cfg(feature = "logging")]
mod utils;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

pub use crate::capability::{Capabilities, Capability, Invocation};
pub use crate::engine::{Diagnostics, Status, TaskExecution, TaskHandle};
pub use crate::error::*;
pub use crate::node::{Group, Leaf, Node, NodeKind, RESULT, THROTTLE, WAIT, classify, parse_alias};
pub use crate::plan::validate;
pub use crate::scope::{ContextStack, Frame, Table};
pub use crate::template::{resolve, resolve_value, to_text};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

use crate::engine::Engine;

/// Results keyed by branch name, or `value` for a literal leaf.
pub type ResultMap = serde_json::Map<String, Value>;

/// How long a reference waits for a sibling unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Concurrently running branches per group unless configured otherwise.
pub const DEFAULT_THROTTLE: usize = 30;

/// Host settings that can be loaded from a file, e.g.
///
/// ```json
/// {
///   "timeout_secs": 60,
///   "throttle": 4,
///   "defaults": { "$llm": { "model": "small", "temperature": 0 } }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upper bound for reference waits, `0` disables it.
    pub timeout_secs: Option<u64>,
    /// Concurrently running branches per group, `0` means unbounded.
    pub throttle: Option<usize>,
    /// Options merged under every invocation of a marker.
    pub defaults: HashMap<String, ResultMap>,
}

/// A configured interpreter. Every call to [`run`](Braid::run) starts an
/// independent braid sharing only the registered capabilities.
#[derive(Debug, Clone)]
pub struct Braid {
    capabilities: Arc<Capabilities>,
    timeout: Option<Duration>,
    throttle: Option<usize>,
}

impl Braid {
    pub fn config() -> Config {
        Config::new()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Classifies `raw` against the registered capability markers.
    pub fn classify(&self, raw: &Value) -> Result<Node> {
        classify(raw, &self.capabilities)
    }

    /// Classifies, validates and starts `raw`.
    ///
    /// Malformed input and references that can never resolve are reported
    /// here, before any task is spawned. Everything else surfaces through
    /// [`TaskHandle::wait`].
    pub fn run(&self, raw: &Value) -> Result<TaskHandle> {
        self.run_with(raw, ResultMap::new())
    }

    /// Like [`run`](Braid::run), with `bindings` visible to every template in
    /// the braid.
    pub fn run_with(&self, raw: &Value, bindings: ResultMap) -> Result<TaskHandle> {
        let node = self.classify(raw)?;
        self.run_node(node, ContextStack::with_bindings(bindings))
    }

    pub fn run_node(&self, node: Node, stack: ContextStack) -> Result<TaskHandle> {
        validate(&node)?;

        tracing::info!("starting braid rooted at a {:?}", node.kind());

        let engine = Engine::new(self.capabilities.clone())
            .with_timeout(self.timeout)
            .with_throttle(self.throttle);

        Ok(engine.execute(Arc::new(node), stack))
    }
}

/// A builder for [`Braid`].
pub struct Config {
    capabilities: Capabilities,
    defaults: Vec<(String, ResultMap)>,
    timeout: Option<Duration>,
    throttle: Option<usize>,
}

impl Config {
    fn new() -> Self {
        Self {
            capabilities: Capabilities::new(),
            defaults: Vec::new(),
            timeout: Some(DEFAULT_TIMEOUT),
            throttle: Some(DEFAULT_THROTTLE),
        }
    }

    /// Registers `handler` for nodes carrying `marker`, e.g. `$llm`.
    pub fn capability(mut self, marker: impl Into<String>, handler: impl Capability + 'static) -> Self {
        self.capabilities.register(marker, handler);
        self
    }

    pub fn capability_fn<F>(mut self, marker: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Invocation) -> std::result::Result<Value, CapabilityFailure> + Send + Sync + 'static,
    {
        self.capabilities.register_fn(marker, func);
        self
    }

    /// Options merged under every invocation of `marker`. Applied when the
    /// braid is finished, so the order relative to
    /// [`capability`](Config::capability) does not matter.
    pub fn defaults(mut self, marker: impl Into<String>, defaults: ResultMap) -> Self {
        self.defaults.push((marker.into(), defaults));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// References wait for their siblings for as long as it takes.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Bounds concurrently running branches of every group without a
    /// `$throttle` of its own. `0` removes the bound.
    pub fn throttle(mut self, permits: usize) -> Self {
        self.throttle = (permits > 0).then_some(permits);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        match settings.timeout_secs {
            Some(0) => self = self.no_timeout(),
            Some(secs) => self = self.timeout(Duration::from_secs(secs)),
            None => {}
        }

        if let Some(permits) = settings.throttle {
            self = self.throttle(permits);
        }

        let mut defaults: Vec<_> = settings.defaults.into_iter().collect();
        defaults.sort_by(|a, b| a.0.cmp(&b.0));
        self.defaults.extend(defaults);
        self
    }

    pub fn finish(mut self) -> Braid {
        for (marker, defaults) in self.defaults {
            if !self.capabilities.set_defaults(&marker, defaults) {
                tracing::warn!("ignoring defaults for unregistered capability '{marker}'");
            }
        }

        Braid {
            capabilities: Arc::new(self.capabilities),
            timeout: self.timeout,
            throttle: self.throttle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_settings_from_json() {
        let settings: Settings = serde_json::from_value(json!({
            "timeout_secs": 5,
            "defaults": {"$llm": {"model": "small"}},
        }))
        .unwrap();

        assert_eq!(settings.timeout_secs, Some(5));
        assert_eq!(settings.throttle, None);

        let braid = Braid::config()
            .settings(settings)
            .capability_fn("$llm", |inv| Ok(json!(inv.option_str("model"))))
            .finish();

        assert_eq!(braid.timeout, Some(Duration::from_secs(5)));

        let result = braid.run(&json!({"$llm": "hi"})).unwrap().wait().unwrap();
        assert_eq!(result["value"], json!("small"));
    }

    #[test]
    fn test_defaults_config() {
        let braid = Braid::config().timeout(Duration::from_secs(1)).throttle(0).finish();
        assert_eq!(braid.timeout, Some(Duration::from_secs(1)));
        assert_eq!(braid.throttle, None);

        let braid = Braid::config().finish();
        assert_eq!(braid.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(braid.throttle, Some(DEFAULT_THROTTLE));
        assert!(braid.capabilities().markers().next().is_none());
    }

    #[test]
    fn test_run_rejects_before_spawning() {
        let braid = Braid::config().finish();

        let err = braid.run(&json!({"a": {"$nope": 1}})).unwrap_err();
        assert!(matches!(err, BraidError::MalformedNode { path, .. } if path == "a"));

        let err = braid.run(&json!({"a": "@a"})).unwrap_err();
        assert!(matches!(
            err.innermost(),
            BraidError::UnresolvedReference { reason: ReferenceFailure::SelfReference, .. }
        ));
    }

    #[test]
    fn test_run_with_initial_bindings() {
        let braid = Braid::config()
            .capability_fn("$echo", |inv| Ok(inv.payload.clone()))
            .finish();

        let mut bindings = ResultMap::new();
        bindings.insert("who".into(), json!("world"));

        let result = braid
            .run_with(&json!({"greet": {"$echo": "hello %(who)s"}}), bindings)
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(result, json!({"greet": {"value": "hello world"}}).as_object().unwrap().clone());
    }
}
