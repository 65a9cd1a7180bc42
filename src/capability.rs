//! Pluggable leaf executors keyed by their marker.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::CapabilityFailure;

/// A fully resolved request for a capability, handed to its handler.
///
/// For `{"$llm": "Hello %(name)s", "model": "m"}` the `marker` is `$llm`, the
/// `payload` is the resolved prompt and `options` holds `model` together with
/// any defaults registered for the marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub marker: String,
    pub payload: Value,
    pub options: Map<String, Value>,
}

impl Invocation {
    /// Convenience accessor for string options such as `model`.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// External executor for capability leaves.
///
/// Implementations are called from worker threads and may block for as long
/// as the provider needs; the owning task completes or fails with the call.
pub trait Capability: Send + Sync {
    fn invoke(&self, invocation: &Invocation) -> Result<Value, CapabilityFailure>;
}

impl<F> Capability for F
where
    F: Fn(&Invocation) -> Result<Value, CapabilityFailure> + Send + Sync,
{
    fn invoke(&self, invocation: &Invocation) -> Result<Value, CapabilityFailure> {
        self(invocation)
    }
}

#[derive(Clone)]
struct Registered {
    handler: Arc<dyn Capability>,
    defaults: Map<String, Value>,
}

/// Table of capability handlers, consulted by both the classifier (to
/// recognize marker keys) and the engine (to dispatch leaves).
#[derive(Clone, Default)]
pub struct Capabilities {
    table: HashMap<String, Registered>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `marker`, replacing an earlier registration
    /// but keeping its defaults.
    pub fn register(&mut self, marker: impl Into<String>, handler: impl Capability + 'static) {
        let marker = marker.into();
        let defaults = self
            .table
            .remove(&marker)
            .map(|old| old.defaults)
            .unwrap_or_default();

        self.table.insert(
            marker,
            Registered {
                handler: Arc::new(handler),
                defaults,
            },
        );
    }

    /// Registers a closure as the handler for `marker`.
    pub fn register_fn<F>(&mut self, marker: impl Into<String>, func: F)
    where
        F: Fn(&Invocation) -> Result<Value, CapabilityFailure> + Send + Sync + 'static,
    {
        self.register(marker, func);
    }

    /// Options merged under every invocation of `marker`. Explicit options on
    /// the node win over these.
    pub fn set_defaults(&mut self, marker: &str, defaults: Map<String, Value>) -> bool {
        match self.table.get_mut(marker) {
            Some(registered) => {
                registered.defaults = defaults;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, marker: &str) -> bool {
        self.table.contains_key(marker)
    }

    pub fn markers(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub(crate) fn prepare(&self, mut invocation: Invocation) -> Option<(Arc<dyn Capability>, Invocation)> {
        let registered = self.table.get(&invocation.marker)?;

        for (key, value) in &registered.defaults {
            if !invocation.options.contains_key(key) {
                invocation.options.insert(key.clone(), value.clone());
            }
        }

        Some((registered.handler.clone(), invocation))
    }
}

impl Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut markers: Vec<_> = self.markers().collect();
        markers.sort();
        write!(f, "Capabilities({})", markers.join(", "))
    }
}
