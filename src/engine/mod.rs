//! The recursive interpreter turning classified nodes into running tasks.
mod diagnostics;
mod handle;
mod throttle;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::Level;

pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};
pub use crate::engine::handle::{Status, TaskHandle};

use crate::ResultMap;
use crate::capability::{Capabilities, Invocation};
use crate::engine::throttle::{Lease, Throttle};
use crate::error::{BraidError, Result};
use crate::node::{Group, Leaf, Node, RESULT, join};
use crate::scope::{ContextStack, Frame, Table};
use crate::template::{placeholders, resolve_value};

/// Executes nodes against a context stack.
///
/// An engine is cheap to clone; all clones share the capability table and
/// the diagnostics of the run they were created for.
#[derive(Clone)]
pub struct Engine {
    capabilities: Arc<Capabilities>,
    timeout: Option<Duration>,
    throttle: Option<usize>,
    diagnostics: Arc<Diagnostics>,
}

impl Engine {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self {
            capabilities,
            timeout: None,
            throttle: None,
            diagnostics: Arc::default(),
        }
    }

    /// Upper bound on how long a reference waits for a sibling.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default bound on concurrently running branches per group, used when a
    /// group has no `$throttle` of its own.
    pub fn with_throttle(mut self, throttle: Option<usize>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Starts `node` and returns immediately. Literals settle on the spot;
    /// everything else runs on its own thread.
    pub fn execute(&self, node: Arc<Node>, stack: ContextStack) -> TaskHandle {
        if let Node::Leaf(Leaf::Literal(value)) = node.as_ref() {
            return TaskHandle::finished("", Ok(literal(value)), self.diagnostics.clone());
        }

        self.spawn(String::new(), node, stack, None, None)
    }

    /// Runs `node` on a new named thread. When `slot` is given the outcome is
    /// also published into that group table under the key.
    fn spawn(
        &self,
        path: String,
        node: Arc<Node>,
        stack: ContextStack,
        slot: Option<(Arc<Table>, String)>,
        throttle: Option<Arc<Throttle>>,
    ) -> TaskHandle {
        let handle = TaskHandle::new(path.clone(), self.diagnostics.clone());

        let engine = self.clone();
        let task = handle.clone();
        let publish = slot.clone();

        let spawned = thread::Builder::new()
            .name(format!("t.{}", if path.is_empty() { "$" } else { &path }))
            .spawn(move || {
                let lease = Lease::acquire(throttle);

                task.start();
                if let Some((table, key)) = &publish {
                    table.start(key);
                }

                let span = tracing::span!(Level::INFO, "task", name = %task.name());
                let _enter = span.enter();

                let start = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    engine.evaluate(&node, task.name(), &stack, &task, &lease)
                }))
                .unwrap_or_else(|payload| {
                    Err(BraidError::Panicked {
                        name: task.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    })
                });

                engine.diagnostics.record(TaskExecution {
                    name: task.name().to_string(),
                    start,
                    duration: start.elapsed(),
                    failed: outcome.is_err(),
                });
                drop(lease);

                // Groups only pass on what a branch already reported.
                if let Err(err) = &outcome
                    && !matches!(err, BraidError::Branch { .. })
                {
                    tracing::warn!("task failed: {err:#}");
                }

                if let Some((table, key)) = &publish
                    && let Err(err) = table.settle(key, outcome.clone())
                {
                    tracing::error!("couldn't publish branch result: {err}");
                }

                task.settle(outcome);
            });

        match spawned {
            Ok(thread) => handle.attach_thread(thread),
            Err(err) => {
                let err = BraidError::Spawn {
                    name: path,
                    source: Arc::new(err),
                };
                if let Some((table, key)) = &slot {
                    let _ = table.settle(key, Err(err.clone()));
                }
                handle.settle(Err(err));
            }
        }

        handle
    }

    /// Runs `node` to completion on the calling thread.
    fn evaluate(
        &self,
        node: &Node,
        path: &str,
        stack: &ContextStack,
        task: &TaskHandle,
        lease: &Lease,
    ) -> Result<ResultMap> {
        match node {
            Node::Leaf(Leaf::Literal(value)) => Ok(literal(value)),
            Node::Leaf(Leaf::Invoke(invocation)) => self.invoke(invocation, path, stack),
            Node::Reference(keys) => {
                let mut values = self.join(keys, path, stack, lease)?;
                if let Some(upstream) = stack.lookup(RESULT) {
                    values.insert(RESULT.to_string(), upstream);
                }
                Ok(values)
            }
            Node::Chain(steps) => self.chain(steps, path, stack, task, lease),
            Node::ParallelGroup(group) => self.group(group, path, stack, task, lease),
        }
    }

    fn group(
        &self,
        group: &Group,
        path: &str,
        stack: &ContextStack,
        task: &TaskHandle,
        lease: &Lease,
    ) -> Result<ResultMap> {
        let keys = group.entries.iter().map(|(key, _)| key.clone()).collect();
        let table = Arc::new(Table::new(keys));
        task.attach_table(table.clone());

        let throttle = group
            .throttle
            .or(self.throttle)
            .map(|permits| Arc::new(Throttle::new(permits)));

        tracing::info!(
            "starting group '{}' with {} branches",
            shown(path),
            group.entries.len()
        );

        let branches: Vec<_> = group
            .entries
            .iter()
            .map(|(key, child)| {
                let branch = stack.push(Frame::Branch {
                    table: table.clone(),
                    key: key.clone(),
                });
                let handle = self.spawn(
                    join(path, key),
                    child.clone(),
                    branch,
                    Some((table.clone(), key.clone())),
                    throttle.clone(),
                );
                task.adopt(handle.clone());
                handle
            })
            .collect();

        lease.suspend(|| {
            table.wait_settled(|| task.mark_failed());

            for branch in &branches {
                // The table already holds the outcome, this only reaps the thread.
                let _ = branch.wait();
            }
        });

        tracing::debug!("group '{}' settled", shown(path));
        table.outcome()
    }

    fn chain(
        &self,
        steps: &[Arc<Node>],
        path: &str,
        stack: &ContextStack,
        task: &TaskHandle,
        lease: &Lease,
    ) -> Result<ResultMap> {
        let mut scope = stack.push(Frame::Shadow(RESULT.to_string()));
        let mut last = ResultMap::new();

        for (i, step) in steps.iter().enumerate() {
            let step_path = join(path, &i.to_string());
            tracing::debug!("chain step '{step_path}'");

            match step.as_ref() {
                Node::Reference(keys) => {
                    let values = self.join(keys, &step_path, &scope, lease)?;
                    scope = scope.push_bindings(values.clone());

                    last = values;
                    if let Some(upstream) = scope.lookup(RESULT) {
                        last.insert(RESULT.to_string(), upstream);
                    }
                }
                other => {
                    last = self.evaluate(other, &step_path, &scope, task, lease)?;

                    let mut bindings = Map::new();
                    bindings.insert(RESULT.to_string(), Value::Object(last.clone()));
                    scope = scope.push_bindings(bindings);
                }
            }
        }

        Ok(last)
    }

    /// Blocks until every key has completed and returns their values. The
    /// throttle permit is lent out for the duration of the wait.
    fn join(&self, keys: &[String], path: &str, stack: &ContextStack, lease: &Lease) -> Result<ResultMap> {
        let mut values = ResultMap::new();

        for key in keys {
            let unresolved = |reason| BraidError::UnresolvedReference {
                key: key.clone(),
                reason,
            };

            let table = stack.declaring_table(key).map_err(unresolved)?;
            tracing::debug!("'{}' waits for '{}'", shown(path), key);

            let value = lease
                .suspend(|| table.wait_for(key, self.timeout))
                .map_err(unresolved)?;
            values.insert(key.clone(), value);
        }

        Ok(values)
    }

    fn invoke(&self, invocation: &Invocation, path: &str, stack: &ContextStack) -> Result<ResultMap> {
        let options = resolve_options(&invocation.options, path, stack)?;
        let local = stack.push_bindings(options.clone());

        let resolved = Invocation {
            marker: invocation.marker.clone(),
            payload: resolve_value(&invocation.payload, &local)?,
            options,
        };

        let (handler, resolved) = self.capabilities.prepare(resolved).ok_or_else(|| {
            BraidError::malformed(
                path,
                format!("no capability registered for '{}'", invocation.marker),
            )
        })?;

        tracing::info!("invoking '{}' at '{}'", resolved.marker, shown(path));

        match handler.invoke(&resolved) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(value) => Ok(literal(&value)),
            Err(err) => Err(BraidError::capability(&resolved.marker, err)),
        }
    }
}

fn literal(value: &Value) -> ResultMap {
    let mut map = ResultMap::new();
    map.insert("value".to_string(), value.clone());
    map
}

/// Resolves the sibling options of a capability node. An option may name
/// another option, which is then resolved first; naming itself reaches past
/// the options to the enclosing scope.
fn resolve_options(options: &ResultMap, path: &str, stack: &ContextStack) -> Result<ResultMap> {
    let mut resolved = ResultMap::new();
    let mut visiting = Vec::new();

    for key in options.keys() {
        resolve_option(key, options, path, stack, &mut resolved, &mut visiting)?;
    }

    Ok(options
        .keys()
        .filter_map(|key| Some((key.clone(), resolved.get(key)?.clone())))
        .collect())
}

fn resolve_option(
    key: &str,
    options: &ResultMap,
    path: &str,
    stack: &ContextStack,
    resolved: &mut ResultMap,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(key) {
        return Ok(());
    }
    if visiting.iter().any(|k| k == key) {
        return Err(BraidError::malformed(
            path,
            format!("option '{key}' depends on itself via {}", visiting.join(" -> ")),
        ));
    }

    let Some(raw) = options.get(key) else {
        return Ok(());
    };

    visiting.push(key.to_string());
    for name in placeholders(raw) {
        let dep = if options.contains_key(&name) {
            name.as_str()
        } else {
            name.split('.').next().unwrap_or(name.as_str())
        };
        if dep != key && options.contains_key(dep) {
            resolve_option(dep, options, path, stack, resolved, visiting)?;
        }
    }
    visiting.pop();

    let value = resolve_value(raw, &stack.push_bindings(resolved.clone()))?;
    resolved.insert(key.to_string(), value);
    Ok(())
}

fn shown(path: &str) -> &str {
    if path.is_empty() { "$" } else { path }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
