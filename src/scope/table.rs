use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::ResultMap;
use crate::error::{BraidError, ReferenceFailure};

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Running,
    Completed(Value),
    Failed(BraidError),
}

impl Slot {
    fn is_settled(&self) -> bool {
        matches!(self, Slot::Completed(_) | Slot::Failed(_))
    }
}

/// Result table of one parallel group.
///
/// Every branch key is declared up front, so a reference can tell a sibling
/// that has not finished yet from a key that does not exist. Each slot is
/// written exactly once; waiters are woken through a single condvar.
#[derive(Debug)]
pub struct Table {
    keys: Vec<String>,
    slots: Mutex<Vec<Slot>>,
    changed: Condvar,
}

impl Table {
    pub(crate) fn new(keys: Vec<String>) -> Self {
        let slots = vec![Slot::Pending; keys.len()];
        Self {
            keys,
            slots: Mutex::new(slots),
            changed: Condvar::new(),
        }
    }

    pub fn declares(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        // A panicking writer never leaves a slot half-written, the vector
        // only ever holds whole values.
        self.slots.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub(crate) fn start(&self, key: &str) {
        if let Some(i) = self.position(key) {
            let mut slots = self.lock();
            if matches!(slots[i], Slot::Pending) {
                slots[i] = Slot::Running;
            }
        }
    }

    /// Publishes the outcome of branch `key` and wakes every waiter.
    pub(crate) fn settle(&self, key: &str, outcome: Result<ResultMap, BraidError>) -> Result<(), BraidError> {
        let i = self
            .position(key)
            .ok_or_else(|| BraidError::KeyOverride(key.to_string()))?;

        {
            let mut slots = self.lock();
            if slots[i].is_settled() {
                return Err(BraidError::KeyOverride(key.to_string()));
            }
            slots[i] = match outcome {
                Ok(map) => Slot::Completed(Value::Object(map)),
                Err(err) => Slot::Failed(err),
            };
        }

        self.changed.notify_all();
        Ok(())
    }

    /// Value of `key` if its branch has completed. Never blocks on the
    /// branch itself.
    pub fn completed(&self, key: &str) -> Option<Value> {
        let i = self.position(key)?;
        match &self.lock()[i] {
            Slot::Completed(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Blocks until branch `key` settles, or until `timeout` passes.
    pub(crate) fn wait_for(&self, key: &str, timeout: Option<Duration>) -> Result<Value, ReferenceFailure> {
        let i = self.position(key).ok_or(ReferenceFailure::Undeclared)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slots = self.lock();

        loop {
            match &slots[i] {
                Slot::Completed(value) => return Ok(value.clone()),
                Slot::Failed(err) => return Err(ReferenceFailure::Failed(Box::new(err.clone()))),
                Slot::Pending | Slot::Running => {}
            }

            slots = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ReferenceFailure::TimedOut(timeout.unwrap_or_default()));
                    }
                    self.changed
                        .wait_timeout(slots, deadline - now)
                        .unwrap_or_else(|poison| poison.into_inner())
                        .0
                }
                None => self
                    .changed
                    .wait(slots)
                    .unwrap_or_else(|poison| poison.into_inner()),
            };
        }
    }

    /// Blocks until every branch has settled. `on_failure` runs once, at the
    /// first moment any branch is seen failed.
    pub(crate) fn wait_settled(&self, mut on_failure: impl FnMut()) {
        let mut reported = false;
        let mut slots = self.lock();

        loop {
            if !reported && slots.iter().any(|slot| matches!(slot, Slot::Failed(_))) {
                reported = true;
                on_failure();
            }

            if slots.iter().all(Slot::is_settled) {
                return;
            }

            slots = self
                .changed
                .wait(slots)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Results of the branches that completed so far.
    pub fn partial(&self) -> ResultMap {
        let slots = self.lock();
        self.keys
            .iter()
            .zip(slots.iter())
            .filter_map(|(key, slot)| match slot {
                Slot::Completed(value) => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Merged outcome once every slot is settled: the first failure in
    /// declared key order, or the union of all results.
    pub(crate) fn outcome(&self) -> Result<ResultMap, BraidError> {
        let slots = self.lock();
        let mut merged = ResultMap::new();

        for (key, slot) in self.keys.iter().zip(slots.iter()) {
            match slot {
                Slot::Completed(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                Slot::Failed(err) => return Err(err.clone().in_branch(key)),
                Slot::Pending | Slot::Running => {
                    return Err(BraidError::UnresolvedReference {
                        key: key.clone(),
                        reason: ReferenceFailure::Undeclared,
                    });
                }
            }
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn map(value: Value) -> ResultMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_write_once() {
        let table = Table::new(vec!["a".into()]);
        table.settle("a", Ok(map(json!({"value": 1})))).unwrap();

        let err = table.settle("a", Ok(map(json!({"value": 2})))).unwrap_err();
        assert!(matches!(err, BraidError::KeyOverride(key) if key == "a"));
        assert_eq!(table.completed("a"), Some(json!({"value": 1})));
    }

    #[test]
    fn test_wait_for_wakes_on_settle() {
        let table = Arc::new(Table::new(vec!["slow".into()]));

        let writer = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.settle("slow", Ok(map(json!({"value": "done"})))).unwrap();
            })
        };

        let value = table.wait_for("slow", Some(Duration::from_secs(5))).unwrap();
        writer.join().unwrap();

        assert_eq!(value, json!({"value": "done"}));
    }

    #[test]
    fn test_wait_for_times_out() {
        let table = Table::new(vec!["never".into()]);
        let err = table
            .wait_for("never", Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, ReferenceFailure::TimedOut(_)));
    }

    #[test]
    fn test_outcome_uses_declared_order() {
        let table = Table::new(vec!["a".into(), "b".into(), "c".into()]);
        table.settle("c", Err(BraidError::KeyOverride("c-err".into()))).unwrap();
        table.settle("b", Err(BraidError::KeyOverride("b-err".into()))).unwrap();
        table.settle("a", Ok(map(json!({"value": 1})))).unwrap();

        let err = table.outcome().unwrap_err();
        assert_eq!(err.branch_path(), vec!["b"]);
        assert_eq!(table.partial(), map(json!({"a": {"value": 1}})));
    }
}
