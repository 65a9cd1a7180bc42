//! The layered context a node executes in.
mod table;

use std::sync::Arc;

use serde_json::Value;

pub use crate::scope::table::Table;

use crate::ResultMap;
use crate::error::ReferenceFailure;

/// One layer of a [`ContextStack`].
#[derive(Debug)]
pub enum Frame {
    /// Immutable bindings, e.g. `$result` or values exposed by a reference.
    Bindings(ResultMap),
    /// The view a branch has on its group: completed siblings are visible,
    /// `key` names the branch itself.
    Branch { table: Arc<Table>, key: String },
    /// Hides `key` from every frame below.
    Shadow(String),
}

struct Link {
    frame: Frame,
    parent: Option<Arc<Link>>,
}

/// A persistent stack of scopes with newest-first lookup.
///
/// Pushing never mutates the receiver: it returns a new stack sharing the
/// old one as its tail, so sibling branches can extend a common prefix
/// independently.
#[derive(Clone, Default)]
pub struct ContextStack {
    top: Option<Arc<Link>>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack holding a single bindings frame.
    pub fn with_bindings(bindings: ResultMap) -> Self {
        Self::new().push(Frame::Bindings(bindings))
    }

    pub fn push(&self, frame: Frame) -> Self {
        Self {
            top: Some(Arc::new(Link {
                frame,
                parent: self.top.clone(),
            })),
        }
    }

    pub fn push_bindings(&self, bindings: ResultMap) -> Self {
        self.push(Frame::Bindings(bindings))
    }

    /// Frames from the most recently pushed to the oldest.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        let mut link = self.top.as_deref();
        std::iter::from_fn(move || {
            let current = link?;
            link = current.parent.as_deref();
            Some(&current.frame)
        })
    }

    /// Looks `key` up from the top of the stack down. Branches of a group
    /// only become visible once they have completed.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        for frame in self.frames() {
            match frame {
                Frame::Bindings(map) => {
                    if let Some(value) = map.get(key) {
                        return Some(value.clone());
                    }
                }
                Frame::Branch { table, .. } => {
                    if let Some(value) = table.completed(key) {
                        return Some(value);
                    }
                }
                Frame::Shadow(hidden) if hidden == key => return None,
                Frame::Shadow(_) => {}
            }
        }
        None
    }

    /// Nearest group that declares `key` as one of its branches.
    pub(crate) fn declaring_table(&self, key: &str) -> Result<Arc<Table>, ReferenceFailure> {
        for frame in self.frames() {
            if let Frame::Branch { table, key: own } = frame
                && table.declares(key)
            {
                if own == key {
                    return Err(ReferenceFailure::SelfReference);
                }
                return Ok(table.clone());
            }
        }
        Err(ReferenceFailure::Undeclared)
    }
}
