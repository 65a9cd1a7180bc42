use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error returned by userland capability handlers.
pub use anyhow::Error as CapabilityFailure;

/// Why a reference could not produce the values it was waiting for.
#[derive(Debug, Error, Clone)]
pub enum ReferenceFailure {
    #[error("no enclosing group declares this key")]
    Undeclared,

    #[error("the reference sits inside the branch it waits for")]
    SelfReference,

    #[error("branches wait on each other in a cycle")]
    Cycle,

    #[error("the referenced branch failed:\n{0}")]
    Failed(Box<BraidError>),

    #[error("the referenced branch did not settle within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error, Clone)]
pub enum BraidError {
    #[error("Malformed node at '{path}': {reason}")]
    MalformedNode { path: String, reason: String },

    #[error("Template key '{key}' is not bound in any visible scope")]
    UnresolvedTemplateKey { key: String },

    #[error("Reference to '{key}' could not be resolved: {reason}")]
    UnresolvedReference {
        key: String,
        reason: ReferenceFailure,
    },

    #[error("Capability '{marker}' failed: {error}")]
    Capability {
        marker: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Branch '{key}':\n{source}")]
    Branch {
        key: String,
        source: Box<BraidError>,
    },

    #[error("Key '{0}' was already settled in its group")]
    KeyOverride(String),

    #[error("Task '{name}' did not finish within {timeout:?}")]
    WaitTimeout { name: String, timeout: Duration },

    #[error("Task '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("Couldn't spawn a thread for task '{name}': {source}")]
    Spawn {
        name: String,
        source: Arc<std::io::Error>,
    },
}

impl BraidError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        BraidError::MalformedNode {
            path: if path.is_empty() { "$".into() } else { path.into() },
            reason: reason.into(),
        }
    }

    pub(crate) fn capability(marker: &str, err: anyhow::Error) -> Self {
        BraidError::Capability {
            marker: marker.into(),
            error: Arc::new(err),
        }
    }

    pub(crate) fn in_branch(self, key: &str) -> Self {
        BraidError::Branch {
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// The underlying failure with all branch attribution stripped.
    pub fn innermost(&self) -> &BraidError {
        let mut err = self;
        while let BraidError::Branch { source, .. } = err {
            err = source;
        }
        err
    }

    /// Keys of the branches the failure travelled through, outermost first.
    pub fn branch_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut err = self;
        while let BraidError::Branch { key, source } = err {
            path.push(key.as_str());
            err = source;
        }
        path
    }
}

pub type Result<T, E = BraidError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_attribution() {
        let err = BraidError::capability("$llm", anyhow::anyhow!("provider down"))
            .in_branch("inner")
            .in_branch("q1");

        assert_eq!(err.branch_path(), vec!["q1", "inner"]);
        assert!(matches!(
            err.innermost(),
            BraidError::Capability { marker, .. } if marker == "$llm"
        ));
    }

    #[test]
    fn test_malformed_root_path() {
        let err = BraidError::malformed("", "bad");
        assert_eq!(err.to_string(), "Malformed node at '$': bad");
    }
}
