//! Error types shared across the engine.
//!
//! Controllers distinguish four classes of failure:
//! - `NotReady`: the object store has not warmed up yet (retried)
//! - per-object apply failures, collected into an [`AggregateError`]
//! - dependency lookups that fail while assembling a working set (fatal to the pass)
//! - process failures, which are reported as log actions rather than errors

use std::fmt;

use thiserror::Error;

use crate::domain::ObjectKind;

/// Errors produced by the engine and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    #[error("object store not ready: {0}")]
    NotReady(String),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("conflict writing {kind} {name:?}: resource version {expected:?} is stale")]
    Conflict {
        kind: ObjectKind,
        name: String,
        expected: Option<String>,
    },

    #[error("expected a {expected} object, found {actual}")]
    WrongKind {
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("refusing to modify {kind} {name:?}: missing owner label")]
    NotOwned { kind: ObjectKind, name: String },

    #[error("{op} {kind}/{name}: {source}")]
    Apply {
        op: ApplyOp,
        kind: ObjectKind,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("process {name:?}: {message}")]
    Process { name: String, message: String },

    #[error("pass cancelled")]
    Cancelled,

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// True for the transient "backing store not warmed up" class
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn apply(op: ApplyOp, kind: ObjectKind, name: &str, source: Error) -> Self {
        Self::Apply {
            op,
            kind,
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The write attempted against the object store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ApplyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Failures collected across one reconciliation pass.
///
/// A non-empty aggregate means the pass partially failed; already-applied
/// writes stay applied and the next pass converges the rest.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate as an error
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "{}", self.errors[0]);
        }
        f.write_str("[")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregateError {}
