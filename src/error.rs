//! Error types.
//!
//! Two very different things can go wrong. A [`Violation`] is a memory-safety
//! defect of the analyzed program: the operation is refused and the façade
//! records a finding. An [`SmgError`] is a failure of the domain itself (a
//! broken invariant or a misuse by the driver) and must abort the analysis.

use thiserror::Error;

use crate::types::{ObjectId, Value};

/// A refused memory access of the analyzed program.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum Violation {
    #[error("invalid read")]
    InvalidRead,
    #[error("invalid write")]
    InvalidWrite,
    #[error("invalid free")]
    InvalidFree,
}

/// An internal failure of the domain.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SmgError {
    #[error("SMG was found inconsistent: {0}")]
    Inconsistent(String),
    #[error("query '{0}' is invalid")]
    InvalidQuery(String),
    #[error("no stack frame is active")]
    NoStackFrame,
    #[error("stack frame for function '{function}' already contains a variable '{name}'")]
    DuplicateVariable { function: String, name: String },
    #[error("global variable '{0}' is already declared")]
    DuplicateGlobal(String),
    #[error("object {0} does not exist")]
    UnknownObject(ObjectId),
    #[error("value {0} is not a pointer")]
    NotAPointer(Value),
    #[error("pointer {0} designates an unknown element of a list segment")]
    AmbiguousTarget(Value),
    #[error("object {0} summarizes several objects and must be materialized first")]
    AbstractAccess(ObjectId),
}

impl SmgError {
    /// Consistency failures point at a bug in the domain and end the analysis run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SmgError::Inconsistent(_))
    }
}

pub type Result<T, E = SmgError> = std::result::Result<T, E>;
