use crate::value::Value;
use thiserror::Error;

/// Result type for eventbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the eventbox runtime.
///
/// `InvalidAccess` covers every scope violation: calling an operation from a
/// scope that may not perform it, invoking a proc where it is forbidden,
/// marking a non-taggable value as shared, or pushing to an answer queue that
/// already delivered its result. `MultipleResults` is the diagnosis for a
/// completion handle fired twice. `AbortAction` is the reserved sentinel the
/// library uses to terminate an action; user code cannot construct a signal
/// carrying it. `Raised` transports a user exception value across a scope
/// boundary.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid access: {0}")]
    InvalidAccess(String),
    #[error("multiple results: {0}")]
    MultipleResults(String),
    #[error("action aborted")]
    AbortAction,
    #[error("user exception: {0:?}")]
    Raised(Value),
}

impl Error {
    pub fn invalid_access<E: ToString>(err: E) -> Self {
        Error::InvalidAccess(err.to_string())
    }

    pub fn multiple_results<E: ToString>(err: E) -> Self {
        Error::MultipleResults(err.to_string())
    }

    pub fn raised(value: impl Into<Value>) -> Self {
        Error::Raised(value.into())
    }

    /// True for the reserved abort sentinel.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::AbortAction)
    }
}

/// Internal marker for a value the deep-copy step cannot reproduce.
///
/// Never surfaced to callers; the sanitizer recovers by dissection and
/// shared-object wrapping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopyError;
