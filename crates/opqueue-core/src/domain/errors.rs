//! Errors and their classification.
//!
//! Expected conditions never show up here: a missing record is `Ok(None)`, a
//! lost compare-and-swap is `Ok(None)`, a validation problem is a
//! `ValidationFailure` value and an operator fault lives inside an
//! `ExecutionResult`. `DelegateError` is for what the caller must handle.

use thiserror::Error;

use super::ids::{OperationId, ParseIdError};
use crate::ports::StoreError;
use crate::schema::ValidationFailure;

/// Failures a caller of the services has to act on.
///
/// # Classification
/// - **Not found** (`is_not_found`): the addressed operator, operation or
///   orchestrator does not exist. Retrying will not help.
/// - **Refused**: `OperationRunning`, `InvalidArgument`, `Validation`. The
///   request is well formed but not allowed in the current state.
/// - **Infrastructure**: `Store`, `Serialization`. Possibly transient.
#[derive(Debug, Error)]
pub enum DelegateError {
    /// No operator is registered under this URI.
    #[error("operator not found: {0}")]
    OperatorNotFound(String),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Carries the key the caller used: an id or an instance identifier.
    #[error("orchestrator not found: {0}")]
    OrchestratorNotFound(String),

    #[error("operator `{0}` is already registered")]
    DuplicateOperator(String),

    /// RUNNING records belong to a worker until it finishes them.
    #[error("cannot delete operation {0}: it is running")]
    OperationRunning(OperationId),

    /// Unsupported argument (search field, run state, ...). Not retryable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Only produced at a boundary that chose to raise rejected params.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// A captured operator fault, raised by `raise_exceptions`.
    #[error("operator execution failed: {message}")]
    Execution { message: String, trace: String },

    #[error(transparent)]
    InvalidId(#[from] ParseIdError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DelegateError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DelegateError::InvalidArgument(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DelegateError::OperatorNotFound(_)
                | DelegateError::OperationNotFound(_)
                | DelegateError::OrchestratorNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DelegateError>;
