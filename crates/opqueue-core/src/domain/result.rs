//! Execution result: what one operator run produced.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::DelegateError;
use super::operation::OperationResult;

/// A deferred side effect requested by an operator via `ctx.trigger(..)`.
///
/// The engine never calls these itself; the caller reads them off the result
/// and forwards them to whatever presentation layer it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// Outcome of `run` (or of a delegation).
///
/// Exactly one of `result` / (`error`, `error_message`) is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// True when the invocation was queued instead of run.
    #[serde(default)]
    pub delegated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerRequest>,

    /// Warnings from the execution-mode decision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn success(result: Option<Value>) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn failure(trace: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(trace.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Result of handing an invocation to the queue.
    pub fn delegated(result: Value) -> Self {
        Self {
            result: Some(result),
            delegated: true,
            ..Default::default()
        }
    }

    /// Capture an `anyhow` error as (trace, message).
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::failure(format!("{err:?}"), err.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_message.is_some()
    }

    /// Convert a captured fault into a `DelegateError`, for the outermost
    /// boundary only.
    pub fn raise_exceptions(self) -> Result<Self, DelegateError> {
        if self.is_error() {
            let message = self
                .error_message
                .clone()
                .or_else(|| self.error.clone())
                .unwrap_or_default();
            return Err(DelegateError::Execution {
                message,
                trace: self.error.unwrap_or_default(),
            });
        }
        Ok(self)
    }

    /// The part stored on the operation record.
    pub fn to_operation_result(&self) -> OperationResult {
        if self.is_error() {
            OperationResult {
                result: None,
                error: self.error.clone(),
                error_message: self.error_message.clone(),
            }
        } else {
            OperationResult::success(self.result.clone())
        }
    }
}
