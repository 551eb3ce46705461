//! Operation record: the persisted unit of delegated work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::OperationId;
use super::state::RunState;

/// Request parameters of one operator invocation.
///
/// This is the only part of an execution context that is persisted; a worker
/// rebuilds the full context from it when it picks the operation up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub operator_uri: String,

    /// Raw operator parameters (validated against the input schema).
    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,

    /// Opaque view selector, interpreted by the dataset layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<Value>,

    /// Caller's own delegation request; `None` leaves it to the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl RequestParams {
    pub fn new(operator_uri: impl Into<String>) -> Self {
        Self {
            operator_uri: operator_uri.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn with_dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    pub fn delegate_to(mut self, target: impl Into<String>) -> Self {
        self.delegated = Some(true);
        self.delegation_target = Some(target.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// The `context` field of an operation document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub request_params: RequestParams,
}

/// Terminal outcome persisted on the record.
///
/// Either `result` is meaningful (success) or `error`/`error_message` are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub result: Option<Value>,

    /// Error trace (cause chain).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OperationResult {
    pub fn success(result: Option<Value>) -> Self {
        Self {
            result,
            error: None,
            error_message: None,
        }
    }

    pub fn failure(trace: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(trace.into()),
            error_message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_message.is_some()
    }
}

/// Progress reported while an operation runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressStatus {
    /// Fraction in `[0, 1]`, when known.
    #[serde(default)]
    pub progress: Option<f64>,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressStatus {
    pub fn new(progress: Option<f64>, label: Option<String>) -> Self {
        Self {
            progress: progress.map(|p| p.clamp(0.0, 1.0)),
            label,
            updated_at: None,
        }
    }
}

/// A delegated operation as stored in the queue collection.
///
/// # Invariants
/// - `result` is `Some` iff `run_state` is terminal.
/// - A state's timestamp is set iff the record has entered that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    #[serde(rename = "_id")]
    pub id: OperationId,

    pub operator: String,

    #[serde(default)]
    pub delegation_target: Option<String>,

    pub context: OperationContext,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub pinned: bool,

    #[serde(default)]
    pub metadata: Option<Value>,

    pub run_state: RunState,

    #[serde(default)]
    pub result: Option<OperationResult>,

    #[serde(default)]
    pub status: Option<ProgressStatus>,

    #[serde(default)]
    pub run_link: Option<String>,

    #[serde(default)]
    pub log_path: Option<String>,

    #[serde(default)]
    pub log_upload_error: Option<String>,

    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    pub fn dataset_id(&self) -> Option<&str> {
        self.context.request_params.dataset_id.as_deref()
    }

    pub fn request_params(&self) -> &RequestParams {
        &self.context.request_params
    }

    /// Timestamp recorded for `state`, if the record ever entered it.
    pub fn timestamp_for(&self, state: RunState) -> Option<DateTime<Utc>> {
        match state {
            RunState::Scheduled => self.scheduled_at,
            RunState::Queued => self.queued_at,
            RunState::Running => self.started_at,
            RunState::Completed => self.completed_at,
            RunState::Failed => self.failed_at,
        }
    }

    /// Display name: the label, falling back to the operator URI.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.operator)
    }
}

/// Fields needed to create a new operation document.
#[derive(Debug, Clone, Default)]
pub struct NewOperation {
    pub operator: String,
    pub delegation_target: Option<String>,
    pub context: OperationContext,
    pub label: Option<String>,
    pub metadata: Option<Value>,
}

impl NewOperation {
    pub fn new(operator: impl Into<String>, request_params: RequestParams) -> Self {
        Self {
            operator: operator.into(),
            context: OperationContext { request_params },
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.delegation_target = Some(target.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_params_round_trip_through_context_document() {
        let params = RequestParams::new("pkg/export")
            .with_params(json!({"format": "csv"}))
            .with_dataset("ds-1")
            .delegate_to("worker-A");
        let doc = serde_json::to_value(OperationContext {
            request_params: params.clone(),
        })
        .unwrap();

        assert_eq!(doc["request_params"]["dataset_id"], "ds-1");
        assert_eq!(doc["request_params"]["params"]["format"], "csv");
        let back: OperationContext = serde_json::from_value(doc).unwrap();
        assert_eq!(back.request_params, params);
    }

    #[test]
    fn progress_is_clamped() {
        let status = ProgressStatus::new(Some(1.7), None);
        assert_eq!(status.progress, Some(1.0));
    }

    #[test]
    fn failure_result_is_error() {
        assert!(OperationResult::failure("trace", "boom").is_error());
        assert!(!OperationResult::success(Some(json!(1))).is_error());
    }
}
