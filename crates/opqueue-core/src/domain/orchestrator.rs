//! Orchestrator record: a registered worker identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::OrchestratorId;

/// A worker process that can claim delegated operations.
///
/// `instance_identifier` is stable per worker instance and doubles as the
/// delegation target the worker serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorRecord {
    #[serde(rename = "_id")]
    pub id: OrchestratorId,

    /// Unique among orchestrators; registration upserts on it.
    pub instance_identifier: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Operator URIs the worker had registered when it last announced
    /// itself. Refreshed on every registration.
    #[serde(default)]
    pub available_operators: Vec<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Set when the worker shut down cleanly or was deactivated by hand.
    /// Registering again clears it.
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl OrchestratorRecord {
    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }

    /// Whether `operator_uri` was among the worker's registered operators.
    pub fn can_run(&self, operator_uri: &str) -> bool {
        self.available_operators.iter().any(|uri| uri == operator_uri)
    }
}
