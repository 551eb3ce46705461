//! Operation repository: persistence and queries for delegated operations.
//!
//! # Design
//! - Every state change is one `find_one_and_update` whose filter carries the
//!   allowed predecessor states (and, when asked, the exact current state).
//!   Losing that race is `Ok(None)`, never an error.
//! - Nothing is cached; every call reads the collection.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::{
    DelegateError, NewOperation, OperationId, OperationRecord, OperationResult, Paging,
    ProgressStatus, Result, RunState, Search, SortDirection,
};
use crate::ports::{
    Clock, Document, DocumentCollection, Filter, FindOptions, ID_FIELD, Order, StoreError, Update,
};

/// Fields a free-text search may target.
pub const OPERATION_SEARCH_FIELDS: &[&str] = &["operator", "label"];

pub(crate) const DATASET_FIELD: &str = "context.request_params.dataset_id";

/// Structured filter for list/count/cleanup queries. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationFilter {
    pub operator: Option<String>,
    pub dataset_id: Option<String>,
    pub run_states: Vec<RunState>,
    pub delegation_target: Option<String>,
    pub pinned: Option<bool>,
    /// Only records last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

impl OperationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    pub fn state(mut self, state: RunState) -> Self {
        self.run_states.push(state);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.delegation_target = Some(target.into());
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    fn to_store_filter(&self) -> Filter {
        let mut parts = Vec::new();
        if let Some(operator) = &self.operator {
            parts.push(Filter::eq("operator", operator.as_str()));
        }
        if let Some(dataset_id) = &self.dataset_id {
            parts.push(Filter::eq(DATASET_FIELD, dataset_id.as_str()));
        }
        match self.run_states.as_slice() {
            [] => {}
            [state] => parts.push(Filter::eq("run_state", state.as_str())),
            states => parts.push(Filter::is_in(
                "run_state",
                states.iter().map(|s| s.as_str()),
            )),
        }
        if let Some(target) = &self.delegation_target {
            parts.push(Filter::eq("delegation_target", target.as_str()));
        }
        if let Some(pinned) = self.pinned {
            parts.push(Filter::eq("pinned", pinned));
        }
        if let Some(at) = self.updated_before {
            parts.push(Filter::lt("updated_at", timestamp(at)));
        }
        Filter::and(parts)
    }
}

/// A requested run-state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub new_state: RunState,
    /// Stored for terminal states; ignored otherwise.
    pub result: Option<OperationResult>,
    pub run_link: Option<String>,
    pub log_path: Option<String>,
    pub progress: Option<ProgressStatus>,
    /// When set, the change only applies if the record is in exactly this state.
    pub required_state: Option<RunState>,
}

impl Transition {
    pub fn to(new_state: RunState) -> Self {
        Self {
            new_state,
            result: None,
            run_link: None,
            log_path: None,
            progress: None,
            required_state: None,
        }
    }

    pub fn requiring(mut self, state: RunState) -> Self {
        self.required_state = Some(state);
        self
    }

    pub fn with_result(mut self, result: OperationResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_run_link(mut self, run_link: impl Into<String>) -> Self {
        self.run_link = Some(run_link.into());
        self
    }

    pub fn with_log_path(mut self, log_path: impl Into<String>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressStatus) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Clone)]
pub struct OperationRepository {
    collection: Arc<dyn DocumentCollection>,
    clock: Arc<dyn Clock>,
}

impl OperationRepository {
    pub fn new(collection: Arc<dyn DocumentCollection>, clock: Arc<dyn Clock>) -> Self {
        Self { collection, clock }
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        for field in [
            "operator",
            DATASET_FIELD,
            "run_state",
            "updated_at",
            "delegation_target",
        ] {
            self.collection.create_index(field).await?;
        }
        Ok(())
    }

    /// Create a record in `initial_state` (QUEUED or SCHEDULED).
    pub async fn enqueue(&self, op: NewOperation, initial_state: RunState) -> Result<OperationRecord> {
        if !matches!(initial_state, RunState::Queued | RunState::Scheduled) {
            return Err(DelegateError::invalid(format!(
                "operations cannot be created in state `{initial_state}`"
            )));
        }

        let now = timestamp(self.clock.now());
        let mut doc = into_document(json!({
            "operator": op.operator,
            "delegation_target": op.delegation_target,
            "context": serde_json::to_value(&op.context)?,
            "label": op.label,
            "pinned": false,
            "metadata": op.metadata,
            "run_state": initial_state.as_str(),
            "result": Value::Null,
            "status": Value::Null,
            "updated_at": now.clone(),
        }))?;
        doc.insert(initial_state.timestamp_field().to_string(), now);

        let stored = self.collection.insert_one(doc).await?;
        let record = decode(stored)?;
        debug!(id = %record.id, operator = %record.operator, state = %initial_state, "operation stored");
        Ok(record)
    }

    /// Atomically move `id` to `transition.new_state`.
    ///
    /// Returns `None` when the record is missing or not in an allowed state.
    pub async fn transition(
        &self,
        id: OperationId,
        transition: Transition,
    ) -> Result<Option<OperationRecord>> {
        let new_state = transition.new_state;
        let allowed = new_state.predecessors();
        if allowed.is_empty() {
            return Ok(None);
        }

        let mut parts = vec![
            Filter::id(id.key()),
            Filter::is_in("run_state", allowed.iter().map(|s| s.as_str())),
        ];
        if let Some(required) = transition.required_state {
            parts.push(Filter::eq("run_state", required.as_str()));
        }

        let now = self.clock.now();
        let mut update = Update::new()
            .set("run_state", new_state.as_str())
            .set(new_state.timestamp_field(), timestamp(now))
            .set("updated_at", timestamp(now));

        update = if new_state.is_terminal() {
            let result = transition.result.unwrap_or_default();
            update.set("result", serde_json::to_value(result)?)
        } else {
            update.set("result", Value::Null)
        };
        if let Some(run_link) = transition.run_link {
            update = update.set("run_link", run_link);
        }
        if let Some(log_path) = transition.log_path {
            update = update.set("log_path", log_path);
        }
        if let Some(progress) = transition.progress {
            update = update.set("status", status_value(progress, now)?);
        }

        let updated = self
            .collection
            .find_one_and_update(&Filter::and(parts), &update, false)
            .await?;
        updated.map(decode).transpose()
    }

    /// Replace the progress status without touching the run state.
    pub async fn update_progress(
        &self,
        id: OperationId,
        progress: ProgressStatus,
    ) -> Result<Option<OperationRecord>> {
        let now = self.clock.now();
        let update = Update::new()
            .set("status", status_value(progress, now)?)
            .set("updated_at", timestamp(now));
        self.update_fields(id, update).await
    }

    pub async fn set_pinned(&self, id: OperationId, pinned: bool) -> Result<Option<OperationRecord>> {
        self.update_fields(id, Update::new().set("pinned", pinned)).await
    }

    pub async fn set_label(&self, id: OperationId, label: &str) -> Result<Option<OperationRecord>> {
        self.update_fields(id, Update::new().set("label", label)).await
    }

    pub async fn set_log_upload_error(
        &self,
        id: OperationId,
        error: Option<&str>,
    ) -> Result<Option<OperationRecord>> {
        let update = match error {
            Some(error) => Update::new().set("log_upload_error", error),
            None => Update::new().set("log_upload_error", Value::Null),
        };
        self.update_fields(id, update).await
    }

    pub async fn set_log_path(&self, id: OperationId, log_path: &str) -> Result<Option<OperationRecord>> {
        self.update_fields(id, Update::new().set("log_path", log_path)).await
    }

    async fn update_fields(&self, id: OperationId, update: Update) -> Result<Option<OperationRecord>> {
        let update = update.set("updated_at", timestamp(self.clock.now()));
        let updated = self
            .collection
            .find_one_and_update(&Filter::id(id.key()), &update, false)
            .await?;
        updated.map(decode).transpose()
    }

    pub async fn get(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        let found = self.collection.find_one(&Filter::id(id.key())).await?;
        found.map(decode).transpose()
    }

    pub async fn list(
        &self,
        filter: &OperationFilter,
        search: Option<&Search>,
        paging: &Paging,
    ) -> Result<Vec<OperationRecord>> {
        let query = query_filter(filter, search)?;
        let order = match paging.sort_direction {
            SortDirection::Ascending => Order::Asc,
            SortDirection::Descending => Order::Desc,
        };
        let options = FindOptions::default()
            .sorted(paging.sort_by.field(), order)
            .sorted(ID_FIELD, order)
            .skip(paging.skip)
            .limit(paging.effective_limit());

        let docs = self.collection.find(&query, &options).await?;
        docs.into_iter().map(decode).collect()
    }

    pub async fn count(&self, filter: &OperationFilter, search: Option<&Search>) -> Result<u64> {
        let query = query_filter(filter, search)?;
        Ok(self.collection.count(&query).await?)
    }

    /// Delete `id` unless it is RUNNING. Returns whether a record was removed.
    pub async fn delete(&self, id: OperationId) -> Result<bool> {
        let query = Filter::and(vec![
            Filter::id(id.key()),
            Filter::ne("run_state", RunState::Running.as_str()),
        ]);
        Ok(self.collection.delete_many(&query).await? > 0)
    }

    /// Ids of records matching `filter`, excluding RUNNING ones.
    pub async fn deletable_ids(&self, filter: &OperationFilter) -> Result<Vec<OperationId>> {
        let docs = self
            .collection
            .find(&deletable(filter), &FindOptions::default().sorted(ID_FIELD, Order::Asc))
            .await?;
        docs.into_iter()
            .map(|doc| -> Result<OperationId> {
                match doc.get(ID_FIELD).and_then(Value::as_str) {
                    Some(id) => Ok(id.parse::<OperationId>()?),
                    None => Err(StoreError::InvalidDocument("missing _id".into()).into()),
                }
            })
            .collect()
    }

    /// Delete records matching `filter`, excluding RUNNING ones.
    pub async fn delete_matching(&self, filter: &OperationFilter) -> Result<u64> {
        Ok(self.collection.delete_many(&deletable(filter)).await?)
    }

    /// Delete every record of a dataset, whatever its state.
    pub async fn delete_for_dataset(&self, dataset_id: &str) -> Result<u64> {
        let deleted = self
            .collection
            .delete_many(&Filter::eq(DATASET_FIELD, dataset_id))
            .await?;
        debug!(dataset_id, deleted, "deleted operations for dataset");
        Ok(deleted)
    }

    /// Dataset ids referenced by at least one record.
    pub async fn distinct_dataset_ids(&self) -> Result<Vec<String>> {
        let values = self.collection.distinct(DATASET_FIELD, &Filter::All).await?;
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

fn deletable(filter: &OperationFilter) -> Filter {
    Filter::and(vec![
        filter.to_store_filter(),
        Filter::ne("run_state", RunState::Running.as_str()),
    ])
}

fn query_filter(filter: &OperationFilter, search: Option<&Search>) -> Result<Filter> {
    let mut parts = vec![filter.to_store_filter()];
    if let Some(search) = search {
        parts.push(search_filter(search, OPERATION_SEARCH_FIELDS)?);
    }
    Ok(Filter::and(parts))
}

/// AND over terms, OR over each term's fields; terms match as literal
/// substrings.
pub(crate) fn search_filter(search: &Search, allowed: &[&str]) -> Result<Filter> {
    if let Some(field) = search.unsupported_field(allowed) {
        return Err(DelegateError::invalid(format!(
            "cannot search on `{field}` (allowed: {})",
            allowed.join(", ")
        )));
    }

    let terms = search
        .0
        .iter()
        .map(|(term, fields)| {
            let pattern = regex::escape(term);
            Filter::Or(
                fields
                    .iter()
                    .map(|field| Filter::regex(field, pattern.clone()))
                    .collect(),
            )
        })
        .collect();
    Ok(Filter::and(terms))
}

/// Timestamps are stored at a fixed precision so they also sort as strings.
pub(crate) fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn status_value(progress: ProgressStatus, now: DateTime<Utc>) -> Result<Value> {
    let status = ProgressStatus {
        updated_at: Some(now),
        ..ProgressStatus::new(progress.progress, progress.label)
    };
    Ok(serde_json::to_value(status)?)
}

pub(crate) fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(doc) => Ok(doc),
        other => Err(StoreError::InvalidDocument(format!("expected an object, got {other}")).into()),
    }
}

fn decode(doc: Document) -> Result<OperationRecord> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}
