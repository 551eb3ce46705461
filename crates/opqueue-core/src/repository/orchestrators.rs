//! Orchestrator repository: worker identities and their operator sets.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::operations::{search_filter, timestamp};
use crate::domain::{
    DelegateError, OrchestratorId, OrchestratorRecord, Paging, Result, Search, SortBy,
    SortDirection,
};
use crate::ports::{
    Clock, Document, DocumentCollection, Filter, FindOptions, ID_FIELD, Order, StoreError, Update,
};

/// Fields a free-text search may target.
pub const ORCHESTRATOR_SEARCH_FIELDS: &[&str] = &["instance_identifier", "available_operators"];

#[derive(Clone)]
pub struct OrchestratorRepository {
    collection: Arc<dyn DocumentCollection>,
    clock: Arc<dyn Clock>,
}

impl OrchestratorRepository {
    pub fn new(collection: Arc<dyn DocumentCollection>, clock: Arc<dyn Clock>) -> Self {
        Self { collection, clock }
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        self.collection.create_index("instance_identifier").await?;
        Ok(())
    }

    /// Insert or refresh the record for `instance_identifier`, re-activating it.
    pub async fn upsert(
        &self,
        instance_identifier: &str,
        description: Option<&str>,
        available_operators: Vec<String>,
    ) -> Result<OrchestratorRecord> {
        let now = timestamp(self.clock.now());
        let update = Update::new()
            .set("description", description)
            .set("available_operators", available_operators)
            .set("updated_at", now.clone())
            .set("deactivated_at", Value::Null)
            .set_on_insert("created_at", now);

        let stored = self
            .collection
            .find_one_and_update(
                &Filter::eq("instance_identifier", instance_identifier),
                &update,
                true,
            )
            .await?
            .ok_or_else(|| StoreError::InvalidDocument("upsert returned nothing".into()))?;
        let record = decode(stored)?;
        debug!(id = %record.id, instance_identifier, "orchestrator upserted");
        Ok(record)
    }

    /// Mark as deactivated without deleting. `None` when unknown.
    pub async fn deactivate(&self, instance_identifier: &str) -> Result<Option<OrchestratorRecord>> {
        let now = timestamp(self.clock.now());
        let update = Update::new()
            .set("deactivated_at", now.clone())
            .set("updated_at", now);
        let updated = self
            .collection
            .find_one_and_update(
                &Filter::eq("instance_identifier", instance_identifier),
                &update,
                false,
            )
            .await?;
        updated.map(decode).transpose()
    }

    pub async fn list(
        &self,
        paging: &Paging,
        search: Option<&Search>,
        include_deactivated: bool,
    ) -> Result<Vec<OrchestratorRecord>> {
        let query = query_filter(search, include_deactivated)?;
        let field = match paging.sort_by {
            SortBy::UpdatedAt => "updated_at",
            // Orchestrators have no queue time; the default sort falls back
            // to registration time.
            SortBy::QueuedAt => "created_at",
            other => {
                return Err(DelegateError::invalid(format!(
                    "cannot sort orchestrators by `{other}`"
                )));
            }
        };
        let order = match paging.sort_direction {
            SortDirection::Ascending => Order::Asc,
            SortDirection::Descending => Order::Desc,
        };
        let options = FindOptions::default()
            .sorted(field, order)
            .sorted(ID_FIELD, order)
            .skip(paging.skip)
            .limit(paging.effective_limit());

        let docs = self.collection.find(&query, &options).await?;
        docs.into_iter().map(decode).collect()
    }

    pub async fn count(&self, search: Option<&Search>, include_deactivated: bool) -> Result<u64> {
        let query = query_filter(search, include_deactivated)?;
        Ok(self.collection.count(&query).await?)
    }

    pub async fn get(&self, id: OrchestratorId) -> Result<Option<OrchestratorRecord>> {
        let found = self.collection.find_one(&Filter::id(id.key())).await?;
        found.map(decode).transpose()
    }

    pub async fn get_by_identifier(
        &self,
        instance_identifier: &str,
    ) -> Result<Option<OrchestratorRecord>> {
        let found = self
            .collection
            .find_one(&Filter::eq("instance_identifier", instance_identifier))
            .await?;
        found.map(decode).transpose()
    }

    pub async fn delete(&self, instance_identifier: &str) -> Result<bool> {
        let deleted = self
            .collection
            .delete_many(&Filter::eq("instance_identifier", instance_identifier))
            .await?;
        Ok(deleted > 0)
    }
}

fn query_filter(search: Option<&Search>, include_deactivated: bool) -> Result<Filter> {
    let mut parts = Vec::new();
    if !include_deactivated {
        parts.push(Filter::exists("deactivated_at", false));
    }
    if let Some(search) = search {
        parts.push(search_filter(search, ORCHESTRATOR_SEARCH_FIELDS)?);
    }
    Ok(Filter::and(parts))
}

fn decode(doc: Document) -> Result<OrchestratorRecord> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}
