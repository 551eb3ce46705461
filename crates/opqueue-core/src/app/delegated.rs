//! Delegated operation service: the run-state machine on top of the
//! operation repository.
//!
//! The service holds no locks of its own. Every transition is a single
//! filter-gated update in the store, so any number of services (in any number
//! of processes sharing the store) can drive the same queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::context::ProgressSink;
use super::status::QueueCounts;
use crate::domain::{
    DelegateError, ExecutionResult, NewOperation, OperationId, OperationRecord, OperationResult,
    Paging, ProgressStatus, Result, RunState, Search, SortBy, SortDirection,
};
use crate::ports::DatasetCatalog;
use crate::repository::{OperationFilter, OperationRepository, Transition};

/// Outcome of a `cleanup` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Records matched by the sweep (deleted unless `dry_run`).
    pub operation_ids: Vec<OperationId>,
    pub deleted: u64,
    pub dry_run: bool,
}

/// Outcome of a `cleanup_orphans` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Dataset ids referenced by records but unknown to the catalog.
    pub dataset_ids: Vec<String>,
    pub deleted: u64,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct DelegatedOperationService {
    repo: OperationRepository,
    catalog: Option<Arc<dyn DatasetCatalog>>,
}

impl DelegatedOperationService {
    pub fn new(repo: OperationRepository) -> Self {
        Self {
            repo,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DatasetCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn repository(&self) -> &OperationRepository {
        &self.repo
    }

    /// Queue an operation for the next free orchestrator on its target.
    pub async fn queue(&self, op: NewOperation) -> Result<OperationRecord> {
        let record = self.repo.enqueue(op, RunState::Queued).await?;
        info!(
            id = %record.id,
            operator = %record.operator,
            delegation_target = record.delegation_target.as_deref().unwrap_or("-"),
            "operation queued"
        );
        Ok(record)
    }

    /// Create an operation that waits in SCHEDULED until `set_queued`.
    pub async fn schedule(&self, op: NewOperation) -> Result<OperationRecord> {
        let record = self.repo.enqueue(op, RunState::Scheduled).await?;
        info!(id = %record.id, operator = %record.operator, "operation scheduled");
        Ok(record)
    }

    pub async fn set_queued(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        let transition = Transition::to(RunState::Queued).requiring(RunState::Scheduled);
        self.repo.transition(id, transition).await
    }

    /// Claim a queued operation. `None` when somebody else got there first.
    pub async fn set_running(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        self.set_running_with(id, None, None).await
    }

    pub async fn set_running_with(
        &self,
        id: OperationId,
        run_link: Option<String>,
        log_path: Option<String>,
    ) -> Result<Option<OperationRecord>> {
        let mut transition = Transition::to(RunState::Running).requiring(RunState::Queued);
        transition.run_link = run_link;
        transition.log_path = log_path;

        let claimed = self.repo.transition(id, transition).await?;
        match &claimed {
            Some(record) => info!(id = %record.id, operator = %record.operator, "operation claimed"),
            None => debug!(%id, "claim missed"),
        }
        Ok(claimed)
    }

    pub async fn set_completed(
        &self,
        id: OperationId,
        result: Option<Value>,
    ) -> Result<Option<OperationRecord>> {
        let transition = Transition::to(RunState::Completed)
            .requiring(RunState::Running)
            .with_result(OperationResult::success(result));
        let updated = self.repo.transition(id, transition).await?;
        if updated.is_some() {
            info!(%id, "operation completed");
        }
        Ok(updated)
    }

    /// Fail from SCHEDULED, QUEUED or RUNNING (the latter also by hand).
    pub async fn set_failed(
        &self,
        id: OperationId,
        error: OperationResult,
    ) -> Result<Option<OperationRecord>> {
        let transition = Transition::to(RunState::Failed).with_result(error);
        let updated = self.repo.transition(id, transition).await?;
        if let Some(record) = &updated {
            let message = record
                .result
                .as_ref()
                .and_then(|r| r.error_message.as_deref())
                .unwrap_or("-");
            warn!(%id, error = message, "operation failed");
        }
        Ok(updated)
    }

    /// Record the outcome of a run: completed on success, failed otherwise.
    pub async fn finish(
        &self,
        id: OperationId,
        outcome: &ExecutionResult,
    ) -> Result<Option<OperationRecord>> {
        if outcome.is_error() {
            self.set_failed(id, outcome.to_operation_result()).await
        } else {
            self.set_completed(id, outcome.result.clone()).await
        }
    }

    pub async fn set_progress(
        &self,
        id: OperationId,
        progress: ProgressStatus,
    ) -> Result<Option<OperationRecord>> {
        self.repo.update_progress(id, progress).await
    }

    pub async fn set_pinned(&self, id: OperationId, pinned: bool) -> Result<Option<OperationRecord>> {
        self.repo.set_pinned(id, pinned).await
    }

    pub async fn set_label(&self, id: OperationId, label: &str) -> Result<Option<OperationRecord>> {
        self.repo.set_label(id, label).await
    }

    pub async fn set_log_upload_error(
        &self,
        id: OperationId,
        error: Option<&str>,
    ) -> Result<Option<OperationRecord>> {
        self.repo.set_log_upload_error(id, error).await
    }

    pub async fn set_log_path(&self, id: OperationId, log_path: &str) -> Result<Option<OperationRecord>> {
        self.repo.set_log_path(id, log_path).await
    }

    /// Delete one operation. Refused while it is RUNNING.
    pub async fn delete(&self, id: OperationId) -> Result<()> {
        if self.repo.delete(id).await? {
            info!(%id, "operation deleted");
            return Ok(());
        }
        match self.repo.get(id).await? {
            Some(record) if record.run_state == RunState::Running => {
                Err(DelegateError::OperationRunning(id))
            }
            // Deleted by someone else in between, or never existed.
            _ => Err(DelegateError::OperationNotFound(id)),
        }
    }

    pub async fn delete_for_dataset(&self, dataset_id: &str) -> Result<u64> {
        self.repo.delete_for_dataset(dataset_id).await
    }

    /// Bulk delete. RUNNING records are never touched; asking for them
    /// explicitly is an error.
    pub async fn cleanup(&self, filter: &OperationFilter, dry_run: bool) -> Result<CleanupReport> {
        if filter.run_states.contains(&RunState::Running) {
            return Err(DelegateError::invalid("running operations cannot be cleaned up"));
        }

        let operation_ids = self.repo.deletable_ids(filter).await?;
        let deleted = if dry_run || operation_ids.is_empty() {
            0
        } else {
            self.repo.delete_matching(filter).await?
        };
        info!(matched = operation_ids.len(), deleted, dry_run, "cleanup finished");
        Ok(CleanupReport {
            operation_ids,
            deleted,
            dry_run,
        })
    }

    /// Delete every operation whose dataset no longer exists in the catalog.
    pub async fn cleanup_orphans(&self, dry_run: bool) -> Result<OrphanReport> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| DelegateError::invalid("no dataset catalog configured"))?;

        let live: BTreeSet<String> = catalog
            .list_dataset_ids()
            .await
            .map_err(|e| DelegateError::invalid(format!("cannot list datasets: {e:#}")))?
            .into_iter()
            .collect();
        let referenced: BTreeSet<String> =
            self.repo.distinct_dataset_ids().await?.into_iter().collect();
        let dataset_ids: Vec<String> = referenced.difference(&live).cloned().collect();

        let mut deleted = 0;
        if !dry_run {
            for dataset_id in &dataset_ids {
                deleted += self.repo.delete_for_dataset(dataset_id).await?;
            }
        }
        info!(orphans = dataset_ids.len(), deleted, dry_run, "orphan cleanup finished");
        Ok(OrphanReport {
            dataset_ids,
            deleted,
            dry_run,
        })
    }

    /// Queue a fresh copy of an existing operation.
    pub async fn rerun(&self, id: OperationId) -> Result<OperationRecord> {
        let original = self
            .repo
            .get(id)
            .await?
            .ok_or(DelegateError::OperationNotFound(id))?;
        let op = NewOperation {
            operator: original.operator,
            delegation_target: original.delegation_target,
            context: original.context,
            label: original.label,
            metadata: original.metadata,
        };
        let record = self.queue(op).await?;
        info!(original = %id, id = %record.id, "operation re-queued");
        Ok(record)
    }

    pub async fn get(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        self.repo.get(id).await
    }

    pub async fn list(
        &self,
        filter: &OperationFilter,
        search: Option<&Search>,
        paging: &Paging,
    ) -> Result<Vec<OperationRecord>> {
        self.repo.list(filter, search, paging).await
    }

    pub async fn count(&self, filter: &OperationFilter, search: Option<&Search>) -> Result<u64> {
        self.repo.count(filter, search).await
    }

    /// Oldest queued operations for `target` (all targets when `None`).
    pub async fn get_queued_operations(
        &self,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        self.oldest_in(RunState::Queued, SortBy::QueuedAt, target, limit)
            .await
    }

    pub async fn get_scheduled_operations(
        &self,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        self.oldest_in(RunState::Scheduled, SortBy::ScheduledAt, target, limit)
            .await
    }

    pub async fn get_running_operations(
        &self,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        self.oldest_in(RunState::Running, SortBy::StartedAt, target, limit)
            .await
    }

    async fn oldest_in(
        &self,
        state: RunState,
        sort_by: SortBy,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        let mut filter = OperationFilter::new().state(state);
        if let Some(target) = target {
            filter = filter.target(target);
        }
        let paging = Paging::new(sort_by, SortDirection::Ascending).page(0, limit);
        self.repo.list(&filter, None, &paging).await
    }

    /// Operation counts per run state, optionally for one target.
    pub async fn counts(&self, target: Option<&str>) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for state in RunState::ALL {
            let mut filter = OperationFilter::new().state(state);
            if let Some(target) = target {
                filter = filter.target(target);
            }
            counts.set(state, self.repo.count(&filter, None).await?);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProgressSink for DelegatedOperationService {
    async fn report_progress(
        &self,
        operation_id: OperationId,
        progress: ProgressStatus,
    ) -> anyhow::Result<()> {
        self.set_progress(operation_id, progress).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestParams;
    use crate::impls::InMemoryDatasetCatalog;
    use crate::testing::{fixed_clock, operation_repo, t0};
    use chrono::Duration;
    use rstest::rstest;
    use serde_json::json;

    async fn service() -> (DelegatedOperationService, Arc<InMemoryDatasetCatalog>) {
        let clock = fixed_clock();
        let catalog = Arc::new(InMemoryDatasetCatalog::new());
        let service = DelegatedOperationService::new(operation_repo(&clock).await)
            .with_catalog(catalog.clone());
        (service, catalog)
    }

    fn export(dataset: &str) -> NewOperation {
        NewOperation::new(
            "pkg/export",
            RequestParams::new("pkg/export")
                .with_params(json!({"format": "csv"}))
                .with_dataset(dataset),
        )
        .with_target("worker-A")
    }

    #[tokio::test]
    async fn export_lifecycle() {
        let (service, _) = service().await;
        let queued = service.queue(export("ds-1")).await.unwrap();
        assert_eq!(queued.run_state, RunState::Queued);

        let running = service.set_running(queued.id).await.unwrap().unwrap();
        assert_eq!(running.run_state, RunState::Running);
        assert!(matches!(
            service.delete(queued.id).await,
            Err(DelegateError::OperationRunning(id)) if id == queued.id
        ));

        let done = service
            .set_completed(queued.id, Some(json!({"n": 3})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.run_state, RunState::Completed);
        assert_eq!(done.result.as_ref().unwrap().result, Some(json!({"n": 3})));
        assert!(done.started_at.is_some() && done.completed_at.is_some());

        service.delete(queued.id).await.unwrap();
        assert!(service.get(queued.id).await.unwrap().is_none());
        assert!(matches!(
            service.delete(queued.id).await,
            Err(DelegateError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (service, _) = service().await;
        let record = service.queue(export("ds-1")).await.unwrap();

        let (a, b) = tokio::join!(service.set_running(record.id), service.set_running(record.id));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn cas_miss_is_an_idempotent_noop() {
        let (service, _) = service().await;
        let record = service.queue(export("ds-1")).await.unwrap();
        service.set_running(record.id).await.unwrap().unwrap();
        let before = service.get(record.id).await.unwrap();

        assert!(service.set_running(record.id).await.unwrap().is_none());
        assert!(service.set_running(record.id).await.unwrap().is_none());
        assert!(service.set_queued(record.id).await.unwrap().is_none());
        assert_eq!(service.get(record.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn terminal_records_do_not_move() {
        let (service, _) = service().await;
        let record = service.queue(export("ds-1")).await.unwrap();
        service
            .set_failed(record.id, OperationResult::failure("trace", "cancelled by hand"))
            .await
            .unwrap()
            .unwrap();

        assert!(service.set_running(record.id).await.unwrap().is_none());
        assert!(
            service
                .set_completed(record.id, None)
                .await
                .unwrap()
                .is_none()
        );
        let stored = service.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.run_state, RunState::Failed);
        assert!(stored.result.unwrap().is_error());
    }

    #[tokio::test]
    async fn running_can_be_failed_by_hand() {
        let (service, _) = service().await;
        let record = service.queue(export("ds-1")).await.unwrap();
        service.set_running(record.id).await.unwrap();
        let failed = service
            .set_failed(record.id, OperationResult::failure("", "worker lost"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.run_state, RunState::Failed);
        assert!(failed.started_at.is_some());
        assert!(failed.failed_at.is_some());
    }

    #[tokio::test]
    async fn scheduled_operations_wait_for_release() {
        let (service, _) = service().await;
        let record = service.schedule(export("ds-1")).await.unwrap();
        assert!(service.set_running(record.id).await.unwrap().is_none());
        assert_eq!(
            service.get_scheduled_operations(None, 10).await.unwrap().len(),
            1
        );

        let queued = service.set_queued(record.id).await.unwrap().unwrap();
        assert!(queued.scheduled_at.is_some() && queued.queued_at.is_some());
        assert!(service.set_running(record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queued_operations_are_oldest_first_per_target() {
        let clock = fixed_clock();
        let service = DelegatedOperationService::new(operation_repo(&clock).await);
        let first = service.queue(export("ds-1")).await.unwrap();
        clock.advance(Duration::seconds(1));
        service.queue(export("ds-2")).await.unwrap();
        service
            .queue(export("ds-3").with_target("worker-B"))
            .await
            .unwrap();

        let for_a = service.get_queued_operations(Some("worker-A"), 10).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].id, first.id);
        assert_eq!(for_a[0].queued_at, Some(t0()));

        let limited = service.get_queued_operations(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn orphans_are_removed_exactly() {
        let (service, catalog) = service().await;
        catalog.add("ds-live", "live").await;
        service.queue(export("ds-live")).await.unwrap();
        service.queue(export("ds-gone")).await.unwrap();
        service.queue(export("ds-gone")).await.unwrap();

        let preview = service.cleanup_orphans(true).await.unwrap();
        assert_eq!(preview.dataset_ids, vec!["ds-gone"]);
        assert_eq!(preview.deleted, 0);
        assert_eq!(service.count(&OperationFilter::new(), None).await.unwrap(), 3);

        let report = service.cleanup_orphans(false).await.unwrap();
        assert_eq!(report.deleted, 2);
        let left = service
            .list(&OperationFilter::new(), None, &Paging::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].dataset_id(), Some("ds-live"));
    }

    #[rstest]
    #[case::completed(RunState::Completed, false)]
    #[case::failed(RunState::Failed, false)]
    #[case::running(RunState::Running, true)]
    #[tokio::test]
    async fn cleanup_refuses_running(#[case] state: RunState, #[case] rejected: bool) {
        let (service, _) = service().await;
        let filter = OperationFilter::new().state(state);
        assert_eq!(service.cleanup(&filter, true).await.is_err(), rejected);
    }

    #[tokio::test]
    async fn cleanup_never_deletes_running_records() {
        let (service, _) = service().await;
        let done = service.queue(export("ds-1")).await.unwrap();
        service.set_running(done.id).await.unwrap();
        service.set_completed(done.id, None).await.unwrap();
        let busy = service.queue(export("ds-1")).await.unwrap();
        service.set_running(busy.id).await.unwrap();

        let preview = service.cleanup(&OperationFilter::new(), true).await.unwrap();
        assert_eq!(preview.operation_ids, vec![done.id]);
        assert_eq!(service.count(&OperationFilter::new(), None).await.unwrap(), 2);

        let report = service.cleanup(&OperationFilter::new(), false).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(service.get(busy.id).await.unwrap().is_some());

        let nothing = service.cleanup(&OperationFilter::new(), false).await.unwrap();
        assert!(nothing.operation_ids.is_empty());
    }

    #[tokio::test]
    async fn rerun_queues_a_copy() {
        let (service, _) = service().await;
        let original = service
            .queue(export("ds-1").with_label("nightly"))
            .await
            .unwrap();
        service.set_running(original.id).await.unwrap();
        service
            .set_failed(original.id, OperationResult::failure("", "x"))
            .await
            .unwrap();

        let copy = service.rerun(original.id).await.unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.run_state, RunState::Queued);
        assert_eq!(copy.label.as_deref(), Some("nightly"));
        assert_eq!(copy.context, original.context);
        assert_eq!(copy.delegation_target, original.delegation_target);
    }

    #[tokio::test]
    async fn progress_is_written_through_the_sink() {
        let (service, _) = service().await;
        let record = service.queue(export("ds-1")).await.unwrap();
        let sink: Arc<dyn ProgressSink> = Arc::new(service.clone());
        let ctx = crate::app::ExecutionContext::new(record.request_params().clone())
            .bind_operation(record.id, sink);

        ctx.set_progress(Some(0.25), Some("exporting")).await.unwrap();
        let stored = service.get(record.id).await.unwrap().unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.progress, Some(0.25));
        assert_eq!(status.label.as_deref(), Some("exporting"));
    }

    #[tokio::test]
    async fn counts_per_state() {
        let (service, _) = service().await;
        let a = service.queue(export("ds-1")).await.unwrap();
        service.queue(export("ds-1")).await.unwrap();
        service.schedule(export("ds-1")).await.unwrap();
        service.set_running(a.id).await.unwrap();

        let counts = service.counts(None).await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(service.counts(Some("nobody")).await.unwrap().total(), 0);
    }
}
