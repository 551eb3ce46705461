//! Orchestrator service: worker registration and discovery.
//!
//! `deactivate`, `delete` and `find` take a key that is either the record's
//! id (with or without its `orch-` prefix) or its instance identifier. An id
//! that matches a record wins; anything else is looked up as an identifier.

use std::sync::Arc;

use tracing::info;

use crate::domain::{
    DelegateError, OrchestratorId, OrchestratorRecord, Paging, Result, Search,
};
use crate::operators::OperatorRegistry;
use crate::repository::OrchestratorRepository;

#[derive(Clone)]
pub struct OrchestratorService {
    repo: OrchestratorRepository,
    registry: Arc<OperatorRegistry>,
}

impl OrchestratorService {
    pub fn new(repo: OrchestratorRepository, registry: Arc<OperatorRegistry>) -> Self {
        Self { repo, registry }
    }

    /// Register (or refresh) this process as `instance_identifier`, declaring
    /// every operator in the local registry as available.
    pub async fn register(
        &self,
        instance_identifier: &str,
        description: Option<&str>,
    ) -> Result<OrchestratorRecord> {
        let record = self
            .repo
            .upsert(instance_identifier, description, self.registry.uris())
            .await?;
        info!(
            instance_identifier,
            operators = record.available_operators.len(),
            "orchestrator registered"
        );
        Ok(record)
    }

    pub async fn deactivate(&self, key: &str) -> Result<OrchestratorRecord> {
        let instance_identifier = self.identifier_for(key).await?;
        let record = self
            .repo
            .deactivate(&instance_identifier)
            .await?
            .ok_or_else(|| DelegateError::OrchestratorNotFound(key.to_string()))?;
        info!(%instance_identifier, "orchestrator deactivated");
        Ok(record)
    }

    pub async fn list(
        &self,
        paging: &Paging,
        search: Option<&Search>,
        include_deactivated: bool,
    ) -> Result<Vec<OrchestratorRecord>> {
        self.repo.list(paging, search, include_deactivated).await
    }

    pub async fn count(&self, search: Option<&Search>, include_deactivated: bool) -> Result<u64> {
        self.repo.count(search, include_deactivated).await
    }

    pub async fn get(&self, id: OrchestratorId) -> Result<Option<OrchestratorRecord>> {
        self.repo.get(id).await
    }

    pub async fn get_by_identifier(
        &self,
        instance_identifier: &str,
    ) -> Result<Option<OrchestratorRecord>> {
        self.repo.get_by_identifier(instance_identifier).await
    }

    /// Look `key` up by id, then by instance identifier.
    pub async fn find(&self, key: &str) -> Result<Option<OrchestratorRecord>> {
        if let Ok(id) = key.parse::<OrchestratorId>()
            && let Some(record) = self.repo.get(id).await?
        {
            return Ok(Some(record));
        }
        self.repo.get_by_identifier(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let instance_identifier = self.identifier_for(key).await?;
        if self.repo.delete(&instance_identifier).await? {
            info!(%instance_identifier, "orchestrator deleted");
            Ok(())
        } else {
            Err(DelegateError::OrchestratorNotFound(key.to_string()))
        }
    }

    async fn identifier_for(&self, key: &str) -> Result<String> {
        self.find(key)
            .await?
            .map(|record| record.instance_identifier)
            .ok_or_else(|| DelegateError::OrchestratorNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ExecutionContext;
    use crate::operators::{Operator, OperatorConfig, OperatorOutput};
    use crate::testing::{fixed_clock, orchestrator_repo};
    use async_trait::async_trait;

    struct Named(OperatorConfig);

    #[async_trait]
    impl Operator for Named {
        fn config(&self) -> &OperatorConfig {
            &self.0
        }

        async fn execute(&self, _ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput> {
            Ok(OperatorOutput::Empty)
        }
    }

    async fn service(names: &[&str]) -> OrchestratorService {
        let mut registry = OperatorRegistry::new();
        for name in names {
            registry
                .register(Arc::new(Named(OperatorConfig::new("pkg", *name))))
                .unwrap();
        }
        let clock = fixed_clock();
        OrchestratorService::new(orchestrator_repo(&clock).await, Arc::new(registry))
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_record() {
        let service = service(&["export", "brain"]).await;
        let first = service.register("orch-1", Some("gpu box")).await.unwrap();
        let second = service.register("orch-1", Some("gpu box")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.available_operators, vec!["pkg/brain", "pkg/export"]);
        assert_eq!(service.count(None, true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deactivate_and_delete_unknown_are_not_found() {
        let service = service(&[]).await;
        assert!(service.deactivate("ghost").await.unwrap_err().is_not_found());
        assert!(service.delete("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn id_and_identifier_both_address_a_record() {
        let service = service(&["export"]).await;
        let first = service.register("gpu-1", None).await.unwrap();
        let second = service.register("gpu-2", None).await.unwrap();

        // Display form carries the `orch-` prefix; the bare ULID works too.
        let deactivated = service.deactivate(&first.id.to_string()).await.unwrap();
        assert_eq!(deactivated.instance_identifier, "gpu-1");
        assert!(!deactivated.is_active());
        assert_eq!(service.find(&first.id.key()).await.unwrap().unwrap().id, first.id);
        assert_eq!(service.find("gpu-2").await.unwrap().unwrap().id, second.id);

        service.delete(&second.id.key()).await.unwrap();
        assert!(service.get_by_identifier("gpu-2").await.unwrap().is_none());
        service.delete("gpu-1").await.unwrap();
        assert_eq!(service.count(None, true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let service = service(&[]).await;
        let stray = crate::domain::OrchestratorId::from_ulid(ulid::Ulid::nil());
        assert!(service.find(&stray.to_string()).await.unwrap().is_none());
        assert!(service.deactivate(&stray.to_string()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deactivated_orchestrators_are_listed_on_request() {
        let service = service(&["export"]).await;
        service.register("orch-1", None).await.unwrap();
        service.deactivate("orch-1").await.unwrap();

        let paging = Paging::default();
        assert!(service.list(&paging, None, false).await.unwrap().is_empty());
        assert_eq!(service.list(&paging, None, true).await.unwrap().len(), 1);
        assert!(
            service
                .get_by_identifier("orch-1")
                .await
                .unwrap()
                .is_some_and(|r| !r.is_active())
        );
    }
}
