//! Execution context: everything one operator invocation can see.
//!
//! Built per invocation and never persisted; only `request_params` survives
//! a trip through the queue. Secrets and the dataset handle are resolved
//! lazily and cached for the lifetime of the context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::domain::{OperationId, ProgressStatus, RequestParams, TriggerRequest};
use crate::ports::{DatasetCatalog, DatasetHandle, SecretsResolver};

/// Where progress of a delegated run is written.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report_progress(
        &self,
        operation_id: OperationId,
        progress: ProgressStatus,
    ) -> anyhow::Result<()>;
}

pub struct ExecutionContext {
    request_params: RequestParams,
    secrets_resolver: Option<Arc<dyn SecretsResolver>>,
    secrets: Mutex<HashMap<String, Option<String>>>,
    catalog: Option<Arc<dyn DatasetCatalog>>,
    dataset: OnceCell<Option<DatasetHandle>>,
    triggers: std::sync::Mutex<Vec<TriggerRequest>>,
    operation: Option<(OperationId, Arc<dyn ProgressSink>)>,
    delegated: bool,
}

impl ExecutionContext {
    pub fn new(request_params: RequestParams) -> Self {
        Self {
            request_params,
            secrets_resolver: None,
            secrets: Mutex::new(HashMap::new()),
            catalog: None,
            dataset: OnceCell::new(),
            triggers: std::sync::Mutex::new(Vec::new()),
            operation: None,
            delegated: false,
        }
    }

    pub fn with_secrets(mut self, resolver: Arc<dyn SecretsResolver>) -> Self {
        self.secrets_resolver = Some(resolver);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DatasetCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Mark the context as executing queued operation `id`. Progress reported
    /// through the context is then written to `sink`.
    pub fn bind_operation(mut self, id: OperationId, sink: Arc<dyn ProgressSink>) -> Self {
        self.operation = Some((id, sink));
        self.delegated = true;
        self
    }

    pub fn request_params(&self) -> &RequestParams {
        &self.request_params
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.request_params.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.request_params.param(name)
    }

    pub fn operator_uri(&self) -> &str {
        &self.request_params.operator_uri
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.request_params.dataset_id.as_deref()
    }

    /// Is this the worker-side run of an already delegated operation?
    pub fn is_delegated(&self) -> bool {
        self.delegated
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        self.operation.as_ref().map(|(id, _)| *id)
    }

    /// Resolve every key not already cached. Each key hits the resolver at
    /// most once per context, even across concurrent callers.
    pub async fn resolve_secrets(&self, keys: &[String]) -> anyhow::Result<()> {
        let Some(resolver) = &self.secrets_resolver else {
            return Ok(());
        };
        let mut cache = self.secrets.lock().await;
        for key in keys {
            if cache.contains_key(key) {
                continue;
            }
            let value = resolver.resolve(key, self.operator_uri()).await?;
            debug!(key = %key, found = value.is_some(), "resolved secret");
            cache.insert(key.clone(), value);
        }
        Ok(())
    }

    /// A secret value, resolving (and caching) it on first use.
    pub async fn secret(&self, key: &str) -> anyhow::Result<Option<String>> {
        if let Some(value) = self.secrets.lock().await.get(key) {
            return Ok(value.clone());
        }
        self.resolve_secrets(&[key.to_string()]).await?;
        Ok(self.secrets.lock().await.get(key).cloned().flatten())
    }

    /// The target dataset, loaded on first use. `None` when the request has
    /// no dataset or no catalog is attached.
    pub async fn dataset(&self) -> anyhow::Result<Option<DatasetHandle>> {
        let handle = self
            .dataset
            .get_or_try_init(|| async {
                match (&self.catalog, self.dataset_id()) {
                    (Some(catalog), Some(id)) => catalog.load(id).await,
                    _ => Ok(None),
                }
            })
            .await?;
        Ok(handle.clone())
    }

    /// Ask the caller to run a deferred side effect once execution finishes.
    pub fn trigger(&self, name: impl Into<String>, params: Value) {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        triggers.push(TriggerRequest {
            name: name.into(),
            params,
        });
    }

    pub(crate) fn take_triggers(&self) -> Vec<TriggerRequest> {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *triggers)
    }

    /// Report progress. Written through to the operation record when the
    /// context is bound to one; otherwise a no-op.
    pub async fn set_progress(&self, progress: Option<f64>, label: Option<&str>) -> anyhow::Result<()> {
        self.report(ProgressStatus::new(progress, label.map(str::to_string)))
            .await
    }

    pub(crate) async fn report(&self, status: ProgressStatus) -> anyhow::Result<()> {
        match &self.operation {
            Some((id, sink)) => sink.report_progress(*id, status).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryDatasetCatalog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSecrets {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretsResolver for CountingSecrets {
        async fn resolve(&self, key: &str, _operator_uri: &str) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((key == "API_KEY").then(|| "s3cret".to_string()))
        }
    }

    #[tokio::test]
    async fn secrets_are_resolved_once_per_context() {
        let resolver = Arc::new(CountingSecrets {
            calls: AtomicUsize::new(0),
        });
        let ctx = ExecutionContext::new(RequestParams::new("pkg/op")).with_secrets(resolver.clone());

        let keys = vec!["API_KEY".to_string(), "MISSING".to_string()];
        ctx.resolve_secrets(&keys).await.unwrap();
        ctx.resolve_secrets(&keys).await.unwrap();
        assert_eq!(ctx.secret("API_KEY").await.unwrap().as_deref(), Some("s3cret"));
        assert_eq!(ctx.secret("MISSING").await.unwrap(), None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dataset_is_loaded_lazily() {
        let catalog = Arc::new(InMemoryDatasetCatalog::new());
        catalog.add("ds-1", "quickstart").await;
        let ctx = ExecutionContext::new(RequestParams::new("pkg/op").with_dataset("ds-1"))
            .with_catalog(catalog.clone());

        assert_eq!(ctx.dataset().await.unwrap().unwrap().name, "quickstart");
        // Cached: removal from the catalog is not seen by this context.
        catalog.remove("ds-1").await;
        assert!(ctx.dataset().await.unwrap().is_some());

        let bare = ExecutionContext::new(RequestParams::new("pkg/op"));
        assert!(bare.dataset().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn triggers_accumulate_until_taken() {
        let ctx = ExecutionContext::new(RequestParams::new("pkg/op"));
        ctx.trigger("reload_dataset", Value::Null);
        ctx.trigger("notify", serde_json::json!({"msg": "done"}));
        let taken = ctx.take_triggers();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].name, "reload_dataset");
        assert!(ctx.take_triggers().is_empty());
    }

    #[tokio::test]
    async fn unbound_progress_is_a_noop() {
        let ctx = ExecutionContext::new(RequestParams::new("pkg/op"));
        ctx.set_progress(Some(0.5), Some("half")).await.unwrap();
        assert!(!ctx.is_delegated());
        assert!(ctx.operation_id().is_none());
    }
}
