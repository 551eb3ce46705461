//! AppBuilder: wiring and startup validation.
//!
//! Store, secrets, dataset catalog and clock are all passed in here; nothing
//! in the crate reaches for a global. `build` fails fast when an operator the
//! caller expects is not registered.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::continual::ContinualExecutor;
use super::delegated::DelegatedOperationService;
use super::executor::{ExecutionMode, Executor, Preparation, decide_execution_mode, run};
use super::orchestrators::OrchestratorService;
use crate::domain::{DelegateError, ExecutionResult, NewOperation, RequestParams, Result};
use crate::impls::InMemoryCollection;
use crate::operators::{ExecutionItem, Operator, OperatorRegistry, TypedOperator};
use crate::ports::{
    Clock, DatasetCatalog, DocumentCollection, SecretsResolver, SystemClock, UlidGenerator,
};
use crate::repository::{OperationRepository, OrchestratorRepository};
use crate::schema::ValidationFailure;

/// Collection names used when the builder creates in-memory collections.
pub const OPERATIONS_COLLECTION: &str = "delegated_ops";
pub const ORCHESTRATORS_COLLECTION: &str = "orchestrators";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing operators: {0:?}. These operators were expected but not registered.")]
    MissingOperators(Vec<String>),

    #[error(transparent)]
    Delegate(#[from] DelegateError),
}

/// Builds an [`App`].
///
/// ```ignore
/// let app = AppBuilder::new()
///     .register(Arc::new(ExportOperator::default()))?
///     .catalog(catalog)
///     .expect_operators(&["@builtin/export"])
///     .build()
///     .await?;
/// ```
pub struct AppBuilder {
    registry: OperatorRegistry,
    operations: Option<Arc<dyn DocumentCollection>>,
    orchestrators: Option<Arc<dyn DocumentCollection>>,
    secrets: Option<Arc<dyn SecretsResolver>>,
    catalog: Option<Arc<dyn DatasetCatalog>>,
    clock: Arc<dyn Clock>,
    default_target: Option<String>,
    expected_operators: Option<Vec<String>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: OperatorRegistry::new(),
            operations: None,
            orchestrators: None,
            secrets: None,
            catalog: None,
            clock: Arc::new(SystemClock),
            default_target: None,
            expected_operators: None,
        }
    }

    pub fn register(mut self, operator: Arc<dyn Operator>) -> Result<Self> {
        self.registry.register(operator)?;
        Ok(self)
    }

    pub fn register_typed<O: TypedOperator>(mut self, operator: O) -> Result<Self> {
        self.registry.register_typed(operator)?;
        Ok(self)
    }

    pub fn operations_collection(mut self, collection: Arc<dyn DocumentCollection>) -> Self {
        self.operations = Some(collection);
        self
    }

    pub fn orchestrators_collection(mut self, collection: Arc<dyn DocumentCollection>) -> Self {
        self.orchestrators = Some(collection);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretsResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn DatasetCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Target for delegated invocations that do not name one.
    pub fn default_delegation_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }

    pub fn expect_operators(mut self, uris: &[&str]) -> Self {
        self.expected_operators = Some(uris.iter().map(|uri| uri.to_string()).collect());
        self
    }

    pub async fn build(self) -> std::result::Result<App, BuildError> {
        if let Some(expected) = &self.expected_operators {
            let missing: Vec<String> = expected
                .iter()
                .filter(|uri| !self.registry.contains(uri))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOperators(missing));
            }
        }

        let clock = self.clock;
        let in_memory = |name: &str| -> Arc<dyn DocumentCollection> {
            let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
            Arc::new(InMemoryCollection::with_id_generator(name, ids))
        };
        let operations_store = self
            .operations
            .unwrap_or_else(|| in_memory(OPERATIONS_COLLECTION));
        let orchestrators_store = self
            .orchestrators
            .unwrap_or_else(|| in_memory(ORCHESTRATORS_COLLECTION));

        let operation_repo = OperationRepository::new(operations_store, Arc::clone(&clock));
        operation_repo.ensure_indexes().await?;
        let orchestrator_repo = OrchestratorRepository::new(orchestrators_store, Arc::clone(&clock));
        orchestrator_repo.ensure_indexes().await?;

        let registry = Arc::new(self.registry);
        let mut executor = Executor::new(Arc::clone(&registry));
        let mut operations = DelegatedOperationService::new(operation_repo);
        if let Some(secrets) = self.secrets {
            executor = executor.with_secrets(secrets);
        }
        if let Some(catalog) = self.catalog {
            executor = executor.with_catalog(Arc::clone(&catalog));
            operations = operations.with_catalog(catalog);
        }

        debug!(operators = registry.len(), "app built");
        Ok(App {
            orchestrators: OrchestratorService::new(orchestrator_repo, Arc::clone(&registry)),
            registry,
            executor,
            operations,
            clock,
            default_target: self.default_target,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What `execute_or_delegate` produced.
///
/// Rejected params come back as data, the same way a run that failed comes
/// back as an `ExecutionResult` carrying its error. Only the caller decides
/// whether either becomes an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Ran (successfully or not) or was queued.
    Executed(ExecutionResult),
    /// Params did not match the operator's input schema. Nothing ran.
    Invalid(ValidationFailure),
}

impl Invocation {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Invocation::Executed(result) => Some(result),
            Invocation::Invalid(_) => None,
        }
    }

    pub fn validation_failure(&self) -> Option<&ValidationFailure> {
        match self {
            Invocation::Invalid(failure) => Some(failure),
            Invocation::Executed(_) => None,
        }
    }

    /// Turn rejected params into `DelegateError::Validation` and a captured
    /// fault into `DelegateError::Execution`. For the outermost boundary.
    pub fn raise_exceptions(self) -> Result<ExecutionResult> {
        match self {
            Invocation::Executed(result) => result.raise_exceptions(),
            Invocation::Invalid(failure) => Err(failure.into()),
        }
    }
}

/// A wired engine: registry, executor and the two services.
pub struct App {
    registry: Arc<OperatorRegistry>,
    executor: Executor,
    operations: DelegatedOperationService,
    orchestrators: OrchestratorService,
    clock: Arc<dyn Clock>,
    default_target: Option<String>,
}

impl App {
    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn operations(&self) -> &DelegatedOperationService {
        &self.operations
    }

    pub fn orchestrators(&self) -> &OrchestratorService {
        &self.orchestrators
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A worker loop for `target`, sharing this app's services.
    pub fn continual_executor(&self, target: impl Into<String>) -> ContinualExecutor {
        ContinualExecutor::new(target, self.operations.clone(), self.executor.clone())
    }

    /// Run an operator now or queue it, whichever its execution options and
    /// the request pick.
    ///
    /// `Err` only for an unknown operator or a store failure while queueing.
    pub async fn execute_or_delegate(&self, request_params: RequestParams) -> Result<Invocation> {
        self.execute_or_delegate_with(request_params, None).await
    }

    /// As `execute_or_delegate`; immediate runs forward stream items to
    /// `forward`.
    pub async fn execute_or_delegate_with(
        &self,
        request_params: RequestParams,
        forward: Option<&tokio::sync::mpsc::UnboundedSender<ExecutionItem>>,
    ) -> Result<Invocation> {
        let prepared = match self.executor.prepare(request_params).await? {
            Preparation::Ready(prepared) => prepared,
            Preparation::Invalid(failure) => return Ok(Invocation::Invalid(failure)),
            Preparation::Failed(result) => return Ok(Invocation::Executed(result)),
        };

        let decision = decide_execution_mode(prepared.operator.as_ref(), &prepared.context);
        let outputs_schema = match prepared.operator.resolve_output(&prepared.context).await {
            Ok(schema) => schema.map(serde_json::to_value).transpose()?,
            Err(err) => return Ok(Invocation::Executed(ExecutionResult::from_error(&err))),
        };

        let mut result = match decision.mode {
            ExecutionMode::Immediate => {
                run(prepared.operator, prepared.context, false, forward).await
            }
            ExecutionMode::Delegated => {
                let request = prepared.context.request_params().clone();
                let metadata = json!({
                    "inputs_schema": prepared.inputs_schema,
                    "outputs_schema": outputs_schema,
                });
                let config = prepared.operator.config();
                let mut op = NewOperation::new(config.uri(), request.clone()).with_metadata(metadata);
                op.delegation_target = request
                    .delegation_target
                    .or_else(|| self.default_target.clone());
                op.label = config.label.clone();

                let record = self.operations.queue(op).await?;
                ExecutionResult::delegated(json!({ "id": record.id }))
            }
        };
        result.outputs_schema = outputs_schema;
        result.warnings = decision.warnings;
        Ok(Invocation::Executed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ExecutionContext;
    use crate::domain::RunState;
    use crate::operators::{ExecutionOptions, OperatorConfig, OperatorOutput};
    use crate::repository::OperationFilter;
    use crate::schema::{ObjectSchema, Property};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo(OperatorConfig);

    #[async_trait]
    impl Operator for Echo {
        fn config(&self) -> &OperatorConfig {
            &self.0
        }

        async fn resolve_input(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
            Ok(Some(ObjectSchema::new().str("message", true).into_property()))
        }

        async fn execute(&self, ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput> {
            Ok(ctx.param("message").cloned().unwrap_or(Value::Null).into())
        }
    }

    fn echo(options: ExecutionOptions) -> Arc<dyn Operator> {
        Arc::new(Echo(
            OperatorConfig::new("@test", "echo")
                .with_label("Echo")
                .with_execution_options(options),
        ))
    }

    fn request(message: &str) -> RequestParams {
        RequestParams::new("@test/echo").with_params(json!({ "message": message }))
    }

    async fn executed(app: &App, params: RequestParams) -> ExecutionResult {
        match app.execute_or_delegate(params).await.unwrap() {
            Invocation::Executed(result) => result,
            Invocation::Invalid(failure) => panic!("unexpected validation failure: {failure}"),
        }
    }

    #[tokio::test]
    async fn build_succeeds_when_expected_operators_are_registered() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::default()))
            .unwrap()
            .expect_operators(&["@test/echo"])
            .build()
            .await;
        assert!(app.is_ok());
    }

    #[tokio::test]
    async fn build_reports_missing_operators() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::default()))
            .unwrap()
            .expect_operators(&["@test/echo", "@test/export"])
            .build()
            .await;
        assert!(matches!(
            app,
            Err(BuildError::MissingOperators(missing)) if missing == vec!["@test/export".to_string()]
        ));
    }

    #[tokio::test]
    async fn immediate_operators_run_inline() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::immediate_only()))
            .unwrap()
            .build()
            .await
            .unwrap();

        let result = executed(&app, request("hi")).await;
        assert!(!result.delegated);
        assert_eq!(result.result, Some(json!("hi")));
        assert_eq!(app.operations().count(&OperationFilter::new(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delegated_operators_are_queued_with_schemas() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::delegated_only()))
            .unwrap()
            .default_delegation_target("worker-A")
            .build()
            .await
            .unwrap();

        let result = executed(&app, request("hi")).await;
        assert!(result.delegated);
        let id: crate::domain::OperationId = serde_json::from_value(result.result.unwrap()["id"].clone()).unwrap();

        let record = app.operations().get(id).await.unwrap().unwrap();
        assert_eq!(record.run_state, RunState::Queued);
        assert_eq!(record.delegation_target.as_deref(), Some("worker-A"));
        assert_eq!(record.label.as_deref(), Some("Echo"));
        assert_eq!(record.metadata.unwrap()["inputs_schema"]["type"], "object");

        // The worker side picks it up and runs it immediately.
        assert_eq!(app.continual_executor("worker-A").run_once().await.unwrap(), 1);
        let done = app.operations().get(id).await.unwrap().unwrap();
        assert_eq!(done.result.unwrap().result, Some(json!("hi")));
    }

    #[tokio::test]
    async fn invalid_params_are_returned_as_data() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::delegated_only()))
            .unwrap()
            .build()
            .await
            .unwrap();

        let invocation = app
            .execute_or_delegate(RequestParams::new("@test/echo"))
            .await
            .unwrap();
        assert_eq!(invocation.validation_failure().unwrap().paths(), vec!["message"]);
        assert!(invocation.result().is_none());
        // Nothing was queued for params that never validated.
        assert_eq!(app.operations().count(&OperationFilter::new(), None).await.unwrap(), 0);

        match invocation.raise_exceptions() {
            Err(DelegateError::Validation(failure)) => assert_eq!(failure.paths(), vec!["message"]),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_failures_and_validation_failures_are_both_ok() {
        struct Broken(OperatorConfig);

        #[async_trait]
        impl Operator for Broken {
            fn config(&self) -> &OperatorConfig {
                &self.0
            }

            async fn resolve_input(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
                anyhow::bail!("schema service offline")
            }

            async fn execute(&self, _ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput> {
                Ok(OperatorOutput::Empty)
            }
        }

        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::default()))
            .unwrap()
            .register(Arc::new(Broken(OperatorConfig::new("@test", "broken"))))
            .unwrap()
            .build()
            .await
            .unwrap();

        let broken = app.execute_or_delegate(RequestParams::new("@test/broken")).await.unwrap();
        assert!(broken.result().unwrap().is_error());
        let invalid = app.execute_or_delegate(RequestParams::new("@test/echo")).await.unwrap();
        assert!(invalid.validation_failure().is_some());
        // Only an unknown operator is a hard error.
        assert!(app.execute_or_delegate(RequestParams::new("@test/nope")).await.is_err());
    }

    #[tokio::test]
    async fn unsupported_delegation_request_warns_and_runs() {
        let app = AppBuilder::new()
            .register(echo(ExecutionOptions::immediate_only()))
            .unwrap()
            .build()
            .await
            .unwrap();

        let mut params = request("hi");
        params.delegated = Some(true);
        let result = executed(&app, params).await;
        assert!(!result.delegated);
        assert_eq!(result.warnings.len(), 1);
    }
}
