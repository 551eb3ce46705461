//! Executor: prepare (resolve + validate), pick a mode, run.
//!
//! # Design
//! - `prepare` returns its outcome as data (`Preparation`); only an unknown
//!   operator URI is an `Err`.
//! - `run` spawns the operator on its own task so a panic is contained and
//!   reported like any other operator fault.
//! - Streams are drained here; the caller sees the last value, plus every
//!   item through the forwarder when it attached one.
//! - A stream counts as successful only if its producer ended with `Ok`.
//!   Values sent before a failure are dropped from the result.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::context::ExecutionContext;
use crate::domain::{ExecutionResult, RequestParams, Result};
use crate::operators::{ExecutionItem, Operator, OperatorOutput, OperatorRegistry};
use crate::ports::{DatasetCatalog, SecretsResolver};
use crate::schema::{Property, ValidationFailure, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Immediate,
    Delegated,
}

/// The chosen mode plus whatever had to be overridden to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: ExecutionMode,
    pub warnings: Vec<String>,
}

impl ModeDecision {
    fn plain(mode: ExecutionMode) -> Self {
        Self {
            mode,
            warnings: Vec::new(),
        }
    }

    fn overridden(mode: ExecutionMode, warning: String) -> Self {
        Self {
            mode,
            warnings: vec![warning],
        }
    }
}

/// An operator with a context whose params passed validation.
pub struct PreparedOperation {
    pub operator: Arc<dyn Operator>,
    pub context: Arc<ExecutionContext>,
    pub inputs_schema: Option<Property>,
}

pub enum Preparation {
    Ready(PreparedOperation),
    Invalid(ValidationFailure),
    /// A resolve hook (secrets, input schema) failed.
    Failed(ExecutionResult),
}

#[derive(Clone)]
pub struct Executor {
    registry: Arc<OperatorRegistry>,
    secrets: Option<Arc<dyn SecretsResolver>>,
    catalog: Option<Arc<dyn DatasetCatalog>>,
}

impl Executor {
    pub fn new(registry: Arc<OperatorRegistry>) -> Self {
        Self {
            registry,
            secrets: None,
            catalog: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DatasetCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    /// A fresh context wired to this executor's secrets and catalog.
    pub fn context(&self, request_params: RequestParams) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(request_params);
        if let Some(secrets) = &self.secrets {
            ctx = ctx.with_secrets(Arc::clone(secrets));
        }
        if let Some(catalog) = &self.catalog {
            ctx = ctx.with_catalog(Arc::clone(catalog));
        }
        ctx
    }

    pub async fn prepare(&self, request_params: RequestParams) -> Result<Preparation> {
        self.prepare_context(self.context(request_params)).await
    }

    /// Resolve the operator, its secrets and input schema, then validate.
    pub async fn prepare_context(&self, ctx: ExecutionContext) -> Result<Preparation> {
        let operator = self.registry.resolve(ctx.operator_uri())?;
        let ctx = Arc::new(ctx);

        if let Err(err) = ctx.resolve_secrets(&operator.config().secrets).await {
            warn!(operator = %ctx.operator_uri(), error = %err, "secret resolution failed");
            return Ok(Preparation::Failed(ExecutionResult::from_error(&err)));
        }

        let inputs_schema = match operator.resolve_input(&ctx).await {
            Ok(schema) => schema,
            Err(err) => {
                warn!(operator = %ctx.operator_uri(), error = %err, "resolve_input failed");
                return Ok(Preparation::Failed(ExecutionResult::from_error(&err)));
            }
        };

        if let Some(schema) = &inputs_schema
            && let Err(failure) = validate(schema, ctx.params())
        {
            debug!(operator = %ctx.operator_uri(), %failure, "params rejected");
            return Ok(Preparation::Invalid(failure));
        }

        Ok(Preparation::Ready(PreparedOperation {
            operator,
            context: ctx,
            inputs_schema,
        }))
    }
}

/// Decide between running now and queueing. Never fails; every override is
/// reported as a warning.
pub fn decide_execution_mode(operator: &dyn Operator, ctx: &ExecutionContext) -> ModeDecision {
    use ExecutionMode::{Delegated, Immediate};

    // Worker side: the operation is already in the queue.
    if ctx.is_delegated() {
        return ModeDecision::plain(Immediate);
    }

    let options = operator.resolve_execution_options(ctx);
    let wants_delegation = ctx
        .request_params()
        .delegated
        .or_else(|| operator.resolve_delegation(ctx))
        .unwrap_or(options.default_choice_to_delegated);

    let uri = operator.uri();
    let decision = match (
        wants_delegation,
        options.allow_immediate_execution,
        options.allow_delegated_execution,
    ) {
        (_, false, false) => ModeDecision::overridden(
            Immediate,
            format!("{uri} allows neither immediate nor delegated execution; running immediately"),
        ),
        (true, _, true) => ModeDecision::plain(Delegated),
        (true, true, false) => ModeDecision::overridden(
            Immediate,
            format!("{uri} does not support delegated execution; running immediately"),
        ),
        (false, true, _) => ModeDecision::plain(Immediate),
        (false, false, true) => ModeDecision::overridden(
            Delegated,
            format!("{uri} does not support immediate execution; delegating"),
        ),
    };

    for warning in &decision.warnings {
        warn!(operator = %uri, "{warning}");
    }
    decision
}

/// Run `operator` to completion.
///
/// With `exhaust`, stream items are drained and progress items are written
/// through the context; otherwise each item goes to `forward` (if any).
/// Either way the result is the last value produced.
pub async fn run(
    operator: Arc<dyn Operator>,
    ctx: Arc<ExecutionContext>,
    exhaust: bool,
    forward: Option<&mpsc::UnboundedSender<ExecutionItem>>,
) -> ExecutionResult {
    let uri = operator.uri();
    let task = tokio::spawn({
        let operator = Arc::clone(&operator);
        let ctx = Arc::clone(&ctx);
        async move { operator.execute(ctx).await }
    });

    let mut result = match task.await {
        Ok(Ok(output)) => match drain(output, &ctx, exhaust, forward).await {
            Ok(value) => ExecutionResult::success(value),
            Err(err) => ExecutionResult::from_error(&err),
        },
        Ok(Err(err)) => {
            error!(operator = %uri, error = %err, "operator failed");
            ExecutionResult::from_error(&err)
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                format!("operator panicked: {}", panic_message(join_err.into_panic()))
            } else {
                "operator task was cancelled".to_string()
            };
            error!(operator = %uri, "{message}");
            ExecutionResult::failure(format!("{uri}: {message}"), message)
        }
    };

    result.triggers = ctx.take_triggers();
    result
}

async fn drain(
    output: OperatorOutput,
    ctx: &ExecutionContext,
    exhaust: bool,
    forward: Option<&mpsc::UnboundedSender<ExecutionItem>>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let mut stream = match output {
        OperatorOutput::Empty => return Ok(None),
        OperatorOutput::Value(value) => return Ok(Some(value)),
        OperatorOutput::Stream(stream) => stream,
    };

    let mut last = None;
    while let Some(item) = stream.next().await {
        if let ExecutionItem::Value(value) = &item {
            last = Some(value.clone());
        }
        if exhaust {
            if let ExecutionItem::Progress(status) = item {
                ctx.report(status).await?;
            }
        } else if let Some(tx) = forward {
            // A caller that stopped listening does not stop the run.
            let _ = tx.send(item);
        }
    }
    stream.finish().await?;
    Ok(last)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
