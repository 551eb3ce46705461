//! Built-in operators shipped with the CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use opqueue_core::app::ExecutionContext;
use opqueue_core::operators::{
    ExecutionOptions, ExecutionStream, Operator, OperatorConfig, OperatorOutput, TypedOperator,
};
use opqueue_core::schema::{ObjectSchema, Property, PropertyType};

pub const PLUGIN: &str = "@builtin";

/// Returns its `message` param. Runs either way; immediate by default.
pub struct Echo {
    config: OperatorConfig,
}

impl Echo {
    pub fn new() -> Self {
        Self {
            config: OperatorConfig::new(PLUGIN, "echo")
                .with_label("Echo")
                .with_description("Return the message param")
                .with_execution_options(ExecutionOptions::either(false)),
        }
    }
}

#[async_trait]
impl Operator for Echo {
    fn config(&self) -> &OperatorConfig {
        &self.config
    }

    async fn resolve_input(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
        Ok(Some(ObjectSchema::new().str("message", true).into_property()))
    }

    async fn execute(&self, ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput> {
        let message = ctx.param("message").cloned().unwrap_or(Value::Null);
        Ok(json!({ "message": message }).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct CountParams {
    pub n: u64,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Counts to `n`, streaming progress. Delegated by default.
pub struct Count {
    config: OperatorConfig,
}

impl Count {
    pub fn new() -> Self {
        Self {
            config: OperatorConfig::new(PLUGIN, "count")
                .with_label("Count")
                .with_description("Count to n, reporting progress")
                .with_execution_options(ExecutionOptions::either(true)),
        }
    }
}

#[async_trait]
impl TypedOperator for Count {
    type Params = CountParams;

    fn config(&self) -> &OperatorConfig {
        &self.config
    }

    fn input_schema(&self) -> Option<Property> {
        Some(
            ObjectSchema::new()
                .property("n", Property::new(PropertyType::int_range(Some(1), None)).required())
                .property(
                    "delay_ms",
                    Property::new(PropertyType::int_range(Some(0), Some(60_000)))
                        .with_default(json!(0)),
                )
                .into_property(),
        )
    }

    async fn run(
        &self,
        params: CountParams,
        _ctx: Arc<ExecutionContext>,
    ) -> anyhow::Result<OperatorOutput> {
        let stream = ExecutionStream::spawn(16, move |tx| async move {
            for i in 1..=params.n {
                if params.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
                }
                let label = format!("{i}/{}", params.n);
                tx.progress(Some(i as f64 / params.n as f64), Some(&label)).await?;
            }
            tx.value(json!({ "n": params.n })).await
        });
        Ok(OperatorOutput::Stream(stream))
    }
}
