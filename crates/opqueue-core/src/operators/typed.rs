//! Typed operators: params decoded into a `serde` type before `run`.
//!
//! `TypedOperator` is generic over its params type and therefore not
//! object-safe; `Typed<O>` erases it into a plain `Operator` so it can live in
//! the registry next to hand-written operators.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ExecutionOptions, Operator, OperatorConfig, OperatorOutput};
use crate::app::ExecutionContext;
use crate::schema::Property;

#[async_trait]
pub trait TypedOperator: Send + Sync + 'static {
    type Params: DeserializeOwned + Send;

    fn config(&self) -> &OperatorConfig;

    /// Schema the raw params are validated against before decoding.
    fn input_schema(&self) -> Option<Property> {
        None
    }

    fn execution_options(&self) -> ExecutionOptions {
        self.config().execution_options.clone()
    }

    async fn run(
        &self,
        params: Self::Params,
        ctx: Arc<ExecutionContext>,
    ) -> anyhow::Result<OperatorOutput>;
}

/// Adapter from `TypedOperator` to `Operator`.
pub struct Typed<O> {
    inner: O,
}

impl<O: TypedOperator> Typed<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<O: TypedOperator> Operator for Typed<O> {
    fn config(&self) -> &OperatorConfig {
        self.inner.config()
    }

    async fn resolve_input(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
        Ok(self.inner.input_schema())
    }

    fn resolve_execution_options(&self, _ctx: &ExecutionContext) -> ExecutionOptions {
        self.inner.execution_options()
    }

    async fn execute(&self, ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput> {
        let raw = Value::Object(ctx.request_params().params.clone());
        let params: O::Params = serde_json::from_value(raw)
            .with_context(|| format!("decode params for {}", self.uri()))?;
        self.inner.run(params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestParams;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct CountParams {
        n: u32,
    }

    struct Count(OperatorConfig);

    #[async_trait]
    impl TypedOperator for Count {
        type Params = CountParams;

        fn config(&self) -> &OperatorConfig {
            &self.0
        }

        async fn run(
            &self,
            params: CountParams,
            _ctx: Arc<ExecutionContext>,
        ) -> anyhow::Result<OperatorOutput> {
            Ok(json!({ "n": params.n }).into())
        }
    }

    fn context(params: Value) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(
            RequestParams::new("pkg/count").with_params(params),
        ))
    }

    #[tokio::test]
    async fn params_are_decoded_into_the_typed_struct() {
        let op = Typed::new(Count(OperatorConfig::new("pkg", "count")));
        let output = op.execute(context(json!({"n": 3}))).await.unwrap();
        assert!(matches!(output, OperatorOutput::Value(v) if v == json!({"n": 3})));
    }

    #[tokio::test]
    async fn decode_failure_names_the_operator() {
        let op = Typed::new(Count(OperatorConfig::new("pkg", "count")));
        let err = op.execute(context(json!({"n": "three"}))).await.unwrap_err();
        assert!(err.to_string().contains("pkg/count"));
    }
}
