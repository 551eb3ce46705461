//! Operators: the units of work the engine resolves, validates and runs.
//!
//! An operator is a plugin capability addressed by URI (`plugin/name`). The
//! engine never looks inside it; it asks for the input schema, the execution
//! policy and finally runs `execute`, which yields a single value or a stream.

pub mod registry;
pub mod stream;
pub mod typed;

pub use registry::OperatorRegistry;
pub use stream::{ExecutionItem, ExecutionStream, OperatorOutput, StreamSender};
pub use typed::{Typed, TypedOperator};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::ExecutionContext;
use crate::schema::Property;

/// Which execution modes an operator supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub allow_immediate_execution: bool,
    pub allow_delegated_execution: bool,
    pub default_choice_to_delegated: bool,
}

impl ExecutionOptions {
    pub fn immediate_only() -> Self {
        Self {
            allow_immediate_execution: true,
            allow_delegated_execution: false,
            default_choice_to_delegated: false,
        }
    }

    pub fn delegated_only() -> Self {
        Self {
            allow_immediate_execution: false,
            allow_delegated_execution: true,
            default_choice_to_delegated: true,
        }
    }

    /// Both modes allowed; `default_delegated` picks when nobody asks.
    pub fn either(default_delegated: bool) -> Self {
        Self {
            allow_immediate_execution: true,
            allow_delegated_execution: true,
            default_choice_to_delegated: default_delegated,
        }
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::immediate_only()
    }
}

/// Static description of an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub execution_options: ExecutionOptions,
    /// Secret keys resolved into the context before validation.
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl OperatorConfig {
    pub fn new(plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_execution_options(mut self, options: ExecutionOptions) -> Self {
        self.execution_options = options;
        self
    }

    pub fn with_secrets(mut self, keys: &[&str]) -> Self {
        self.secrets = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn uri(&self) -> String {
        format!("{}/{}", self.plugin, self.name)
    }
}

/// A runnable operator.
///
/// Only `config` and `execute` are required; the resolve hooks default to
/// "no schema" and the static execution options.
#[async_trait]
pub trait Operator: Send + Sync {
    fn config(&self) -> &OperatorConfig;

    fn uri(&self) -> String {
        self.config().uri()
    }

    async fn resolve_input(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
        Ok(None)
    }

    async fn resolve_output(&self, _ctx: &ExecutionContext) -> anyhow::Result<Option<Property>> {
        Ok(None)
    }

    fn resolve_execution_options(&self, _ctx: &ExecutionContext) -> ExecutionOptions {
        self.config().execution_options.clone()
    }

    /// The operator's own delegation preference for this invocation.
    fn resolve_delegation(&self, _ctx: &ExecutionContext) -> Option<bool> {
        None
    }

    async fn execute(&self, ctx: Arc<ExecutionContext>) -> anyhow::Result<OperatorOutput>;
}
