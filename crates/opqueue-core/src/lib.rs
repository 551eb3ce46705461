//! opqueue-core
//!
//! Delegated operation engine: run operators now or queue them for a worker.
//!
//! # Modules
//! - **domain**: ids, run states, operation/orchestrator records, paging, results, errors
//! - **schema**: operator input schemas and parameter validation
//! - **ports**: what the engine consumes (DocumentCollection, SecretsResolver, DatasetCatalog, Clock, IdGenerator)
//! - **impls**: in-memory store with snapshots, env/static secrets, in-memory dataset catalog
//! - **repository**: operation and orchestrator persistence over a DocumentCollection
//! - **operators**: the Operator trait, typed operators, streams and the registry
//! - **app**: executor, services, continual executor and the builder
//! - **config**: EngineConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod operators;
pub mod ports;
pub mod repository;
pub mod schema;

#[cfg(test)]
mod testing;

pub use app::{App, AppBuilder, BuildError, ContinualExecutor, ExecutionContext, Invocation};
pub use config::EngineConfig;
pub use domain::{DelegateError, ExecutionResult, RequestParams, Result, RunState};
pub use operators::{Operator, OperatorConfig, OperatorRegistry, TypedOperator};
