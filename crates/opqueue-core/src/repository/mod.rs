//! Repositories: typed access to the operation and orchestrator collections.

pub mod operations;
pub mod orchestrators;

pub use operations::{OPERATION_SEARCH_FIELDS, OperationFilter, OperationRepository, Transition};
pub use orchestrators::{ORCHESTRATOR_SEARCH_FIELDS, OrchestratorRepository};
