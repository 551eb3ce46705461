//! Domain model: ids, run states, records, paging and results.
//!
//! Everything here is plain data plus the rules that need no I/O: which run
//! state may follow which, how an id parses, how a failure is classified.
//! Persistence lives behind `ports::DocumentCollection`; the mapping between
//! records and documents lives in `repository`.
//!
//! # Records
//! - **OperationRecord**: one delegated operation and its lifecycle
//! - **OrchestratorRecord**: one registered worker identity
//!
//! # Values
//! - **ExecutionResult** / **OperationResult**: what a run produced, as
//!   returned to the caller and as stored on the record
//! - **Paging** / **Search**: list controls shared by both services

pub mod errors;
pub mod ids;
pub mod operation;
pub mod orchestrator;
pub mod paging;
pub mod result;
pub mod state;

pub use errors::{DelegateError, Result};
pub use ids::{Id, IdMarker, OperationId, OrchestratorId, ParseIdError};
pub use operation::{
    NewOperation, OperationContext, OperationRecord, OperationResult, ProgressStatus,
    RequestParams,
};
pub use orchestrator::OrchestratorRecord;
pub use paging::{DEFAULT_LIST_LIMIT, Paging, Search, SortBy, SortDirection};
pub use result::{ExecutionResult, TriggerRequest};
pub use state::RunState;
