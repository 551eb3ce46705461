//! Application layer: execution, the two services, the worker loop and the
//! builder that wires them.

pub mod builder;
pub mod context;
pub mod continual;
pub mod delegated;
pub mod executor;
pub mod orchestrators;
pub mod status;

pub use builder::{App, AppBuilder, BuildError, Invocation};
pub use context::{ExecutionContext, ProgressSink};
pub use continual::{ContinualExecutor, ShutdownHandle};
pub use delegated::{CleanupReport, DelegatedOperationService, OrphanReport};
pub use executor::{
    ExecutionMode, Executor, ModeDecision, Preparation, PreparedOperation, decide_execution_mode,
    run,
};
pub use orchestrators::OrchestratorService;
pub use status::QueueCounts;
