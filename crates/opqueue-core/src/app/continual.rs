//! Continual executor: the worker-side poll loop for one delegation target.
//!
//! # Design
//! - One loop, one operation at a time. Claims go through `set_running`, so
//!   several executors on the same target never run the same record twice.
//! - Shutdown is cooperative: a `watch` flag checked at the top of every tick
//!   and raced against the idle sleep. A run in progress is never preempted.
//! - A process killed mid-run leaves its record RUNNING; nothing here
//!   reclaims it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::context::ProgressSink;
use super::delegated::DelegatedOperationService;
use super::executor::{Executor, Preparation, decide_execution_mode, run};
use super::orchestrators::OrchestratorService;
use crate::domain::{ExecutionResult, OperationRecord, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Requests shutdown of a running `ContinualExecutor`.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        // Ignore send error: the loop may already be gone.
        let _ = self.tx.send(true);
    }
}

struct Registration {
    orchestrators: OrchestratorService,
    description: Option<String>,
}

pub struct ContinualExecutor {
    target: String,
    service: DelegatedOperationService,
    executor: Executor,
    registration: Option<Registration>,
    poll_interval: Duration,
    page_size: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ContinualExecutor {
    pub fn new(
        target: impl Into<String>,
        service: DelegatedOperationService,
        executor: Executor,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            target: target.into(),
            service,
            executor,
            registration: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Register the target as an orchestrator when `run` starts and
    /// deactivate it when `run` returns.
    pub fn with_registration(
        mut self,
        orchestrators: OrchestratorService,
        description: Option<String>,
    ) -> Self {
        self.registration = Some(Registration {
            orchestrators,
            description,
        });
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Poll until shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if let Some(reg) = &self.registration {
            reg.orchestrators
                .register(&self.target, reg.description.as_deref())
                .await?;
        }
        info!(target_name = %self.target, interval = ?self.poll_interval, "continual executor started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(0) => true,
                Ok(processed) => {
                    debug!(processed, "tick finished");
                    false
                }
                Err(err) => {
                    error!(error = %err, "tick failed");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        if let Some(reg) = &self.registration
            && let Err(err) = reg.orchestrators.deactivate(&self.target).await
        {
            warn!(error = %err, "failed to deactivate orchestrator");
        }
        info!(target_name = %self.target, "continual executor stopped");
        Ok(())
    }

    /// One tick: claim and run every queued operation in one page. Returns
    /// how many this executor ran.
    pub async fn run_once(&self) -> Result<usize> {
        let queued = self
            .service
            .get_queued_operations(Some(&self.target), self.page_size)
            .await?;

        let mut processed = 0;
        for record in queued {
            if *self.shutdown_tx.borrow() {
                break;
            }
            let Some(claimed) = self.service.set_running(record.id).await? else {
                continue;
            };
            self.execute(claimed).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn execute(&self, record: OperationRecord) -> Result<()> {
        let sink: Arc<dyn ProgressSink> = Arc::new(self.service.clone());
        let ctx = self
            .executor
            .context(record.request_params().clone())
            .bind_operation(record.id, sink);

        let outcome = match self.executor.prepare_context(ctx).await {
            Ok(Preparation::Ready(prepared)) => {
                let decision = decide_execution_mode(prepared.operator.as_ref(), &prepared.context);
                debug!(id = %record.id, mode = ?decision.mode, "running delegated operation");
                run(prepared.operator, prepared.context, true, None).await
            }
            Ok(Preparation::Invalid(failure)) => {
                ExecutionResult::failure(format!("{failure:?}"), failure.to_string())
            }
            Ok(Preparation::Failed(result)) => result,
            Err(err) => ExecutionResult::failure(format!("{err:?}"), err.to_string()),
        };

        if self.service.finish(record.id, &outcome).await?.is_none() {
            // Failed by hand while running.
            warn!(id = %record.id, "operation left RUNNING before it finished");
        }
        Ok(())
    }
}
