//! opqueue CLI - operational tooling for delegated operations.
//!
//! State lives in JSON snapshots under `--data-dir`. Every store call locks
//! the snapshot, reads it, and writes it back when it changed something, so a
//! long-running `opqueue run` and one-shot commands can share a directory.

mod builtin;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opqueue_core::app::App;
use opqueue_core::app::builder::{OPERATIONS_COLLECTION, ORCHESTRATORS_COLLECTION};
use opqueue_core::domain::{
    OperationId, OperationRecord, OperationResult, Paging, RequestParams, RunState, Search,
    SortBy, SortDirection,
};
use opqueue_core::impls::{
    EnvSecretsResolver, InMemoryCollection, InMemoryDatasetCatalog, SnapshotCollection,
};
use opqueue_core::ports::DocumentCollection;
use opqueue_core::repository::{
    OPERATION_SEARCH_FIELDS, ORCHESTRATOR_SEARCH_FIELDS, OperationFilter,
};
use opqueue_core::{AppBuilder, EngineConfig, Invocation};

#[derive(Parser)]
#[command(name = "opqueue")]
#[command(about = "Delegated operation queue", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `opqueue_core=debug`. `RUST_LOG` wins.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// JSON config file; `OPQUEUE_*` variables fill what it leaves out.
    #[arg(long, global = true, env = "OPQUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot directory.
    #[arg(long, global = true, env = "OPQUEUE_DATA_DIR", default_value = ".opqueue")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Run state (repeatable)
    #[arg(long = "state")]
    states: Vec<RunState>,
    #[arg(long)]
    operator: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    pinned: Option<bool>,
    /// Search term matched against operator and label
    #[arg(long)]
    search: Option<String>,
}

impl FilterArgs {
    fn filter(&self) -> OperationFilter {
        OperationFilter {
            operator: self.operator.clone(),
            dataset_id: self.dataset.clone(),
            run_states: self.states.clone(),
            delegation_target: self.target.clone(),
            pinned: self.pinned,
            updated_before: None,
        }
    }

    fn search(&self) -> Option<Search> {
        self.search
            .as_ref()
            .map(|term| Search::new().term(term, OPERATION_SEARCH_FIELDS))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List operations
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "queued_at")]
        sort: SortBy,
        #[arg(long, default_value = "desc")]
        direction: SortDirection,
        #[arg(long, default_value = "0")]
        skip: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one operation as JSON
    Info { id: OperationId },
    /// Count operations
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Per-state counts
    Status {
        #[arg(long)]
        target: Option<String>,
    },
    /// Delete an operation (refused while running)
    Delete { id: OperationId },
    /// Mark an operation failed by hand
    Fail {
        id: OperationId,
        #[arg(long, default_value = "failed manually")]
        message: String,
    },
    /// Delete completed/failed operations
    Cleanup {
        #[arg(long = "state")]
        states: Vec<RunState>,
        #[arg(long)]
        operator: Option<String>,
        #[arg(long)]
        dataset: Option<String>,
        /// Only operations not updated for this many days
        #[arg(long)]
        older_than_days: Option<i64>,
        /// Also delete pinned operations
        #[arg(long)]
        include_pinned: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete operations whose dataset no longer exists
    Orphans {
        /// Dataset ids that still exist (repeatable)
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Confirm that no dataset exists any more
        #[arg(long, conflicts_with = "datasets")]
        no_live_datasets: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue a fresh copy of an operation
    Rerun { id: OperationId },
    /// Pin or unpin an operation
    Pin {
        id: OperationId,
        #[arg(long)]
        unpin: bool,
    },
    /// Invoke an operator: run now or queue, per its execution options
    Invoke {
        operator: String,
        /// Params as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        dataset: Option<String>,
        /// Force delegation (`true`) or immediate execution (`false`)
        #[arg(long)]
        delegate: Option<bool>,
        #[arg(long)]
        target: Option<String>,
    },
    /// Run a continual executor for the configured instance
    Run {
        /// Process one page of queued work and exit
        #[arg(long)]
        once: bool,
        #[arg(long, env = "OPQUEUE_INSTANCE")]
        instance: Option<String>,
    },
    /// Orchestrator registry
    #[command(subcommand)]
    Orchestrator(OrchestratorCommands),
}

#[derive(Subcommand)]
enum OrchestratorCommands {
    /// Register this process's operators under an identifier
    Register {
        identifier: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List orchestrators
    List {
        /// Include deactivated orchestrators
        #[arg(long)]
        all: bool,
        #[arg(long)]
        search: Option<String>,
    },
    /// Mark an orchestrator deactivated
    Deactivate {
        /// Orchestrator id or instance identifier
        key: String,
    },
    Delete {
        /// Orchestrator id or instance identifier
        key: String,
    },
}

/// The two collections backing an `App`.
struct Stores {
    operations: Arc<dyn DocumentCollection>,
    orchestrators: Arc<dyn DocumentCollection>,
    config: EngineConfig,
}

impl Stores {
    /// Snapshot-backed when the config names a data dir, in memory otherwise.
    fn open(config: EngineConfig) -> Self {
        if let Some(dir) = &config.data_dir {
            info!(data_dir = %dir.display(), "using snapshot store");
        }
        Self {
            operations: collection(OPERATIONS_COLLECTION, config.operations_snapshot()),
            orchestrators: collection(ORCHESTRATORS_COLLECTION, config.orchestrators_snapshot()),
            config,
        }
    }

    async fn app(&self, live_datasets: &[String]) -> Result<App> {
        let catalog = InMemoryDatasetCatalog::new();
        for id in live_datasets {
            catalog.add(id.clone(), id.clone()).await;
        }
        let app = AppBuilder::new()
            .register(Arc::new(builtin::Echo::new()))?
            .register_typed(builtin::Count::new())?
            .operations_collection(Arc::clone(&self.operations))
            .orchestrators_collection(Arc::clone(&self.orchestrators))
            .secrets(Arc::new(EnvSecretsResolver::with_prefix("OPQUEUE_SECRET_")))
            .catalog(Arc::new(catalog))
            .default_delegation_target(self.config.instance_identifier.clone())
            .build()
            .await?;
        Ok(app)
    }
}

fn collection(name: &str, snapshot: Option<PathBuf>) -> Arc<dyn DocumentCollection> {
    match snapshot {
        Some(path) => Arc::new(SnapshotCollection::new(name, path)),
        None => Arc::new(InMemoryCollection::new(name)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if config.data_dir.is_none() {
        config.data_dir = Some(cli.data_dir.clone());
    }

    let live_datasets = match &cli.command {
        Commands::Orphans { datasets, .. } => datasets.clone(),
        _ => Vec::new(),
    };
    let stores = Stores::open(config);
    let app = stores.app(&live_datasets).await?;

    dispatch(cli.command, &app, &stores.config, &mut std::io::stdout()).await
}

/// `now` minus `days`, for `--older-than-days`.
fn older_than(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    if days < 0 {
        bail!("--older-than-days must not be negative (got {days})");
    }
    Duration::try_days(days)
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than-days {days} is out of range"))
}

async fn dispatch<W: Write>(
    command: Commands,
    app: &App,
    config: &EngineConfig,
    out: &mut W,
) -> Result<()> {
    let ops = app.operations();
    match command {
        Commands::List {
            filter,
            sort,
            direction,
            skip,
            limit,
        } => {
            let paging = Paging::new(sort, direction).page(skip, limit);
            let search = filter.search();
            let records = ops.list(&filter.filter(), search.as_ref(), &paging).await?;
            writeln!(out, "Operations ({})", records.len())?;
            for record in &records {
                print_row(out, record)?;
            }
        }
        Commands::Info { id } => {
            let Some(record) = ops.get(id).await? else {
                bail!("operation {id} not found");
            };
            writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
        }
        Commands::Count { filter } => {
            let search = filter.search();
            writeln!(out, "{}", ops.count(&filter.filter(), search.as_ref()).await?)?;
        }
        Commands::Status { target } => {
            let counts = ops.counts(target.as_deref()).await?;
            writeln!(out, "Operations: {} total, {} pending", counts.total(), counts.pending())?;
            for state in RunState::ALL {
                writeln!(out, "  {:<10} {}", state.as_str(), counts.get(state))?;
            }
        }
        Commands::Delete { id } => {
            ops.delete(id).await?;
            writeln!(out, "Deleted {id}")?;
        }
        Commands::Fail { id, message } => {
            let error = OperationResult::failure(format!("{message} (via cli)"), message);
            match ops.set_failed(id, error).await? {
                Some(_) => writeln!(out, "Marked {id} failed")?,
                None => bail!("operation {id} cannot be failed from its current state"),
            }
        }
        Commands::Cleanup {
            states,
            operator,
            dataset,
            older_than_days,
            include_pinned,
            dry_run,
        } => {
            let mut filter = OperationFilter {
                operator,
                dataset_id: dataset,
                run_states: if states.is_empty() {
                    vec![RunState::Completed, RunState::Failed]
                } else {
                    states
                },
                ..OperationFilter::new()
            };
            if !include_pinned {
                filter = filter.pinned(false);
            }
            if let Some(days) = older_than_days {
                filter = filter.updated_before(older_than(Utc::now(), days)?);
            }
            let report = ops.cleanup(&filter, dry_run).await?;
            if report.operation_ids.is_empty() {
                writeln!(out, "Nothing to clean up")?;
            } else if dry_run {
                writeln!(out, "Would delete {} operation(s):", report.operation_ids.len())?;
                for id in &report.operation_ids {
                    writeln!(out, "  {id}")?;
                }
            } else {
                writeln!(out, "Deleted {} operation(s)", report.deleted)?;
            }
        }
        Commands::Orphans {
            datasets,
            no_live_datasets,
            dry_run,
        } => {
            // The catalog only knows what was passed in; an empty one would
            // mark every dataset-bound operation as orphaned.
            if datasets.is_empty() && !no_live_datasets {
                bail!(
                    "no --dataset given: every dataset would count as deleted. \
                     Pass the live datasets, or --no-live-datasets to confirm"
                );
            }
            let report = ops.cleanup_orphans(dry_run).await?;
            if report.dataset_ids.is_empty() {
                writeln!(out, "Nothing to clean up")?;
            } else {
                let verb = if dry_run { "Would delete" } else { "Deleted" };
                writeln!(
                    out,
                    "{verb} operations of {} orphaned dataset(s): {}",
                    report.dataset_ids.len(),
                    report.dataset_ids.join(", ")
                )?;
            }
        }
        Commands::Rerun { id } => {
            let record = ops.rerun(id).await?;
            writeln!(out, "Queued {} (copy of {id})", record.id)?;
        }
        Commands::Pin { id, unpin } => {
            if ops.set_pinned(id, !unpin).await?.is_none() {
                bail!("operation {id} not found");
            }
            writeln!(out, "{} {id}", if unpin { "Unpinned" } else { "Pinned" })?;
        }
        Commands::Invoke {
            operator,
            params,
            dataset,
            delegate,
            target,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params must be JSON")?;
            let mut request = RequestParams::new(operator).with_params(params);
            if let Some(dataset) = dataset {
                request = request.with_dataset(dataset);
            }
            if let Some(target) = target {
                request = request.delegate_to(target);
            }
            if delegate.is_some() {
                request.delegated = delegate;
            }

            let invocation = app.execute_or_delegate(request).await?;
            if let Invocation::Executed(result) = &invocation {
                for warning in &result.warnings {
                    eprintln!("warning: {warning}");
                }
            }
            let result = invocation.raise_exceptions()?;
            writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
        }
        Commands::Run { once, instance } => {
            let mut config = config.clone();
            if let Some(instance) = instance {
                config.instance_identifier = instance;
            }
            let worker = config.continual_executor(app);
            if once {
                let processed = worker.run_once().await?;
                writeln!(out, "Processed {processed} operation(s)")?;
            } else {
                let handle = worker.shutdown_handle();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                        handle.request_shutdown();
                    }
                });
                worker.run().await?;
            }
        }
        Commands::Orchestrator(command) => orchestrator(command, app, out).await?,
    }
    Ok(())
}

async fn orchestrator<W: Write>(command: OrchestratorCommands, app: &App, out: &mut W) -> Result<()> {
    let orchestrators = app.orchestrators();
    match command {
        OrchestratorCommands::Register {
            identifier,
            description,
        } => {
            let record = orchestrators
                .register(&identifier, description.as_deref())
                .await?;
            writeln!(
                out,
                "Registered {} ({} operators)",
                record.instance_identifier,
                record.available_operators.len()
            )?;
        }
        OrchestratorCommands::List { all, search } => {
            let search = search.map(|term| Search::new().term(term, ORCHESTRATOR_SEARCH_FIELDS));
            let paging = Paging::new(SortBy::UpdatedAt, SortDirection::Descending);
            let records = orchestrators.list(&paging, search.as_ref(), all).await?;
            writeln!(out, "Orchestrators ({})", records.len())?;
            for record in records {
                writeln!(
                    out,
                    "  {} | {} | {} | {}",
                    record.id,
                    record.instance_identifier,
                    if record.is_active() { "active" } else { "deactivated" },
                    record.available_operators.join(", ")
                )?;
            }
        }
        OrchestratorCommands::Deactivate { key } => {
            let record = orchestrators.deactivate(&key).await?;
            writeln!(out, "Deactivated {}", record.instance_identifier)?;
        }
        OrchestratorCommands::Delete { key } => {
            orchestrators.delete(&key).await?;
            writeln!(out, "Deleted {key}")?;
        }
    }
    Ok(())
}

fn print_row<W: Write>(out: &mut W, record: &OperationRecord) -> std::io::Result<()> {
    let progress = record
        .status
        .as_ref()
        .and_then(|s| s.progress)
        .map(|p| format!("{:>3.0}%", p * 100.0))
        .unwrap_or_else(|| "   -".to_string());
    writeln!(
        out,
        "  {} | {:<9} | {} | {} | {}{}",
        record.id,
        record.run_state.as_str(),
        progress,
        record.delegation_target.as_deref().unwrap_or("-"),
        record.display_name(),
        if record.pinned { " [pinned]" } else { "" },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration as StdDuration;

    use opqueue_core::domain::NewOperation;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            data_dir: Some(dir.to_path_buf()),
            instance_identifier: "w".to_string(),
            register_orchestrator: false,
            poll_interval_ms: 10,
            ..EngineConfig::from_lookup(|_| None)
        }
    }

    /// Parse `args` like the binary does and run them against `stores`.
    async fn exec(stores: &Stores, args: &[&str]) -> (Result<()>, String) {
        let cli = Cli::try_parse_from(std::iter::once("opqueue").chain(args.iter().copied()))
            .unwrap();
        let live_datasets = match &cli.command {
            Commands::Orphans { datasets, .. } => datasets.clone(),
            _ => Vec::new(),
        };
        let app = stores.app(&live_datasets).await.unwrap();
        let mut out = Vec::new();
        let outcome = dispatch(cli.command, &app, &stores.config, &mut out).await;
        (outcome, String::from_utf8(out).unwrap())
    }

    async fn queue(stores: &Stores, dataset: Option<&str>) -> OperationId {
        let app = stores.app(&[]).await.unwrap();
        let mut request = RequestParams::new("@builtin/echo");
        if let Some(dataset) = dataset {
            request = request.with_dataset(dataset);
        }
        let op = NewOperation::new("@builtin/echo", request).with_target("w");
        app.operations().queue(op).await.unwrap().id
    }

    #[tokio::test]
    async fn delete_refuses_a_running_operation() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));
        let id = queue(&stores, None).await;
        let app = stores.app(&[]).await.unwrap();
        app.operations().set_running(id).await.unwrap().unwrap();

        let (outcome, out) = exec(&stores, &["delete", &id.to_string()]).await;
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("running"), "{err}");
        assert!(out.is_empty());
        assert!(app.operations().get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_with_nothing_to_delete_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));
        queue(&stores, None).await;

        let (outcome, out) = exec(&stores, &["cleanup"]).await;
        outcome.unwrap();
        assert_eq!(out, "Nothing to clean up\n");
    }

    #[tokio::test]
    async fn cleanup_rejects_out_of_range_age() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));

        let (outcome, _) = exec(&stores, &["cleanup", "--older-than-days", "9999999999999"]).await;
        assert!(outcome.unwrap_err().to_string().contains("out of range"));
    }

    #[test]
    fn older_than_checks_its_input() {
        let now = Utc::now();
        assert_eq!(older_than(now, 2).unwrap(), now - Duration::days(2));
        assert_eq!(older_than(now, 0).unwrap(), now);
        assert!(older_than(now, -1).is_err());
        assert!(older_than(now, i64::MAX).is_err());
        assert!(older_than(now, 9_999_999_999_999).is_err());
    }

    #[tokio::test]
    async fn orphans_needs_live_datasets_or_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));
        queue(&stores, Some("ds-live")).await;
        queue(&stores, Some("ds-gone")).await;

        let (outcome, _) = exec(&stores, &["orphans"]).await;
        assert!(outcome.unwrap_err().to_string().contains("--no-live-datasets"));
        let (_, count) = exec(&stores, &["count"]).await;
        assert_eq!(count, "2\n");

        let (outcome, out) = exec(&stores, &["orphans", "--dataset", "ds-live"]).await;
        outcome.unwrap();
        assert_eq!(out, "Deleted operations of 1 orphaned dataset(s): ds-gone\n");

        let (outcome, out) = exec(&stores, &["orphans", "--no-live-datasets", "--dry-run"]).await;
        outcome.unwrap();
        assert_eq!(out, "Would delete operations of 1 orphaned dataset(s): ds-live\n");
        let (_, count) = exec(&stores, &["count"]).await;
        assert_eq!(count, "1\n");
    }

    #[tokio::test]
    async fn invalid_params_are_reported_as_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));

        let (outcome, out) =
            exec(&stores, &["invoke", "@builtin/count", "--params", r#"{"n": 0}"#]).await;
        assert!(outcome.is_err());
        assert!(out.is_empty());
        let (_, count) = exec(&stores, &["count"]).await;
        assert_eq!(count, "0\n");
    }

    #[tokio::test]
    async fn orchestrators_are_addressed_by_id_or_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::open(config(dir.path()));
        exec(&stores, &["orchestrator", "register", "gpu-1"]).await.0.unwrap();
        let app = stores.app(&[]).await.unwrap();
        let record = app.orchestrators().get_by_identifier("gpu-1").await.unwrap().unwrap();

        let (outcome, out) = exec(&stores, &["orchestrator", "deactivate", &record.id.to_string()]).await;
        outcome.unwrap();
        assert_eq!(out, "Deactivated gpu-1\n");
        exec(&stores, &["orchestrator", "delete", "gpu-1"]).await.0.unwrap();
        assert!(exec(&stores, &["orchestrator", "delete", "gpu-1"]).await.0.is_err());
    }

    #[tokio::test]
    async fn two_processes_on_one_data_dir_share_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let client = Stores::open(config(dir.path()));
        let worker = Stores::open(config(dir.path()));

        // A long-running worker started before any work was queued.
        let worker_app = worker.app(&[]).await.unwrap();
        let executor = Arc::new(worker.config.continual_executor(&worker_app));
        let shutdown = executor.shutdown_handle();
        let running = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.run().await }
        });

        let (outcome, _) =
            exec(&client, &["invoke", "@builtin/count", "--params", r#"{"n": 2}"#]).await;
        outcome.unwrap();

        let mut completed = String::new();
        for _ in 0..300 {
            completed = exec(&client, &["count", "--state", "completed"]).await.1;
            if completed == "1\n" {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(completed, "1\n", "worker never saw the queued operation");

        shutdown.request_shutdown();
        running.await.unwrap().unwrap();

        // Nothing the client wrote was lost when the worker stopped.
        let fresh = Stores::open(config(dir.path()));
        assert_eq!(exec(&fresh, &["count"]).await.1, "1\n");
        let (_, listed) = exec(&fresh, &["list"]).await;
        assert!(listed.starts_with("Operations (1)"), "{listed}");
    }
}
