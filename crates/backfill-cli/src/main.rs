// crates/backfill-cli/src/main.rs
// ============================================================================
// Module: Backfill CLI Entry Point
// Description: Command dispatcher for migration operators and worker ticks.
// Purpose: Manage batched migrations and drive the worker from the shell.
// Dependencies: clap, backfill-config, backfill-core, backfill-store-sqlite, serde, tokio.
// ============================================================================

//! ## Overview
//! The `backfill` CLI wires `backfill.toml` into the `SQLite` store, lease
//! provider, and target database, then exposes operator actions on
//! migrations, a single worker tick (`worker perform`), and a cadence loop
//! (`worker run`). Results are JSON on stdout; errors go to stderr with a
//! failure exit code.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use backfill_config::BackfillConfig;
use backfill_core::MigrationId;
use backfill_core::MigrationStatus;
use backfill_core::NewMigration;
use backfill_core::runtime::BatchedMigrationWorker;
use backfill_core::runtime::MigrationAdmin;
use backfill_core::runtime::MigrationRegistry;
use backfill_core::runtime::SystemClock;
use backfill_core::runtime::WorkerOutcome;
use backfill_store_sqlite::SqliteLeaseProvider;
use backfill_store_sqlite::SqliteMigrationStore;
use backfill_store_sqlite::SqliteTarget;
use backfill_store_sqlite::register_builtin_jobs;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "backfill", version, disable_help_subcommand = true)]
struct Cli {
    /// Config file path (defaults to `BACKFILL_CONFIG`, then ./backfill.toml).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Migration operator actions.
    Migration {
        /// Selected migration subcommand.
        #[command(subcommand)]
        command: MigrationCommand,
    },
    /// Worker execution.
    Worker {
        /// Selected worker subcommand.
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the config file.
    Validate,
}

/// Migration subcommands.
#[derive(Subcommand, Debug)]
enum MigrationCommand {
    /// Register a new migration.
    Create(MigrationCreateCommand),
    /// List every migration.
    List,
    /// Show one migration.
    Show(MigrationIdArgs),
    /// Pause an active migration.
    Pause(MigrationIdArgs),
    /// Resume a paused migration.
    Resume(MigrationIdArgs),
    /// Reactivate a failed migration and reset its failed jobs.
    Retry(MigrationIdArgs),
    /// Run every remaining batch synchronously under the worker lease.
    Finalize(MigrationIdArgs),
    /// Delete a migration and its jobs.
    Delete(MigrationIdArgs),
    /// Report covered keys and job counts.
    Progress(MigrationIdArgs),
}

/// Arguments for `migration create`.
#[derive(Args, Debug)]
struct MigrationCreateCommand {
    /// Registered job class performing the row mutation.
    #[arg(long)]
    job_class: String,
    /// Table to migrate (optionally schema-qualified).
    #[arg(long)]
    table: String,
    /// Ordered integer key column.
    #[arg(long, default_value = "id")]
    column: String,
    /// First key of the range (inclusive).
    #[arg(long, allow_negative_numbers = true)]
    min: i64,
    /// Last key of the range (inclusive).
    #[arg(long, allow_negative_numbers = true)]
    max: i64,
    /// Keys per batch.
    #[arg(long, default_value_t = 1_000)]
    batch_size: u64,
    /// Keys per sub-batch mutation.
    #[arg(long, default_value_t = 100)]
    sub_batch_size: u64,
    /// Minimum seconds between batches.
    #[arg(long, default_value_t = 120)]
    interval_secs: u64,
    /// Job arguments as a JSON array.
    #[arg(long, value_name = "JSON")]
    arguments: Option<String>,
    /// Create the migration paused instead of active.
    #[arg(long, action = ArgAction::SetTrue)]
    paused: bool,
}

/// Migration identifier argument.
#[derive(Args, Debug)]
struct MigrationIdArgs {
    /// Migration identifier.
    #[arg(long)]
    id: u64,
}

/// Worker subcommands.
#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Run one worker tick.
    Perform,
    /// Tick on the configured cadence until interrupted.
    Run(WorkerRunCommand),
}

/// Arguments for `worker run`.
#[derive(Args, Debug)]
struct WorkerRunCommand {
    /// Stop after this many ticks.
    #[arg(long)]
    ticks: Option<u64>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper for user-facing messages.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Responses
// ============================================================================

/// Output of `config validate`.
#[derive(Debug, Serialize)]
struct ConfigValidateResponse {
    /// Always true when printed.
    valid: bool,
    /// Resolved store path.
    store_path: PathBuf,
    /// Resolved target path, when separate from the store.
    target_path: Option<PathBuf>,
}

/// Output of `migration delete`.
#[derive(Debug, Serialize)]
struct DeleteResponse {
    /// Deleted migration.
    migration_id: MigrationId,
    /// False when the migration did not exist.
    deleted: bool,
}

/// One line of `worker run` output.
#[derive(Debug, Serialize)]
struct TickReport {
    /// 1-based tick number.
    tick: u64,
    /// Tick outcome when the tick completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<WorkerOutcome>,
    /// Error message when the tick failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = BackfillConfig::load(cli.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    match cli.command {
        Commands::Config {
            command: ConfigCommand::Validate,
        } => {
            write_json(&ConfigValidateResponse {
                valid: true,
                store_path: config.store.path.clone(),
                target_path: config.target.as_ref().map(|target| target.path.clone()),
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migration {
            command,
        } => {
            let backends = Backends::open(&config)?;
            let value = command_migration(&config, &backends, command)?;
            write_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker {
            command: WorkerCommand::Perform,
        } => {
            let worker = build_worker(&config, &Backends::open(&config)?)?;
            let outcome = worker
                .perform()
                .map_err(|err| CliError::new(format!("worker tick failed: {err}")))?;
            write_json(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker {
            command: WorkerCommand::Run(command),
        } => command_worker_run(&config, command.ticks).await,
    }
}

// ============================================================================
// SECTION: Wiring
// ============================================================================

/// Store and target connections opened from configuration.
struct Backends {
    /// Migration store and lease database.
    store: SqliteMigrationStore,
    /// Database holding target tables.
    target: SqliteTarget,
}

impl Backends {
    /// Opens the configured store and target.
    fn open(config: &BackfillConfig) -> CliResult<Self> {
        let store = SqliteMigrationStore::open(&config.store)
            .map_err(|err| CliError::new(format!("failed to open store: {err}")))?;
        let target = match &config.target {
            Some(target) => SqliteTarget::open(&target.path)
                .map_err(|err| CliError::new(format!("failed to open target: {err}")))?,
            None => SqliteTarget::from_store(&store),
        };
        Ok(Self {
            store,
            target,
        })
    }

    /// Builds a registry with the built-in job classes.
    fn registry(&self) -> MigrationRegistry {
        let mut registry = MigrationRegistry::new();
        register_builtin_jobs(&mut registry, &self.target);
        registry
    }
}

/// Builds a worker wired to the configured backends.
fn build_worker(
    config: &BackfillConfig,
    backends: &Backends,
) -> CliResult<BatchedMigrationWorker<SqliteMigrationStore, SqliteLeaseProvider>> {
    let events = config
        .event_sink()
        .map_err(|err| CliError::new(format!("failed to open event sink: {err}")))?;
    Ok(BatchedMigrationWorker::new(
        config.worker_config(),
        Some(backends.store.clone()),
        SqliteLeaseProvider::from_store(&backends.store),
        Arc::new(backends.registry()),
    )
    .with_toggles(Arc::new(config.feature_toggle()))
    .with_events(events))
}

// ============================================================================
// SECTION: Migration Commands
// ============================================================================

/// Executes a migration subcommand and returns its JSON result.
fn command_migration(
    config: &BackfillConfig,
    backends: &Backends,
    command: MigrationCommand,
) -> CliResult<Value> {
    let clock = SystemClock;
    let admin = MigrationAdmin::new(&backends.store, &clock);
    let failed = |err: &dyn std::fmt::Display| CliError::new(format!("migration command failed: {err}"));
    match command {
        MigrationCommand::Create(command) => {
            let definition = new_migration(command)?;
            to_json(&admin.create(definition).map_err(|err| failed(&err))?)
        }
        MigrationCommand::List => to_json(&admin.list().map_err(|err| failed(&err))?),
        MigrationCommand::Show(args) => {
            to_json(&admin.show(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
        MigrationCommand::Pause(args) => {
            to_json(&admin.pause(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
        MigrationCommand::Resume(args) => {
            to_json(&admin.resume(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
        MigrationCommand::Retry(args) => {
            to_json(&admin.retry(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
        MigrationCommand::Finalize(args) => {
            let worker = build_worker(config, backends)?;
            to_json(&worker.finalize(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
        MigrationCommand::Delete(args) => {
            let id = migration_id(&args)?;
            let deleted = admin.delete(id).map_err(|err| failed(&err))?;
            to_json(&DeleteResponse {
                migration_id: id,
                deleted,
            })
        }
        MigrationCommand::Progress(args) => {
            to_json(&admin.progress(migration_id(&args)?).map_err(|err| failed(&err))?)
        }
    }
}

/// Builds a migration definition from `migration create` arguments.
fn new_migration(command: MigrationCreateCommand) -> CliResult<NewMigration> {
    let job_arguments = match command.arguments.as_deref() {
        Some(raw) => parse_job_arguments(raw)?,
        None => Vec::new(),
    };
    Ok(NewMigration {
        job_class_name: command.job_class.into(),
        table_name: command.table,
        column_name: command.column,
        job_arguments,
        min_value: command.min,
        max_value: command.max,
        batch_size: command.batch_size,
        sub_batch_size: command.sub_batch_size,
        interval_secs: command.interval_secs,
        status: if command.paused { MigrationStatus::Paused } else { MigrationStatus::Active },
    })
}

/// Parses `--arguments` as a JSON array.
fn parse_job_arguments(raw: &str) -> CliResult<Vec<Value>> {
    serde_json::from_str::<Vec<Value>>(raw)
        .map_err(|err| CliError::new(format!("--arguments must be a JSON array: {err}")))
}

/// Converts an `--id` argument.
fn migration_id(args: &MigrationIdArgs) -> CliResult<MigrationId> {
    MigrationId::from_raw(args.id)
        .ok_or_else(|| CliError::new("--id must be greater than zero".to_string()))
}

// ============================================================================
// SECTION: Worker Commands
// ============================================================================

/// Ticks the worker on the configured cadence.
async fn command_worker_run(config: &BackfillConfig, ticks: Option<u64>) -> CliResult<ExitCode> {
    let worker = Arc::new(build_worker(config, &Backends::open(config)?)?);
    let mut cadence = tokio::time::interval(config.cadence());
    cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut completed = 0_u64;
    while ticks.is_none_or(|limit| completed < limit) {
        tokio::select! {
            _ = cadence.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let tick_worker = Arc::clone(&worker);
        let joined = tokio::task::spawn_blocking(move || tick_worker.perform()).await;
        completed += 1;
        let report = match joined {
            Ok(Ok(outcome)) => TickReport {
                tick: completed,
                result: Some(outcome),
                error: None,
            },
            Ok(Err(err)) => TickReport {
                tick: completed,
                result: None,
                error: Some(err.to_string()),
            },
            Err(err) => TickReport {
                tick: completed,
                result: None,
                error: Some(format!("worker tick aborted: {err}")),
            },
        };
        write_json(&report)?;
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Serializes a response to a JSON value.
fn to_json<T: Serialize>(value: &T) -> CliResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| CliError::new(format!("failed to serialize output: {err}")))
}

/// Writes one JSON document to stdout.
fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|err| CliError::new(format!("failed to serialize output: {err}")))?;
    write_stdout_line(&line).map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Formats an output stream failure.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write to {stream}: {error}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
