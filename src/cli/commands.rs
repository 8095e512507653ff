//! CLI command definitions for pgtask.
//!
//! `worker` runs the supervisor; everything else is a one-shot administrative
//! command against the database named by `DATABASE_URL`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use clap::{ArgAction, Parser};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, EnqueueRequest};
use crate::config::{parse_duration, Settings};
use crate::error::SupervisorError;
use crate::scheduler::{
    upcoming_run, NewSchedule, RelatedObject, Schedule, ScheduleStore, ScheduleUpdate, Scheduler,
    TickOutcome,
};
use crate::storage::{Database, PoolOptions, TaskState};
use crate::supervisor::{exit_code, run_worker_process, Supervisor, SupervisorConfig};
use crate::worker::{builtin_registry, RegistryFactory};

/// PostgreSQL-backed background tasks.
#[derive(Parser, Debug)]
#[command(name = "pgtask")]
#[command(about = "PostgreSQL-backed task queue, result store, cron scheduler and worker supervisor")]
#[command(version)]
#[command(
    long_about = "pgtask runs background tasks stored in PostgreSQL.\n\nConnection and tuning come from environment variables (DATABASE_URL, PGTASK_*).\n\nExample usage:\n  pgtask migrate\n  pgtask worker --processes 2 --threads 4\n  pgtask enqueue default pgtask.echo --args '[\"hello\"]'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Raise verbosity: -v for debug, -vv for trace.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Cli {
    /// Log filter from `-v` if given, otherwise `--log-level`.
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => self.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the worker supervisor: N processes with M worker tasks each.
    Worker(WorkerArgs),

    /// Run a single worker process (started by `worker`).
    #[command(name = "worker-process", hide = true)]
    WorkerProcess(WorkerProcessArgs),

    /// Create or upgrade the database schema.
    Migrate,

    /// Enqueue a task and print its message id.
    Enqueue(EnqueueArgs),

    /// Print the stored result of a task.
    Result(ResultArgs),

    /// Manage recurring schedules.
    Schedule(ScheduleArgs),

    /// Scheduler operations.
    Scheduler(SchedulerArgs),

    /// Task table maintenance.
    Tasks(TasksArgs),
}

/// Arguments for `pgtask worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker processes (overrides PGTASK_WORKER_PROCESSES).
    #[arg(short = 'p', long)]
    pub processes: Option<usize>,

    /// Worker tasks per process (overrides PGTASK_WORKER_THREADS).
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Comma-separated queues to consume; defaults to every registered queue.
    #[arg(short = 'Q', long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Write the supervisor pid here and refuse to start if it is taken.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Restart all workers when files under this directory change.
    #[arg(long)]
    pub watch: Option<PathBuf>,

    /// Apply migrations before starting the workers.
    #[arg(long)]
    pub migrate: bool,
}

/// Arguments for the hidden `pgtask worker-process`.
#[derive(Parser, Debug)]
pub struct WorkerProcessArgs {
    /// Index of this process among its siblings.
    #[arg(long, default_value = "0")]
    pub worker_index: usize,

    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    #[arg(short = 'Q', long, value_delimiter = ',')]
    pub queues: Vec<String>,
}

/// Arguments for `pgtask enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Target queue.
    pub queue: String,

    /// Actor name.
    pub actor: String,

    /// Positional arguments as JSON.
    #[arg(long, default_value = "[]")]
    pub args: String,

    /// Keyword arguments as JSON.
    #[arg(long, default_value = "{}")]
    pub kwargs: String,

    /// Message options as JSON.
    #[arg(long, default_value = "{}")]
    pub options: String,

    /// Delay before the task becomes claimable (seconds or `minutes=5;…`).
    #[arg(long)]
    pub delay: Option<String>,

    /// Wait until the queue has no unfinished tasks.
    #[arg(long)]
    pub join: bool,
}

/// Arguments for `pgtask result`.
#[derive(Parser, Debug)]
pub struct ResultArgs {
    /// Message id returned by `enqueue`.
    pub message_id: Uuid,

    /// Output JSON with the payload in base64.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    #[command(subcommand)]
    pub command: ScheduleSubcommand,
}

/// Schedule subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ScheduleSubcommand {
    /// Create a schedule, or update the one with the same uid.
    Create(ScheduleCreateArgs),

    /// Change fields of an existing schedule.
    Update(ScheduleUpdateArgs),

    /// Stop dispatching a schedule.
    Pause { id: Uuid },

    /// Resume a paused schedule from the next matching time.
    Resume { id: Uuid },

    /// Delete a schedule.
    Delete { id: Uuid },

    /// List schedules, optionally only those of one related object.
    List(ScheduleListArgs),
}

#[derive(Parser, Debug)]
pub struct ScheduleCreateArgs {
    /// Unique natural key of the schedule.
    pub uid: String,

    /// Actor to enqueue.
    pub actor: String,

    /// Five-field crontab, e.g. "*/5 * * * *".
    pub crontab: String,

    /// Queue; defaults to the actor's queue.
    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    #[arg(long, default_value = "[]")]
    pub args: String,

    #[arg(long, default_value = "{}")]
    pub kwargs: String,

    /// Create the schedule paused.
    #[arg(long)]
    pub paused: bool,

    /// Type of the object owning this schedule.
    #[arg(long, requires = "rel_obj_id")]
    pub rel_obj_type: Option<String>,

    /// Id of the object owning this schedule.
    #[arg(long, requires = "rel_obj_type")]
    pub rel_obj_id: Option<String>,

    #[arg(short = 'd', long)]
    pub description: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ScheduleUpdateArgs {
    pub id: Uuid,

    #[arg(long)]
    pub crontab: Option<String>,

    #[arg(short = 'q', long, conflicts_with = "clear_queue")]
    pub queue: Option<String>,

    /// Fall back to the actor's queue again.
    #[arg(long)]
    pub clear_queue: bool,

    #[arg(long)]
    pub args: Option<String>,

    #[arg(long)]
    pub kwargs: Option<String>,

    #[arg(short = 'd', long)]
    pub description: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ScheduleListArgs {
    #[arg(long, requires = "rel_obj_id")]
    pub rel_obj_type: Option<String>,

    #[arg(long, requires = "rel_obj_type")]
    pub rel_obj_id: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct SchedulerArgs {
    #[command(subcommand)]
    pub command: SchedulerSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum SchedulerSubcommand {
    /// Dispatch due schedules once, if no other process is dispatching.
    Tick,
}

#[derive(Parser, Debug)]
pub struct TasksArgs {
    #[command(subcommand)]
    pub command: TasksSubcommand,
}

/// Task maintenance subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum TasksSubcommand {
    /// Delete finished tasks older than a cutoff.
    Purge {
        /// Minimum age; defaults to PGTASK_TASK_EXPIRATION.
        #[arg(long)]
        older_than: Option<String>,

        /// States to purge.
        #[arg(long, value_delimiter = ',', default_value = "done,rejected")]
        states: Vec<String>,
    },

    /// Row counts per state for a queue.
    Stats {
        queue: String,

        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Put tasks stuck in `consumed` back to `queued`.
    RequeueStale {
        /// Minimum time since the task was claimed.
        #[arg(long)]
        older_than: String,
    },

    /// Delete every task of a queue.
    Flush { queue: String },
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command with the
/// built-in actors.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Run the parsed CLI with the built-in actors.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    run_with_registry(cli, builtin_registry).await
}

/// Run the parsed CLI with the application's actors.
///
/// Returns the process exit code.
pub async fn run_with_registry(cli: Cli, factory: RegistryFactory) -> anyhow::Result<i32> {
    let log_filter = cli.log_filter();
    match cli.command {
        Commands::Worker(args) => run_worker_command(args, factory, &log_filter).await,
        Commands::WorkerProcess(args) => run_worker_process_command(args, factory).await,
        Commands::Migrate => {
            run_migrate_command().await?;
            Ok(exit_code::OK)
        }
        Commands::Enqueue(args) => {
            run_enqueue_command(args).await?;
            Ok(exit_code::OK)
        }
        Commands::Result(args) => {
            run_result_command(args).await?;
            Ok(exit_code::OK)
        }
        Commands::Schedule(args) => {
            run_schedule_command(args).await?;
            Ok(exit_code::OK)
        }
        Commands::Scheduler(args) => {
            run_scheduler_command(args, factory).await?;
            Ok(exit_code::OK)
        }
        Commands::Tasks(args) => {
            run_tasks_command(args).await?;
            Ok(exit_code::OK)
        }
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_settings() -> anyhow::Result<Settings> {
    Settings::from_env().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))
}

async fn connect(settings: &Settings) -> anyhow::Result<Database> {
    let options = PoolOptions {
        max_connections: settings.db_max_connections,
        ..Default::default()
    };
    Database::connect_with(&settings.database_url, &options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))
}

/// Validates a JSON argument and returns its bytes.
fn json_bytes(value: &str, what: &str) -> anyhow::Result<Vec<u8>> {
    serde_json::from_str::<serde_json::Value>(value)
        .map_err(|e| anyhow::anyhow!("--{} is not valid JSON: {}", what, e))?;
    Ok(value.as_bytes().to_vec())
}

fn related_object(kind: Option<String>, id: Option<String>) -> Option<RelatedObject> {
    match (kind, id) {
        (Some(kind), Some(id)) => Some(RelatedObject { kind, id }),
        _ => None,
    }
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

/// Flags every child receives so it consumes what the supervisor was asked to.
fn child_args(settings: &Settings, log_filter: &str) -> Vec<String> {
    let mut args = vec![
        "--threads".to_string(),
        settings.threads.to_string(),
        "--log-level".to_string(),
        log_filter.to_string(),
    ];
    if !settings.queues.is_empty() {
        args.push("--queues".to_string());
        args.push(settings.queues.join(","));
    }
    args
}

async fn run_worker_command(
    args: WorkerArgs,
    factory: RegistryFactory,
    log_filter: &str,
) -> anyhow::Result<i32> {
    let mut settings = load_settings()?;
    if let Some(processes) = args.processes {
        settings.processes = processes;
    }
    if let Some(threads) = args.threads {
        settings.threads = threads;
    }
    if !args.queues.is_empty() {
        settings.queues = args.queues;
    }
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Catch registry mistakes once here instead of in every child.
    if let Err(e) = factory(&settings).and_then(|r| r.validate(&settings.channel_prefix)) {
        error!(error = %e, "Invalid actor registry");
        return Ok(exit_code::REGISTRY);
    }

    if args.migrate {
        let db = match connect(&settings).await {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "Cannot migrate");
                return Ok(exit_code::CONNECT);
            }
        };
        let applied = db.run_migrations(&settings.channel_prefix).await?;
        info!(applied = applied, "Migrations applied");
        db.close().await;
    }

    let program = std::env::current_exe()?;
    let config = SupervisorConfig::new(settings.processes, program)
        .with_worker_args(child_args(&settings, log_filter))
        .with_shutdown_timeout(settings.shutdown_timeout)
        .with_pid_file(args.pid_file)
        .with_watch(args.watch);

    match Supervisor::new(config).run().await {
        Ok(code) => Ok(code),
        Err(e @ (SupervisorError::PidFileHeld { .. } | SupervisorError::PidFile(_))) => {
            error!(error = %e, "Cannot start supervisor");
            Ok(exit_code::PID_FILE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_worker_process_command(
    args: WorkerProcessArgs,
    factory: RegistryFactory,
) -> anyhow::Result<i32> {
    let mut settings = load_settings()?;
    if let Some(threads) = args.threads {
        settings.threads = threads;
    }
    if !args.queues.is_empty() {
        settings.queues = args.queues;
    }
    Ok(run_worker_process(settings, factory, args.worker_index).await)
}

// ============================================================================
// One-shot Commands
// ============================================================================

async fn run_migrate_command() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let applied = db.run_migrations(&settings.channel_prefix).await?;
    db.close().await;

    if applied == 0 {
        println!("Schema is up to date");
    } else {
        println!("Applied {} migration(s)", applied);
    }
    Ok(())
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let broker = Broker::new(db.pool().clone(), settings.channel_prefix.clone());

    let mut request = EnqueueRequest::new(&args.queue, &args.actor)
        .with_args(json_bytes(&args.args, "args")?)
        .with_kwargs(json_bytes(&args.kwargs, "kwargs")?)
        .with_options(json_bytes(&args.options, "options")?);
    if let Some(delay) = &args.delay {
        request = request.with_delay(parse_duration(delay, "--delay")?);
    }

    let message_id = broker.enqueue_request(request).await?;
    println!("{}", message_id);

    if args.join {
        broker
            .join(&args.queue, None, Duration::from_millis(500))
            .await?;
        info!(queue = %args.queue, "Queue drained");
    }
    db.close().await;
    Ok(())
}

#[derive(Serialize)]
struct ResultOutput {
    message_id: Uuid,
    state: Option<TaskState>,
    payload: Option<String>,
    expiry: Option<chrono::DateTime<Utc>>,
    expired: bool,
}

async fn run_result_command(args: ResultArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let broker = Broker::new(db.pool().clone(), settings.channel_prefix.clone());

    let state = broker.tasks().get(args.message_id).await?.map(|t| t.state);
    let result = broker.fetch_result(args.message_id).await?;
    db.close().await;

    if args.json {
        let output = ResultOutput {
            message_id: args.message_id,
            state,
            payload: result.as_ref().map(|r| STANDARD.encode(&r.payload)),
            expiry: result.as_ref().and_then(|r| r.expiry),
            expired: result
                .as_ref()
                .map(|r| r.is_expired(Utc::now()))
                .unwrap_or(false),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match (result, state) {
        (Some(result), _) => {
            println!("{}", String::from_utf8_lossy(&result.payload));
            Ok(())
        }
        (None, Some(state)) => anyhow::bail!("No result for {} (state: {})", args.message_id, state),
        (None, None) => anyhow::bail!("Unknown task {}", args.message_id),
    }
}

// ============================================================================
// Schedule Command Implementation
// ============================================================================

fn print_schedule(schedule: &Schedule) {
    let now = Utc::now();
    let next = match upcoming_run(schedule, now) {
        Some(next) => next.to_rfc3339(),
        None => "-".to_string(),
    };
    println!(
        "{}  {:<24} {:<14} {:<24} {:<10} next={}{}",
        schedule.id,
        schedule.uid,
        schedule.crontab,
        schedule.actor_name,
        if schedule.paused { "paused" } else { "active" },
        next,
        schedule
            .description
            .as_deref()
            .map(|d| format!("  # {}", d))
            .unwrap_or_default(),
    );
}

async fn run_schedule_command(args: ScheduleArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let store = ScheduleStore::new(db.pool().clone());

    match args.command {
        ScheduleSubcommand::Create(args) => {
            let mut new = NewSchedule::new(&args.uid, &args.actor, &args.crontab)
                .with_args(json_bytes(&args.args, "args")?)
                .with_kwargs(json_bytes(&args.kwargs, "kwargs")?)
                .paused(args.paused);
            if let Some(queue) = args.queue {
                new = new.with_queue(queue);
            }
            if let (Some(kind), Some(id)) = (args.rel_obj_type, args.rel_obj_id) {
                new = new.with_rel_obj(kind, id);
            }
            if let Some(description) = args.description {
                new = new.with_description(description);
            }
            let schedule = store.create(new).await?;
            print_schedule(&schedule);
        }
        ScheduleSubcommand::Update(args) => {
            let update = ScheduleUpdate {
                crontab: args.crontab,
                args: args.args.as_deref().map(|a| json_bytes(a, "args")).transpose()?,
                kwargs: args
                    .kwargs
                    .as_deref()
                    .map(|k| json_bytes(k, "kwargs"))
                    .transpose()?,
                queue_name: if args.clear_queue {
                    Some(None)
                } else {
                    args.queue.map(Some)
                },
                description: args.description.map(Some),
                ..Default::default()
            };
            let schedule = store.update(args.id, update).await?;
            print_schedule(&schedule);
        }
        ScheduleSubcommand::Pause { id } => {
            let schedule = store.set_paused(id, true).await?;
            print_schedule(&schedule);
        }
        ScheduleSubcommand::Resume { id } => {
            let schedule = store.set_paused(id, false).await?;
            print_schedule(&schedule);
        }
        ScheduleSubcommand::Delete { id } => {
            if store.delete(id).await? {
                println!("Deleted schedule {}", id);
            } else {
                warn!(id = %id, "No such schedule");
            }
        }
        ScheduleSubcommand::List(args) => {
            let rel_obj = related_object(args.rel_obj_type, args.rel_obj_id);
            let schedules = store.list(rel_obj.as_ref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&schedules)?);
            } else if schedules.is_empty() {
                println!("No schedules.");
            } else {
                for schedule in &schedules {
                    print_schedule(schedule);
                }
            }
        }
    }

    db.close().await;
    Ok(())
}

async fn run_scheduler_command(args: SchedulerArgs, factory: RegistryFactory) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let broker = Broker::new(db.pool().clone(), settings.channel_prefix.clone());

    match args.command {
        SchedulerSubcommand::Tick => {
            let mut scheduler = Scheduler::new(db.pool().clone(), broker);
            match factory(&settings) {
                Ok(registry) => scheduler = scheduler.with_registry(Arc::new(registry)),
                Err(e) => warn!(error = %e, "Dispatching without actor registry"),
            }
            match scheduler.tick().await? {
                TickOutcome::NotLeader => println!("Another process is dispatching; nothing done"),
                TickOutcome::Dispatched(count) => println!("Dispatched {} task(s)", count),
            }
        }
    }

    db.close().await;
    Ok(())
}

// ============================================================================
// Tasks Command Implementation
// ============================================================================

async fn run_tasks_command(args: TasksArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let db = connect(&settings).await?;
    let broker = Broker::new(db.pool().clone(), settings.channel_prefix.clone());
    let tasks = broker.tasks();

    match args.command {
        TasksSubcommand::Purge { older_than, states } => {
            let older_than = match older_than {
                Some(value) => parse_duration(&value, "--older-than")?,
                None => settings.task_expiration,
            };
            let states = states
                .iter()
                .map(|s| s.parse::<TaskState>())
                .collect::<Result<Vec<_>, _>>()?;
            let purged = tasks.purge(older_than, &states).await?;
            println!("Purged {} task(s)", purged);
        }
        TasksSubcommand::Stats { queue, json } => {
            let stats = broker.queue_stats(&queue).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Queue:    {}", queue);
                println!("Queued:   {}", stats.queued);
                println!("Consumed: {}", stats.consumed);
                println!("Done:     {}", stats.done);
                println!("Rejected: {}", stats.rejected);
            }
        }
        TasksSubcommand::RequeueStale { older_than } => {
            let older_than = parse_duration(&older_than, "--older-than")?;
            let requeued = tasks.requeue_stale(older_than).await?;
            println!("Requeued {} task(s)", requeued);
        }
        TasksSubcommand::Flush { queue } => {
            let flushed = broker.flush(&queue).await?;
            println!("Flushed {} task(s) from {}", flushed, queue);
        }
    }

    db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from([
            "pgtask",
            "worker",
            "--processes",
            "3",
            "-t",
            "4",
            "--queues",
            "mail,reports",
            "--pid-file",
            "/tmp/pgtask.pid",
            "-vv",
        ])
        .expect("parse");

        assert_eq!(cli.log_filter(), "trace");
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.processes, Some(3));
                assert_eq!(args.threads, Some(4));
                assert_eq!(args.queues, vec!["mail", "reports"]);
                assert_eq!(args.pid_file, Some(PathBuf::from("/tmp/pgtask.pid")));
                assert!(args.watch.is_none());
                assert!(!args.migrate);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_worker_process_with_child_args() {
        let settings = Settings::default()
            .with_threads(2)
            .with_queues(vec!["a".into(), "b".into()]);
        let mut argv = vec![
            "pgtask".to_string(),
            "worker-process".to_string(),
            "--worker-index".to_string(),
            "1".to_string(),
        ];
        argv.extend(child_args(&settings, "debug"));

        let cli = Cli::try_parse_from(argv).expect("parse");
        assert_eq!(cli.log_filter(), "debug");
        match cli.command {
            Commands::WorkerProcess(args) => {
                assert_eq!(args.worker_index, 1);
                assert_eq!(args.threads, Some(2));
                assert_eq!(args.queues, vec!["a", "b"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_worker_process_is_hidden() {
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("worker"));
        assert!(!help.contains("worker-process"));
    }

    #[test]
    fn test_parse_schedule_create() {
        let cli = Cli::try_parse_from([
            "pgtask",
            "schedule",
            "create",
            "nightly-report",
            "reports.build",
            "0 3 * * *",
            "--rel-obj-type",
            "tenant",
            "--rel-obj-id",
            "42",
        ])
        .expect("parse");

        match cli.command {
            Commands::Schedule(ScheduleArgs {
                command: ScheduleSubcommand::Create(args),
            }) => {
                assert_eq!(args.uid, "nightly-report");
                assert_eq!(args.crontab, "0 3 * * *");
                assert_eq!(args.rel_obj_id.as_deref(), Some("42"));
                assert!(!args.paused);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rel_obj_requires_both_parts() {
        let result = Cli::try_parse_from([
            "pgtask",
            "schedule",
            "list",
            "--rel-obj-type",
            "tenant",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_update_queue_flags_conflict() {
        let id = Uuid::new_v4().to_string();
        let result = Cli::try_parse_from([
            "pgtask",
            "schedule",
            "update",
            &id,
            "--queue",
            "mail",
            "--clear-queue",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_tasks_purge_defaults() {
        let cli = Cli::try_parse_from(["pgtask", "tasks", "purge"]).expect("parse");
        match cli.command {
            Commands::Tasks(TasksArgs {
                command: TasksSubcommand::Purge { older_than, states },
            }) => {
                assert!(older_than.is_none());
                assert_eq!(states, vec!["done", "rejected"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_json_bytes() {
        assert_eq!(json_bytes("[1, 2]", "args").expect("valid"), b"[1, 2]".to_vec());
        assert!(json_bytes("[1, 2", "args").is_err());
    }

    #[test]
    fn test_child_args_omit_empty_queues() {
        let args = child_args(&Settings::default(), "info");
        assert_eq!(args, vec!["--threads", "1", "--log-level", "info"]);
    }
}
