//! The worker process: what runs behind `pgtask worker-process`.
//!
//! Startup builds the registry, connects, starts the pool, the scheduler and
//! housekeeping, then prints the readiness line the supervisor waits for.
//! The first termination signal drains the pool; a second one exits at once.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use rand::prelude::*;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::Settings;
use crate::metrics::init_metrics;
use crate::scheduler::Scheduler;
use crate::storage::{Database, PoolOptions};
use crate::worker::{Housekeeper, PoolError, RegistryFactory, WorkerPool, WorkerPoolConfig};

use super::state::{exit_code, Lifecycle, SignalAction};

/// Hidden CLI subcommand the supervisor re-executes itself with.
pub const WORKER_PROCESS_COMMAND: &str = "worker-process";

const READY_PREFIX: &str = "pgtask-worker-ready";

/// How long background tasks get to notice shutdown.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ready_line(worker: usize, pid: u32) -> String {
    format!("{} worker={} pid={}", READY_PREFIX, worker, pid)
}

pub fn is_ready_line(line: &str) -> bool {
    line.trim_end().starts_with(READY_PREFIX)
}

/// SIGTERM and SIGINT as one stream.
pub struct TerminationSignals {
    source: SignalSource,
}

enum SignalSource {
    Os { term: Signal, int: Signal },
    Channel(mpsc::UnboundedReceiver<&'static str>),
}

impl TerminationSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            source: SignalSource::Os {
                term: signal(SignalKind::terminate())?,
                int: signal(SignalKind::interrupt())?,
            },
        })
    }

    /// Signals delivered by the caller instead of the OS, for embedding
    /// hosts that own signal handling.
    pub fn channel() -> (mpsc::UnboundedSender<&'static str>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                source: SignalSource::Channel(rx),
            },
        )
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        match &mut self.source {
            SignalSource::Os { term, int } => tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            },
            SignalSource::Channel(rx) => match rx.recv().await {
                Some(name) => name,
                // No sender left means no signal can ever arrive.
                None => std::future::pending().await,
            },
        }
    }
}

/// Mixes OS entropy with the pid so forked siblings never share a stream.
fn process_seed() -> u64 {
    let entropy: u64 = rand::rng().random();
    entropy ^ u64::from(std::process::id()).rotate_left(32)
}

/// Runs one worker process to completion and returns its exit code.
pub async fn run_worker_process(
    settings: Settings,
    factory: RegistryFactory,
    worker_index: usize,
) -> i32 {
    let mut signals = match TerminationSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            // Reported like any other startup failure, so it is not restarted.
            error!(error = %e, "Failed to install signal handlers");
            return exit_code::CONNECT;
        }
    };
    let mut lifecycle = Lifecycle::Starting;
    let pid = std::process::id();
    let seed = process_seed();
    info!(worker = worker_index, pid = pid, state = %lifecycle, "Worker process starting");

    let registry = match factory(&settings).and_then(|r| {
        r.validate(&settings.channel_prefix)?;
        Ok(r)
    }) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "Failed to build actor registry");
            return exit_code::REGISTRY;
        }
    };

    let options = PoolOptions {
        max_connections: settings.db_max_connections,
        ..Default::default()
    };
    let db = match Database::connect_with(&settings.database_url, &options).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return exit_code::CONNECT;
        }
    };

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics disabled");
    }

    let broker = Broker::new(db.pool().clone(), settings.channel_prefix.clone());
    let config = WorkerPoolConfig::from_settings(&settings).with_rng_seed(seed);
    let mut pool = match WorkerPool::new(config, broker.clone(), Arc::clone(&registry)) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Failed to create worker pool");
            return exit_code::REGISTRY;
        }
    };
    if let Err(e) = pool.start().await {
        error!(error = %e, "Failed to start worker pool");
        return match e {
            PoolError::Broker(_) => exit_code::CONNECT,
            _ => exit_code::REGISTRY,
        };
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler = Scheduler::new(db.pool().clone(), broker.clone()).with_registry(registry);
    let scheduler_interval = settings.scheduler_interval;
    let scheduler_rx = shutdown_tx.subscribe();
    let scheduler_handle =
        tokio::spawn(async move { scheduler.run(scheduler_interval, scheduler_rx).await });

    let housekeeper = Housekeeper::new(
        broker.tasks().clone(),
        &settings,
        format!("pgtask-worker-{}", worker_index),
    );
    let housekeeping_rx = shutdown_tx.subscribe();
    let housekeeping_handle = tokio::spawn(async move { housekeeper.run(housekeeping_rx).await });

    lifecycle.advance(Lifecycle::Running);
    info!(
        worker = worker_index,
        pid = pid,
        queues = ?pool.queues(),
        threads = pool.num_workers(),
        "Worker process ready"
    );
    {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", ready_line(worker_index, pid));
        let _ = stdout.flush();
    }

    let name = signals.recv().await;
    let (next, _) = lifecycle.on_signal();
    lifecycle = next;
    info!(signal = name, state = %lifecycle, "Stopping worker process");
    let _ = shutdown_tx.send(());

    let stopped = {
        let stop = pool.shutdown();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                result = &mut stop => break Some(result),
                name = signals.recv() => {
                    let (next, action) = lifecycle.on_signal();
                    lifecycle = next;
                    if action == SignalAction::Kill {
                        warn!(signal = name, "Second termination signal, exiting without waiting");
                        break None;
                    }
                }
            }
        }
    };

    match stopped {
        None => return lifecycle.exit_code(),
        Some(Ok(())) => {}
        Some(Err(e)) => warn!(error = %e, "Worker pool did not stop cleanly"),
    }

    for handle in [scheduler_handle, housekeeping_handle] {
        if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    db.close().await;

    lifecycle.advance(Lifecycle::Stopped);
    let stats = pool.stats();
    info!(
        state = %lifecycle,
        tasks_done = stats.tasks_done,
        tasks_failed = stats.tasks_failed,
        "Worker process stopped"
    );
    lifecycle.exit_code()
}
