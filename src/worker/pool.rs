//! Worker pool for processing tasks from PostgreSQL queues.
//!
//! A pool runs M worker tasks inside one process. Workers claim rows from the
//! task table and sleep on a process-wide [`Notify`] between claims; a single
//! listener task turns enqueue notifications into wake-ups.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel, bounded by a timeout
//! - Per-actor time limits and retry policy with jittered backoff
//! - Pool statistics tracking

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Message, Wake};
use crate::config::Settings;
use crate::error::{ActorError, BrokerError, RegistryError};
use crate::metrics::{MetricsCollector, TaskOutcome, UnregisteredSite};
use crate::storage::{DatabaseError, Task};

use super::registry::{ActorRegistry, RetryPolicy, TaskContext};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// None of the requested queues has a registered actor.
    #[error("No registered actor serves any of the queues {0:?}")]
    NoQueues(Vec<String>),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Queues to consume; empty means every queue in the registry.
    pub queues: Vec<String>,
    /// Longest a worker sleeps before sweeping again without a notification.
    pub listen_timeout: Duration,
    /// Time limit for actors that do not set one.
    pub default_time_limit: Duration,
    /// Retry budget for actors that do not set a policy.
    pub default_max_retries: u32,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Pause after a failed claim before trying again.
    pub error_backoff: Duration,
    /// Seed for the per-worker random generators.
    pub rng_seed: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queues: Vec::new(),
            listen_timeout: Duration::from_secs(30),
            default_time_limit: Duration::from_secs(600),
            default_max_retries: 5,
            shutdown_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            rng_seed: 0,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            num_workers: settings.threads,
            queues: settings.queues.clone(),
            listen_timeout: settings.consumer_listen_timeout,
            default_time_limit: settings.task_default_time_limit,
            default_max_retries: settings.task_max_retries,
            shutdown_timeout: settings.shutdown_timeout,
            ..Default::default()
        }
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    pub fn with_default_time_limit(mut self, limit: Duration) -> Self {
        self.default_time_limit = limit;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running an actor.
    pub active_workers: usize,
    pub tasks_done: u64,
    /// Tasks that failed, whether requeued for retry or rejected.
    pub tasks_failed: u64,
    /// Tasks handed back because no actor was registered.
    pub tasks_released: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks the actors ran.
    pub fn total_processed(&self) -> u64 {
        self.tasks_done + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_done as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_done: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_released: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_done: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_released: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: TaskOutcome, duration: Duration) {
        let counter = match outcome {
            TaskOutcome::Done => &self.tasks_done,
            TaskOutcome::Retried | TaskOutcome::Rejected => &self.tasks_failed,
            TaskOutcome::Released => {
                self.tasks_released.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let done = self.tasks_done.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = done + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_done: done,
            tasks_failed: failed,
            tasks_released: self.tasks_released.load(Ordering::SeqCst),
            average_task_duration: average_duration,
        }
    }
}

/// Queue names paired with the actors this process can run on them.
#[derive(Debug, Clone)]
struct QueueBinding {
    queue_name: String,
    actors: Vec<String>,
}

fn bind_queues(registry: &ActorRegistry, requested: &[String]) -> Result<Vec<QueueBinding>, PoolError> {
    let candidates = if requested.is_empty() {
        registry.queues()
    } else {
        requested.to_vec()
    };

    let mut bindings = Vec::new();
    for queue_name in &candidates {
        let actors = registry.actors_for_queue(queue_name);
        if actors.is_empty() {
            warn!(queue = %queue_name, "No registered actor for queue; not consuming it");
            continue;
        }
        bindings.push(QueueBinding {
            queue_name: queue_name.clone(),
            actors,
        });
    }

    if bindings.is_empty() {
        return Err(PoolError::NoQueues(candidates));
    }
    Ok(bindings)
}

/// Worker pool that manages multiple workers processing tasks.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Broker,
    registry: Arc<ActorRegistry>,
    bindings: Arc<Vec<QueueBinding>>,
    wake: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    listener_handle: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoQueues` if no requested queue has an actor.
    pub fn new(
        config: WorkerPoolConfig,
        broker: Broker,
        registry: Arc<ActorRegistry>,
    ) -> Result<Self, PoolError> {
        registry.validate(broker.channel_prefix())?;
        let bindings = bind_queues(&registry, &config.queues)?;

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            broker,
            registry,
            bindings: Arc::new(bindings),
            wake: Arc::new(Notify::new()),
            shutdown_tx,
            worker_handles: Vec::new(),
            listener_handle: None,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        })
    }

    /// Queues this pool consumes.
    pub fn queues(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.queue_name.clone()).collect()
    }

    /// Subscribes to the consumed queues and starts all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or a broker error if the first `LISTEN` fails.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let queues = self.queues();
        let subscription = self.broker.subscribe(&queues).await?;
        let listener = Listener {
            broker: self.broker.clone(),
            queues,
            wake: Arc::clone(&self.wake),
            shutdown_rx: self.shutdown_tx.subscribe(),
            listen_timeout: self.config.listen_timeout,
        };
        self.listener_handle = Some(tokio::spawn(listener.run(subscription)));

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                broker: self.broker.clone(),
                registry: Arc::clone(&self.registry),
                bindings: Arc::clone(&self.bindings),
                cursor: i,
                wake: Arc::clone(&self.wake),
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: self.config.clone(),
                rng: ChaCha8Rng::seed_from_u64(self.config.rng_seed.wrapping_add(i as u64)),
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.set_active_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            queues = ?self.queues(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Stops claiming and waits for in-flight tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout; they are aborted in that case and their rows
    /// stay `consumed`.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };
        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;

        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.set_active_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// Owns the process's `LISTEN` connection and wakes idle workers.
struct Listener {
    broker: Broker,
    queues: Vec<String>,
    wake: Arc<Notify>,
    shutdown_rx: broadcast::Receiver<()>,
    listen_timeout: Duration,
}

impl Listener {
    async fn run(mut self, first: crate::broker::Subscription) {
        let mut subscription = Some(first);

        loop {
            let current = match subscription.take() {
                Some(s) => s,
                None => match self.broker.subscribe(&self.queues).await {
                    Ok(s) => {
                        // Anything sent while unsubscribed was missed.
                        self.wake.notify_waiters();
                        s
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to re-subscribe, retrying");
                        tokio::select! {
                            _ = self.shutdown_rx.recv() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                },
            };

            let wakes = current.into_stream(self.listen_timeout);
            futures::pin_mut!(wakes);

            loop {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => {
                        debug!("Listener stopped");
                        return;
                    }
                    next = wakes.next() => match next {
                        Some(Ok(Wake::Notified { message_id, .. })) => {
                            debug!(message_id = %message_id, "Enqueue notification");
                            self.wake.notify_waiters();
                        }
                        Some(Ok(Wake::Reconnected)) => self.wake.notify_waiters(),
                        Some(Ok(Wake::TimedOut)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Notification listener failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A single worker that claims and runs tasks.
struct Worker {
    id: String,
    broker: Broker,
    registry: Arc<ActorRegistry>,
    bindings: Arc<Vec<QueueBinding>>,
    /// Next queue to try first, for round-robin across queues.
    cursor: usize,
    wake: Arc<Notify>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerPoolConfig,
    rng: ChaCha8Rng,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Claims tasks until there is nothing to claim, then sleeps until
    /// notified, the listen timeout passes, or shutdown.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // We missed some signals, but since it's shutdown, just check again
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            // Armed before the claim so a notification sent in between is kept.
            let wake = Arc::clone(&self.wake);
            let notified = wake.notified();
            futures::pin_mut!(notified);
            notified.as_mut().enable();

            match self.claim_next().await {
                Ok(Some(task)) => {
                    self.process_task(task).await;
                    continue;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim task");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.listen_timeout) => {}
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Tries each queue once, starting after the last one that yielded.
    async fn claim_next(&mut self) -> Result<Option<Task>, DatabaseError> {
        let n = self.bindings.len();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            let binding = &self.bindings[index];
            if let Some(task) = self
                .broker
                .tasks()
                .claim(&binding.queue_name, &binding.actors)
                .await?
            {
                self.cursor = index + 1;
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn process_task(&mut self, task: Task) {
        let start_time = Instant::now();
        let message_id = task.message_id;

        let Some(actor) = self.registry.get(&task.actor_name) else {
            warn!(
                worker_id = %self.id,
                message_id = %message_id,
                actor = %task.actor_name,
                "Claimed task for unregistered actor; releasing"
            );
            self.metrics
                .record_unregistered_actor(UnregisteredSite::Claim);
            if let Err(e) = self.broker.tasks().release(message_id).await {
                error!(message_id = %message_id, error = %e, "Failed to release task");
            }
            self.finish(&task, TaskOutcome::Released, start_time.elapsed());
            return;
        };

        let spec = actor.spec().clone();
        let retries = u32::try_from(task.retries).unwrap_or(0);

        info!(
            worker_id = %self.id,
            message_id = %message_id,
            actor = %task.actor_name,
            queue = %task.queue_name,
            retries = retries,
            "Processing task"
        );

        self.stats.increment_active();
        self.metrics.task_started();

        let result = match decode_message(&task) {
            Ok(message) => {
                let ctx = TaskContext {
                    message_id,
                    retries,
                    message,
                };
                let limit = spec.time_limit.unwrap_or(self.config.default_time_limit);
                let mut handle = tokio::spawn(async move { actor.perform(ctx).await });

                match tokio::time::timeout(limit, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) if join_err.is_panic() => {
                        Err(ActorError::Panicked(panic_message(join_err.into_panic())))
                    }
                    Ok(Err(join_err)) => Err(ActorError::Failed(join_err.to_string())),
                    Err(_) => {
                        handle.abort();
                        Err(ActorError::TimeLimitExceeded(limit))
                    }
                }
            }
            Err(e) => Err(e),
        };

        self.metrics.task_finished();
        self.stats.decrement_active();

        let outcome = match result {
            Ok(payload) => self.complete(&task, payload, spec.result_ttl).await,
            Err(e) => {
                let policy = spec
                    .retry
                    .clone()
                    .unwrap_or_else(|| RetryPolicy::new(self.config.default_max_retries));
                self.fail(&task, retries, &policy, e).await
            }
        };

        self.finish(&task, outcome, start_time.elapsed());
    }

    async fn complete(
        &self,
        task: &Task,
        payload: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> TaskOutcome {
        if let Err(e) = self
            .broker
            .tasks()
            .complete(task.message_id, payload.as_deref(), ttl)
            .await
        {
            error!(
                worker_id = %self.id,
                message_id = %task.message_id,
                error = %e,
                "Failed to mark task done"
            );
        }
        TaskOutcome::Done
    }

    async fn fail(
        &mut self,
        task: &Task,
        retries: u32,
        policy: &RetryPolicy,
        err: ActorError,
    ) -> TaskOutcome {
        let (requeue, eta, outcome) = if policy.should_retry(retries, &err) {
            let backoff = policy.backoff(retries, &mut self.rng);
            let eta = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                worker_id = %self.id,
                message_id = %task.message_id,
                actor = %task.actor_name,
                error = %err,
                retry = retries + 1,
                max_retries = policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                "Task failed, requeueing for retry"
            );
            (true, Some(eta), TaskOutcome::Retried)
        } else {
            error!(
                worker_id = %self.id,
                message_id = %task.message_id,
                actor = %task.actor_name,
                error = %err,
                retries = retries,
                "Task failed, rejecting"
            );
            (false, None, TaskOutcome::Rejected)
        };

        if let Err(e) = self
            .broker
            .tasks()
            .reject(task.message_id, requeue, eta)
            .await
        {
            error!(
                worker_id = %self.id,
                message_id = %task.message_id,
                error = %e,
                "Failed to record task failure"
            );
        }
        outcome
    }

    fn finish(&self, task: &Task, outcome: TaskOutcome, duration: Duration) {
        self.stats.record(outcome, duration);
        self.metrics.record_processed(
            &task.queue_name,
            &task.actor_name,
            outcome,
            duration.as_secs_f64(),
        );
        debug!(
            worker_id = %self.id,
            message_id = %task.message_id,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );
    }
}

fn decode_message(task: &Task) -> Result<Message, ActorError> {
    let bytes = task
        .message
        .as_deref()
        .ok_or_else(|| ActorError::BadArguments("task has no message".to_string()))?;
    Message::decode(bytes).map_err(|e| ActorError::BadArguments(e.to_string()))
}
