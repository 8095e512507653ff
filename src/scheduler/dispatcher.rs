//! Turns due schedules into tasks.
//!
//! Every worker process runs a [`Scheduler`], but each tick first takes a
//! transaction-scoped advisory lock; only the process that wins it dispatches.
//! The lock and the row locks are released together at commit, and the
//! enqueue notifications fire only then.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{scheduler_lock_key, Broker, EnqueueRequest};
use crate::error::ScheduleError;
use crate::metrics::{MetricsCollector, UnregisteredSite};
use crate::worker::ActorRegistry;

use super::cron::{next_run_for, CronSchedule};
use super::schedule::{Schedule, ScheduleStore};

/// Queue used when neither the schedule nor the registry names one.
pub const FALLBACK_QUEUE: &str = "default";

/// Result of a single [`Scheduler::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another process holds the lock for this tick.
    NotLeader,
    /// This process was leader and enqueued this many tasks.
    Dispatched(usize),
}

pub struct Scheduler {
    pool: PgPool,
    broker: Broker,
    registry: Option<Arc<ActorRegistry>>,
    lock_key: i64,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(pool: PgPool, broker: Broker) -> Self {
        let lock_key = scheduler_lock_key(broker.channel_prefix());
        Self {
            pool,
            broker,
            registry: None,
            lock_key,
            metrics: MetricsCollector::new(),
        }
    }

    /// Uses the registry to resolve the queue of schedules without one.
    pub fn with_registry(mut self, registry: Arc<ActorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Dispatches every due schedule, if this process wins the lock.
    ///
    /// Either all due schedules of the tick are enqueued and advanced, or
    /// none are.
    pub async fn tick(&self) -> Result<TickOutcome, ScheduleError> {
        let mut tx = self.pool.begin().await?;

        let (leader,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *tx)
            .await?;
        if !leader {
            tx.rollback().await?;
            debug!(lock_key = self.lock_key, "Scheduler lock held elsewhere");
            self.metrics.record_scheduler_tick(None);
            return Ok(TickOutcome::NotLeader);
        }

        let now = Utc::now();
        let due = ScheduleStore::lock_due(&mut *tx, now).await?;
        let mut dispatched = 0;

        for schedule in &due {
            let cron = match CronSchedule::parse(&schedule.crontab) {
                Ok(cron) => cron,
                Err(e) => {
                    // Left for an operator to fix; next_run stays put.
                    warn!(
                        schedule_id = %schedule.id,
                        crontab = %schedule.crontab,
                        error = %e,
                        "Skipping schedule with invalid crontab"
                    );
                    continue;
                }
            };
            let next_run = match next_run_for(&cron, schedule.next_run, now) {
                Ok(next_run) => next_run,
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        crontab = %schedule.crontab,
                        error = %e,
                        "Schedule has no future run; skipping"
                    );
                    continue;
                }
            };

            let queue = self.resolve_queue(schedule);
            let request = EnqueueRequest::new(queue, &schedule.actor_name)
                .with_args(schedule.args.clone())
                .with_kwargs(schedule.kwargs.clone())
                .with_options(schedule.options.clone());
            let message_id = self.broker.enqueue_in(&mut *tx, request).await?;
            ScheduleStore::set_next_run(&mut *tx, schedule.id, next_run).await?;

            self.metrics.record_dispatched(&schedule.actor_name);
            info!(
                schedule_id = %schedule.id,
                uid = %schedule.uid,
                actor = %schedule.actor_name,
                message_id = %message_id,
                next_run = %next_run,
                "Dispatched scheduled task"
            );
            dispatched += 1;
        }

        tx.commit().await?;
        self.metrics.record_scheduler_tick(Some(dispatched));
        Ok(TickOutcome::Dispatched(dispatched))
    }

    fn resolve_queue(&self, schedule: &Schedule) -> String {
        if let Some(queue) = &schedule.queue_name {
            return queue.clone();
        }
        let registered = self
            .registry
            .as_ref()
            .and_then(|registry| registry.queue_for(&schedule.actor_name));
        match registered {
            Some(queue) => queue.to_string(),
            None => {
                if self.registry.is_some() {
                    warn!(
                        schedule_id = %schedule.id,
                        actor = %schedule.actor_name,
                        queue = FALLBACK_QUEUE,
                        "Scheduled actor is not registered; using fallback queue"
                    );
                    self.metrics
                        .record_unregistered_actor(UnregisteredSite::Dispatch);
                }
                FALLBACK_QUEUE.to_string()
            }
        }
    }

    /// Ticks every `interval` until shutdown. Tick errors are logged and the
    /// loop continues.
    pub async fn run(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = interval.as_secs_f64(), "Scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Dispatched(n)) if n > 0 => {
                            debug!(dispatched = n, "Scheduler tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.metrics.record_scheduler_error();
                            error!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

/// Next time a dispatched schedule should fire; exposed for the CLI listing.
pub fn upcoming_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if schedule.paused {
        return None;
    }
    let cron = CronSchedule::parse(&schedule.crontab).ok()?;
    if schedule.next_run > now {
        Some(schedule.next_run)
    } else {
        cron.next_after(now)
    }
}
