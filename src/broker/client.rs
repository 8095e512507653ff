//! The producer-facing broker: enqueue, results, subscriptions.

use std::time::Duration;

use rand::RngExt;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::metrics::MetricsCollector;
use crate::storage::{NewTask, QueueStats, ResultStore, TaskResult, TaskStore};

use super::channel::{channel_name, validate_actor_name, validate_queue_name, ChannelIdentifier};
use super::message::Message;
use super::subscription::Subscription;

/// Attempts for an enqueue hitting connection errors.
const ENQUEUE_ATTEMPTS: u32 = 3;
const ENQUEUE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const ENQUEUE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Everything needed to enqueue one task.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue_name: String,
    pub actor_name: String,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    pub options: Vec<u8>,
    /// Do not claim before this much time has passed.
    pub delay: Option<Duration>,
    /// Reuse an id to re-queue an existing task. Fails while it is consumed.
    pub message_id: Option<Uuid>,
}

impl EnqueueRequest {
    pub fn new(queue_name: impl Into<String>, actor_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            actor_name: actor_name.into(),
            args: Vec::new(),
            kwargs: Vec::new(),
            options: Vec::new(),
            delay: None,
            message_id: None,
        }
    }

    pub fn with_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Vec<u8>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }

    fn into_new_task(self) -> Result<NewTask, BrokerError> {
        let mut message = Message::new(
            self.queue_name,
            self.actor_name,
            self.args,
            self.kwargs,
            self.options,
        );
        if let Some(id) = self.message_id {
            message = message.with_message_id(id);
        }

        let eta = match self.delay {
            Some(delay) if !delay.is_zero() => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| message.enqueued_at.checked_add_signed(delay)),
            _ => None,
        };

        Ok(NewTask {
            message_id: message.message_id,
            message: message.encode()?,
            queue_name: message.queue_name,
            actor_name: message.actor_name,
            eta,
        })
    }
}

/// Enqueue and result API over the task table.
#[derive(Clone)]
pub struct Broker {
    tasks: TaskStore,
    results: ResultStore,
    channel_prefix: String,
    metrics: MetricsCollector,
}

impl Broker {
    pub fn new(pool: PgPool, channel_prefix: impl Into<String>) -> Self {
        Self {
            tasks: TaskStore::new(pool.clone()),
            results: ResultStore::new(pool),
            channel_prefix: channel_prefix.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn channel_prefix(&self) -> &str {
        &self.channel_prefix
    }

    /// Enqueues a task for immediate execution and returns its id.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        actor_name: &str,
        args: Vec<u8>,
        kwargs: Vec<u8>,
        options: Vec<u8>,
    ) -> Result<Uuid, BrokerError> {
        let request = EnqueueRequest::new(queue_name, actor_name)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_options(options);
        self.enqueue_request(request).await
    }

    /// Enqueues in its own transaction, retrying connection errors with
    /// randomized exponential backoff.
    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<Uuid, BrokerError> {
        let task = self.prepare(request)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tasks.create(&task).await {
                Ok(id) => {
                    self.enqueued(&task);
                    return Ok(id);
                }
                Err(e) if e.is_transient() && attempt < ENQUEUE_ATTEMPTS => {
                    let backoff = enqueue_backoff(attempt);
                    warn!(
                        message_id = %task.message_id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Enqueue hit a connection error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Enqueues on the caller's connection or transaction.
    ///
    /// Nothing is retried here: the caller owns the transaction.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        request: EnqueueRequest,
    ) -> Result<Uuid, BrokerError> {
        let task = self.prepare(request)?;
        let id = TaskStore::create_in(conn, &task).await?;
        self.enqueued(&task);
        Ok(id)
    }

    fn prepare(&self, request: EnqueueRequest) -> Result<NewTask, BrokerError> {
        validate_queue_name(&self.channel_prefix, &request.queue_name)?;
        validate_actor_name(&request.actor_name)?;
        request.into_new_task()
    }

    fn enqueued(&self, task: &NewTask) {
        self.metrics
            .record_enqueued(&task.queue_name, &task.actor_name);
        debug!(
            message_id = %task.message_id,
            queue = %task.queue_name,
            actor = %task.actor_name,
            eta = ?task.eta,
            "Enqueued task"
        );
    }

    /// Reads a task result without waiting. `None` means there is none (yet).
    pub async fn fetch_result(&self, message_id: Uuid) -> Result<Option<TaskResult>, BrokerError> {
        Ok(self.results.fetch(message_id).await?)
    }

    /// Listens for enqueues on the given queues.
    pub async fn subscribe(&self, queues: &[String]) -> Result<Subscription, BrokerError> {
        let mut channels = Vec::with_capacity(queues.len());
        for queue in queues {
            validate_queue_name(&self.channel_prefix, queue)?;
            channels.push(channel_name(
                &self.channel_prefix,
                queue,
                ChannelIdentifier::Enqueue,
            ));
        }
        Subscription::open(self.tasks.pool(), channels).await
    }

    /// Per-state row counts for a queue.
    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, BrokerError> {
        Ok(self.tasks.queue_stats(queue_name).await?)
    }

    /// Waits until `queue_name` has no queued or consumed tasks.
    pub async fn join(
        &self,
        queue_name: &str,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<(), BrokerError> {
        let started = tokio::time::Instant::now();
        loop {
            let stats = self.tasks.queue_stats(queue_name).await?;
            if stats.unfinished() == 0 {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Err(BrokerError::JoinTimeout {
                        queue: queue_name.to_string(),
                        remaining: stats.unfinished(),
                        timeout,
                    });
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Deletes every task in a queue.
    pub async fn flush(&self, queue_name: &str) -> Result<u64, BrokerError> {
        let count = self.tasks.flush(queue_name).await?;
        info!(queue = %queue_name, count = count, "Queue flushed");
        Ok(count)
    }

    /// Fills the result of a task from outside a worker.
    pub async fn store_result(
        &self,
        message_id: Uuid,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        Ok(self.results.store(message_id, payload, ttl).await?)
    }
}

/// Random backoff in `[cap/2, cap]` where `cap` doubles per attempt.
fn enqueue_backoff(attempt: u32) -> Duration {
    let cap = ENQUEUE_BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(ENQUEUE_BACKOFF_MAX);
    let cap_ms = cap.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(cap_ms / 2..=cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_enqueue_request_builder() {
        let id = Uuid::new_v4();
        let request = EnqueueRequest::new("mail", "mail.send")
            .with_args(b"[1]".to_vec())
            .with_kwargs(b"{}".to_vec())
            .with_delay(Duration::from_secs(30))
            .with_message_id(id);

        assert_eq!(request.queue_name, "mail");
        assert_eq!(request.actor_name, "mail.send");
        assert_eq!(request.delay, Some(Duration::from_secs(30)));
        assert_eq!(request.message_id, Some(id));
    }

    #[test]
    fn test_into_new_task_sets_eta_from_delay() {
        let before = Utc::now();
        let task = EnqueueRequest::new("default", "echo")
            .with_delay(Duration::from_secs(60))
            .into_new_task()
            .expect("task");

        let eta = task.eta.expect("eta");
        assert!(eta >= before + chrono::Duration::seconds(60));

        let message = Message::decode(&task.message).expect("decode");
        assert_eq!(message.message_id, task.message_id);
        assert_eq!(message.actor_name, "echo");
    }

    #[test]
    fn test_into_new_task_without_delay_has_no_eta() {
        let task = EnqueueRequest::new("default", "echo")
            .with_delay(Duration::ZERO)
            .into_new_task()
            .expect("task");
        assert!(task.eta.is_none());
    }

    #[test]
    fn test_enqueue_backoff_bounds() {
        for attempt in 1..10 {
            let backoff = enqueue_backoff(attempt);
            assert!(backoff <= ENQUEUE_BACKOFF_MAX);
            assert!(backoff >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_queue_before_touching_db() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let broker = Broker::new(pool, "pgtask");

        let err = broker
            .enqueue("bad queue", "echo", Vec::new(), Vec::new(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidQueueName(_)));

        let err = broker
            .enqueue("default", "", Vec::new(), Vec::new(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidActorName(_)));
    }
}
