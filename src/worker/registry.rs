//! Actor registry.
//!
//! Actors are registered explicitly at startup; the worker pool and the
//! scheduler look them up by name. There is no discovery: the application
//! hands a [`RegistryFactory`] to the CLI entry point.
//!
//! # Example
//!
//! ```ignore
//! use pgtask::worker::{actor_fn, ActorRegistry, ActorSpec};
//!
//! let mut registry = ActorRegistry::new();
//! registry.register(actor_fn(
//!     ActorSpec::new("mail.send").with_queue("mail"),
//!     |ctx| async move {
//!         let to: Vec<String> = ctx.message.args_json().map_err(|e| {
//!             pgtask::error::ActorError::BadArguments(e.to_string())
//!         })?;
//!         send(&to).await;
//!         Ok(None)
//!     },
//! ))?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::broker::channel::{validate_actor_name, validate_queue_name};
use crate::broker::Message;
use crate::config::Settings;
use crate::error::{ActorError, RegistryError};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 3600);

/// How a failing actor is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    /// Whether a task that already ran `retries` retries gets another one.
    pub fn should_retry(&self, retries: u32, error: &ActorError) -> bool {
        error.is_retryable() && retries < self.max_retries
    }

    /// Delay before retry number `retries + 1`: exponential from
    /// `min_backoff`, capped at `max_backoff`, jittered into `[b/2, b]`.
    pub fn backoff(&self, retries: u32, rng: &mut ChaCha8Rng) -> Duration {
        let factor = 1u32.checked_shl(retries.min(31)).unwrap_or(u32::MAX);
        let ceiling = self
            .min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(ceiling_ms / 2..=ceiling_ms))
    }
}

/// Static description of an actor.
///
/// `retry` and `time_limit` fall back to the worker settings when unset.
#[derive(Debug, Clone)]
pub struct ActorSpec {
    pub name: String,
    pub queue_name: String,
    pub retry: Option<RetryPolicy>,
    pub time_limit: Option<Duration>,
    /// How long a returned result stays readable. `None` keeps it until the
    /// row is purged.
    pub result_ttl: Option<Duration>,
}

impl ActorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_name: DEFAULT_QUEUE.to_string(),
            retry: None,
            time_limit: None,
            result_ttl: None,
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }
}

/// What an actor receives for one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub message_id: Uuid,
    /// Retries already spent on this task.
    pub retries: u32,
    pub message: Message,
}

/// A named unit of work.
#[async_trait]
pub trait Actor: Send + Sync {
    fn spec(&self) -> &ActorSpec;

    /// Runs one task. `Ok(Some(bytes))` is stored as the task result.
    async fn perform(&self, ctx: TaskContext) -> Result<Option<Vec<u8>>, ActorError>;
}

/// Adapter turning an async closure into an [`Actor`].
struct FnActor<F> {
    spec: ActorSpec,
    f: F,
}

#[async_trait]
impl<F> Actor for FnActor<F>
where
    F: Fn(TaskContext) -> BoxFuture<'static, Result<Option<Vec<u8>>, ActorError>> + Send + Sync,
{
    fn spec(&self) -> &ActorSpec {
        &self.spec
    }

    async fn perform(&self, ctx: TaskContext) -> Result<Option<Vec<u8>>, ActorError> {
        (self.f)(ctx).await
    }
}

/// Wraps an async closure as an actor.
pub fn actor_fn<F, Fut>(spec: ActorSpec, f: F) -> Arc<dyn Actor>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Vec<u8>>, ActorError>> + Send + 'static,
{
    Arc::new(FnActor {
        spec,
        f: move |ctx: TaskContext| -> BoxFuture<'static, _> { Box::pin(f(ctx)) },
    })
}

/// Builds the registry of a worker process.
pub type RegistryFactory = fn(&Settings) -> Result<ActorRegistry, RegistryError>;

/// Actors by name.
#[derive(Clone, Default)]
pub struct ActorRegistry {
    actors: HashMap<String, Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: Arc<dyn Actor>) -> Result<(), RegistryError> {
        let spec = actor.spec();
        validate_actor_name(&spec.name).map_err(|e| RegistryError::InvalidSpec {
            actor: spec.name.clone(),
            reason: e.to_string(),
        })?;
        if spec.queue_name.is_empty() {
            return Err(RegistryError::InvalidSpec {
                actor: spec.name.clone(),
                reason: "queue name cannot be empty".to_string(),
            });
        }
        if spec.time_limit == Some(Duration::ZERO) {
            return Err(RegistryError::InvalidSpec {
                actor: spec.name.clone(),
                reason: "time limit must be positive".to_string(),
            });
        }
        if let Some(retry) = &spec.retry {
            if retry.min_backoff > retry.max_backoff {
                return Err(RegistryError::InvalidSpec {
                    actor: spec.name.clone(),
                    reason: "min_backoff exceeds max_backoff".to_string(),
                });
            }
        }
        if self.actors.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateActor(spec.name.clone()));
        }

        let name = spec.name.clone();
        self.actors.insert(name, actor);
        Ok(())
    }

    /// Checks the registry can serve on `channel_prefix`.
    pub fn validate(&self, channel_prefix: &str) -> Result<(), RegistryError> {
        if self.actors.is_empty() {
            return Err(RegistryError::Empty);
        }
        for actor in self.actors.values() {
            let spec = actor.spec();
            validate_queue_name(channel_prefix, &spec.queue_name).map_err(|e| {
                RegistryError::InvalidSpec {
                    actor: spec.name.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Actor>> {
        self.actors.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Actor>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::ActorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actors.contains_key(name)
    }

    pub fn queue_for(&self, name: &str) -> Option<&str> {
        self.actors.get(name).map(|a| a.spec().queue_name.as_str())
    }

    /// Distinct queues served by the registered actors, sorted.
    pub fn queues(&self) -> Vec<String> {
        self.actors
            .values()
            .map(|a| a.spec().queue_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Names of the actors bound to `queue_name`, sorted.
    pub fn actors_for_queue(&self, queue_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .actors
            .values()
            .filter(|a| a.spec().queue_name == queue_name)
            .map(|a| a.spec().name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl std::fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("actors", &self.names())
            .finish()
    }
}
