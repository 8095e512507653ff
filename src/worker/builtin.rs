//! Actors shipped with the binary, used for smoke tests and health checks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Settings;
use crate::error::{ActorError, RegistryError};

use super::registry::{Actor, ActorRegistry, ActorSpec, TaskContext};

pub const ECHO_ACTOR: &str = "pgtask.echo";
pub const SLEEP_ACTOR: &str = "pgtask.sleep";

/// Returns its `args` bytes as the task result.
pub struct EchoActor {
    spec: ActorSpec,
}

impl EchoActor {
    pub fn new() -> Self {
        Self {
            spec: ActorSpec::new(ECHO_ACTOR).with_result_ttl(Duration::from_secs(24 * 3600)),
        }
    }
}

impl Default for EchoActor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actor for EchoActor {
    fn spec(&self) -> &ActorSpec {
        &self.spec
    }

    async fn perform(&self, ctx: TaskContext) -> Result<Option<Vec<u8>>, ActorError> {
        info!(message_id = %ctx.message_id, bytes = ctx.message.args.len(), "echo");
        Ok(Some(ctx.message.args))
    }
}

/// Sleeps for the number of seconds given as JSON args, e.g. `[2.5]`.
pub struct SleepActor {
    spec: ActorSpec,
}

impl SleepActor {
    pub fn new() -> Self {
        Self {
            spec: ActorSpec::new(SLEEP_ACTOR),
        }
    }
}

impl Default for SleepActor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actor for SleepActor {
    fn spec(&self) -> &ActorSpec {
        &self.spec
    }

    async fn perform(&self, ctx: TaskContext) -> Result<Option<Vec<u8>>, ActorError> {
        let (seconds,): (f64,) = ctx
            .message
            .args_json()
            .map_err(|e| ActorError::BadArguments(e.to_string()))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ActorError::BadArguments(format!(
                "sleep duration must be a non-negative number, got {}",
                seconds
            )));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(None)
    }
}

/// Registry holding only the built-in actors.
pub fn builtin_registry(_settings: &Settings) -> Result<ActorRegistry, RegistryError> {
    let mut registry = ActorRegistry::new();
    registry.register(Arc::new(EchoActor::new()))?;
    registry.register(Arc::new(SleepActor::new()))?;
    Ok(registry)
}
