//! pgtask: PostgreSQL-backed background tasks.
//!
//! Tasks are rows in a `tasks` table. Producers enqueue them through the
//! [`broker::Broker`]; workers claim them with `FOR UPDATE SKIP LOCKED`, woken
//! by `LISTEN/NOTIFY`. Results live on the task row. Recurring work is stored
//! as cron [`scheduler::Schedule`]s and dispatched by one elected process per
//! tick. The [`supervisor`] runs N worker processes with M worker tasks each.
//!
//! Applications register their actors in an [`worker::ActorRegistry`] and hand
//! a factory for it to [`cli::run_with_registry`].

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, EnqueueRequest, Message};
pub use config::Settings;
pub use error::{ActorError, BrokerError, RegistryError, ScheduleError, SupervisorError};
pub use worker::{actor_fn, Actor, ActorRegistry, ActorSpec, TaskContext};
