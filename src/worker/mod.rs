//! Task execution inside one worker process.
//!
//! - **ActorRegistry**: actors by name, built once at startup
//! - **WorkerPool**: M workers claiming tasks and running actors
//! - **Housekeeper**: purge, orphan expiry and metrics export
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pgtask::worker::{builtin_registry, WorkerPool, WorkerPoolConfig};
//!
//! let registry = Arc::new(builtin_registry(&settings)?);
//! let mut pool = WorkerPool::new(WorkerPoolConfig::from_settings(&settings), broker, registry)?;
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```

pub mod builtin;
pub mod housekeeping;
pub mod pool;
pub mod registry;

pub use builtin::builtin_registry;
pub use housekeeping::{Housekeeper, HousekeepingReport};
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use registry::{
    actor_fn, Actor, ActorRegistry, ActorSpec, RegistryFactory, RetryPolicy, TaskContext,
};
