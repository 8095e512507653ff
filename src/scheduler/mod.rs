//! Cron scheduling on top of the broker.
//!
//! - [`cron`]: five-field crontab parsing and next-fire computation
//! - [`schedule`]: schedule records and their CRUD store
//! - [`dispatcher`]: the leader-elected tick that enqueues due schedules
//!
//! # Example
//!
//! ```ignore
//! use pgtask::scheduler::{NewSchedule, ScheduleStore, Scheduler};
//!
//! let store = ScheduleStore::new(pool.clone());
//! store
//!     .create(NewSchedule::new("nightly-digest", "mail.digest", "0 3 * * *"))
//!     .await?;
//!
//! let scheduler = Scheduler::new(pool, broker);
//! scheduler.tick().await?;
//! ```

pub mod cron;
pub mod dispatcher;
pub mod schedule;

pub use cron::{compute_next_run, next_run_for, CronError, CronSchedule};
pub use dispatcher::{upcoming_run, Scheduler, TickOutcome, FALLBACK_QUEUE};
pub use schedule::{
    paused_next_run, NewSchedule, RelatedObject, Schedule, ScheduleStore, ScheduleUpdate,
};
