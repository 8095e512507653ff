//! Worker processes and the supervisor that runs them.
//!
//! `pgtask worker` starts a [`Supervisor`], which re-executes the current
//! binary as `pgtask worker-process` once per process, waits for each child's
//! readiness line, forwards their output and relays termination signals.

pub mod log_watcher;
pub mod manager;
pub mod pidfile;
pub mod process;
pub mod state;
pub mod watcher;

pub use log_watcher::{LogSource, LogWatcher, Pipe};
pub use manager::{Supervisor, SupervisorConfig};
pub use pidfile::PidFile;
pub use process::{run_worker_process, TerminationSignals, WORKER_PROCESS_COMMAND};
pub use state::{exit_code, Lifecycle, SignalAction};
pub use watcher::FileWatcher;
