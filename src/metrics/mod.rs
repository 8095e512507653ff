//! Prometheus metrics for brokers, workers and the scheduler.
//!
//! # Example
//!
//! ```ignore
//! use pgtask::metrics::{init_metrics, export_metrics, MetricsCollector, TaskOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_processed("default", "echo", TaskOutcome::Done, 0.25);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TaskOutcome, UnregisteredSite};
pub use prometheus::{export_metrics, init_metrics, write_textfile};
