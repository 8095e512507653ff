//! Prometheus metrics registration and export.
//!
//! Worker processes have no HTTP surface; metrics are exported in the text
//! exposition format, either as a string or as a file for the node_exporter
//! textfile collector.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

/// Global Prometheus registry for all pgtask metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks enqueued, labeled by queue and actor.
pub static TASKS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Tasks processed, labeled by queue, actor and outcome.
pub static TASKS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by actor.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tasks currently being handled in this process.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Scheduler ticks, labeled by outcome (leader, not_leader, error).
pub static SCHEDULER_TICKS: OnceLock<CounterVec> = OnceLock::new();

/// Schedules dispatched, labeled by actor.
pub static SCHEDULES_DISPATCHED: OnceLock<CounterVec> = OnceLock::new();

/// Tasks referencing an actor missing from the registry, labeled by site.
pub static UNREGISTERED_ACTOR: OnceLock<CounterVec> = OnceLock::new();

/// Finished tasks deleted by housekeeping.
pub static TASKS_PURGED: OnceLock<IntCounter> = OnceLock::new();

/// Unclaimed tasks expired by housekeeping.
pub static TASKS_EXPIRED: OnceLock<IntCounter> = OnceLock::new();

/// Worker tasks running in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls keep the first registry.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_enqueued = CounterVec::new(
        Opts::new("pgtask_tasks_enqueued_total", "Total number of tasks enqueued"),
        &["queue", "actor"],
    )?;

    let tasks_processed = CounterVec::new(
        Opts::new(
            "pgtask_tasks_processed_total",
            "Total number of tasks handled by workers",
        ),
        &["queue", "actor", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "pgtask_task_duration_seconds",
            "Actor execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["actor"],
    )?;

    let tasks_in_progress = Gauge::new(
        "pgtask_tasks_in_progress",
        "Number of tasks currently being handled",
    )?;

    let scheduler_ticks = CounterVec::new(
        Opts::new("pgtask_scheduler_ticks_total", "Scheduler tick attempts"),
        &["outcome"],
    )?;

    let schedules_dispatched = CounterVec::new(
        Opts::new(
            "pgtask_schedules_dispatched_total",
            "Schedules turned into tasks",
        ),
        &["actor"],
    )?;

    let unregistered_actor = CounterVec::new(
        Opts::new(
            "pgtask_unregistered_actor_total",
            "Tasks naming an actor missing from the registry",
        ),
        &["site"],
    )?;

    let tasks_purged = IntCounter::new("pgtask_tasks_purged_total", "Finished tasks purged")?;
    let tasks_expired = IntCounter::new(
        "pgtask_tasks_expired_total",
        "Queued tasks expired without being claimed",
    )?;

    let active_workers = Gauge::new("pgtask_active_workers", "Number of active worker tasks")?;

    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(tasks_processed.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(scheduler_ticks.clone()))?;
    registry.register(Box::new(schedules_dispatched.clone()))?;
    registry.register(Box::new(unregistered_actor.clone()))?;
    registry.register(Box::new(tasks_purged.clone()))?;
    registry.register(Box::new(tasks_expired.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Losing a race here only means another caller initialized first
    let _ = REGISTRY.set(registry);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = TASKS_PROCESSED.set(tasks_processed);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = SCHEDULER_TICKS.set(scheduler_ticks);
    let _ = SCHEDULES_DISPATCHED.set(schedules_dispatched);
    let _ = UNREGISTERED_ACTOR.set(unregistered_actor);
    let _ = TASKS_PURGED.set(tasks_purged);
    let _ = TASKS_EXPIRED.set(tasks_expired);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to `{dir}/{name}.prom`.
///
/// The file is replaced atomically so a collector never reads a partial
/// export.
pub fn write_textfile(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let target = dir.join(format!("{}.prom", name));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(export_metrics().as_bytes())?;
    file.flush()?;
    file.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_contains_metric_names() {
        init_metrics().expect("init");
        TASKS_PURGED.get().expect("registered").inc_by(3);

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("pgtask_tasks_purged_total"));
    }

    #[test]
    fn test_write_textfile() {
        init_metrics().expect("init");
        let dir = tempfile::tempdir().expect("tempdir");

        let path = write_textfile(dir.path(), "worker-0").expect("write");
        assert_eq!(path, dir.path().join("worker-0.prom"));

        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.contains("pgtask_"));
    }
}
