//! Periodic maintenance run by every worker process.
//!
//! Deletes finished tasks past their expiration, expires tasks nobody ever
//! claimed, and refreshes the process's metrics textfile.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::metrics::{write_textfile, MetricsCollector};
use crate::storage::{DatabaseError, TaskState, TaskStore};

const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Counts from one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub purged: u64,
    pub expired: u64,
}

pub struct Housekeeper {
    tasks: TaskStore,
    purge_interval: Duration,
    expiration: Duration,
    metrics_dir: Option<PathBuf>,
    metrics_name: String,
    metrics: MetricsCollector,
}

impl Housekeeper {
    pub fn new(tasks: TaskStore, settings: &Settings, metrics_name: impl Into<String>) -> Self {
        Self {
            tasks,
            purge_interval: settings.task_purge_interval,
            expiration: settings.task_expiration,
            metrics_dir: settings.metrics_dir.clone(),
            metrics_name: metrics_name.into(),
            metrics: MetricsCollector::new(),
        }
    }

    /// One pass: purge finished rows, then expire orphaned queued rows.
    pub async fn run_once(&self) -> Result<HousekeepingReport, DatabaseError> {
        let purged = self
            .tasks
            .purge(self.expiration, &[TaskState::Done, TaskState::Rejected])
            .await?;
        let expired = self.tasks.expire_orphans(self.expiration).await?;
        self.metrics.record_housekeeping(purged, expired);

        if purged > 0 || expired > 0 {
            info!(purged = purged, expired = expired, "Housekeeping pass complete");
        }
        Ok(HousekeepingReport { purged, expired })
    }

    fn export_metrics(&self) {
        let Some(dir) = &self.metrics_dir else {
            return;
        };
        match write_textfile(dir, &self.metrics_name) {
            Ok(path) => debug!(path = %path.display(), "Metrics exported"),
            Err(e) => error!(dir = %dir.display(), error = %e, "Failed to export metrics"),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut purge = tokio::time::interval(self.purge_interval);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut export = tokio::time::interval(METRICS_EXPORT_INTERVAL);
        export.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = purge.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Housekeeping pass failed");
                    }
                }
                _ = export.tick() => self.export_metrics(),
            }
        }

        self.export_metrics();
        debug!("Housekeeping stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;
    use sqlx::postgres::PgPoolOptions;

    fn housekeeper(metrics_dir: Option<PathBuf>) -> Housekeeper {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/pgtask_unused")
            .expect("lazy pool");
        let mut settings = Settings::default();
        settings.metrics_dir = metrics_dir;
        Housekeeper::new(TaskStore::new(pool), &settings, "worker-3")
    }

    #[tokio::test]
    async fn test_export_metrics_writes_file() {
        init_metrics().expect("init");
        let dir = tempfile::tempdir().expect("tempdir");
        let keeper = housekeeper(Some(dir.path().to_path_buf()));

        keeper.export_metrics();

        assert!(dir.path().join("worker-3.prom").exists());
    }

    #[tokio::test]
    async fn test_export_without_dir_is_noop() {
        let keeper = housekeeper(None);
        keeper.export_metrics();
        assert_eq!(keeper.expiration, Settings::default().task_expiration);
    }
}
