//! High-level recording helpers over the raw Prometheus statics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) ran,
//! so library users that never export metrics pay nothing.

use super::prometheus::{
    ACTIVE_WORKERS, SCHEDULER_TICKS, SCHEDULES_DISPATCHED, TASKS_ENQUEUED, TASKS_EXPIRED,
    TASKS_IN_PROGRESS, TASKS_PROCESSED, TASKS_PURGED, TASK_DURATION, UNREGISTERED_ACTOR,
};

/// How a worker finished with a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Retried,
    Rejected,
    Released,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retried => "retried",
            Self::Rejected => "rejected",
            Self::Released => "released",
        }
    }
}

/// Where an unregistered actor was noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisteredSite {
    Claim,
    Dispatch,
}

impl UnregisteredSite {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Dispatch => "dispatch",
        }
    }
}

/// Metrics collector for recording pgtask operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_enqueued(&self, queue: &str, actor: &str) {
        if let Some(counter) = TASKS_ENQUEUED.get() {
            counter.with_label_values(&[queue, actor]).inc();
        }
    }

    /// Record a handled task and how long the actor ran.
    pub fn record_processed(
        &self,
        queue: &str,
        actor: &str,
        outcome: TaskOutcome,
        duration_secs: f64,
    ) {
        if let Some(counter) = TASKS_PROCESSED.get() {
            counter
                .with_label_values(&[queue, actor, outcome.as_str()])
                .inc();
        }

        if let Some(histogram) = TASK_DURATION.get() {
            histogram.with_label_values(&[actor]).observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            actor = actor,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    pub fn task_started(&self) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn task_finished(&self) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Record a scheduler tick; `dispatched` is `None` when not leader.
    pub fn record_scheduler_tick(&self, dispatched: Option<usize>) {
        if let Some(counter) = SCHEDULER_TICKS.get() {
            let outcome = if dispatched.is_some() {
                "leader"
            } else {
                "not_leader"
            };
            counter.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_scheduler_error(&self) {
        if let Some(counter) = SCHEDULER_TICKS.get() {
            counter.with_label_values(&["error"]).inc();
        }
    }

    pub fn record_dispatched(&self, actor: &str) {
        if let Some(counter) = SCHEDULES_DISPATCHED.get() {
            counter.with_label_values(&[actor]).inc();
        }
    }

    pub fn record_unregistered_actor(&self, site: UnregisteredSite) {
        if let Some(counter) = UNREGISTERED_ACTOR.get() {
            counter.with_label_values(&[site.as_str()]).inc();
        }
    }

    pub fn record_housekeeping(&self, purged: u64, expired: u64) {
        if let Some(counter) = TASKS_PURGED.get() {
            counter.inc_by(purged);
        }
        if let Some(counter) = TASKS_EXPIRED.get() {
            counter.inc_by(expired);
        }
    }

    pub fn set_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_recording_before_init_is_noop() {
        // Must not panic whether or not another test initialized metrics.
        let collector = MetricsCollector::new();
        collector.record_enqueued("default", "echo");
        collector.record_processed("default", "echo", TaskOutcome::Done, 0.1);
    }

    #[test]
    fn test_record_processed_increments_counter() {
        init_metrics().expect("init");
        let collector = MetricsCollector::new();
        let counter = TASKS_PROCESSED.get().expect("registered");
        let before = counter
            .with_label_values(&["q-test", "a-test", "retried"])
            .get();

        collector.record_processed("q-test", "a-test", TaskOutcome::Retried, 1.5);

        let after = counter
            .with_label_values(&["q-test", "a-test", "retried"])
            .get();
        assert!((after - before - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_in_progress_gauge() {
        init_metrics().expect("init");
        let collector = MetricsCollector::new();
        let gauge = TASKS_IN_PROGRESS.get().expect("registered");
        let before = gauge.get();

        collector.task_started();
        collector.task_finished();

        assert!((gauge.get() - before).abs() < f64::EPSILON);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(TaskOutcome::Done.as_str(), "done");
        assert_eq!(TaskOutcome::Released.as_str(), "released");
        assert_eq!(UnregisteredSite::Dispatch.as_str(), "dispatch");
    }
}
