//! The supervisor: N worker processes, their output, and their shutdown.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;

use super::log_watcher::{LogSource, LogWatcher, Pipe};
use super::pidfile::PidFile;
use super::process::{is_ready_line, TerminationSignals, WORKER_PROCESS_COMMAND};
use super::state::{exit_code, Lifecycle, SignalAction};
use super::watcher::FileWatcher;

const MIN_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);
/// Extra time on top of the workers' own shutdown timeout.
const STOP_GRACE: Duration = Duration::from_secs(10);
const REAP_INTERVAL: Duration = Duration::from_millis(250);
const WATCH_INTERVAL: Duration = Duration::from_secs(1);
const LOG_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub processes: usize,
    /// Binary re-executed for each worker, normally the current executable.
    pub program: PathBuf,
    /// Arguments appended after `worker-process --worker-index N`.
    pub worker_args: Vec<String>,
    pub ready_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub pid_file: Option<PathBuf>,
    pub watch: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(processes: usize, program: impl Into<PathBuf>) -> Self {
        Self {
            processes,
            program: program.into(),
            worker_args: Vec::new(),
            ready_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            pid_file: None,
            watch: None,
        }
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_file = path;
        self
    }

    pub fn with_watch(mut self, dir: Option<PathBuf>) -> Self {
        self.watch = dir;
        self
    }
}

/// Doubling restart delay, reset once a worker stayed up long enough.
pub fn next_backoff(current: Duration, uptime: Duration) -> Duration {
    if uptime >= MAX_RESTART_BACKOFF {
        return MIN_RESTART_BACKOFF;
    }
    current.saturating_mul(2).clamp(MIN_RESTART_BACKOFF, MAX_RESTART_BACKOFF)
}

struct WorkerSlot {
    index: usize,
    child: Option<Child>,
    pid: Option<i32>,
    started_at: Instant,
    backoff: Duration,
    restart_at: Option<Instant>,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            child: None,
            pid: None,
            started_at: Instant::now(),
            backoff: Duration::ZERO,
            restart_at: None,
        }
    }
}

fn emit(source: LogSource, line: &str) {
    match source.pipe {
        Pipe::Stdout => {
            let _ = writeln!(std::io::stdout().lock(), "[{}] {}", source, line);
        }
        Pipe::Stderr => {
            let _ = writeln!(std::io::stderr().lock(), "[{}] {}", source, line);
        }
    }
}

/// Sends `signal` to a worker's process group.
fn send_signal(pid: i32, signal: libc::c_int) {
    // Workers lead their own group, so this also reaches their children.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid = pid, signal = signal, error = %err, "Failed to signal worker");
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    slots: Vec<WorkerSlot>,
    logs: LogWatcher,
    lifecycle: Lifecycle,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let slots = (0..config.processes).map(WorkerSlot::new).collect();
        Self {
            config,
            slots,
            logs: LogWatcher::new(),
            lifecycle: Lifecycle::Starting,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Runs until every worker stopped and returns the exit code.
    pub async fn run(self) -> Result<i32, SupervisorError> {
        let signals = TerminationSignals::install().map_err(SupervisorError::Signal)?;
        self.run_with_signals(signals).await
    }

    /// [`Supervisor::run`] driven by an existing signal source.
    pub async fn run_with_signals(
        mut self,
        mut signals: TerminationSignals,
    ) -> Result<i32, SupervisorError> {
        let _pid_file = match &self.config.pid_file {
            Some(path) => Some(PidFile::acquire(path)?),
            None => None,
        };

        info!(
            processes = self.config.processes,
            program = %self.config.program.display(),
            "Starting worker processes"
        );
        for index in 0..self.slots.len() {
            if let Err(e) = self.start_worker(index).await {
                error!(worker = index, error = %e, "Worker failed to start");
                self.lifecycle.advance(Lifecycle::Stopping);
                self.stop_all(self.config.shutdown_timeout + STOP_GRACE).await;
                return match e {
                    SupervisorError::NotReady {
                        code: Some(code), ..
                    } if exit_code::is_startup_failure(code) => Ok(code),
                    other => Err(other),
                };
            }
        }
        self.lifecycle.advance(Lifecycle::Running);
        info!(processes = self.slots.len(), "All workers ready");

        let mut watcher = self.config.watch.clone().map(FileWatcher::new);
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        let mut watch_tick = tokio::time::interval(WATCH_INTERVAL);
        let mut stop_deadline: Option<Instant> = None;

        while !self.lifecycle.is_terminal() {
            tokio::select! {
                name = signals.recv() => {
                    let (next, action) = self.lifecycle.on_signal();
                    self.lifecycle = next;
                    match action {
                        SignalAction::GracefulStop => {
                            info!(signal = name, "Stopping workers gracefully");
                            self.signal_all(libc::SIGTERM);
                            stop_deadline =
                                Some(Instant::now() + self.config.shutdown_timeout + STOP_GRACE);
                        }
                        SignalAction::Kill => {
                            warn!(signal = name, "Second termination signal, exiting now");
                            self.signal_all(libc::SIGTERM);
                        }
                        SignalAction::Ignore => {}
                    }
                }
                batch = self.logs.next_batch(LOG_WAIT) => {
                    for (source, line) in batch {
                        emit(source, &line);
                    }
                }
                _ = reap.tick() => {
                    if let Some(code) = self.reap().await? {
                        return Ok(code);
                    }
                    if self.lifecycle == Lifecycle::Stopping {
                        if self.all_exited() {
                            self.lifecycle.advance(Lifecycle::Stopped);
                            self.drain_logs().await;
                            info!("All workers stopped");
                        } else if stop_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                            warn!("Workers did not stop in time, killing them");
                            self.signal_all(libc::SIGKILL);
                            self.lifecycle.advance(Lifecycle::Killed);
                        }
                    }
                }
                _ = watch_tick.tick(), if watcher.is_some() && self.lifecycle == Lifecycle::Running => {
                    let changed = watcher.as_mut().map(FileWatcher::poll).unwrap_or_default();
                    if !changed.is_empty() {
                        info!(
                            files = changed.len(),
                            first = %changed[0].display(),
                            "Files changed, restarting workers"
                        );
                        if let Some(code) = self.restart_all().await? {
                            return Ok(code);
                        }
                    }
                }
            }
        }
        Ok(self.lifecycle.exit_code())
    }

    /// Spawns worker `index` and waits for its readiness line.
    async fn start_worker(&mut self, index: usize) -> Result<(), SupervisorError> {
        let mut child = Command::new(&self.config.program)
            .arg(WORKER_PROCESS_COMMAND)
            .arg("--worker-index")
            .arg(index.to_string())
            .args(&self.config.worker_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                worker: index,
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            self.logs.watch(
                LogSource {
                    worker: index,
                    pipe: Pipe::Stderr,
                },
                stderr,
            );
        }

        let stdout = self.await_ready(index, &mut child).await?;
        self.logs.watch(
            LogSource {
                worker: index,
                pipe: Pipe::Stdout,
            },
            stdout,
        );

        let pid = child.id().map(|pid| pid as i32);
        debug!(worker = index, pid = ?pid, "Worker ready");
        let slot = &mut self.slots[index];
        slot.child = Some(child);
        slot.pid = pid;
        slot.started_at = Instant::now();
        slot.restart_at = None;
        Ok(())
    }

    /// Forwards output until the readiness line, returning the rest of stdout.
    async fn await_ready(
        &self,
        index: usize,
        child: &mut Child,
    ) -> Result<BufReader<ChildStdout>, SupervisorError> {
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::Spawn {
            worker: index,
            source: std::io::Error::other("stdout not captured"),
        })?;
        let mut reader = BufReader::new(stdout);
        let deadline = Instant::now() + self.config.ready_timeout;
        let source = LogSource {
            worker: index,
            pipe: Pipe::Stdout,
        };

        loop {
            let mut line = Vec::new();
            match tokio::time::timeout_at(deadline, reader.read_until(b'\n', &mut line)).await {
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(SupervisorError::ReadyTimeout {
                        worker: index,
                        timeout: self.config.ready_timeout,
                    });
                }
                Ok(Ok(0)) => {
                    let status = child.wait().await?;
                    return Err(SupervisorError::NotReady {
                        worker: index,
                        code: status.code(),
                    });
                }
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&line);
                    if is_ready_line(&line) {
                        return Ok(reader);
                    }
                    emit(source, line.trim_end());
                }
                Ok(Err(e)) => return Err(SupervisorError::Io(e)),
            }
        }
    }

    fn signal_all(&self, signal: libc::c_int) {
        for slot in &self.slots {
            if let (Some(pid), Some(_)) = (slot.pid, &slot.child) {
                send_signal(pid, signal);
            }
        }
    }

    fn all_exited(&self) -> bool {
        self.slots.iter().all(|slot| slot.child.is_none())
    }

    /// Collects exited workers and restarts those due.
    ///
    /// Returns an exit code when a startup failure ends the supervisor.
    async fn reap(&mut self) -> Result<Option<i32>, SupervisorError> {
        for i in 0..self.slots.len() {
            let status = match self.slots[i].child.as_mut() {
                Some(child) => child.try_wait()?,
                None => None,
            };
            let Some(status) = status else {
                continue;
            };

            let slot = &mut self.slots[i];
            slot.child = None;
            slot.pid = None;
            let code = status.code();

            if self.lifecycle != Lifecycle::Running {
                info!(worker = slot.index, code = ?code, "Worker exited");
                continue;
            }

            if let Some(code) = code.filter(|c| exit_code::is_startup_failure(*c)) {
                error!(worker = slot.index, code = code, "Worker failed at startup, stopping");
                self.lifecycle.advance(Lifecycle::Stopping);
                self.stop_all(self.config.shutdown_timeout + STOP_GRACE).await;
                return Ok(Some(code));
            }

            slot.backoff = next_backoff(slot.backoff, slot.started_at.elapsed());
            slot.restart_at = Some(Instant::now() + slot.backoff);
            warn!(
                worker = slot.index,
                status = %status,
                restart_in_secs = slot.backoff.as_secs(),
                "Worker exited unexpectedly"
            );
        }

        if self.lifecycle != Lifecycle::Running {
            return Ok(None);
        }

        let now = Instant::now();
        for i in 0..self.slots.len() {
            if !self.slots[i].restart_at.is_some_and(|at| at <= now) {
                continue;
            }
            match self.start_worker(i).await {
                Ok(()) => info!(worker = i, "Worker restarted"),
                Err(SupervisorError::NotReady {
                    code: Some(code), ..
                }) if exit_code::is_startup_failure(code) => {
                    error!(worker = i, code = code, "Restarted worker failed at startup, stopping");
                    self.lifecycle.advance(Lifecycle::Stopping);
                    self.stop_all(self.config.shutdown_timeout + STOP_GRACE).await;
                    return Ok(Some(code));
                }
                Err(e) => {
                    let slot = &mut self.slots[i];
                    slot.backoff = next_backoff(slot.backoff, Duration::ZERO);
                    slot.restart_at = Some(Instant::now() + slot.backoff);
                    warn!(worker = i, error = %e, "Worker restart failed");
                }
            }
        }
        Ok(None)
    }

    /// Gracefully stops every worker, then starts them again.
    async fn restart_all(&mut self) -> Result<Option<i32>, SupervisorError> {
        self.stop_all(self.config.shutdown_timeout + STOP_GRACE).await;
        for index in 0..self.slots.len() {
            self.slots[index].backoff = Duration::ZERO;
            if let Err(e) = self.start_worker(index).await {
                error!(worker = index, error = %e, "Worker failed to restart");
                if let SupervisorError::NotReady {
                    code: Some(code), ..
                } = e
                {
                    if exit_code::is_startup_failure(code) {
                        self.lifecycle.advance(Lifecycle::Stopping);
                        self.stop_all(self.config.shutdown_timeout + STOP_GRACE).await;
                        return Ok(Some(code));
                    }
                }
                let slot = &mut self.slots[index];
                slot.backoff = MIN_RESTART_BACKOFF;
                slot.restart_at = Some(Instant::now() + slot.backoff);
            }
        }
        Ok(None)
    }

    /// Sends SIGTERM and waits up to `timeout` before killing stragglers.
    async fn stop_all(&mut self, timeout: Duration) {
        self.signal_all(libc::SIGTERM);
        let deadline = Instant::now() + timeout;

        loop {
            for slot in self.slots.iter_mut() {
                if let Some(child) = slot.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        debug!(worker = slot.index, status = %status, "Worker exited");
                        slot.child = None;
                        slot.pid = None;
                    }
                }
            }
            if self.all_exited() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Workers did not stop in time, killing them");
                for slot in self.slots.iter_mut() {
                    if let Some(mut child) = slot.child.take() {
                        let _ = child.kill().await;
                    }
                    slot.pid = None;
                }
                break;
            }

            let batch = self.logs.next_batch(REAP_INTERVAL).await;
            for (source, line) in batch {
                emit(source, &line);
            }
        }
    }

    /// Prints what is left in the pipes of exited workers.
    async fn drain_logs(&mut self) {
        for _ in 0..20 {
            if self.logs.is_empty() {
                break;
            }
            let batch = self.logs.next_batch(Duration::from_millis(50)).await;
            for (source, line) in batch {
                emit(source, &line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff, Duration::from_secs(1));
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_resets_after_long_uptime() {
        let backoff = next_backoff(Duration::from_secs(32), Duration::from_secs(300));
        assert_eq!(backoff, MIN_RESTART_BACKOFF);
    }

    #[test]
    fn test_config_builder() {
        let config = SupervisorConfig::new(3, "/usr/bin/pgtask")
            .with_worker_args(vec!["--threads".into(), "4".into()])
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_pid_file(Some(PathBuf::from("/tmp/pgtask.pid")))
            .with_watch(None);
        assert_eq!(config.processes, 3);
        assert_eq!(config.worker_args, vec!["--threads", "4"]);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.pid_file.is_some());

        let supervisor = Supervisor::new(config);
        assert_eq!(supervisor.slots.len(), 3);
        assert_eq!(supervisor.lifecycle(), Lifecycle::Starting);
        assert!(supervisor.all_exited());
    }

    #[tokio::test]
    async fn test_worker_that_exits_early_is_not_ready() {
        // `false` exits 1 without printing a readiness line.
        let mut supervisor = Supervisor::new(SupervisorConfig::new(1, "false"));
        let err = supervisor.start_worker(0).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { worker: 0, code: Some(1) }));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let mut supervisor = Supervisor::new(SupervisorConfig::new(1, "/nonexistent/pgtask"));
        let err = supervisor.start_worker(0).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { worker: 0, .. }));
    }

    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    #[tokio::test]
    async fn test_startup_failure_code_ends_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = script(dir.path(), "echo connecting\nexit 3");

        let supervisor = Supervisor::new(SupervisorConfig::new(2, program));
        let code = supervisor.run().await.expect("run");
        assert_eq!(code, exit_code::CONNECT);
    }

    #[tokio::test]
    async fn test_ready_worker_is_stopped_with_sigterm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = script(
            dir.path(),
            "echo \"pgtask-worker-ready worker=0 pid=$$\"\nexec sleep 30",
        );

        let mut supervisor = Supervisor::new(SupervisorConfig::new(1, program));
        supervisor.start_worker(0).await.expect("start");
        assert!(!supervisor.all_exited());
        assert!(supervisor.slots[0].pid.is_some());

        supervisor.stop_all(Duration::from_secs(5)).await;
        assert!(supervisor.all_exited());
    }

    #[tokio::test]
    async fn test_single_signal_stops_gracefully() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = script(
            dir.path(),
            "echo \"pgtask-worker-ready worker=0 pid=$$\"\nexec sleep 30",
        );
        let (tx, signals) = TerminationSignals::channel();
        tx.send("SIGTERM").expect("send");

        let supervisor = Supervisor::new(SupervisorConfig::new(1, program));
        let code = tokio::time::timeout(
            Duration::from_secs(20),
            supervisor.run_with_signals(signals),
        )
        .await
        .expect("supervisor should stop")
        .expect("run");
        assert_eq!(code, exit_code::OK);
    }

    #[tokio::test]
    async fn test_second_signal_exits_killed() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The worker ignores SIGTERM, so the graceful stop never completes.
        let program = script(
            dir.path(),
            "trap '' TERM\necho \"pgtask-worker-ready worker=0 pid=$$\"\nexec sleep 30",
        );
        let (tx, signals) = TerminationSignals::channel();
        tx.send("SIGTERM").expect("send");
        tx.send("SIGTERM").expect("send");

        let supervisor = Supervisor::new(SupervisorConfig::new(1, program));
        let code = tokio::time::timeout(
            Duration::from_secs(20),
            supervisor.run_with_signals(signals),
        )
        .await
        .expect("supervisor should exit")
        .expect("run");
        assert_eq!(code, exit_code::KILLED);
    }
}
