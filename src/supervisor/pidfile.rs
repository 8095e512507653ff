//! PID file guarding against two supervisors on one host.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::SupervisorError;

/// Whether a process with this pid exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A PID file owned by this process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
}

impl PidFile {
    /// Writes our pid to `path`.
    ///
    /// Fails if the file names a live process. A file left behind by a dead
    /// process is overwritten.
    pub fn acquire(path: &Path) -> Result<Self, SupervisorError> {
        if let Some(pid) = read_pid(path)? {
            if process_alive(pid) {
                return Err(SupervisorError::PidFileHeld {
                    path: path.display().to_string(),
                    pid,
                });
            }
            warn!(path = %path.display(), pid = pid, "Removing stale PID file");
        }

        let pid = std::process::id() as i32;
        fs::write(path, format!("{}\n", pid)).map_err(|e| {
            SupervisorError::PidFile(format!("cannot write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), pid = pid, "PID file written");

        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Leave the file alone if someone else has taken it over.
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
                }
            }
            _ => {}
        }
    }
}

/// Pid stored in `path`, if the file exists and holds one.
fn read_pid(path: &Path) -> Result<Option<i32>, SupervisorError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SupervisorError::PidFile(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(contents.trim().parse::<i32>().ok())
}
