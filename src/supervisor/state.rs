//! Process lifecycle and exit codes.
//!
//! ```text
//! Starting → Running → Stopping → Stopped
//!                         ↓
//!                       Killed   (second termination signal)
//! ```

use std::fmt;

use tracing::warn;

/// Exit codes shared by the supervisor and worker processes.
pub mod exit_code {
    pub const OK: i32 = 0;
    /// A second termination signal arrived during graceful shutdown.
    pub const KILLED: i32 = 1;
    /// The actor registry could not be built or validated.
    pub const REGISTRY: i32 = 2;
    /// The database was unreachable at startup.
    pub const CONNECT: i32 = 3;
    pub const PID_FILE: i32 = 4;

    /// Codes a restart cannot fix.
    pub fn is_startup_failure(code: i32) -> bool {
        code == REGISTRY || code == CONNECT
    }
}

/// What to do in response to a termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop claiming, let in-flight work finish.
    GracefulStop,
    /// Exit now.
    Kill,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
    Killed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Killed)
    }

    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Stopping)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopping, Self::Killed)
        )
    }

    /// Moves to `target` when the diagram allows it; otherwise stays put.
    pub fn advance(&mut self, target: Self) -> bool {
        if !self.can_transition_to(target) {
            warn!(from = %self, to = %target, "Ignoring invalid lifecycle transition");
            return false;
        }
        *self = target;
        true
    }

    /// Next state and action after a termination signal.
    pub fn on_signal(self) -> (Self, SignalAction) {
        match self {
            Self::Starting | Self::Running => (Self::Stopping, SignalAction::GracefulStop),
            Self::Stopping => (Self::Killed, SignalAction::Kill),
            Self::Stopped | Self::Killed => (self, SignalAction::Ignore),
        }
    }

    /// Exit code for a process that ended in this state.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Killed => exit_code::KILLED,
            _ => exit_code::OK,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
        };
        f.write_str(label)
    }
}
