//! Process lifecycle status and per-process state.

use serde::Serialize;

/// Lifecycle status of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not started yet.
    Pending,
    /// Spawned, readiness not decided.
    Starting,
    /// Spawned with a readiness pattern, waiting for it to match.
    Running,
    /// Readiness criterion satisfied.
    Ready,
    /// A graceful stop is in flight.
    Stopping,
    /// Exited after a stop request.
    Stopped,
    /// One-shot exited cleanly.
    Finished,
    /// Exited with a failure, failed to spawn, or missed its ready timeout.
    Failed,
    /// Never spawned: dependency failed/skipped or condition was falsy.
    Skipped,
}

impl Status {
    /// Terminal statuses are never left again (except through an explicit
    /// `start`/`restart` call).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Stopped | Status::Finished | Status::Failed | Status::Skipped
        )
    }

    /// Ready-or-terminal: the condition tier waits resolve on.
    pub fn is_settled(&self) -> bool {
        matches!(self, Status::Ready) || self.is_terminal()
    }

    /// Whether a child process may currently exist.
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            Status::Starting | Status::Running | Status::Ready | Status::Stopping
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Pending => "pending",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Finished => "finished",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        };
        f.write_str(text)
    }
}

/// Manager-owned state of one process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    /// Process name.
    pub name: String,
    /// Current status.
    pub status: Status,
    /// Exit code of the last run; `None` before the first exit or after a
    /// spawn failure.
    pub exit_code: Option<i32>,
    /// Number of restarts scheduled for this process, monotonically
    /// non-decreasing within one manager instance.
    pub restart_count: u32,
}

impl ProcessState {
    pub fn new(name: String) -> Self {
        Self {
            name,
            status: Status::Pending,
            exit_code: None,
            restart_count: 0,
        }
    }
}
