//! Event stream surfaced by the process manager.
//!
//! Every event carries the process name; listeners are invoked synchronously
//! in the manager's coordinator context and must not block.

use std::collections::HashMap;

use crate::process::Status;

/// An event emitted by the manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A status transition.
    Status { name: String, status: Status },
    /// Raw PTY output bytes, ANSI escapes included.
    Output { name: String, bytes: Vec<u8> },
    /// The child exited; `None` means it never spawned.
    Exit { name: String, code: Option<i32> },
    /// The error-output checker fired.
    Error { name: String },
}

impl Event {
    /// The process this event belongs to.
    pub fn name(&self) -> &str {
        match self {
            Event::Status { name, .. }
            | Event::Output { name, .. }
            | Event::Exit { name, .. }
            | Event::Error { name } => name,
        }
    }
}

/// A registered event listener.
pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Internal events flowing from runners to the manager's driver task.
#[derive(Debug)]
pub(crate) enum RunnerEvent {
    Status {
        name: String,
        status: Status,
    },
    Output {
        name: String,
        bytes: Vec<u8>,
    },
    /// The child exited (or failed to spawn); carries the final status the
    /// runner settled on, so the driver can schedule an auto-restart before
    /// either event reaches listeners.
    Exit {
        name: String,
        code: Option<i32>,
        status: Status,
    },
    /// Readiness reached; carries captures for compiled patterns.
    Ready {
        name: String,
        captures: HashMap<String, String>,
    },
    Error {
        name: String,
    },
}
