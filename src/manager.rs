//! Process manager: tiered start protocol, skip propagation, auto-restart
//! with backoff, event fan-out and shutdown.
//!
//! All runner callbacks funnel through one unbounded channel drained by a
//! single driver task, so state transitions and listener fan-out happen in
//! one coordinator context. Locks are only ever held without awaiting.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::color;
use crate::config::ResolvedConfig;
use crate::deps;
use crate::error::Error;
use crate::events::{Event, Listener, RunnerEvent};
use crate::output::format_seconds;
use crate::process::{ProcessState, Status};
use crate::runner::{ProcessRunner, STOP_GRACE};

/// First auto-restart delay.
pub const BACKOFF_BASE_MS: u64 = 1_000;
/// Auto-restart delay cap.
pub const BACKOFF_MAX_MS: u64 = 30_000;
/// Uptime after which the backoff counter resets.
pub const BACKOFF_RESET_MS: u64 = 10_000;

/// Orchestrates all runners for one resolved config.
#[derive(Clone)]
pub struct ProcessManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ResolvedConfig,
    tiers: Vec<Vec<String>>,
    runners: HashMap<String, Arc<ProcessRunner>>,
    states: Mutex<HashMap<String, ProcessState>>,
    status_watch: HashMap<String, watch::Sender<Status>>,
    listeners: Mutex<Vec<Listener>>,
    stopping: AtomicBool,
    attempts: Mutex<HashMap<String, u32>>,
    pending_restarts: Mutex<HashMap<String, JoinHandle<()>>>,
    delay_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    started_at: Mutex<HashMap<String, Instant>>,
    size: Mutex<(u16, u16)>,
}

impl ProcessManager {
    /// Builds tiers and runners for `config`. Must be called inside a tokio
    /// runtime; the driver task starts immediately.
    pub fn new(config: ResolvedConfig) -> Result<Self, Error> {
        let tiers = deps::build_tiers(&config)?;
        let (events, inbox) = mpsc::unbounded_channel();

        let mut runners = HashMap::new();
        let mut states = HashMap::new();
        let mut status_watch = HashMap::new();
        for (name, process) in &config.processes {
            runners.insert(
                name.clone(),
                ProcessRunner::new(name.clone(), process.clone(), events.clone()),
            );
            states.insert(name.clone(), ProcessState::new(name.clone()));
            status_watch.insert(name.clone(), watch::channel(Status::Pending).0);
        }

        let shared = Arc::new(Shared {
            config,
            tiers,
            runners,
            states: Mutex::new(states),
            status_watch,
            listeners: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            attempts: Mutex::new(HashMap::new()),
            pending_restarts: Mutex::new(HashMap::new()),
            delay_timers: Mutex::new(HashMap::new()),
            started_at: Mutex::new(HashMap::new()),
            size: Mutex::new((80, 24)),
        });
        tokio::spawn(drive(Arc::clone(&shared), inbox));
        Ok(Self { shared })
    }

    /// Registers an event listener. Listeners run synchronously in the
    /// coordinator context and must not block.
    pub fn on(&self, listener: Listener) {
        self.shared.listeners.lock().unwrap().push(listener);
    }

    /// The resolved config this manager runs.
    pub fn config(&self) -> &ResolvedConfig {
        &self.shared.config
    }

    /// Computed start tiers.
    pub fn tiers(&self) -> &[Vec<String>] {
        &self.shared.tiers
    }

    /// Process names in tiered topological order.
    pub fn process_names(&self) -> Vec<String> {
        self.shared.tiers.iter().flatten().cloned().collect()
    }

    /// State snapshot of one process.
    pub fn get_state(&self, name: &str) -> Option<ProcessState> {
        self.shared.states.lock().unwrap().get(name).cloned()
    }

    /// State snapshots of every process, in tiered topological order.
    pub fn get_all_states(&self) -> Vec<ProcessState> {
        let names = self.process_names();
        let states = self.shared.states.lock().unwrap();
        names
            .iter()
            .filter_map(|name| states.get(name).cloned())
            .collect()
    }

    /// Whether any process ended in the `failed` state.
    pub fn any_failed(&self) -> bool {
        self.shared
            .states
            .lock()
            .unwrap()
            .values()
            .any(|state| state.status == Status::Failed)
    }

    /// Whether every process reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.shared
            .states
            .lock()
            .unwrap()
            .values()
            .all(|state| state.status.is_terminal())
    }

    /// Whether `stopAll` has been requested.
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Whether the run has quiesced: every process terminal, no pending
    /// restart or delay timers, and no child left alive (a process that
    /// missed its ready timeout stays `failed` while its child lingers).
    pub fn is_idle(&self) -> bool {
        self.all_terminal()
            && self.shared.pending_restarts.lock().unwrap().is_empty()
            && self.shared.delay_timers.lock().unwrap().is_empty()
            && self.shared.runners.values().all(|runner| !runner.has_child())
    }

    /// Starts every process, tier by tier.
    ///
    /// Within a tier processes run to readiness concurrently; a tier is
    /// drained when each member is ready or terminal, so a crashing process
    /// cannot stall its tier. Dependents of failed, skipped or stopped
    /// processes are skipped without being spawned, transitively.
    pub async fn start_all(&self, cols: u16, rows: u16) {
        let shared = &self.shared;
        *shared.size.lock().unwrap() = (cols, rows);
        for tier in &shared.tiers {
            if shared.stopping.load(Ordering::SeqCst) {
                break;
            }
            let mut waits = Vec::new();
            for name in tier {
                let process = &shared.config.processes[name];
                let blocked = {
                    let states = shared.states.lock().unwrap();
                    process.depends_on.iter().any(|dep| {
                        states.get(dep).is_some_and(|state| {
                            matches!(
                                state.status,
                                Status::Failed | Status::Skipped | Status::Stopped
                            )
                        })
                    })
                };
                if blocked || !condition_met(process.condition.as_deref()) {
                    shared.set_status(name, Status::Skipped);
                    continue;
                }
                let runner = Arc::clone(&shared.runners[name]);
                if let Some(delay) = process.delay {
                    let task_shared = Arc::clone(shared);
                    let process_name = name.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        task_shared.delay_timers.lock().unwrap().remove(&process_name);
                        if task_shared.stopping.load(Ordering::SeqCst) {
                            return;
                        }
                        runner.start(cols, rows).await;
                    });
                    if let Some(old) = shared
                        .delay_timers
                        .lock()
                        .unwrap()
                        .insert(name.clone(), handle)
                    {
                        old.abort();
                    }
                } else {
                    runner.start(cols, rows).await;
                }
                waits.push(shared.status_watch[name].subscribe());
            }
            for mut wait in waits {
                let _ = wait.wait_for(|status| status.is_settled()).await;
            }
        }
    }

    /// Starts one process; only valid from `stopped`, `finished` or
    /// `failed`. Cancels any pending auto-restart and resets its backoff.
    pub async fn start(&self, name: &str, cols: u16, rows: u16) {
        let shared = &self.shared;
        let Some(runner) = shared.runners.get(name) else {
            return;
        };
        let startable = {
            let states = shared.states.lock().unwrap();
            states.get(name).is_some_and(|state| {
                matches!(
                    state.status,
                    Status::Stopped | Status::Finished | Status::Failed
                )
            })
        };
        if !startable {
            return;
        }
        shared.cancel_pending_restart(name);
        shared.attempts.lock().unwrap().insert(name.to_string(), 0);
        *shared.size.lock().unwrap() = (cols, rows);
        runner.start(cols, rows).await;
    }

    /// Stops one process; only valid while starting, running or ready.
    pub async fn stop(&self, name: &str) {
        let shared = &self.shared;
        let Some(runner) = shared.runners.get(name) else {
            return;
        };
        let alive = {
            let states = shared.states.lock().unwrap();
            states.get(name).is_some_and(|state| {
                matches!(
                    state.status,
                    Status::Starting | Status::Running | Status::Ready
                )
            })
        };
        if !alive {
            return;
        }
        shared.cancel_pending_restart(name);
        runner.stop(STOP_GRACE).await;
    }

    /// Restarts one process; only valid from `stopped` or `failed`.
    pub async fn restart(&self, name: &str, cols: u16, rows: u16) {
        let shared = &self.shared;
        let Some(runner) = shared.runners.get(name) else {
            return;
        };
        let restartable = {
            let states = shared.states.lock().unwrap();
            states
                .get(name)
                .is_some_and(|state| matches!(state.status, Status::Stopped | Status::Failed))
        };
        if !restartable {
            return;
        }
        shared.cancel_pending_restart(name);
        shared.attempts.lock().unwrap().insert(name.to_string(), 0);
        *shared.size.lock().unwrap() = (cols, rows);
        runner.restart(cols, rows).await;
    }

    /// Restarts every currently alive process.
    pub async fn restart_all(&self, cols: u16, rows: u16) {
        let shared = &self.shared;
        *shared.size.lock().unwrap() = (cols, rows);
        let mut handles = Vec::new();
        for name in self.process_names() {
            let alive = {
                let states = shared.states.lock().unwrap();
                states
                    .get(&name)
                    .is_some_and(|state| state.status.is_alive())
            };
            if !alive {
                continue;
            }
            shared.cancel_pending_restart(&name);
            let runner = Arc::clone(&shared.runners[&name]);
            handles.push(tokio::spawn(async move {
                runner.restart(cols, rows).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Forwards new terminal dimensions to one process.
    pub fn resize(&self, name: &str, cols: u16, rows: u16) {
        if let Some(runner) = self.shared.runners.get(name) {
            runner.resize(cols, rows);
        }
    }

    /// Forwards new terminal dimensions to every process.
    pub fn resize_all(&self, cols: u16, rows: u16) {
        *self.shared.size.lock().unwrap() = (cols, rows);
        for runner in self.shared.runners.values() {
            runner.resize(cols, rows);
        }
    }

    /// Forwards input bytes; the runner enforces `interactive`.
    pub fn write(&self, name: &str, bytes: &[u8]) {
        if let Some(runner) = self.shared.runners.get(name) {
            runner.write(bytes);
        }
    }

    /// Stops everything: cancels pending restart and delay timers, then
    /// stops runners tier by tier in reverse order. When this returns, every
    /// process has a terminal status.
    pub async fn stop_all(&self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::SeqCst);
        for (_, handle) in shared.pending_restarts.lock().unwrap().drain() {
            handle.abort();
        }
        for (_, handle) in shared.delay_timers.lock().unwrap().drain() {
            handle.abort();
        }
        for tier in shared.tiers.iter().rev() {
            let mut handles = Vec::new();
            for name in tier {
                let runner = Arc::clone(&shared.runners[name]);
                handles.push(tokio::spawn(async move {
                    runner.stop(STOP_GRACE).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        // Processes that never spawned (pending, cancelled delays) settle
        // as stopped.
        let unfinished: Vec<String> = {
            let states = shared.states.lock().unwrap();
            states
                .values()
                .filter(|state| !state.status.is_terminal())
                .map(|state| state.name.clone())
                .collect()
        };
        for name in unfinished {
            shared.set_status(&name, Status::Stopped);
        }
    }
}

impl Shared {
    fn set_status(&self, name: &str, status: Status) {
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(name) {
                state.status = status;
            }
        }
        if let Some(tx) = self.status_watch.get(name) {
            let _ = tx.send(status);
        }
        self.emit(&Event::Status {
            name: name.to_string(),
            status,
        });
    }

    fn emit(&self, event: &Event) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            // A broken listener must not take down the others.
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(name = event.name(), "event listener panicked");
            }
        }
    }

    fn emit_notice(&self, name: &str, text: &str) {
        self.emit(&Event::Output {
            name: name.to_string(),
            bytes: format!("{text}\r\n").into_bytes(),
        });
    }

    fn cancel_pending_restart(&self, name: &str) {
        if let Some(handle) = self.pending_restarts.lock().unwrap().remove(name) {
            handle.abort();
        }
    }

    /// Plans an auto-restart for a persistent process that just failed.
    ///
    /// When a restart applies, the timer is registered and the restart
    /// counter bumped before the caller emits the exit to listeners, so an
    /// observer never sees a failed-and-settled state that is secretly about
    /// to restart. Returns the user-facing notice line, if any.
    fn plan_restart(self: &Arc<Self>, name: &str, code: Option<i32>) -> Option<String> {
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        // Spawn failures carry no exit code and are not restarted.
        let code = code?;
        if code == 0 {
            return None;
        }
        let config = self.config.processes.get(name)?;
        if !config.persistent {
            return None;
        }

        let uptime = self
            .started_at
            .lock()
            .unwrap()
            .get(name)
            .map(Instant::elapsed);
        let mut attempts = self.attempts.lock().unwrap();
        let mut attempt = attempts.get(name).copied().unwrap_or(0);
        if uptime.is_some_and(|up| up > Duration::from_millis(BACKOFF_RESET_MS)) {
            attempt = 0;
        }
        if let Some(max) = config.max_restarts {
            if attempt >= max {
                attempts.insert(name.to_string(), attempt);
                return Some(color::yellow(&format!(
                    "[numux] reached restart limit ({max}/{max}) — giving up"
                )));
            }
        }

        let delay = backoff_delay(attempt);
        let label = match config.max_restarts {
            Some(max) => format!("attempt {}/{}", attempt + 1, max),
            None => format!("attempt {}", attempt + 1),
        };
        attempts.insert(name.to_string(), attempt + 1);
        drop(attempts);
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(name) {
                state.restart_count += 1;
            }
        }

        let shared = Arc::clone(self);
        let process = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.pending_restarts.lock().unwrap().remove(&process);
            if shared.stopping.load(Ordering::SeqCst) {
                return;
            }
            if let Some(runner) = shared.runners.get(&process) {
                let (cols, rows) = *shared.size.lock().unwrap();
                runner.restart(cols, rows).await;
            }
        });
        if let Some(old) = self
            .pending_restarts
            .lock()
            .unwrap()
            .insert(name.to_string(), handle)
        {
            old.abort();
        }
        Some(color::yellow(&format!(
            "[numux] restarting in {}s ({label})",
            format_seconds(delay)
        )))
    }
}

/// Exponential backoff: `min(BASE * 2^attempt, MAX)`.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(31);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_MAX_MS))
}

/// A condition is falsy when the variable is unset, empty, `0` or `false`
/// (case-insensitive); a leading `!` inverts the decision.
fn condition_met(condition: Option<&str>) -> bool {
    let Some(condition) = condition else {
        return true;
    };
    let (negate, variable) = match condition.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, condition),
    };
    let truthy = std::env::var(variable)
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(false);
    truthy != negate
}

async fn drive(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<RunnerEvent>) {
    while let Some(event) = inbox.recv().await {
        match event {
            RunnerEvent::Status { name, status } => {
                if status == Status::Starting {
                    shared
                        .started_at
                        .lock()
                        .unwrap()
                        .insert(name.clone(), Instant::now());
                }
                shared.set_status(&name, status);
            }
            RunnerEvent::Output { name, bytes } => {
                shared.emit(&Event::Output { name, bytes });
            }
            // Readiness itself is surfaced through the status transition.
            RunnerEvent::Ready { .. } => {}
            RunnerEvent::Error { name } => {
                shared.emit(&Event::Error { name });
            }
            RunnerEvent::Exit { name, code, status } => {
                {
                    let mut states = shared.states.lock().unwrap();
                    if let Some(state) = states.get_mut(&name) {
                        state.exit_code = code;
                    }
                }
                let notice = if status == Status::Failed {
                    shared.plan_restart(&name, code)
                } else {
                    None
                };
                shared.set_status(&name, status);
                shared.emit(&Event::Exit {
                    name: name.clone(),
                    code,
                });
                if let Some(text) = notice {
                    shared.emit_notice(&name, &text);
                }
            }
        }
    }
}
