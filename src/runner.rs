//! Per-process supervision: spawn, readiness, stop, restart.
//!
//! A runner owns exactly one child at a time. Every spawn bumps a generation
//! counter; callbacks from older children (late PTY reads, late exits,
//! stale ready timers) are discarded by comparing generations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::color;
use crate::config::ProcessConfig;
use crate::envfile;
use crate::events::RunnerEvent;
use crate::output::format_seconds;
use crate::process::Status;
use crate::pty;
use crate::ready::{ErrorChecker, ReadinessChecker};

/// Grace period for a plain `stop` before escalating to SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// Grace period used while restarting.
pub const RESTART_GRACE: Duration = Duration::from_secs(2);
/// How long an exit report waits for trailing PTY output to settle.
const OUTPUT_SETTLE: Duration = Duration::from_millis(200);

/// Supervisor for a single process.
pub struct ProcessRunner {
    name: String,
    config: ProcessConfig,
    events: mpsc::UnboundedSender<RunnerEvent>,
    inner: Mutex<RunnerInner>,
    // Counts observed exits; `stop` waits on it instead of polling.
    exit_counter: watch::Sender<u64>,
}

struct RunnerInner {
    generation: u64,
    child: Option<pty::PtyChild>,
    stopping: bool,
    restarting: bool,
    ready_timed_out: bool,
    ready: bool,
    readiness: ReadinessChecker,
    errors: Option<ErrorChecker>,
    ready_timer: Option<JoinHandle<()>>,
}

impl ProcessRunner {
    pub(crate) fn new(
        name: String,
        config: ProcessConfig,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Arc<Self> {
        let readiness = ReadinessChecker::new(config.persistent, config.ready_pattern.clone());
        Arc::new(Self {
            name,
            events,
            inner: Mutex::new(RunnerInner {
                generation: 0,
                child: None,
                stopping: false,
                restarting: false,
                ready_timed_out: false,
                ready: false,
                readiness,
                errors: None,
                ready_timer: None,
            }),
            exit_counter: watch::channel(0).0,
            config,
        })
    }

    /// The process this runner supervises.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the configured command under a fresh PTY.
    pub async fn start(self: &Arc<Self>, cols: u16, rows: u16) {
        self.start_with(cols, rows, None, None).await;
    }

    /// Spawns with optional command/env overrides (used by reload flows).
    pub async fn start_with(
        self: &Arc<Self>,
        cols: u16,
        rows: u16,
        command_override: Option<&str>,
        extra_env: Option<&HashMap<String, String>>,
    ) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if inner.child.is_some() {
                return;
            }
            inner.generation += 1;
            inner.stopping = false;
            inner.restarting = false;
            inner.ready = false;
            inner.ready_timed_out = false;
            inner.readiness =
                ReadinessChecker::new(self.config.persistent, self.config.ready_pattern.clone());
            inner.errors = self.config.error_matcher.clone().map(ErrorChecker::new);
            if let Some(timer) = inner.ready_timer.take() {
                timer.abort();
            }
            inner.generation
        };
        self.emit_status(Status::Starting);

        let command = command_override.unwrap_or(&self.config.command).to_string();

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert("TERM".into(), "xterm-256color".into());
        if std::env::var_os("NO_COLOR").is_none() {
            env.insert("FORCE_COLOR".into(), "1".into());
        }
        for path in &self.config.env_files {
            match envfile::load_env_file(path) {
                Ok(vars) => env.extend(vars),
                Err(err) => {
                    self.fail_spawn(&err.to_string());
                    return;
                }
            }
        }
        env.extend(self.config.env.clone());
        if let Some(extra) = extra_env {
            env.extend(extra.clone());
        }

        let spawned =
            match pty::spawn_shell(&command, self.config.cwd.as_deref(), &env, cols, rows) {
                Ok(spawned) => spawned,
                Err(err) => {
                    self.fail_spawn(&format!("{err:#}"));
                    return;
                }
            };

        if self.config.show_command {
            self.emit_line(&color::dim(&format!("$ {command}")));
        }
        if self.pattern_active() {
            self.emit_status(Status::Running);
        }

        let immediately_ready = {
            let mut inner = self.inner.lock().unwrap();
            inner.child = Some(spawned.handle);
            if self.pattern_active() {
                if let Some(timeout) = self.config.ready_timeout {
                    let runner = Arc::clone(self);
                    inner.ready_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        runner.on_ready_timeout(generation, timeout);
                    }));
                }
            }
            inner.readiness.is_immediately_ready()
        };
        if immediately_ready {
            self.mark_ready(generation);
        }

        let runner = Arc::clone(self);
        let mut output = spawned.output;
        let mut drain = tokio::spawn(async move {
            while let Some(bytes) = output.recv().await {
                runner.on_output(generation, bytes);
            }
        });

        let runner = Arc::clone(self);
        let mut child = spawned.child;
        tokio::spawn(async move {
            let code = tokio::task::spawn_blocking(move || child.wait())
                .await
                .ok()
                .and_then(Result::ok)
                .map(|status| status.exit_code() as i32);
            // Let trailing output land first; descendants may keep the PTY
            // open past the leader's exit, so don't wait forever.
            let _ = tokio::time::timeout(OUTPUT_SETTLE, &mut drain).await;
            runner.on_exit(generation, code);
        });
    }

    /// Gracefully stops the child, escalating to SIGKILL after `grace`.
    /// No-op when nothing is running.
    pub async fn stop(self: &Arc<Self>, grace: Duration) {
        let (baseline, already_failed) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.child.is_none() {
                return;
            }
            inner.stopping = true;
            if let Some(timer) = inner.ready_timer.take() {
                timer.abort();
            }
            (*self.exit_counter.borrow(), inner.ready_timed_out)
        };
        // A ready-timeout already settled the status as failed; kill the
        // leftover child without another transition.
        if !already_failed {
            self.emit_status(Status::Stopping);
        }
        self.signal(self.stop_signal());
        if !self.wait_exit(baseline, Some(grace)).await {
            tracing::debug!(name = %self.name, "grace period elapsed, killing process group");
            self.signal(pty::KILL_SIGNAL);
            self.wait_exit(baseline, None).await;
        }
    }

    /// Stops the child (2 s grace) and starts a fresh generation.
    /// Idempotent while a restart is already in flight.
    pub async fn restart(self: &Arc<Self>, cols: u16, rows: u16) {
        let (has_child, baseline) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.restarting {
                return;
            }
            inner.restarting = true;
            let has_child = inner.child.is_some();
            if has_child {
                inner.stopping = true;
                if let Some(timer) = inner.ready_timer.take() {
                    timer.abort();
                }
            }
            (has_child, *self.exit_counter.borrow())
        };
        if has_child {
            self.emit_status(Status::Stopping);
            self.signal(self.stop_signal());
            if !self.wait_exit(baseline, Some(RESTART_GRACE)).await {
                self.signal(pty::KILL_SIGNAL);
                self.wait_exit(baseline, None).await;
            }
        }
        // start() resets checkers, flags and the generation counter.
        self.start(cols, rows).await;
    }

    /// Forwards new terminal dimensions to the PTY, if alive.
    pub fn resize(&self, cols: u16, rows: u16) {
        let inner = self.inner.lock().unwrap();
        if let Some(child) = inner.child.as_ref() {
            child.resize(cols, rows);
        }
    }

    /// Writes input to the child's terminal; only `interactive` processes
    /// accept input.
    pub fn write(&self, bytes: &[u8]) {
        if !self.config.interactive {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(child) = inner.child.as_mut() {
            let _ = child.write(bytes);
        }
    }

    /// Capture groups from the readiness match of the current generation.
    pub fn captures(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().readiness.captures().clone()
    }

    /// Whether a child process currently exists.
    pub fn has_child(&self) -> bool {
        self.inner.lock().unwrap().child.is_some()
    }

    // A readiness pattern only applies to persistent processes; one-shots
    // are ready on clean exit.
    fn pattern_active(&self) -> bool {
        self.config.persistent && self.config.ready_pattern.is_some()
    }

    fn on_output(&self, generation: u64, bytes: Vec<u8>) {
        let (became_ready, fired_error) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                tracing::debug!(name = %self.name, "dropping stale pty output");
                return;
            }
            let text = String::from_utf8_lossy(&bytes);
            let became_ready = inner.readiness.feed(&text);
            let fired_error = inner
                .errors
                .as_mut()
                .is_some_and(|checker| checker.feed(&text));
            (became_ready, fired_error)
        };
        self.emit(RunnerEvent::Output {
            name: self.name.clone(),
            bytes,
        });
        if became_ready {
            self.mark_ready(generation);
        }
        if fired_error {
            self.emit(RunnerEvent::Error {
                name: self.name.clone(),
            });
        }
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let (ready_on_exit, suppress, stopping) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                tracing::debug!(name = %self.name, "dropping stale exit");
                return;
            }
            inner.child = None;
            let ready_on_exit = inner.readiness.depends_on_exit() && code == Some(0);
            (
                ready_on_exit,
                inner.ready_timed_out || inner.restarting,
                inner.stopping,
            )
        };
        if ready_on_exit {
            self.mark_ready(generation);
        }
        match code {
            Some(127) => self.emit_line(&color::red("[numux] command not found")),
            Some(126) => self.emit_line(&color::red("[numux] permission denied")),
            _ => {}
        }
        if !suppress {
            let status = if stopping {
                Status::Stopped
            } else if code == Some(0) {
                Status::Finished
            } else {
                Status::Failed
            };
            self.emit(RunnerEvent::Exit {
                name: self.name.clone(),
                code,
                status,
            });
        }
        self.exit_counter.send_modify(|count| *count += 1);
    }

    /// Idempotent readiness transition; cancels the ready timer. A process
    /// already failed by its ready timeout stays failed, even if the
    /// pattern shows up late.
    fn mark_ready(&self, generation: u64) {
        let captures = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation
                || inner.ready
                || inner.stopping
                || inner.ready_timed_out
            {
                return;
            }
            inner.ready = true;
            if let Some(timer) = inner.ready_timer.take() {
                timer.abort();
            }
            inner.readiness.captures().clone()
        };
        self.emit_status(Status::Ready);
        self.emit(RunnerEvent::Ready {
            name: self.name.clone(),
            captures,
        });
    }

    /// The ready timer fired before the pattern matched. The process is
    /// marked failed but the child is left running; a later `stop` kills it,
    /// and its eventual exit is not reported again.
    fn on_ready_timeout(&self, generation: u64, timeout: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation || inner.ready || inner.stopping {
                return;
            }
            inner.ready_timed_out = true;
            inner.ready_timer = None;
        }
        self.emit_line(&color::red(&format!(
            "[numux] readyPattern not matched within {}s — marking as failed",
            format_seconds(timeout)
        )));
        self.emit_status(Status::Failed);
        // Resolve the tier wait even though readiness never happened.
        self.emit(RunnerEvent::Ready {
            name: self.name.clone(),
            captures: HashMap::new(),
        });
    }

    fn fail_spawn(&self, message: &str) {
        self.emit_line(&color::red(&format!("[numux] failed to start: {message}")));
        self.emit(RunnerEvent::Exit {
            name: self.name.clone(),
            code: None,
            status: Status::Failed,
        });
    }

    fn signal(&self, signal: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(child) = inner.child.as_mut() {
            child.signal_group(signal);
        }
    }

    #[cfg(unix)]
    fn stop_signal(&self) -> i32 {
        self.config.stop_signal.number()
    }

    #[cfg(not(unix))]
    fn stop_signal(&self) -> i32 {
        0
    }

    async fn wait_exit(&self, baseline: u64, timeout: Option<Duration>) -> bool {
        let mut exits = self.exit_counter.subscribe();
        let wait = exits.wait_for(|count| *count > baseline);
        match timeout {
            Some(duration) => matches!(tokio::time::timeout(duration, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        }
    }

    fn emit_status(&self, status: Status) {
        self.emit(RunnerEvent::Status {
            name: self.name.clone(),
            status,
        });
    }

    fn emit_line(&self, text: &str) {
        self.emit(RunnerEvent::Output {
            name: self.name.clone(),
            bytes: format!("{text}\r\n").into_bytes(),
        });
    }

    fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::config::{ReadyPattern, StopSignal};

    fn test_config(command: &str) -> ProcessConfig {
        ProcessConfig {
            command: command.to_string(),
            cwd: None,
            env: HashMap::new(),
            env_files: Vec::new(),
            depends_on: Vec::new(),
            ready_pattern: None,
            persistent: true,
            max_restarts: None,
            ready_timeout: None,
            delay: None,
            condition: None,
            platforms: None,
            stop_signal: StopSignal::Term,
            colors: Vec::new(),
            watch: Vec::new(),
            interactive: false,
            error_matcher: None,
            show_command: false,
        }
    }

    fn runner(
        config: ProcessConfig,
    ) -> (Arc<ProcessRunner>, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessRunner::new("test".into(), config, tx), rx)
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> Status {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for runner event")
                .expect("runner event channel closed");
            match event {
                RunnerEvent::Status { status, .. } => return status,
                RunnerEvent::Exit { status, .. } => return status,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn one_shot_becomes_ready_then_finished() {
        let mut config = test_config("true");
        config.persistent = false;
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        assert_eq!(next_status(&mut rx).await, Status::Ready);
        assert_eq!(next_status(&mut rx).await, Status::Finished);
    }

    #[tokio::test]
    async fn failing_one_shot_is_failed_without_ready() {
        let mut config = test_config("exit 7");
        config.persistent = false;
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        loop {
            match rx.recv().await.expect("exit event missing") {
                RunnerEvent::Exit { code, status, .. } => {
                    assert_eq!(code, Some(7));
                    assert_eq!(status, Status::Failed);
                    break;
                }
                RunnerEvent::Ready { .. } => panic!("failing one-shot must not become ready"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn pattern_readiness_reports_running_first() {
        let mut config = test_config("echo booting; echo now serving; sleep 30");
        config.ready_pattern = Some(ReadyPattern::Text(Regex::new("serving").unwrap()));
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        assert_eq!(next_status(&mut rx).await, Status::Running);
        assert_eq!(next_status(&mut rx).await, Status::Ready);
        runner.stop(Duration::from_secs(5)).await;
        assert_eq!(next_status(&mut rx).await, Status::Stopping);
        assert_eq!(next_status(&mut rx).await, Status::Stopped);
    }

    #[tokio::test]
    async fn ready_timeout_marks_failed_and_suppresses_exit() {
        let mut config = test_config("sleep 30");
        config.ready_pattern = Some(ReadyPattern::Text(Regex::new("never").unwrap()));
        config.ready_timeout = Some(Duration::from_millis(150));
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        assert_eq!(next_status(&mut rx).await, Status::Running);
        assert_eq!(next_status(&mut rx).await, Status::Failed);
        // Killing the child afterwards must not re-report an exit.
        runner.stop(Duration::from_secs(5)).await;
        let trailing = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(RunnerEvent::Exit { .. }) => panic!("exit reported after timeout"),
                    Some(_) => continue,
                    None => break,
                }
            }
        })
        .await;
        assert!(trailing.is_err(), "channel should stay open and quiet");
    }

    #[tokio::test]
    async fn late_pattern_match_after_timeout_stays_failed() {
        let mut config = test_config("sleep 0.4; echo listening; sleep 30");
        config.ready_pattern = Some(ReadyPattern::Text(Regex::new("listening").unwrap()));
        config.ready_timeout = Some(Duration::from_millis(150));
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        assert_eq!(next_status(&mut rx).await, Status::Running);
        assert_eq!(next_status(&mut rx).await, Status::Failed);
        // The pattern arriving after the deadline must not resurrect the
        // process.
        tokio::time::sleep(Duration::from_millis(600)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(
                    event,
                    RunnerEvent::Status {
                        status: Status::Ready,
                        ..
                    }
                ),
                "ready emitted after the ready timeout"
            );
        }
        runner.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn one_shot_with_pattern_is_ready_on_clean_exit() {
        let mut config = test_config("sleep 0.4; echo done");
        config.persistent = false;
        config.ready_pattern = Some(ReadyPattern::Text(Regex::new("done").unwrap()));
        config.ready_timeout = Some(Duration::from_millis(100));
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        // No running transition and no ready timer: readiness is the clean
        // exit, well past the configured timeout.
        assert_eq!(next_status(&mut rx).await, Status::Ready);
        assert_eq!(next_status(&mut rx).await, Status::Finished);
    }

    #[tokio::test]
    async fn spawn_failure_reports_failed_and_null_exit() {
        let mut config = test_config("true");
        config.cwd = Some("/nonexistent-cwd-for-numux".into());
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        let mut saw_failed_exit = false;
        let mut saw_notice = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            match event {
                RunnerEvent::Exit { code, status, .. } => {
                    assert_eq!(code, None);
                    assert_eq!(status, Status::Failed);
                    saw_failed_exit = true;
                    break;
                }
                RunnerEvent::Output { bytes, .. } => {
                    if String::from_utf8_lossy(&bytes).contains("failed to start") {
                        saw_notice = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_failed_exit && saw_notice);
    }

    #[tokio::test]
    async fn command_not_found_appends_a_hint() {
        let mut config = test_config("definitely-not-a-command-numux");
        config.persistent = false;
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        let mut hinted = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            match event {
                RunnerEvent::Output { bytes, .. } => {
                    if String::from_utf8_lossy(&bytes).contains("command not found") {
                        hinted = true;
                    }
                }
                RunnerEvent::Exit { code, .. } => {
                    assert_eq!(code, Some(127));
                    break;
                }
                _ => {}
            }
        }
        assert!(hinted);
    }

    #[tokio::test]
    async fn show_command_echoes_a_dim_line_first() {
        let mut config = test_config("echo real-output");
        config.show_command = true;
        config.persistent = false;
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        let first_output = loop {
            match rx.recv().await.expect("events") {
                RunnerEvent::Output { bytes, .. } => break String::from_utf8_lossy(&bytes).to_string(),
                _ => continue,
            }
        };
        assert!(first_output.contains("$ echo real-output"));
    }

    #[tokio::test]
    async fn write_is_gated_on_interactive() {
        let mut config = test_config("read line; echo got $line");
        config.interactive = true;
        let (runner, mut rx) = runner(config);
        runner.start(80, 24).await;
        assert_eq!(next_status(&mut rx).await, Status::Starting);
        assert_eq!(next_status(&mut rx).await, Status::Ready);
        runner.write(b"hello\n");
        let mut echoed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            if let RunnerEvent::Output { bytes, .. } = &event {
                if String::from_utf8_lossy(bytes).contains("got hello") {
                    echoed = true;
                    break;
                }
            }
            if let RunnerEvent::Exit { .. } = event {
                break;
            }
        }
        assert!(echoed);
    }
}
