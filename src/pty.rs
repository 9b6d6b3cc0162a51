//! Pseudo-terminal plumbing around `portable-pty`.
//!
//! Children run as `sh -c <command>` attached to a freshly allocated PTY and
//! become leaders of their own session, so signals addressed to the process
//! group reach their descendants too. A blocking reader thread bridges PTY
//! bytes into a tokio channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

/// Handle to a live PTY child: master side, writer and signalling.
pub struct PtyChild {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl std::fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChild").field("pid", &self.pid).finish()
    }
}

/// Result of a successful spawn.
pub struct Spawned {
    /// Master-side handle kept by the runner.
    pub handle: PtyChild,
    /// PTY output chunks in read order; closes at EOF.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Wait handle, consumed by the runner's exit watcher.
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
}

/// Spawns `sh -c <command>` under a new PTY of the given size.
///
/// The child environment is exactly `env`; the caller composes parent
/// environment, built-ins, env files and per-process overrides beforehand.
pub fn spawn_shell(
    command: &str,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    cols: u16,
    rows: u16,
) -> Result<Spawned> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("failed to allocate pty")?;

    let mut cmd = CommandBuilder::new("sh");
    cmd.arg("-c");
    cmd.arg(command);
    cmd.env_clear();
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    // Close our copy of the slave so EOF is observed when the child exits.
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(Spawned {
        handle: PtyChild {
            pid,
            master: pair.master,
            writer,
            killer,
        },
        output: rx,
        child,
    })
}

impl PtyChild {
    /// OS pid of the group leader, when known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forwards new dimensions to the PTY (delivers SIGWINCH to the child).
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
    }

    /// Writes input bytes to the child's terminal.
    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    /// Signals the child's process group, falling back to the leader when
    /// the group signal is unavailable. Already-exited children are ignored.
    #[cfg(unix)]
    pub fn signal_group(&mut self, signal: i32) {
        let Some(pid) = self.pid else {
            let _ = self.killer.kill();
            return;
        };
        unsafe {
            if libc::kill(-(pid as i32), signal) != 0 {
                let _ = libc::kill(pid as i32, signal);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn signal_group(&mut self, _signal: i32) {
        let _ = self.killer.kill();
    }
}

/// Signal number used for forced termination after the grace period.
#[cfg(unix)]
pub const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const KILL_SIGNAL: i32 = 9;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        std::env::vars().collect()
    }

    #[tokio::test]
    async fn spawns_and_streams_output() {
        let mut spawned =
            spawn_shell("echo pty-check", None, &base_env(), 80, 24).expect("spawn");
        let mut collected = Vec::new();
        while let Some(chunk) = spawned.output.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("pty-check"), "output: {text:?}");
        let mut child = spawned.child;
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn reports_exit_codes() {
        let spawned = spawn_shell("exit 3", None, &base_env(), 80, 24).expect("spawn");
        let status = tokio::task::spawn_blocking(move || {
            let mut child = spawned.child;
            child.wait()
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.exit_code(), 3);
    }

    #[tokio::test]
    async fn group_signal_terminates_descendants() {
        let mut spawned =
            spawn_shell("sleep 30 & sleep 30", None, &base_env(), 80, 24).expect("spawn");
        spawned.handle.signal_group(libc::SIGTERM);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = spawned.child;
            child.wait()
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn respects_the_provided_environment() {
        let mut env = base_env();
        env.insert("NUMUX_PTY_TEST".into(), "42".into());
        let spawned =
            spawn_shell("printf \"%s\" \"$NUMUX_PTY_TEST\"", None, &env, 80, 24).expect("spawn");
        let mut child = spawned.child;
        let status = child.wait().unwrap();
        assert!(status.success());
    }
}
