//! Process lifetime plumbing on both sides of the stdio boundary.
//!
//! Engine side: `--stop-with-process <pid>` binds the engine's lifetime
//! to its parent. Host side: [`EngineSupervisor`] spawns the engine
//! binary, pipes requests and responses, restarts it on unexpected exit
//! with capped backoff, and performs the staged graceful shutdown (close
//! stdin, then SIGTERM, then SIGKILL).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::events::EngineEvent;

/// How often the engine probes its parent process.
const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Restart attempts before the supervisor gives up.
const MAX_RESTARTS: u32 = 3;

/// Base restart backoff; doubles per attempt (1 s, 2 s, 4 s).
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// An engine alive at least this long resets the restart budget.
const STABLE_UPTIME: Duration = Duration::from_secs(10);

/// Delay between closing stdin and SIGTERM during graceful shutdown.
const TERM_DELAY: Duration = Duration::from_millis(500);

/// Delay between SIGTERM and SIGKILL.
const KILL_DELAY: Duration = Duration::from_secs(5);

/// Resolves when the given process is gone. Engine-side half of
/// `--stop-with-process`; never resolves on non-Unix platforms.
pub async fn parent_exited(pid: u32) {
    #[cfg(unix)]
    {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let mut tick = tokio::time::interval(PARENT_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            // kill(pid, 0): existence probe without a signal.
            if nix::sys::signal::kill(pid, None).is_err() {
                info!(pid = pid.as_raw(), "parent process exited");
                return;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        std::future::pending::<()>().await;
    }
}

/// Host-side configuration for spawning the engine binary.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

/// Host-side supervisor: one engine child with restart-on-crash.
#[derive(Debug)]
pub struct EngineSupervisor {
    config: SupervisorConfig,
    status: broadcast::Sender<EngineEvent>,
}

impl EngineSupervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let (status, _) = broadcast::channel(32);
        Self { config, status }
    }

    /// Subscribes to `engine-status` events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.status.subscribe()
    }

    /// Runs the supervision loop.
    ///
    /// Requests arriving on `requests` are written to the engine's stdin;
    /// every stdout line is forwarded to `output`. Closing the request
    /// channel triggers graceful shutdown. The loop returns when the
    /// engine exits after shutdown, or once the restart budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the binary cannot be started at all.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<String>,
        output: mpsc::Sender<String>,
    ) -> std::io::Result<()> {
        let mut attempts = 0u32;
        loop {
            let spawned_at = tokio::time::Instant::now();
            let mut child = self.spawn()?;
            let child_pid = child.id();
            let mut stdin = child.stdin.take();
            let stdout = child.stdout.take();
            self.publish(true, false);

            let mut lines = stdout.map(|out| BufReader::new(out).lines());
            let mut shutting_down = false;

            let exit_status = loop {
                tokio::select! {
                    status = child.wait() => break status.ok(),
                    request = requests.recv(), if !shutting_down => {
                        match request {
                            Some(mut line) => {
                                if let Some(stdin) = stdin.as_mut() {
                                    line.push('\n');
                                    if stdin.write_all(line.as_bytes()).await.is_err() {
                                        warn!("engine stdin write failed");
                                    }
                                    let _ = stdin.flush().await;
                                }
                            }
                            None => {
                                // Host is done: staged graceful shutdown.
                                shutting_down = true;
                                drop(stdin.take());
                                tokio::spawn(stage_signals(child_pid));
                            }
                        }
                    }
                    line = next_line(&mut lines) => {
                        match line {
                            Some(line) => {
                                let _ = output.send(line).await;
                            }
                            None => {
                                // stdout closed; wait for process exit.
                                lines = None;
                            }
                        }
                    }
                }
            };

            if shutting_down {
                debug!(?exit_status, "engine stopped after graceful shutdown");
                self.publish(false, false);
                return Ok(());
            }

            // Unexpected exit. A stable run earns a fresh restart budget.
            if spawned_at.elapsed() >= STABLE_UPTIME {
                attempts = 0;
            }
            attempts += 1;
            if attempts > MAX_RESTARTS {
                warn!(?exit_status, "engine keeps crashing, giving up");
                self.publish(false, false);
                return Ok(());
            }
            let backoff = RESTART_BACKOFF_BASE * 2u32.pow(attempts - 1);
            warn!(
                ?exit_status,
                attempt = attempts,
                backoff_secs = backoff.as_secs(),
                "engine exited unexpectedly, restarting"
            );
            self.publish(false, true);
            tokio::time::sleep(backoff).await;
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // stderr flows through for free-form engine logging.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command.spawn()
    }

    fn publish(&self, connected: bool, restarting: bool) {
        let _ = self.status.send(EngineEvent::EngineStatus { connected, restarting });
    }
}

type Lines = Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>;

/// Reads the next stdout line, or pends forever once stdout is gone.
async fn next_line(lines: &mut Lines) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// SIGTERM after 500 ms, SIGKILL after a further 5 s.
async fn stage_signals(pid: Option<u32>) {
    #[cfg(unix)]
    {
        let Some(pid) = pid else { return };
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        tokio::time::sleep(TERM_DELAY).await;
        if nix::sys::signal::kill(pid, None).is_ok() {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
            tokio::time::sleep(KILL_DELAY).await;
            if nix::sys::signal::kill(pid, None).is_ok() {
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, TERM_DELAY, KILL_DELAY);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parent_exited_detects_dead_pid() {
        // Spawn and reap a short-lived child; its pid is then gone (or
        // recycled, in which case the probe simply takes longer and the
        // timeout below fails loudly).
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let mut child = child;
        child.wait().unwrap();

        tokio::time::timeout(Duration::from_secs(10), parent_exited(pid))
            .await
            .expect("dead parent not detected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_cap_reached_after_repeated_crashes() {
        let supervisor = EngineSupervisor::new(SupervisorConfig {
            binary: PathBuf::from("false"),
            args: Vec::new(),
        });
        let mut status = supervisor.subscribe();
        let (_request_tx, request_rx) = mpsc::channel(1);
        let (output_tx, _output_rx) = mpsc::channel(16);

        tokio::time::timeout(Duration::from_secs(30), supervisor.run(request_rx, output_tx))
            .await
            .expect("supervisor did not give up")
            .unwrap();

        // Expect: connect/restart pairs, then a final not-restarting status.
        let mut restarting = 0;
        let mut gave_up = false;
        while let Ok(event) = status.try_recv() {
            if let EngineEvent::EngineStatus { connected, restarting: r } = event {
                if !connected && r {
                    restarting += 1;
                }
                if !connected && !r {
                    gave_up = true;
                }
            }
        }
        assert_eq!(restarting, MAX_RESTARTS);
        assert!(gave_up);
    }
}
