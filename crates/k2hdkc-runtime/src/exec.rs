use crate::RuntimeError;
use k2hdkc_schema::CommandLine;
use serde::Serialize;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default deadline for helper and runtime commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    /// Terminated by a signal it did not receive from us.
    Signaled,
    /// Killed after exceeding its deadline.
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub pid: u32,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExitOutcome,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome == ExitOutcome::Exited(0)
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == ExitOutcome::TimedOut
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExitOutcome::Exited(code) => Some(code),
            ExitOutcome::Signaled | ExitOutcome::TimedOut => None,
        }
    }
}

/// Runs external programs with a deadline and captured output.
///
/// The executor only classifies how a process ended; whether a non-zero exit
/// is a failure is up to the caller.
#[derive(Debug, Clone)]
pub struct Executor {
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait for output pipes to close once the child is gone.
    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Parse `line` with shell quoting rules and run it.
    pub fn run_line(&self, line: &str, timeout: Duration) -> Result<ExecutionResult, RuntimeError> {
        let command = CommandLine::parse(line)?;
        self.run(&command, timeout)
    }

    pub fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<ExecutionResult, RuntimeError> {
        info!("running {command} (timeout {}s)", timeout.as_secs());
        let started = Instant::now();

        let mut child = Command::new(command.program())
            .args(command.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| RuntimeError::SpawnFailed {
                program: command.program().to_owned(),
                source,
            })?;
        let pid = child.id();

        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        // Too far out to represent: run without a deadline.
        let deadline = started.checked_add(timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    kill_tree(&mut child);
                    let _ = child.wait();
                    return Err(e.into());
                }
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        };

        let Some(status) = status else {
            kill_tree(&mut child);
            child.wait()?;
            let stderr = self.collect(&stderr_rx);
            let stdout = self.collect(&stdout_rx);
            warn!(
                "{command} timed out after {}s and was killed; stderr: {}",
                timeout.as_secs(),
                stderr.trim()
            );
            return Ok(ExecutionResult {
                pid,
                stdout,
                stderr,
                outcome: ExitOutcome::TimedOut,
                elapsed: started.elapsed(),
            });
        };

        let stdout = self.collect(&stdout_rx);
        let stderr = self.collect(&stderr_rx);
        let outcome = status
            .code()
            .map_or(ExitOutcome::Signaled, ExitOutcome::Exited);
        let elapsed = started.elapsed();

        match outcome {
            ExitOutcome::Exited(code) => {
                info!("{command} exited with code {code} after {elapsed:?}");
            }
            _ => info!("{command} was terminated by a signal after {elapsed:?}"),
        }
        debug!("stdout: {}", stdout.trim());
        debug!("stderr: {}", stderr.trim());

        Ok(ExecutionResult {
            pid,
            stdout,
            stderr,
            outcome,
            elapsed,
        })
    }

    /// Output read so far; gives up after the drain timeout so a grandchild
    /// still holding the pipe cannot block us.
    fn collect(&self, rx: &Receiver<Vec<u8>>) -> String {
        match rx.recv_timeout(self.drain_timeout) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }
}

/// Kill the child and everything it spawned. The child leads its own
/// process group, so a helper script's children go with it.
fn kill_tree(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = kill_process_group(pid) {
        debug!("kill of process group {pid} failed: {e}");
        if let Err(e) = child.kill() {
            debug!("kill of pid {pid} failed (already gone?): {e}");
        }
    }
}

#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
    })?;
    // SAFETY: kill() takes no pointers; a negative pid addresses the process
    // group the child was placed in at spawn.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                let _ = tx.send(buf);
            });
        }
        None => {
            let _ = tx.send(Vec::new());
        }
    }
    rx
}
