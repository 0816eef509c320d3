//! Child-process supervision: timeout, cancellation and output capture.
//!
//! Each script runs in its own process group so that timeouts and cancels
//! reach every descendant, not just the interpreter.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::TIMEOUT_EXIT_CODE;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("job {0} is already executing")]
    DuplicateExecution(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// What to run and under which constraints.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overlaid on the ambient environment; these win on collision.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// How the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

/// Captured result of one supervised run. Output is kept on every path.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal it did not handle.
    pub exit_code: Option<i32>,
    pub termination: Termination,
}

enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancel,
}

/// Launches scripts and enforces their limits.
///
/// At most one execution per job identifier is in flight at a time.
pub struct ProcessSupervisor {
    grace_period: Duration,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases the job's in-flight slot when dropped.
struct InFlight<'a> {
    supervisor: &'a ProcessSupervisor,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.supervisor.in_flight.lock() {
            set.remove(&self.job_id);
        }
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn is_executing(&self, job_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    fn claim(&self, job_id: &str) -> Result<InFlight<'_>, SupervisorError> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(job_id.to_string()) {
            return Err(SupervisorError::DuplicateExecution(job_id.to_string()));
        }
        Ok(InFlight {
            supervisor: self,
            job_id: job_id.to_string(),
        })
    }

    /// Run `request` to completion, timeout or cancellation.
    ///
    /// - Normal exit: `Termination::Exited` with the process exit code. Anything
    ///   the script left running in its process group is killed.
    /// - Timeout: the whole process group is killed at once; exit code is
    ///   [`TIMEOUT_EXIT_CODE`].
    /// - Cancel: SIGTERM to the group, then SIGKILL after the grace period.
    ///
    /// Stdout and stderr collected up to the end are returned in every case.
    pub async fn execute(
        &self,
        job_id: &str,
        request: &ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, SupervisorError> {
        let _slot = self.claim(job_id)?;

        let mut child = spawn(request)?;
        let pid = child.id();
        info!(job_id, pid = ?pid, program = %request.program, "process started");

        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        let trigger = tokio::select! {
            status = child.wait() => Trigger::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Trigger::Deadline,
            _ = cancel.cancelled() => Trigger::Cancel,
        };

        let (exit_code, termination) = match trigger {
            Trigger::Exited(status) => {
                let status = status.map_err(SupervisorError::Wait)?;
                // Background children left in the group would outlive the job.
                signal_group(&mut child, pid, Signal::Kill);
                (status.code(), Termination::Exited)
            }
            Trigger::Deadline => {
                warn!(job_id, timeout = ?request.timeout, "timeout expired, killing process group");
                signal_group(&mut child, pid, Signal::Kill);
                child.wait().await.map_err(SupervisorError::Wait)?;
                (Some(TIMEOUT_EXIT_CODE), Termination::TimedOut)
            }
            Trigger::Cancel => {
                info!(job_id, "cancel requested, terminating process group");
                signal_group(&mut child, pid, Signal::Term);
                let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
                    Ok(status) => status.map_err(SupervisorError::Wait)?,
                    Err(_) => {
                        warn!(job_id, grace = ?self.grace_period, "grace period elapsed, killing");
                        signal_group(&mut child, pid, Signal::Kill);
                        child.wait().await.map_err(SupervisorError::Wait)?
                    }
                };
                (status.code(), Termination::Cancelled)
            }
        };

        // Descendants that escaped the group may still hold the pipes open.
        let stdout = stdout.finish(self.grace_period).await;
        let stderr = stderr.finish(self.grace_period).await;
        debug!(job_id, ?exit_code, ?termination, "process finished");

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            termination,
        })
    }
}

fn spawn(request: &ExecRequest) -> Result<Child, SupervisorError> {
    let mut cmd = std::process::Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.working_dir)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut cmd = Command::from(cmd);
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: request.program.clone(),
        source,
    })
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group, so the group id equals its pid.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        // Group already gone; make sure the direct child is not left behind.
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: Signal) {
    let _ = child.start_kill();
}

/// Drains one pipe into a shared buffer so partial output survives a kill.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<S>(stream: Option<S>) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = stream.map(|mut stream| {
            let sink = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = sink.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(self, wait: Duration) -> String {
        if let Some(task) = self.task {
            let abort = task.abort_handle();
            if tokio::time::timeout(wait, task).await.is_err() {
                abort.abort();
            }
        }
        let bytes = self
            .buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
