//! Remote execution of the errand payload.
//!
//! [`RemoteRunner::run`] is the one long-running step of an errand and the
//! only place cancellation is observed: implementations evaluate the
//! [`Checkpoint`] they are handed at safe points and return its error. The
//! orchestrator then calls [`RemoteRunner::cancel`] to stop whatever is
//! still executing.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use errand_state::StateStore;

use crate::checkpoint::Checkpoint;
use crate::error::{ErrandError, ErrandResult};
use crate::orchestrator::ErrandTarget;
use crate::BoxFuture;

/// Outcome of one errand execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// One-line summary handed back to the caller.
    #[serde(skip)]
    pub short_description: String,
}

impl RunResult {
    pub fn new(job: &str, exit_code: i32, stdout: String, stderr: String) -> Self {
        let short_description = if exit_code == 0 {
            format!("Errand `{job}' completed successfully (exit code {exit_code})")
        } else {
            format!("Errand `{job}' completed with error (exit code {exit_code})")
        };
        Self {
            exit_code,
            stdout,
            stderr,
            short_description,
        }
    }

    /// Full result payload as stored on the task.
    pub fn to_json(&self) -> ErrandResult<String> {
        serde_json::to_string(self).map_err(|e| ErrandError::Execution(e.to_string()))
    }
}

/// Drives the errand on its provisioned instances.
pub trait RemoteRunner: Send + Sync {
    /// Execute the errand, evaluating `checkpoint` at safe points.
    fn run<'a>(
        &'a self,
        target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<RunResult>>;

    /// Stop an errand whose `run` returned at a checkpoint. Fails with
    /// [`ErrandError::RemoteAgent`] if the agent cannot be reached.
    fn cancel<'a>(&'a self, target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>>;
}

// ── Process runner ────────────────────────────────────────────────

/// Runs the errand command as a local child process.
pub struct ProcessRunner {
    state: StateStore,
    poll_interval: Duration,
    /// Children left running when a checkpoint interrupted `run`.
    parked: Mutex<HashMap<String, Child>>,
}

impl ProcessRunner {
    pub fn new(state: StateStore, poll_interval: Duration) -> Self {
        Self {
            state,
            poll_interval,
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn agent_key(target: &ErrandTarget) -> String {
        format!("{}/{}", target.deployment.name, target.job.name)
    }

    fn spawn(&self, target: &ErrandTarget) -> ErrandResult<Child> {
        let job = &target.job;
        let errand = job.errand.as_ref().ok_or_else(|| {
            ErrandError::Execution(format!("job `{}' has no errand command", job.name))
        })?;

        Command::new(&errand.command)
            .args(&errand.args)
            .envs(&errand.env)
            .env("ERRAND_DEPLOYMENT", &target.deployment.name)
            .env("ERRAND_JOB", &job.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ErrandError::RemoteAgent(format!("spawn `{}': {e}", errand.command)))
    }
}

enum Step {
    Exited(std::io::Result<std::process::ExitStatus>),
    Poll,
}

impl RemoteRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<RunResult>> {
        Box::pin(async move {
            let key = Self::agent_key(target);
            let mut child = self.spawn(target)?;
            info!(errand = %key, pid = ?child.id(), "errand started");

            let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
            let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let status = loop {
                let step = tokio::select! {
                    status = child.wait() => Step::Exited(status),
                    _ = ticker.tick() => Step::Poll,
                };
                match step {
                    Step::Exited(status) => {
                        break status.map_err(|e| {
                            ErrandError::RemoteAgent(format!("wait on {key}: {e}"))
                        })?;
                    }
                    Step::Poll => {
                        if let Err(e) = checkpoint.check() {
                            if e.is_cancellation() {
                                warn!(errand = %key, error = %e, "errand interrupted");
                                self.parked.lock().await.insert(key, child);
                            } else {
                                // No cancel() follows a failed check, so stop the child here.
                                error!(errand = %key, error = %e, "checkpoint failed");
                                if let Err(kill_err) = child.kill().await {
                                    error!(errand = %key, error = %kill_err, "errand kill failed");
                                }
                            }
                            return Err(e);
                        }
                    }
                }
            };

            let stdout = match stdout {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            let stderr = match stderr {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };

            // Killed by a signal: no exit code.
            let exit_code = status.code().unwrap_or(-1);
            let result = RunResult::new(&target.job.name, exit_code, stdout, stderr);
            self.state
                .set_task_result(checkpoint.task_id(), &result.to_json()?)?;
            info!(errand = %key, exit_code, "errand finished");
            Ok(result)
        })
    }

    fn cancel<'a>(&'a self, target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            let key = Self::agent_key(target);
            let Some(mut child) = self.parked.lock().await.remove(&key) else {
                debug!(errand = %key, "nothing to cancel");
                return Ok(());
            };
            child
                .kill()
                .await
                .map_err(|e| ErrandError::RemoteAgent(format!("cancel {key}: {e}")))?;
            info!(errand = %key, "errand cancelled");
            Ok(())
        })
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "errand output truncated");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
