//! Queued jobs and the task bookkeeping around them.

use std::sync::Arc;

use tracing::{error, info, warn};

use errand_state::{StateStore, TaskState};

use crate::error::{ErrandError, ErrandResult};
use crate::orchestrator::{ErrandOrchestrator, RunErrand};
use crate::BoxFuture;

/// A unit of work executed on behalf of one task.
pub trait QueuedJob: Send + Sync {
    /// Stable name of the job kind, stored on the task.
    fn job_type(&self) -> &'static str;

    /// Do the work and return a short result description.
    fn perform<'a>(&'a self) -> BoxFuture<'a, ErrandResult<String>>;
}

/// Runs one errand through an orchestrator.
pub struct RunErrandJob {
    orchestrator: Arc<ErrandOrchestrator>,
    request: RunErrand,
}

impl RunErrandJob {
    pub const JOB_TYPE: &'static str = "run_errand";

    pub fn new(orchestrator: Arc<ErrandOrchestrator>, request: RunErrand) -> Self {
        Self {
            orchestrator,
            request,
        }
    }

    pub fn request(&self) -> &RunErrand {
        &self.request
    }
}

impl QueuedJob for RunErrandJob {
    fn job_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn perform<'a>(&'a self) -> BoxFuture<'a, ErrandResult<String>> {
        Box::pin(self.orchestrator.perform(&self.request))
    }
}

/// Perform `job` for the task `task_id` and record its terminal state.
///
/// The task must exist. A result the job already stored on the task (the
/// runner's full output) is kept; otherwise the short result is stored.
/// The job's outcome is returned unchanged, even when recording the
/// terminal state fails.
pub async fn run_task(
    state: &StateStore,
    task_id: &str,
    job: &dyn QueuedJob,
) -> ErrandResult<String> {
    let task = state
        .get_task(task_id)?
        .ok_or_else(|| ErrandError::TaskNotFound(task_id.to_string()))?;
    if task.state == TaskState::Queued {
        state.set_task_state(task_id, TaskState::Running)?;
    }
    info!(task_id, job_type = job.job_type(), "task started");

    let outcome = job.perform().await;

    let (terminal, result) = match &outcome {
        Ok(short) => {
            let stored = match state.get_task(task_id) {
                Ok(task) => task.and_then(|task| task.result),
                Err(e) => {
                    error!(task_id, error = %e, "failed to read task result");
                    None
                }
            };
            (TaskState::Done, Some(stored.unwrap_or_else(|| short.clone())))
        }
        Err(e) => {
            let terminal = match e.primary() {
                ErrandError::TaskCancelled(_) => TaskState::Cancelled,
                ErrandError::TaskTimedOut(_) => TaskState::TimedOut,
                _ => TaskState::Errored,
            };
            (terminal, Some(e.to_string()))
        }
    };
    if let Err(e) = state.finish_task(task_id, terminal, result) {
        error!(task_id, state = ?terminal, error = %e, "failed to record task outcome");
    }

    match &outcome {
        Ok(_) => info!(task_id, state = ?terminal, "task finished"),
        Err(e) => warn!(task_id, state = ?terminal, error = %e, "task finished"),
    }
    outcome
}
