//! Cooperative cancellation checkpoints.
//!
//! A [`Checkpoint`] reads the task's state from a [`TaskStore`] and fails
//! with [`ErrandError::TaskCancelled`] once somebody has asked for the
//! task to be cancelled. Long-running collaborators call
//! [`Checkpoint::check`] at safe points. A checkpoint derived with
//! [`Checkpoint::ignoring_cancellation`] never fails; cleanup runs with one.

use std::fmt;
use std::sync::Arc;

use errand_state::{StateStore, TaskRecord, TaskState};

use crate::error::{ErrandError, ErrandResult};

/// Read access to task records.
pub trait TaskStore: Send + Sync {
    fn find_task(&self, task_id: &str) -> ErrandResult<TaskRecord>;
}

impl TaskStore for StateStore {
    fn find_task(&self, task_id: &str) -> ErrandResult<TaskRecord> {
        self.get_task(task_id)?
            .ok_or_else(|| ErrandError::TaskNotFound(task_id.to_string()))
    }
}

/// Cancellation probe bound to one task.
#[derive(Clone)]
pub struct Checkpoint {
    tasks: Arc<dyn TaskStore>,
    task_id: String,
    ignore_cancellation: bool,
}

impl Checkpoint {
    pub fn new(tasks: Arc<dyn TaskStore>, task_id: impl Into<String>) -> Self {
        Self {
            tasks,
            task_id: task_id.into(),
            ignore_cancellation: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// A copy of this checkpoint on which [`check`](Self::check) is a no-op.
    pub fn ignoring_cancellation(&self) -> Self {
        Self {
            ignore_cancellation: true,
            ..self.clone()
        }
    }

    pub fn is_ignoring_cancellation(&self) -> bool {
        self.ignore_cancellation
    }

    /// Fail if the task has been cancelled or has timed out.
    pub fn check(&self) -> ErrandResult<()> {
        if self.ignore_cancellation {
            return Ok(());
        }
        let task = self.tasks.find_task(&self.task_id)?;
        match task.state {
            TaskState::Cancelling => Err(ErrandError::TaskCancelled(self.task_id.clone())),
            TaskState::TimedOut => Err(ErrandError::TaskTimedOut(self.task_id.clone())),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("task_id", &self.task_id)
            .field("ignore_cancellation", &self.ignore_cancellation)
            .finish()
    }
}
