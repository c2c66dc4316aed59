//! Errand error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can end an errand run.
#[derive(Debug, Error)]
pub enum ErrandError {
    #[error("deployment `{0}' doesn't exist")]
    DeploymentNotFound(String),

    #[error("job `{job}' doesn't exist in deployment `{deployment}'")]
    JobNotFound { deployment: String, job: String },

    #[error("job `{0}' is not an errand. To mark a job as an errand set its lifecycle to 'errand' in the deployment manifest")]
    NotAnErrand(String),

    /// Names the first instance the errand needed, `<job>/0`.
    #[error("instance `{0}' doesn't exist")]
    InstanceNotFound(String),

    #[error("failed to acquire lock `{resource}' within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("preparation failed: {0}")]
    Preparation(String),

    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("decommissioning failed: {0}")]
    Decommission(String),

    #[error("task `{0}' cancelled")]
    TaskCancelled(String),

    #[error("task `{0}' timed out")]
    TaskTimedOut(String),

    #[error("task `{0}' doesn't exist")]
    TaskNotFound(String),

    #[error("remote agent error: {0}")]
    RemoteAgent(String),

    #[error("errand execution failed: {0}")]
    Execution(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(#[from] errand_state::StateError),

    /// Cleanup failed. `primary` is the run-phase error, if there was one.
    #[error("{}", describe_cleanup(.primary, .failures))]
    Cleanup {
        primary: Option<Box<ErrandError>>,
        failures: Vec<ErrandError>,
    },
}

pub type ErrandResult<T> = Result<T, ErrandError>;

impl ErrandError {
    /// Whether this error is a cooperative cancellation (or timeout) observed at a checkpoint.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ErrandError::TaskCancelled(_) | ErrandError::TaskTimedOut(_))
    }

    /// The run-phase error behind a cleanup aggregate, or `self`.
    pub fn primary(&self) -> &ErrandError {
        match self {
            ErrandError::Cleanup {
                primary: Some(primary),
                ..
            } => primary.primary(),
            other => other,
        }
    }
}

fn describe_cleanup(primary: &Option<Box<ErrandError>>, failures: &[ErrandError]) -> String {
    let failures = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    match primary {
        Some(primary) => format!("{primary} (cleanup also failed: {failures})"),
        None => format!("cleanup failed: {failures}"),
    }
}
