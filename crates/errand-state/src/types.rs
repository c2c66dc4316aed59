//! Domain types for the errand state store.
//!
//! These types represent the persisted state of deployments, tasks,
//! resource pools, and errand instances. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a task.
pub type TaskId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// A stored deployment: its name and the raw manifest it was deployed with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub name: String,
    /// Raw manifest payload (YAML).
    pub manifest: String,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

// ── Task ──────────────────────────────────────────────────────────

/// A queued unit of work and the state cancellation requests are recorded against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Kind of job this task runs (e.g. `run_errand`).
    pub job_type: String,
    pub description: String,
    pub state: TaskState,
    /// Full result payload or error text once the task is terminal.
    pub result: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    /// Cancellation requested; honoured at the next checkpoint.
    Cancelling,
    Cancelled,
    Done,
    Errored,
    TimedOut,
}

impl TaskState {
    /// Whether the task has finished and will not change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Done | TaskState::Errored | TaskState::TimedOut
        )
    }
}

// ── Resource pool ─────────────────────────────────────────────────

/// Shared VM capacity accounting for one named pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePoolRecord {
    pub name: String,
    /// Current capacity (baseline plus everything granted to running errands).
    pub size: u32,
    /// Ceiling `size` may never exceed.
    pub max_size: u32,
    pub updated_at: u64,
}

impl ResourcePoolRecord {
    /// Remaining capacity before the pool hits its ceiling.
    pub fn headroom(&self) -> u32 {
        self.max_size.saturating_sub(self.size)
    }
}

/// A relative change to one pool's size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolDelta {
    pub pool: String,
    pub count: u32,
}

impl PoolDelta {
    pub fn new(pool: impl Into<String>, count: u32) -> Self {
        Self {
            pool: pool.into(),
            count,
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// A VM provisioned for one instance of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    /// Cloud identifier of the backing VM.
    pub vm_cid: String,
    pub status: InstanceStatus,
    pub created_at: u64,
}

/// Lifecycle status of an errand instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Deleting,
}

impl InstanceRecord {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.job, self.index)
    }
}

/// Composite key for an instance: `{deployment}/{job}/{index}`.
pub fn instance_key(deployment: &str, job: &str, index: u32) -> String {
    format!("{deployment}/{job}/{index}")
}
