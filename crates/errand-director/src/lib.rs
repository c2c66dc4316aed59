//! errand-director — runs one-shot errands against a deployment's fleet.
//!
//! An errand run resolves a deployment and one of its errand jobs, takes
//! the deployment lock, and then drives five collaborators in strict order:
//!
//! ```text
//! ErrandOrchestrator
//!   ├── validate (deployment, job, lifecycle, ≥1 instance)   no lock held
//!   └── DistributedLock("lock:deployment:<name>")
//!       ├── DeploymentPreparer      prepare_deployment → prepare_job
//!       ├── ResourcePoolManager     apply
//!       ├── InstanceLifecycle       provision_instances
//!       ├── RemoteRunner            run (checkpoint-aware) / cancel
//!       └── cleanup, cancellation ignored:
//!           InstanceLifecycle::decommission_instances → ResourcePoolManager::restore
//! ```
//!
//! Cancellation is cooperative: a request marks the task `cancelling` in
//! the task store and the runner observes it through a [`Checkpoint`].
//! Cleanup runs with a checkpoint that ignores cancellation, so it always
//! completes.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod instances;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod pool;
pub mod preparer;
pub mod runner;
pub mod task;

use std::future::Future;
use std::pin::Pin;

pub use checkpoint::{Checkpoint, TaskStore};
pub use config::{DirectorConfig, RunnerConfig};
pub use error::{ErrandError, ErrandResult};
pub use events::{Event, EventSink, EventState, TracingEventSink};
pub use instances::{Cloud, CloudInstanceLifecycle, InstanceLifecycle, LocalCloud, VmSpec};
pub use lock::{deployment_lock_key, with_lock, DistributedLock, LocalLock, LockGuard};
pub use manifest::{
    DeploymentPlan, DeploymentRepository, ErrandCommand, InstancePlan, JobPlan, Lifecycle,
    ManifestParser, ParseOptions, ResourcePoolPlan, YamlManifestParser,
};
pub use orchestrator::{ErrandOrchestrator, ErrandPhase, ErrandServices, ErrandTarget, RunErrand};
pub use pool::{PoolLedger, PoolUpdater, ResourcePoolManager};
pub use preparer::{DeploymentPreparer, StatePreparer};
pub use runner::{ProcessRunner, RemoteRunner, RunResult};
pub use task::{run_task, QueuedJob, RunErrandJob};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
