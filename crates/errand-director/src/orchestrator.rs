//! The errand run state machine.
//!
//! ```text
//! Validating ─► Locked ─► Preparing ─► Allocating ─► Provisioning ─► Running
//!                                                                      │
//!                           (checkpoint raised) Cancelling ◄───────────┤
//!                                                  │                   │
//!                                                  ▼                   ▼
//!                                             CleaningUp ◄─────────────┘
//!                                                  │
//!                                   Succeeded | Failed | Cancelled
//! ```
//!
//! Validation happens before the lock is taken and touches nothing. Once
//! the lock is held, cleanup (decommission, then pool restore) runs exactly
//! once on every exit path, with cancellation ignored.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, TaskStore};
use crate::config::DirectorConfig;
use crate::error::{ErrandError, ErrandResult};
use crate::events::{Event, EventSink, EventState};
use crate::instances::InstanceLifecycle;
use crate::lock::{deployment_lock_key, with_lock, DistributedLock};
use crate::manifest::{DeploymentPlan, DeploymentRepository, JobPlan, ManifestParser};
use crate::pool::{PoolLedger, PoolUpdater, ResourcePoolManager};
use crate::preparer::DeploymentPreparer;
use crate::runner::{RemoteRunner, RunResult};

/// One request to run an errand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrand {
    pub deployment: String,
    pub errand: String,
    /// Task whose state cancellation requests are recorded against.
    pub task_id: String,
}

impl RunErrand {
    pub fn new(
        deployment: impl Into<String>,
        errand: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            deployment: deployment.into(),
            errand: errand.into(),
            task_id: task_id.into(),
        }
    }
}

/// The resolved deployment and errand job a run operates on.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrandTarget {
    pub deployment: DeploymentPlan,
    pub job: JobPlan,
}

impl ErrandTarget {
    pub fn new(deployment: DeploymentPlan, job: JobPlan) -> Self {
        Self { deployment, job }
    }
}

/// States of one errand run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrandPhase {
    Validating,
    Locked,
    Preparing,
    Allocating,
    Provisioning,
    Running,
    Cancelling,
    CleaningUp,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for ErrandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrandPhase::Validating => "validating",
            ErrandPhase::Locked => "locked",
            ErrandPhase::Preparing => "preparing",
            ErrandPhase::Allocating => "allocating",
            ErrandPhase::Provisioning => "provisioning",
            ErrandPhase::Running => "running",
            ErrandPhase::Cancelling => "cancelling",
            ErrandPhase::CleaningUp => "cleaning_up",
            ErrandPhase::Succeeded => "succeeded",
            ErrandPhase::Failed => "failed",
            ErrandPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Collaborators an orchestrator drives. Each is owned elsewhere and
/// injected at construction.
#[derive(Clone)]
pub struct ErrandServices {
    pub deployments: Arc<dyn DeploymentRepository>,
    pub manifest_parser: Arc<dyn ManifestParser>,
    pub tasks: Arc<dyn TaskStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub preparer: Arc<dyn DeploymentPreparer>,
    pub pool_ledger: Arc<dyn PoolLedger>,
    pub instances: Arc<dyn InstanceLifecycle>,
    pub runner: Arc<dyn RemoteRunner>,
    pub events: Arc<dyn EventSink>,
}

/// Runs errands end to end.
pub struct ErrandOrchestrator {
    services: ErrandServices,
    config: DirectorConfig,
}

impl ErrandOrchestrator {
    pub fn new(services: ErrandServices, config: DirectorConfig) -> Self {
        Self { services, config }
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    /// Run the errand described by `request` and return the runner's short
    /// result description.
    pub async fn perform(&self, request: &RunErrand) -> ErrandResult<String> {
        let target = self.resolve(request)?;
        let checkpoint = Checkpoint::new(Arc::clone(&self.services.tasks), request.task_id.clone());
        let key = deployment_lock_key(&target.deployment.name);

        with_lock(
            self.services.lock.as_ref(),
            &key,
            self.config.lock_timeout(),
            || self.perform_locked(&target, &checkpoint),
        )
        .await
    }

    /// Resolve and validate the deployment and errand job. Nothing is
    /// locked or allocated here.
    pub fn resolve(&self, request: &RunErrand) -> ErrandResult<ErrandTarget> {
        self.enter(&request.errand, ErrandPhase::Validating);

        let record = self
            .services
            .deployments
            .find_deployment_by_name(&request.deployment)?
            .ok_or_else(|| ErrandError::DeploymentNotFound(request.deployment.clone()))?;

        let plan = self.services.manifest_parser.parse(
            &record.manifest,
            self.services.events.as_ref(),
            &self.config.manifest,
        )?;

        let job = plan
            .job(&request.errand)
            .cloned()
            .ok_or_else(|| ErrandError::JobNotFound {
                deployment: request.deployment.clone(),
                job: request.errand.clone(),
            })?;

        if !job.can_run_as_errand() {
            return Err(ErrandError::NotAnErrand(job.name));
        }
        if job.instances.is_empty() {
            return Err(ErrandError::InstanceNotFound(format!("{}/0", job.name)));
        }

        Ok(ErrandTarget::new(plan, job))
    }

    async fn perform_locked(
        &self,
        target: &ErrandTarget,
        checkpoint: &Checkpoint,
    ) -> ErrandResult<String> {
        self.enter(&target.job.name, ErrandPhase::Locked);
        let pools = ResourcePoolManager::new(
            Arc::clone(&self.services.pool_ledger),
            vec![PoolUpdater::for_job(&target.job)],
        );

        let outcome = AssertUnwindSafe(self.execute(target, checkpoint, &pools))
            .catch_unwind()
            .await;

        self.enter(&target.job.name, ErrandPhase::CleaningUp);
        let failures = self.clean_up(target, checkpoint, &pools).await;

        match outcome {
            Ok(result) => self.settle(&target.job.name, result, failures),
            Err(panic) => {
                error!(
                    errand = %target.job.name,
                    "errand panicked; cleanup finished, resuming unwind"
                );
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn execute(
        &self,
        target: &ErrandTarget,
        checkpoint: &Checkpoint,
        pools: &ResourcePoolManager,
    ) -> ErrandResult<RunResult> {
        let errand = target.job.name.as_str();
        let services = &self.services;

        self.enter(errand, ErrandPhase::Preparing);
        self.stage("Preparing deployment", errand, async {
            services.preparer.prepare_deployment(target).await?;
            services.preparer.prepare_job(target).await
        })
        .await?;

        self.enter(errand, ErrandPhase::Allocating);
        self.stage("Allocating resources", errand, pools.apply()).await?;

        self.enter(errand, ErrandPhase::Provisioning);
        self.stage(
            "Provisioning instances",
            errand,
            services.instances.provision_instances(target),
        )
        .await?;

        self.enter(errand, ErrandPhase::Running);
        match self
            .stage("Running errand", errand, services.runner.run(target, checkpoint))
            .await
        {
            Err(e) if e.is_cancellation() => {
                self.enter(errand, ErrandPhase::Cancelling);
                warn!(
                    errand,
                    task_id = %checkpoint.task_id(),
                    "cancellation observed, stopping errand"
                );
                services.runner.cancel(target).await?;
                Err(e)
            }
            other => other,
        }
    }

    /// Decommission, then restore, with cancellation ignored. Returns every
    /// failure instead of stopping at the first.
    async fn clean_up(
        &self,
        target: &ErrandTarget,
        checkpoint: &Checkpoint,
        pools: &ResourcePoolManager,
    ) -> Vec<ErrandError> {
        let errand = target.job.name.as_str();
        let checkpoint = checkpoint.ignoring_cancellation();
        let mut failures = Vec::new();

        let decommissioned = self
            .stage(
                "Deleting instances",
                errand,
                self.services.instances.decommission_instances(target, &checkpoint),
            )
            .await;
        if let Err(e) = decommissioned {
            error!(errand, error = %e, "instance cleanup failed");
            failures.push(e);
        }

        if let Err(e) = self.stage("Restoring resources", errand, pools.restore()).await {
            error!(errand, error = %e, "resource pool restore failed");
            failures.push(e);
        }

        failures
    }

    fn settle(
        &self,
        errand: &str,
        result: ErrandResult<RunResult>,
        failures: Vec<ErrandError>,
    ) -> ErrandResult<String> {
        match (result, failures.is_empty()) {
            (Ok(result), true) => {
                self.enter(errand, ErrandPhase::Succeeded);
                info!(errand, result = %result.short_description, "errand succeeded");
                Ok(result.short_description)
            }
            (Ok(_), false) => {
                self.enter(errand, ErrandPhase::Failed);
                Err(ErrandError::Cleanup {
                    primary: None,
                    failures,
                })
            }
            (Err(e), true) => {
                let phase = if e.is_cancellation() {
                    ErrandPhase::Cancelled
                } else {
                    ErrandPhase::Failed
                };
                self.enter(errand, phase);
                Err(e)
            }
            (Err(e), false) => {
                self.enter(errand, ErrandPhase::Failed);
                Err(ErrandError::Cleanup {
                    primary: Some(Box::new(e)),
                    failures,
                })
            }
        }
    }

    fn enter(&self, errand: &str, phase: ErrandPhase) {
        debug!(errand, %phase, "errand phase");
    }

    /// Await `fut`, reporting it to the event sink as one stage.
    async fn stage<T>(
        &self,
        stage: &str,
        errand: &str,
        fut: impl Future<Output = ErrandResult<T>>,
    ) -> ErrandResult<T> {
        let events = &self.services.events;
        events.record(Event::new(stage, errand, EventState::Started));
        let result = fut.await;
        match &result {
            Ok(_) => events.record(Event::new(stage, errand, EventState::Finished)),
            Err(e) => events.record(
                Event::new(stage, errand, EventState::Failed).with_detail(e.to_string()),
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_display_snake_case() {
        assert_eq!(ErrandPhase::CleaningUp.to_string(), "cleaning_up");
        assert_eq!(ErrandPhase::Succeeded.to_string(), "succeeded");
    }
}
