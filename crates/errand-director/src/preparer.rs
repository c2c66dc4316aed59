//! Getting a deployment and its errand job ready to run.

use tracing::debug;

use errand_state::StateStore;

use crate::error::{ErrandError, ErrandResult};
use crate::orchestrator::ErrandTarget;
use crate::BoxFuture;

/// Readies a deployment, then one job within it.
///
/// Both steps are idempotent. `prepare_job` runs only after
/// `prepare_deployment` succeeded.
pub trait DeploymentPreparer: Send + Sync {
    fn prepare_deployment<'a>(
        &'a self,
        target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>>;

    fn prepare_job<'a>(&'a self, target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>>;
}

/// Binds a deployment's resource pools in the state store.
#[derive(Clone)]
pub struct StatePreparer {
    state: StateStore,
}

impl StatePreparer {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

impl DeploymentPreparer for StatePreparer {
    fn prepare_deployment<'a>(
        &'a self,
        target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            for pool in &target.deployment.resource_pools {
                self.state
                    .register_pool(&pool.name, pool.size, pool.max_size)
                    .map_err(|e| {
                        ErrandError::Preparation(format!("bind pool `{}': {e}", pool.name))
                    })?;
            }
            debug!(
                deployment = %target.deployment.name,
                pools = target.deployment.resource_pools.len(),
                "deployment prepared"
            );
            Ok(())
        })
    }

    fn prepare_job<'a>(&'a self, target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            let job = &target.job;
            let pool = self
                .state
                .get_pool(&job.resource_pool)
                .map_err(|e| ErrandError::Preparation(e.to_string()))?
                .ok_or_else(|| {
                    ErrandError::Preparation(format!(
                        "resource pool `{}' for job `{}' is not bound",
                        job.resource_pool, job.name
                    ))
                })?;

            let needed = u32::try_from(job.instances.len()).unwrap_or(u32::MAX);
            if needed > pool.max_size {
                return Err(ErrandError::Preparation(format!(
                    "job `{}' needs {needed} instances but resource pool `{}' allows at most {}",
                    job.name, pool.name, pool.max_size
                )));
            }
            debug!(job = %job.name, pool = %pool.name, needed, "job prepared");
            Ok(())
        })
    }
}
