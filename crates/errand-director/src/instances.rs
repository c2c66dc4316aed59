//! VM instances backing an errand job.
//!
//! [`InstanceLifecycle`] creates the job's instances before the errand runs
//! and deletes them afterwards. [`CloudInstanceLifecycle`] does both by
//! pairing a [`Cloud`] with instance records in the state store, so a
//! decommission after a partial provision only touches what exists.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, error, info};
use uuid::Uuid;

use errand_state::{instance_key, InstanceRecord, InstanceStatus, StateStore};

use crate::checkpoint::Checkpoint;
use crate::error::{ErrandError, ErrandResult};
use crate::orchestrator::ErrandTarget;
use crate::BoxFuture;

/// What the cloud needs to know to create one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    pub resource_pool: String,
}

/// Infrastructure seam for VM creation and deletion.
pub trait Cloud: Send + Sync {
    /// Create a VM and return its cloud id.
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Delete a VM. Deleting a VM that no longer exists succeeds.
    fn delete_vm<'a>(&'a self, vm_cid: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Creates and deletes the instances an errand runs on.
pub trait InstanceLifecycle: Send + Sync {
    /// Bring the job's instances in line with its declared topology.
    fn provision_instances<'a>(
        &'a self,
        target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>>;

    /// Delete every instance recorded for the job. `checkpoint` is consulted
    /// between deletions.
    fn decommission_instances<'a>(
        &'a self,
        target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<()>>;
}

// ── Local cloud ───────────────────────────────────────────────────

/// In-process cloud that only mints and forgets VM ids.
#[derive(Debug, Default)]
pub struct LocalCloud {
    vms: Mutex<HashSet<String>>,
}

impl LocalCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm_count(&self) -> usize {
        self.vms.lock().map(|vms| vms.len()).unwrap_or(0)
    }
}

impl Cloud for LocalCloud {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let vm_cid = format!("vm-{}", Uuid::new_v4());
            self.vms
                .lock()
                .map_err(|_| anyhow::anyhow!("local cloud state poisoned"))?
                .insert(vm_cid.clone());
            debug!(%vm_cid, job = %spec.job, index = spec.index, "vm created");
            Ok(vm_cid)
        })
    }

    fn delete_vm<'a>(&'a self, vm_cid: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let existed = self
                .vms
                .lock()
                .map_err(|_| anyhow::anyhow!("local cloud state poisoned"))?
                .remove(vm_cid);
            debug!(%vm_cid, existed, "vm deleted");
            Ok(())
        })
    }
}

// ── Cloud-backed lifecycle ────────────────────────────────────────

pub struct CloudInstanceLifecycle<C> {
    cloud: C,
    state: StateStore,
}

impl<C: Cloud> CloudInstanceLifecycle<C> {
    pub fn new(cloud: C, state: StateStore) -> Self {
        Self { cloud, state }
    }

    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    async fn provision_one(&self, spec: &VmSpec, recreate: bool) -> anyhow::Result<()> {
        let key = instance_key(&spec.deployment, &spec.job, spec.index);
        if let Some(existing) = self.state.get_instance(&key)? {
            if !recreate && existing.status == InstanceStatus::Running {
                debug!(instance = %key, vm_cid = %existing.vm_cid, "reusing instance");
                return Ok(());
            }
            self.delete_vm_of(&existing).await?;
            self.state.delete_instance(&key)?;
        }

        let mut record = InstanceRecord {
            deployment: spec.deployment.clone(),
            job: spec.job.clone(),
            index: spec.index,
            vm_cid: String::new(),
            status: InstanceStatus::Creating,
            created_at: epoch_secs(),
        };
        // Recorded before the cloud call so a later decommission finds it.
        self.state.put_instance(&record)?;
        record.vm_cid = self
            .cloud
            .create_vm(spec)
            .await
            .with_context(|| format!("create vm for {key}"))?;
        record.status = InstanceStatus::Running;
        self.state.put_instance(&record)?;
        info!(instance = %key, vm_cid = %record.vm_cid, "instance provisioned");
        Ok(())
    }

    async fn decommission_one(&self, mut record: InstanceRecord) -> anyhow::Result<()> {
        let key = record.table_key();
        record.status = InstanceStatus::Deleting;
        self.state.put_instance(&record)?;
        self.delete_vm_of(&record).await?;
        self.state.delete_instance(&key)?;
        info!(instance = %key, vm_cid = %record.vm_cid, "instance decommissioned");
        Ok(())
    }

    /// Delete the VM behind `record`, if creation ever returned one.
    async fn delete_vm_of(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        if record.vm_cid.is_empty() {
            debug!(instance = %record.table_key(), "no vm recorded");
            return Ok(());
        }
        self.cloud
            .delete_vm(&record.vm_cid)
            .await
            .with_context(|| format!("delete vm {} of {}", record.vm_cid, record.table_key()))
    }
}

impl<C: Cloud> InstanceLifecycle for CloudInstanceLifecycle<C> {
    fn provision_instances<'a>(
        &'a self,
        target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            let job = &target.job;
            for instance in &job.instances {
                let spec = VmSpec {
                    deployment: target.deployment.name.clone(),
                    job: job.name.clone(),
                    index: instance.index,
                    resource_pool: job.resource_pool.clone(),
                };
                self.provision_one(&spec, target.deployment.recreate)
                    .await
                    .map_err(|e| ErrandError::Provisioning(format!("{e:#}")))?;
            }
            Ok(())
        })
    }

    fn decommission_instances<'a>(
        &'a self,
        target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            let records = self
                .state
                .list_instances_for_job(&target.deployment.name, &target.job.name)?;

            let mut failures = Vec::new();
            for record in records {
                checkpoint.check()?;
                let key = record.table_key();
                if let Err(e) = self.decommission_one(record).await {
                    error!(instance = %key, error = %format!("{e:#}"), "decommission failed");
                    failures.push(format!("{key}: {e:#}"));
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(ErrandError::Decommission(failures.join("; ")))
            }
        })
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
