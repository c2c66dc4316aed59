//! Deployment manifests and the plan an errand run is resolved against.
//!
//! A stored [`DeploymentRecord`] carries the raw manifest. A
//! [`ManifestParser`] turns it into a [`DeploymentPlan`]: the deployment's
//! jobs, their instances, and the resource pools they draw from.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use errand_state::{DeploymentRecord, StateStore};

use crate::error::{ErrandError, ErrandResult};
use crate::events::{Event, EventSink, EventState};

/// Extensible key/value options for manifest parsing.
pub type ParseOptions = HashMap<String, String>;

// ── Plan ──────────────────────────────────────────────────────────

/// A parsed deployment, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentPlan {
    pub name: String,
    pub resource_pools: Vec<ResourcePoolPlan>,
    pub jobs: Vec<JobPlan>,
    /// Recreate existing VMs instead of reusing them.
    pub recreate: bool,
}

impl DeploymentPlan {
    pub fn job(&self, name: &str) -> Option<&JobPlan> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn resource_pool(&self, name: &str) -> Option<&ResourcePoolPlan> {
        self.resource_pools.iter().find(|pool| pool.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePoolPlan {
    pub name: String,
    /// Baseline capacity.
    pub size: u32,
    pub max_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub instances: Vec<InstancePlan>,
    pub resource_pool: String,
    pub errand: Option<ErrandCommand>,
}

impl JobPlan {
    pub fn can_run_as_errand(&self) -> bool {
        self.lifecycle == Lifecycle::Errand
    }
}

/// Job lifecycle classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Service,
    Errand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePlan {
    pub job: String,
    pub index: u32,
}

impl InstancePlan {
    /// `<job>/<index>`
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }
}

/// The payload an errand job executes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrandCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ── Collaborator seams ────────────────────────────────────────────

/// Looks up stored deployments by name.
pub trait DeploymentRepository: Send + Sync {
    fn find_deployment_by_name(&self, name: &str) -> ErrandResult<Option<DeploymentRecord>>;
}

impl DeploymentRepository for StateStore {
    fn find_deployment_by_name(&self, name: &str) -> ErrandResult<Option<DeploymentRecord>> {
        Ok(self.get_deployment(name)?)
    }
}

/// Turns a raw manifest into a deployment plan.
pub trait ManifestParser: Send + Sync {
    fn parse(
        &self,
        manifest: &str,
        events: &dyn EventSink,
        options: &ParseOptions,
    ) -> ErrandResult<DeploymentPlan>;
}

// ── YAML manifests ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    name: String,
    #[serde(default)]
    resource_pools: Vec<PoolDoc>,
    #[serde(default)]
    jobs: Vec<JobDoc>,
}

#[derive(Debug, Deserialize)]
struct PoolDoc {
    name: String,
    #[serde(default)]
    size: u32,
    max_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct JobDoc {
    name: String,
    #[serde(default)]
    lifecycle: Lifecycle,
    #[serde(default)]
    instances: u32,
    resource_pool: String,
    errand: Option<ErrandCommand>,
}

/// Parses YAML deployment manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlManifestParser;

impl ManifestParser for YamlManifestParser {
    fn parse(
        &self,
        manifest: &str,
        events: &dyn EventSink,
        options: &ParseOptions,
    ) -> ErrandResult<DeploymentPlan> {
        let doc: ManifestDoc =
            serde_yaml::from_str(manifest).map_err(|e| ErrandError::Manifest(e.to_string()))?;
        events.record(Event::new("Parsing manifest", &doc.name, EventState::Started));

        match build_plan(doc, options) {
            Ok(plan) => {
                events.record(Event::new("Parsing manifest", &plan.name, EventState::Finished));
                debug!(
                    deployment = %plan.name,
                    jobs = plan.jobs.len(),
                    pools = plan.resource_pools.len(),
                    "manifest parsed"
                );
                Ok(plan)
            }
            Err(e) => {
                events.record(
                    Event::new("Parsing manifest", "manifest", EventState::Failed)
                        .with_detail(e.to_string()),
                );
                Err(e)
            }
        }
    }
}

fn build_plan(doc: ManifestDoc, options: &ParseOptions) -> ErrandResult<DeploymentPlan> {
    let mut resource_pools = Vec::with_capacity(doc.resource_pools.len());
    for pool in doc.resource_pools {
        let max_size = pool.max_size.unwrap_or(pool.size);
        if max_size < pool.size {
            return Err(ErrandError::Manifest(format!(
                "resource pool `{}' has max_size {} below size {}",
                pool.name, max_size, pool.size
            )));
        }
        resource_pools.push(ResourcePoolPlan {
            name: pool.name,
            size: pool.size,
            max_size,
        });
    }

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(doc.jobs.len());
    for job in doc.jobs {
        if !seen.insert(job.name.clone()) {
            return Err(ErrandError::Manifest(format!("duplicate job `{}'", job.name)));
        }
        if !resource_pools.iter().any(|pool| pool.name == job.resource_pool) {
            return Err(ErrandError::Manifest(format!(
                "job `{}' references unknown resource pool `{}'",
                job.name, job.resource_pool
            )));
        }
        let instances = (0..job.instances)
            .map(|index| InstancePlan {
                job: job.name.clone(),
                index,
            })
            .collect();
        jobs.push(JobPlan {
            name: job.name,
            lifecycle: job.lifecycle,
            instances,
            resource_pool: job.resource_pool,
            errand: job.errand,
        });
    }

    let recreate = options
        .get("recreate")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));

    Ok(DeploymentPlan {
        name: doc.name,
        resource_pools,
        jobs,
        recreate,
    })
}
