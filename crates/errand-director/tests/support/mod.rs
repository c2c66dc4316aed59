//! Recording collaborators for orchestrator tests.
//!
//! Every mock appends to one shared call log so tests can assert the exact
//! order the orchestrator drives its collaborators in.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use errand_director::*;
use errand_state::{DeploymentRecord, PoolDelta, TaskRecord, TaskState};

pub const DEPLOYMENT: &str = "deployment";
pub const ERRAND: &str = "fake-errand-name";
pub const TASK_ID: &str = "fake-task-id";
pub const POOL: &str = "fake-pool";
pub const SHORT_DESCRIPTION: &str = "fake-result-short-description";

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn log(calls: &CallLog, entry: impl Into<String>) {
    calls.lock().unwrap().push(entry.into());
}

// ── Plans ─────────────────────────────────────────────────────────

pub fn job(name: &str, lifecycle: Lifecycle, instances: u32) -> JobPlan {
    JobPlan {
        name: name.to_string(),
        lifecycle,
        instances: (0..instances)
            .map(|index| InstancePlan {
                job: name.to_string(),
                index,
            })
            .collect(),
        resource_pool: POOL.to_string(),
        errand: None,
    }
}

pub fn plan(jobs: Vec<JobPlan>) -> DeploymentPlan {
    DeploymentPlan {
        name: DEPLOYMENT.to_string(),
        resource_pools: vec![ResourcePoolPlan {
            name: POOL.to_string(),
            size: 0,
            max_size: 10,
        }],
        jobs,
        recreate: false,
    }
}

pub fn request() -> RunErrand {
    RunErrand::new(DEPLOYMENT, ERRAND, TASK_ID)
}

// ── Mocks ─────────────────────────────────────────────────────────

pub struct MockRepository {
    calls: CallLog,
    pub exists: AtomicBool,
}

impl DeploymentRepository for MockRepository {
    fn find_deployment_by_name(&self, name: &str) -> ErrandResult<Option<DeploymentRecord>> {
        log(&self.calls, format!("find_deployment {name}"));
        if !self.exists.load(Ordering::SeqCst) || name != DEPLOYMENT {
            return Ok(None);
        }
        Ok(Some(DeploymentRecord {
            name: name.to_string(),
            manifest: "fake-manifest".to_string(),
            created_at: 0,
            updated_at: 0,
        }))
    }
}

pub struct MockParser {
    calls: CallLog,
    pub plan: Mutex<DeploymentPlan>,
}

impl ManifestParser for MockParser {
    fn parse(
        &self,
        manifest: &str,
        _events: &dyn EventSink,
        _options: &ParseOptions,
    ) -> ErrandResult<DeploymentPlan> {
        log(&self.calls, format!("parse {manifest}"));
        Ok(self.plan.lock().unwrap().clone())
    }
}

/// Task store holding a single task whose state tests flip directly.
pub struct MockTasks {
    pub state: Mutex<TaskState>,
}

impl MockTasks {
    pub fn new(state: TaskState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set(&self, state: TaskState) {
        *self.state.lock().unwrap() = state;
    }
}

impl TaskStore for MockTasks {
    fn find_task(&self, task_id: &str) -> ErrandResult<TaskRecord> {
        if task_id != TASK_ID {
            return Err(ErrandError::TaskNotFound(task_id.to_string()));
        }
        Ok(TaskRecord {
            id: task_id.to_string(),
            job_type: "run_errand".to_string(),
            description: String::new(),
            state: *self.state.lock().unwrap(),
            result: None,
            created_at: 0,
            updated_at: 0,
        })
    }
}

/// A [`LocalLock`] that logs acquisition, release and requested timeouts.
pub struct RecordingLock {
    calls: CallLog,
    inner: LocalLock,
    pub timeouts: Mutex<Vec<Duration>>,
}

struct LoggedRelease {
    calls: CallLog,
    resource: String,
    _inner: LockGuard,
}

impl Drop for LoggedRelease {
    fn drop(&mut self) {
        log(&self.calls, format!("release {}", self.resource));
    }
}

impl DistributedLock for RecordingLock {
    fn acquire<'a>(
        &'a self,
        resource: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ErrandResult<LockGuard>> {
        Box::pin(async move {
            self.timeouts.lock().unwrap().push(timeout);
            let inner = self.inner.acquire(resource, timeout).await?;
            log(&self.calls, format!("acquire {resource}"));
            Ok(LockGuard::new(
                resource,
                LoggedRelease {
                    calls: Arc::clone(&self.calls),
                    resource: resource.to_string(),
                    _inner: inner,
                },
            ))
        })
    }
}

pub struct MockPreparer {
    calls: CallLog,
    pub fail_job: AtomicBool,
}

impl DeploymentPreparer for MockPreparer {
    fn prepare_deployment<'a>(
        &'a self,
        _target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            log(&self.calls, "prepare_deployment");
            Ok(())
        })
    }

    fn prepare_job<'a>(&'a self, _target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            log(&self.calls, "prepare_job");
            if self.fail_job.load(Ordering::SeqCst) {
                return Err(ErrandError::Preparation("fake-preparation-error".to_string()));
            }
            Ok(())
        })
    }
}

pub struct MockLedger {
    calls: CallLog,
    pub fail_shrink: AtomicBool,
    pub grown: Mutex<Vec<Vec<PoolDelta>>>,
    pub shrunk: Mutex<Vec<Vec<PoolDelta>>>,
}

impl PoolLedger for MockLedger {
    fn grow(&self, deltas: &[PoolDelta]) -> ErrandResult<()> {
        log(&self.calls, "grow_pools");
        self.grown.lock().unwrap().push(deltas.to_vec());
        Ok(())
    }

    fn shrink(&self, deltas: &[PoolDelta]) -> ErrandResult<()> {
        log(&self.calls, "shrink_pools");
        self.shrunk.lock().unwrap().push(deltas.to_vec());
        if self.fail_shrink.load(Ordering::SeqCst) {
            return Err(ErrandError::ResourceAllocation("fake-restore-error".to_string()));
        }
        Ok(())
    }
}

pub struct MockInstances {
    calls: CallLog,
    pub fail_provision: AtomicBool,
    pub fail_decommission: AtomicBool,
    /// Whether the checkpoint passed when evaluated inside decommission.
    pub cleanup_checkpoint: Mutex<Vec<bool>>,
}

impl InstanceLifecycle for MockInstances {
    fn provision_instances<'a>(
        &'a self,
        _target: &'a ErrandTarget,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            log(&self.calls, "provision_instances");
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(ErrandError::Provisioning("fake-provision-error".to_string()));
            }
            Ok(())
        })
    }

    fn decommission_instances<'a>(
        &'a self,
        _target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            log(&self.calls, "decommission_instances");
            self.cleanup_checkpoint
                .lock()
                .unwrap()
                .push(checkpoint.check().is_ok());
            if self.fail_decommission.load(Ordering::SeqCst) {
                return Err(ErrandError::Decommission("fake-decommission-error".to_string()));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    Succeed,
    Fail,
    /// Evaluate the checkpoint once, then succeed.
    Checkpoint,
    Panic,
}

pub struct MockRunner {
    calls: CallLog,
    pub behavior: Mutex<RunBehavior>,
    pub fail_cancel: AtomicBool,
}

impl MockRunner {
    pub fn set(&self, behavior: RunBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

fn fake_result() -> RunResult {
    RunResult {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
        short_description: SHORT_DESCRIPTION.to_string(),
    }
}

impl RemoteRunner for MockRunner {
    fn run<'a>(
        &'a self,
        _target: &'a ErrandTarget,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, ErrandResult<RunResult>> {
        Box::pin(async move {
            log(&self.calls, "run");
            let behavior = *self.behavior.lock().unwrap();
            match behavior {
                RunBehavior::Succeed => Ok(fake_result()),
                RunBehavior::Fail => Err(ErrandError::Execution("fake-run-error".to_string())),
                RunBehavior::Checkpoint => {
                    checkpoint.check()?;
                    Ok(fake_result())
                }
                RunBehavior::Panic => panic!("fake-runner-panic"),
            }
        })
    }

    fn cancel<'a>(&'a self, _target: &'a ErrandTarget) -> BoxFuture<'a, ErrandResult<()>> {
        Box::pin(async move {
            log(&self.calls, "cancel");
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(ErrandError::RemoteAgent("fake-cancel-error".to_string()));
            }
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<Event>>,
}

impl EventSink for RecordingEvents {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

// ── Harness ───────────────────────────────────────────────────────

/// One set of mocks, defaulting to a successful run of a one-instance
/// errand job.
pub struct Harness {
    pub calls: CallLog,
    pub repository: Arc<MockRepository>,
    pub parser: Arc<MockParser>,
    pub tasks: Arc<MockTasks>,
    pub lock: Arc<RecordingLock>,
    pub preparer: Arc<MockPreparer>,
    pub ledger: Arc<MockLedger>,
    pub instances: Arc<MockInstances>,
    pub runner: Arc<MockRunner>,
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    pub fn new() -> Self {
        let calls: CallLog = Arc::default();
        Self {
            repository: Arc::new(MockRepository {
                calls: Arc::clone(&calls),
                exists: AtomicBool::new(true),
            }),
            parser: Arc::new(MockParser {
                calls: Arc::clone(&calls),
                plan: Mutex::new(plan(vec![job(ERRAND, Lifecycle::Errand, 1)])),
            }),
            tasks: Arc::new(MockTasks::new(TaskState::Running)),
            lock: Arc::new(RecordingLock {
                calls: Arc::clone(&calls),
                inner: LocalLock::new(),
                timeouts: Mutex::new(Vec::new()),
            }),
            preparer: Arc::new(MockPreparer {
                calls: Arc::clone(&calls),
                fail_job: AtomicBool::new(false),
            }),
            ledger: Arc::new(MockLedger {
                calls: Arc::clone(&calls),
                fail_shrink: AtomicBool::new(false),
                grown: Mutex::new(Vec::new()),
                shrunk: Mutex::new(Vec::new()),
            }),
            instances: Arc::new(MockInstances {
                calls: Arc::clone(&calls),
                fail_provision: AtomicBool::new(false),
                fail_decommission: AtomicBool::new(false),
                cleanup_checkpoint: Mutex::new(Vec::new()),
            }),
            runner: Arc::new(MockRunner {
                calls: Arc::clone(&calls),
                behavior: Mutex::new(RunBehavior::Succeed),
                fail_cancel: AtomicBool::new(false),
            }),
            events: Arc::new(RecordingEvents::default()),
            calls,
        }
    }

    pub fn set_plan(&self, plan: DeploymentPlan) {
        *self.parser.plan.lock().unwrap() = plan;
    }

    pub fn services(&self) -> ErrandServices {
        self.services_with_tasks(self.tasks.clone())
    }

    pub fn services_with_tasks(&self, tasks: Arc<dyn TaskStore>) -> ErrandServices {
        ErrandServices {
            deployments: self.repository.clone(),
            manifest_parser: self.parser.clone(),
            tasks,
            lock: self.lock.clone(),
            preparer: self.preparer.clone(),
            pool_ledger: self.ledger.clone(),
            instances: self.instances.clone(),
            runner: self.runner.clone(),
            events: self.events.clone(),
        }
    }

    pub fn orchestrator(&self) -> ErrandOrchestrator {
        ErrandOrchestrator::new(self.services(), DirectorConfig::default())
    }

    pub fn orchestrator_with(&self, config: DirectorConfig) -> ErrandOrchestrator {
        ErrandOrchestrator::new(self.services(), config)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }
}
