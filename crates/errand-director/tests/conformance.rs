//! Contract suites applied to every implementation of a collaborator trait.

mod support;

use std::sync::Arc;
use std::time::Duration;

use errand_director::*;
use errand_state::{PoolDelta, StateStore, TaskState};

use support::*;

// ── DistributedLock ───────────────────────────────────────────────

async fn distributed_lock_contract(lock: &dyn DistributedLock) {
    let key = deployment_lock_key("conformance");

    let guard = lock.acquire(&key, Duration::from_secs(1)).await.unwrap();
    assert_eq!(guard.resource(), key);

    let contended = lock.acquire(&key, Duration::from_millis(20)).await;
    assert!(matches!(contended, Err(ErrandError::LockTimeout { .. })));

    let other = lock
        .acquire(&deployment_lock_key("elsewhere"), Duration::from_millis(20))
        .await;
    assert!(other.is_ok(), "locks on different deployments must not contend");
    drop(other);

    drop(guard);
    assert!(lock.acquire(&key, Duration::from_millis(20)).await.is_ok());

    let result: ErrandResult<u32> =
        with_lock(lock, &key, Duration::from_secs(1), || async { Ok(7) }).await;
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn local_lock_conforms() {
    distributed_lock_contract(&LocalLock::new()).await;
}

#[tokio::test]
async fn recording_lock_conforms() {
    let h = Harness::new();
    distributed_lock_contract(h.lock.as_ref()).await;
}

// ── TaskStore / checkpoint ────────────────────────────────────────

fn task_store_contract(tasks: Arc<dyn TaskStore>, task_id: &str, set_state: impl Fn(TaskState)) {
    let checkpoint = Checkpoint::new(Arc::clone(&tasks), task_id);
    let cleanup = checkpoint.ignoring_cancellation();

    set_state(TaskState::Running);
    assert!(checkpoint.check().is_ok());

    set_state(TaskState::Cancelling);
    assert!(matches!(checkpoint.check(), Err(ErrandError::TaskCancelled(_))));
    assert!(cleanup.check().is_ok());

    set_state(TaskState::TimedOut);
    assert!(matches!(checkpoint.check(), Err(ErrandError::TaskTimedOut(_))));
    assert!(cleanup.check().is_ok());

    let missing = Checkpoint::new(tasks, "no-such-task");
    assert!(matches!(missing.check(), Err(ErrandError::TaskNotFound(_))));
}

#[test]
fn state_store_conforms_as_task_store() {
    let store = StateStore::open_in_memory().unwrap();
    store.create_task(TASK_ID, "run_errand", "").unwrap();

    let writer = store.clone();
    task_store_contract(Arc::new(store), TASK_ID, move |state| {
        writer.set_task_state(TASK_ID, state).unwrap();
    });
}

#[test]
fn mock_tasks_conform_as_task_store() {
    let tasks = Arc::new(MockTasks::new(TaskState::Running));
    let writer = Arc::clone(&tasks);
    task_store_contract(tasks, TASK_ID, move |state| writer.set(state));
}

// ── PoolLedger ────────────────────────────────────────────────────

/// `ledger` must hold pool "p" at size 1 with ceiling 3; `size` reads it back.
fn pool_ledger_contract(ledger: &dyn PoolLedger, size: impl Fn() -> u32) {
    ledger.grow(&[PoolDelta::new("p", 2)]).unwrap();
    assert_eq!(size(), 3);

    let over = ledger.grow(&[PoolDelta::new("p", 1)]);
    assert!(matches!(over, Err(ErrandError::ResourceAllocation(_))));
    assert_eq!(size(), 3, "a failed grow must not allocate");

    ledger.shrink(&[PoolDelta::new("p", 2)]).unwrap();
    assert_eq!(size(), 1);

    ledger.shrink(&[]).unwrap();
    assert_eq!(size(), 1);
}

#[test]
fn state_store_conforms_as_pool_ledger() {
    let store = StateStore::open_in_memory().unwrap();
    store.register_pool("p", 1, 3).unwrap();

    let reader = store.clone();
    pool_ledger_contract(&store, move || reader.get_pool("p").unwrap().unwrap().size);
}

// ── QueuedJob ─────────────────────────────────────────────────────

/// Performs `job` through `run_task` once with the task running and once
/// with cancellation requested; the second must end `Cancelled`.
async fn queued_job_contract(make_job: impl Fn(&str) -> Box<dyn QueuedJob>, state: &StateStore) {
    let job = make_job("contract-ok");
    assert!(!job.job_type().is_empty());
    state.create_task("contract-ok", job.job_type(), "").unwrap();
    let outcome = run_task(state, "contract-ok", job.as_ref()).await;
    let task = state.get_task("contract-ok").unwrap().unwrap();
    assert!(task.state.is_terminal());
    assert_eq!(outcome.is_ok(), task.state == TaskState::Done);

    let job = make_job("contract-cancel");
    state.create_task("contract-cancel", job.job_type(), "").unwrap();
    state.request_cancellation("contract-cancel").unwrap();
    let outcome = run_task(state, "contract-cancel", job.as_ref()).await;
    assert!(matches!(outcome, Err(ref e) if e.is_cancellation()));
    assert_eq!(
        state.get_task("contract-cancel").unwrap().unwrap().state,
        TaskState::Cancelled
    );
}

#[tokio::test]
async fn run_errand_job_conforms() {
    let h = Harness::new();
    h.runner.set(RunBehavior::Checkpoint);
    let state = StateStore::open_in_memory().unwrap();
    let orchestrator = Arc::new(ErrandOrchestrator::new(
        h.services_with_tasks(Arc::new(state.clone())),
        DirectorConfig::default(),
    ));

    queued_job_contract(
        |task_id| {
            let job = RunErrandJob::new(
                Arc::clone(&orchestrator),
                RunErrand::new(DEPLOYMENT, ERRAND, task_id),
            );
            assert_eq!(job.job_type(), "run_errand");
            Box::new(job)
        },
        &state,
    )
    .await;
}
