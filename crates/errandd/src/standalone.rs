//! Standalone mode: every collaborator runs in this process.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use uuid::Uuid;

use errand_director::{
    run_task, CloudInstanceLifecycle, DirectorConfig, ErrandOrchestrator, ErrandServices,
    LocalCloud, LocalLock, ManifestParser, ProcessRunner, RunErrand, RunErrandJob, StatePreparer,
    TracingEventSink, YamlManifestParser,
};
use errand_state::{DeploymentRecord, StateStore};

pub const DEFAULT_LOG_FILTER: &str = "info,errandd=debug,errand_director=debug";

/// Open (or create) the state store under `data_dir`.
pub fn open_state(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("errandd.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(state)
}

/// Wire the in-process collaborators around one state store.
pub fn build_orchestrator(state: &StateStore, config: DirectorConfig) -> ErrandOrchestrator {
    let services = ErrandServices {
        deployments: Arc::new(state.clone()),
        manifest_parser: Arc::new(YamlManifestParser),
        tasks: Arc::new(state.clone()),
        lock: Arc::new(LocalLock::new()),
        preparer: Arc::new(StatePreparer::new(state.clone())),
        pool_ledger: Arc::new(state.clone()),
        instances: Arc::new(CloudInstanceLifecycle::new(LocalCloud::new(), state.clone())),
        runner: Arc::new(ProcessRunner::new(state.clone(), config.runner.poll_interval())),
        events: Arc::new(TracingEventSink),
    };
    ErrandOrchestrator::new(services, config)
}

/// Validate `manifest` and store it under the deployment's name.
pub fn deploy(
    state: &StateStore,
    manifest: &str,
    config: &DirectorConfig,
) -> anyhow::Result<DeploymentRecord> {
    let plan = YamlManifestParser.parse(manifest, &TracingEventSink, &config.manifest)?;

    let now = epoch_secs();
    let created_at = state
        .get_deployment(&plan.name)?
        .map_or(now, |existing| existing.created_at);
    let record = DeploymentRecord {
        name: plan.name,
        manifest: manifest.to_string(),
        created_at,
        updated_at: now,
    };
    state.put_deployment(&record)?;
    Ok(record)
}

/// Run one errand as a new task. Ctrl-C marks the task cancelling.
pub async fn run_errand(
    state: &StateStore,
    config: DirectorConfig,
    deployment: &str,
    errand: &str,
) -> anyhow::Result<String> {
    let task_id = Uuid::new_v4().to_string();
    state.create_task(
        &task_id,
        RunErrandJob::JOB_TYPE,
        &format!("run errand {errand} from deployment {deployment}"),
    )?;
    info!(%task_id, %deployment, %errand, "errand task created");

    let orchestrator = Arc::new(build_orchestrator(state, config));
    let job = RunErrandJob::new(orchestrator, RunErrand::new(deployment, errand, &task_id));

    let interrupt = {
        let state = state.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(%task_id, "interrupt received, cancelling errand");
                if let Err(e) = state.request_cancellation(&task_id) {
                    warn!(%task_id, error = %e, "cancellation request rejected");
                }
            }
        })
    };

    let outcome = run_task(state, &task_id, &job).await;
    interrupt.abort();
    Ok(outcome?)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
