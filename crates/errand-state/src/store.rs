//! StateStore — redb-backed state persistence for the errand director.
//!
//! Provides typed operations over deployments, tasks, resource pools, and
//! instances. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Every table maps `&str` keys to JSON bytes.
type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: serde::Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// List every value whose key starts with `prefix` (empty prefix lists all).
    fn list<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete(&self, table_def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put(DEPLOYMENTS, &record.name, record)?;
        debug!(deployment = %record.name, "deployment stored");
        Ok(())
    }

    /// Get a deployment by name.
    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, name)
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.list(DEPLOYMENTS, "")
    }

    /// Delete a deployment by name. Returns true if it existed.
    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(DEPLOYMENTS, name)?;
        debug!(deployment = %name, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Create a new task in the `Queued` state.
    pub fn create_task(
        &self,
        id: &str,
        job_type: &str,
        description: &str,
    ) -> StateResult<TaskRecord> {
        let now = epoch_secs();
        let task = TaskRecord {
            id: id.to_string(),
            job_type: job_type.to_string(),
            description: description.to_string(),
            state: TaskState::Queued,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.put(TASKS, id, &task)?;
        debug!(task_id = %id, %job_type, "task created");
        Ok(task)
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &str) -> StateResult<Option<TaskRecord>> {
        self.get(TASKS, id)
    }

    /// List all tasks.
    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list(TASKS, "")
    }

    /// Delete a task by id. Returns true if it existed.
    pub fn delete_task(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(TASKS, id)?;
        debug!(task_id = %id, existed, "task deleted");
        Ok(existed)
    }

    /// Overwrite a task's state.
    pub fn set_task_state(&self, id: &str, state: TaskState) -> StateResult<TaskRecord> {
        self.update_task(id, |task| {
            task.state = state;
            Ok(())
        })
    }

    /// Mark a queued or running task as `Cancelling`.
    ///
    /// The running job observes the request at its next checkpoint.
    pub fn request_cancellation(&self, id: &str) -> StateResult<TaskRecord> {
        let task = self.update_task(id, |task| match task.state {
            TaskState::Queued | TaskState::Running => {
                task.state = TaskState::Cancelling;
                Ok(())
            }
            from => Err(StateError::InvalidTransition {
                task_id: task.id.clone(),
                from,
                to: TaskState::Cancelling,
            }),
        })?;
        debug!(task_id = %id, "task cancellation requested");
        Ok(task)
    }

    /// Record a terminal state and optional result payload for a task.
    pub fn finish_task(
        &self,
        id: &str,
        state: TaskState,
        result: Option<String>,
    ) -> StateResult<TaskRecord> {
        self.update_task(id, |task| {
            task.state = state;
            task.result = result;
            Ok(())
        })
    }

    /// Attach a result payload to a task without changing its state.
    pub fn set_task_result(&self, id: &str, result: &str) -> StateResult<TaskRecord> {
        self.update_task(id, |task| {
            task.result = Some(result.to_string());
            Ok(())
        })
    }

    /// Read-modify-write a task inside one write transaction.
    fn update_task(
        &self,
        id: &str,
        apply: impl FnOnce(&mut TaskRecord) -> StateResult<()>,
    ) -> StateResult<TaskRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut task: TaskRecord = {
                let guard = table
                    .get(id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("task {id}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            // An error here drops the transaction uncommitted.
            apply(&mut task)?;
            task.updated_at = epoch_secs();
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(task)
    }

    // ── Resource pools ─────────────────────────────────────────────

    /// Register a pool, or refresh the ceiling of an existing one.
    ///
    /// An existing pool keeps its current `size`: other runs may hold
    /// capacity in it.
    pub fn register_pool(
        &self,
        name: &str,
        size: u32,
        max_size: u32,
    ) -> StateResult<ResourcePoolRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let existing: Option<ResourcePoolRecord> =
                match table.get(name).map_err(map_err!(Read))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                    }
                    None => None,
                };
            let record = match existing {
                Some(mut pool) => {
                    pool.max_size = max_size.max(pool.size);
                    pool.updated_at = epoch_secs();
                    pool
                }
                None => ResourcePoolRecord {
                    name: name.to_string(),
                    size,
                    max_size: max_size.max(size),
                    updated_at: epoch_secs(),
                },
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            pool = %name,
            size = record.size,
            max_size = record.max_size,
            "resource pool registered"
        );
        Ok(record)
    }

    /// Get a pool by name.
    pub fn get_pool(&self, name: &str) -> StateResult<Option<ResourcePoolRecord>> {
        self.get(POOLS, name)
    }

    /// List all pools.
    pub fn list_pools(&self) -> StateResult<Vec<ResourcePoolRecord>> {
        self.list(POOLS, "")
    }

    /// Grow every listed pool, all or nothing.
    ///
    /// If any pool is unknown or would exceed its `max_size`, the
    /// transaction is dropped and no pool changes.
    pub fn grow_pools(&self, deltas: &[PoolDelta]) -> StateResult<Vec<ResourcePoolRecord>> {
        self.adjust_pools(deltas, |pool, count| {
            let grown = pool.size.saturating_add(count);
            if grown > pool.max_size {
                return Err(StateError::CapacityExceeded {
                    pool: pool.name.clone(),
                    requested: count,
                    size: pool.size,
                    max_size: pool.max_size,
                });
            }
            pool.size = grown;
            Ok(())
        })
    }

    /// Shrink every listed pool by its delta, saturating at zero.
    pub fn shrink_pools(&self, deltas: &[PoolDelta]) -> StateResult<Vec<ResourcePoolRecord>> {
        self.adjust_pools(deltas, |pool, count| {
            pool.size = pool.size.saturating_sub(count);
            Ok(())
        })
    }

    fn adjust_pools(
        &self,
        deltas: &[PoolDelta],
        adjust: impl Fn(&mut ResourcePoolRecord, u32) -> StateResult<()>,
    ) -> StateResult<Vec<ResourcePoolRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut updated = Vec::with_capacity(deltas.len());
        {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            for delta in deltas {
                let mut pool: ResourcePoolRecord = {
                    let guard = table
                        .get(delta.pool.as_str())
                        .map_err(map_err!(Read))?
                        .ok_or_else(|| {
                            StateError::NotFound(format!("resource pool {}", delta.pool))
                        })?;
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                };
                adjust(&mut pool, delta.count)?;
                pool.updated_at = epoch_secs();
                let value = serde_json::to_vec(&pool).map_err(map_err!(Serialize))?;
                table
                    .insert(delta.pool.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                updated.push(pool);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &record.table_key(), record)
    }

    /// Get an instance by its composite key.
    pub fn get_instance(&self, key: &str) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, key)
    }

    /// List all instances of one job within a deployment.
    pub fn list_instances_for_job(
        &self,
        deployment: &str,
        job: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        self.list(INSTANCES, &format!("{deployment}/{job}/"))
    }

    /// Delete an instance by key. Returns true if it existed.
    pub fn delete_instance(&self, key: &str) -> StateResult<bool> {
        self.delete(INSTANCES, key)
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
