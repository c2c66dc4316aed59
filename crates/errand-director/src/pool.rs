//! Resource pool accounting for errand runs.
//!
//! A [`ResourcePoolManager`] is built per run from one [`PoolUpdater`] per
//! job. `apply` grows the shared pools by what the job needs; `restore`
//! shrinks them by exactly what `apply` granted. Both go through a
//! [`PoolLedger`], which only ever applies deltas.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use errand_state::{PoolDelta, StateError, StateStore};

use crate::error::{ErrandError, ErrandResult};
use crate::manifest::JobPlan;

/// Shared capacity accounting.
pub trait PoolLedger: Send + Sync {
    /// Grow every pool by its delta, or none of them.
    fn grow(&self, deltas: &[PoolDelta]) -> ErrandResult<()>;

    /// Shrink every pool by its delta.
    fn shrink(&self, deltas: &[PoolDelta]) -> ErrandResult<()>;
}

impl PoolLedger for StateStore {
    fn grow(&self, deltas: &[PoolDelta]) -> ErrandResult<()> {
        self.grow_pools(deltas).map(|_| ()).map_err(|e| match e {
            StateError::CapacityExceeded { .. } | StateError::NotFound(_) => {
                ErrandError::ResourceAllocation(e.to_string())
            }
            other => ErrandError::State(other),
        })
    }

    fn shrink(&self, deltas: &[PoolDelta]) -> ErrandResult<()> {
        self.shrink_pools(deltas)?;
        Ok(())
    }
}

/// Capacity one job needs from one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUpdater {
    pub pool: String,
    pub required: u32,
}

impl PoolUpdater {
    pub fn for_job(job: &JobPlan) -> Self {
        Self {
            pool: job.resource_pool.clone(),
            required: u32::try_from(job.instances.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Grows pools for one run and gives the capacity back afterwards.
pub struct ResourcePoolManager {
    ledger: Arc<dyn PoolLedger>,
    updaters: Vec<PoolUpdater>,
    /// What `apply` granted and `restore` has not yet returned.
    granted: Mutex<Vec<PoolDelta>>,
}

impl ResourcePoolManager {
    pub fn new(ledger: Arc<dyn PoolLedger>, updaters: Vec<PoolUpdater>) -> Self {
        Self {
            ledger,
            updaters,
            granted: Mutex::new(Vec::new()),
        }
    }

    /// Per-pool deltas, merged when several updaters share a pool.
    fn deltas(&self) -> Vec<PoolDelta> {
        let mut merged: BTreeMap<&str, u32> = BTreeMap::new();
        for updater in &self.updaters {
            if updater.required == 0 {
                continue;
            }
            let entry = merged.entry(updater.pool.as_str()).or_default();
            *entry = entry.saturating_add(updater.required);
        }
        merged
            .into_iter()
            .map(|(pool, count)| PoolDelta::new(pool, count))
            .collect()
    }

    /// Grow every affected pool, or fail without allocating anything.
    pub async fn apply(&self) -> ErrandResult<()> {
        let mut granted = self.granted.lock().await;
        if !granted.is_empty() {
            debug!("resource pools already applied for this run");
            return Ok(());
        }

        let deltas = self.deltas();
        self.ledger.grow(&deltas).map_err(|e| match e {
            ErrandError::ResourceAllocation(_) => e,
            other => ErrandError::ResourceAllocation(other.to_string()),
        })?;
        for delta in &deltas {
            info!(pool = %delta.pool, count = delta.count, "resource pool grown");
        }
        *granted = deltas;
        Ok(())
    }

    /// Return whatever `apply` granted. Safe to call when `apply` never ran
    /// or failed.
    pub async fn restore(&self) -> ErrandResult<()> {
        let mut granted = self.granted.lock().await;
        let deltas = std::mem::take(&mut *granted);
        if let Err(e) = self.ledger.shrink(&deltas) {
            // Keep the grant so a later restore can retry it.
            *granted = deltas;
            return Err(e);
        }
        for delta in &deltas {
            info!(pool = %delta.pool, count = delta.count, "resource pool restored");
        }
        Ok(())
    }
}
