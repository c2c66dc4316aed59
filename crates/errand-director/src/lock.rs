//! Deployment-scoped mutual exclusion.
//!
//! A [`DistributedLock`] hands out a [`LockGuard`] per resource key; the
//! lock is released when the guard drops, including while unwinding.
//! [`LocalLock`] is the in-process implementation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{ErrandError, ErrandResult};
use crate::BoxFuture;

/// Lock key for all mutating work against one deployment.
pub fn deployment_lock_key(deployment: &str) -> String {
    format!("lock:deployment:{deployment}")
}

/// Acquire/release contract for a named lock.
pub trait DistributedLock: Send + Sync {
    /// Acquire `resource` within `timeout`, or fail with
    /// [`ErrandError::LockTimeout`].
    fn acquire<'a>(
        &'a self,
        resource: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ErrandResult<LockGuard>>;
}

/// Proof of lock ownership. Dropping it releases the lock.
pub struct LockGuard {
    resource: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    /// Wrap whatever value keeps the lock held; dropping it must release.
    pub fn new(resource: impl Into<String>, held: impl Send + Sync + 'static) -> Self {
        Self {
            resource: resource.into(),
            _held: Box::new(held),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(resource = %self.resource, "lock released");
    }
}

/// Run `f` while holding `resource`.
///
/// `f` is never invoked if the lock cannot be acquired in time.
pub async fn with_lock<L, F, Fut, T>(
    lock: &L,
    resource: &str,
    timeout: Duration,
    f: F,
) -> ErrandResult<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ErrandResult<T>>,
{
    let guard = lock.acquire(resource, timeout).await?;
    let result = f().await;
    drop(guard);
    result
}

type Slot = Arc<Mutex<()>>;
type Slots = Arc<std::sync::Mutex<HashMap<String, Slot>>>;

/// In-process lock: one async mutex per resource key. A key's entry lives
/// only while someone holds or waits for it.
#[derive(Default)]
pub struct LocalLock {
    slots: Slots,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, resource: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(resource.to_string()).or_default())
    }
}

/// Drop the entry for `resource` if `slot` is its last outside reference.
fn prune(slots: &Slots, resource: &str, slot: &Slot) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    let unused = slots
        .get(resource)
        .is_some_and(|entry| Arc::ptr_eq(entry, slot) && Arc::strong_count(slot) == 2);
    if unused {
        slots.remove(resource);
    }
}

/// Held mutex of one [`LocalLock`] key.
struct LocalHold {
    resource: String,
    slots: Slots,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        // Unlock first; the guard holds its own reference to the slot.
        self.guard.take();
        prune(&self.slots, &self.resource, &self.slot);
    }
}

impl DistributedLock for LocalLock {
    fn acquire<'a>(
        &'a self,
        resource: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ErrandResult<LockGuard>> {
        Box::pin(async move {
            let slot = self.slot(resource);
            let acquired = tokio::time::timeout(timeout, Arc::clone(&slot).lock_owned()).await;
            match acquired {
                Ok(guard) => {
                    debug!(%resource, "lock acquired");
                    let held = LocalHold {
                        resource: resource.to_string(),
                        slots: Arc::clone(&self.slots),
                        slot,
                        guard: Some(guard),
                    };
                    Ok(LockGuard::new(resource, held))
                }
                Err(_) => {
                    prune(&self.slots, resource, &slot);
                    warn!(%resource, ?timeout, "lock acquisition timed out");
                    Err(ErrandError::LockTimeout {
                        resource: resource.to_string(),
                        timeout,
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn key_is_scoped_to_deployment() {
        assert_eq!(deployment_lock_key("deployment"), "lock:deployment:deployment");
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let lock = LocalLock::new();
        let _guard = lock.acquire("lock:deployment:a", Duration::from_secs(1)).await.unwrap();

        let err = lock
            .acquire("lock:deployment:a", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ErrandError::LockTimeout { ref resource, .. } if resource == "lock:deployment:a"
        ));
    }

    #[tokio::test]
    async fn different_deployments_do_not_contend() {
        let lock = LocalLock::new();
        let _a = lock.acquire("lock:deployment:a", Duration::from_secs(1)).await.unwrap();
        let b = lock.acquire("lock:deployment:b", Duration::from_millis(20)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn with_lock_releases_after_error() {
        let lock = LocalLock::new();
        let result: ErrandResult<()> = with_lock(&lock, "k", Duration::from_secs(1), || async {
            Err(ErrandError::Execution("boom".to_string()))
        })
        .await;
        assert!(result.is_err());

        assert!(lock.acquire("k", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn with_lock_skips_body_on_timeout() {
        let lock = LocalLock::new();
        let _held = lock.acquire("k", Duration::from_secs(1)).await.unwrap();
        let ran = AtomicBool::new(false);

        let result = with_lock(&lock, "k", Duration::from_millis(20), || async {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ErrandError::LockTimeout { .. })));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn waiter_acquires_once_released() {
        let lock = Arc::new(LocalLock::new());
        let guard = lock.acquire("k", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                lock.acquire("k", Duration::from_secs(5)).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
    }

    fn slot_count(lock: &LocalLock) -> usize {
        lock.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let lock = LocalLock::new();
        for deployment in ["a", "b", "c"] {
            let key = deployment_lock_key(deployment);
            let _guard = lock.acquire(&key, Duration::from_secs(1)).await.unwrap();
            assert_eq!(slot_count(&lock), 1);
        }
        assert_eq!(slot_count(&lock), 0);
    }

    #[tokio::test]
    async fn key_survives_while_contended() {
        let lock = LocalLock::new();
        let guard = lock.acquire("k", Duration::from_secs(1)).await.unwrap();
        assert!(lock.acquire("k", Duration::from_millis(10)).await.is_err());
        // The timed-out waiter must not drop the holder's entry.
        assert_eq!(slot_count(&lock), 1);
        assert!(lock.acquire("k", Duration::from_millis(10)).await.is_err());

        drop(guard);
        assert_eq!(slot_count(&lock), 0);
        assert!(lock.acquire("k", Duration::from_millis(10)).await.is_ok());
    }
}
