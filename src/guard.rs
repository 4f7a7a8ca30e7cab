use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::core::errors::{LoanError, Result};

/// One async mutex per loan number, created on first use.
///
/// Unrelated loans never contend; callers for the same loan are serialized.
/// Lookup-or-insert goes through the DashMap shard lock, so two callers
/// racing on a new loan number always end up with the same mutex.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Option<Duration>,
}

/// Exclusive access to one loan until dropped
#[derive(Debug)]
pub struct EntityGuard {
    entity_id: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl EntityGuard {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        debug!(
            loan = %self.entity_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released loan lock"
        );
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `LockTimeout` instead of waiting longer than `timeout`
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    fn mutex_for(&self, entity_id: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(entity_id) {
            return existing.clone();
        }
        self.locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `entity_id`
    pub async fn lock(&self, entity_id: &str) -> Result<EntityGuard> {
        let mutex = self.mutex_for(entity_id);
        let started = Instant::now();

        let guard = match self.timeout {
            None => mutex.lock_owned().await,
            Some(timeout) => match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(loan = %entity_id, waited_ms = timeout.as_millis() as u64, "Lock wait timed out");
                    return Err(LoanError::LockTimeout {
                        entity_id: entity_id.to_string(),
                        waited: timeout,
                    });
                }
            },
        };

        let waited = started.elapsed();
        if waited > Duration::from_millis(1) {
            debug!(loan = %entity_id, waited_ms = waited.as_millis() as u64, "Acquired loan lock after wait");
        }
        Ok(EntityGuard {
            entity_id: entity_id.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    /// Run `body` while holding the lock for `entity_id`.
    /// The lock is released on every exit path, errors and panics included.
    pub async fn with_lock<F, Fut, T>(&self, entity_id: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock(entity_id).await?;
        body().await
    }

    /// Whether some caller currently holds the lock for `entity_id`
    pub fn is_locked(&self, entity_id: &str) -> bool {
        self.locks
            .get(entity_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop mutexes nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_same_entity_is_serialized() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                table
                    .with_lock("LN-1", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_different_entities_do_not_block() {
        let table = LockTable::with_timeout(Some(Duration::from_millis(50)));
        let _held = table.lock("LN-1").await.unwrap();

        let other = table.lock("LN-2").await;
        assert!(other.is_ok());
        assert!(table.is_locked("LN-1"));
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let table = LockTable::with_timeout(Some(Duration::from_millis(20)));
        let _held = table.lock("LN-1").await.unwrap();

        let err = table.lock("LN-1").await.unwrap_err();
        assert!(matches!(err, LoanError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_released_on_error() {
        let table = LockTable::new();
        let result: Result<()> = table
            .with_lock("LN-1", || async { Err(LoanError::internal("boom")) })
            .await;
        assert!(result.is_err());
        assert!(!table.is_locked("LN-1"));
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let table = LockTable::new();
        let held = table.lock("LN-1").await.unwrap();
        drop(table.lock("LN-2").await.unwrap());

        assert_eq!(table.prune_idle(), 1);
        assert_eq!(table.len(), 1);
        drop(held);
        assert_eq!(table.prune_idle(), 1);
        assert!(table.is_empty());
    }
}
