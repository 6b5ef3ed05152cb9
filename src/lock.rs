//! Cluster-wide mutual exclusion keyed by resource.
//!
//! A lock is identified by `(resource_id, resource_type, tenant_id)`.
//! Tenant id [`PLATFORM_SCOPE`] marks a platform-wide resource that is not
//! owned by any tenant.
//!
//! The in-memory implementation serializes tasks within one process. A
//! clustered deployment plugs in a backend over shared storage (e.g. Postgres
//! advisory locks) behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::LockError;

/// Tenant id for platform-wide locks.
pub const PLATFORM_SCOPE: i64 = -1;

/// Identity of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub resource_id: i64,
    pub resource_type: String,
    pub tenant_id: i64,
}

impl LockKey {
    pub fn new(resource_id: i64, resource_type: impl Into<String>, tenant_id: i64) -> Self {
        Self {
            resource_id,
            resource_type: resource_type.into(),
            tenant_id,
        }
    }
}

/// Proof of ownership returned by a successful acquisition.
///
/// Must be handed back to [`LockService::unlock`]; dropping it does not
/// release the lock.
#[derive(Debug)]
pub struct LockToken {
    key: LockKey,
    owner: u64,
    acquired_at: Instant,
}

impl LockToken {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Time since the lock was acquired.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Mutual exclusion over named resources.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Block until the lock is acquired or the service timeout elapses.
    async fn lock(
        &self,
        resource_id: i64,
        resource_type: &str,
        tenant_id: i64,
    ) -> Result<LockToken, LockError>;

    /// Wait at most `timeout`; `Ok(None)` when the lock stayed busy.
    async fn try_lock(
        &self,
        resource_id: i64,
        resource_type: &str,
        tenant_id: i64,
        timeout: Duration,
    ) -> Result<Option<LockToken>, LockError>;

    /// Release a lock previously acquired through this service.
    async fn unlock(&self, token: LockToken) -> Result<(), LockError>;
}

/// Process-local lock table.
pub struct MemoryLockService {
    held: Mutex<HashMap<LockKey, u64>>,
    released: Notify,
    next_owner: AtomicU64,
    timeout: Duration,
}

impl MemoryLockService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_owner: AtomicU64::new(1),
            timeout,
        }
    }

    /// Whether some owner currently holds `key`.
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.table().contains_key(key)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, u64>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn try_acquire(&self, key: &LockKey) -> Option<LockToken> {
        let mut table = self.table();
        if table.contains_key(key) {
            return None;
        }
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        table.insert(key.clone(), owner);
        Some(LockToken {
            key: key.clone(),
            owner,
            acquired_at: Instant::now(),
        })
    }

    async fn acquire_until(&self, key: &LockKey, deadline: Instant) -> Option<LockToken> {
        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.try_acquire(key) {
                return Some(token);
            }

            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn lock(
        &self,
        resource_id: i64,
        resource_type: &str,
        tenant_id: i64,
    ) -> Result<LockToken, LockError> {
        let key = LockKey::new(resource_id, resource_type, tenant_id);
        let start = Instant::now();
        match self.acquire_until(&key, start + self.timeout).await {
            Some(token) => {
                tracing::trace!(resource_id, resource_type, tenant_id, "lock acquired");
                Ok(token)
            }
            None => Err(LockError::Timeout {
                resource_id,
                resource_type: resource_type.to_string(),
                tenant_id,
                waited_ms: start.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn try_lock(
        &self,
        resource_id: i64,
        resource_type: &str,
        tenant_id: i64,
        timeout: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let key = LockKey::new(resource_id, resource_type, tenant_id);
        Ok(self.acquire_until(&key, Instant::now() + timeout).await)
    }

    async fn unlock(&self, token: LockToken) -> Result<(), LockError> {
        {
            let mut table = self.table();
            match table.get(&token.key) {
                Some(owner) if *owner == token.owner => {
                    table.remove(&token.key);
                }
                Some(_) => {
                    return Err(LockError::NotOwner {
                        resource_id: token.key.resource_id,
                        resource_type: token.key.resource_type.clone(),
                    })
                }
                None => {
                    return Err(LockError::Released {
                        resource_id: token.key.resource_id,
                        resource_type: token.key.resource_type.clone(),
                    })
                }
            }
        }
        self.released.notify_waiters();
        tracing::trace!(
            resource_id = token.key.resource_id,
            resource_type = %token.key.resource_type,
            held_ms = token.held_for().as_millis() as u64,
            "lock released"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let locks = MemoryLockService::new(Duration::from_millis(100));
        let token = locks.lock(1, "PLATFORM_INFO", PLATFORM_SCOPE).await.unwrap();
        assert!(locks.is_locked(token.key()));

        locks.unlock(token).await.unwrap();
        assert!(!locks.is_locked(&LockKey::new(1, "PLATFORM_INFO", PLATFORM_SCOPE)));

        // Immediately re-acquirable
        let again = locks.lock(1, "PLATFORM_INFO", PLATFORM_SCOPE).await.unwrap();
        locks.unlock(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let locks = MemoryLockService::new(Duration::from_millis(50));
        let a = locks.lock(1, "A", 1).await.unwrap();
        let b = locks.lock(1, "A", 2).await.unwrap();
        let c = locks.lock(2, "A", 1).await.unwrap();
        let d = locks.lock(1, "B", 1).await.unwrap();
        for t in [a, b, c, d] {
            locks.unlock(t).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_when_held() {
        let locks = MemoryLockService::new(Duration::from_millis(200));
        let _held = locks.lock(9, "R", 1).await.unwrap();

        let err = locks.lock(9, "R", 1).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { resource_id: 9, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_returns_none_on_contention() {
        let locks = MemoryLockService::new(Duration::from_secs(5));
        let held = locks.lock(3, "R", 1).await.unwrap();

        let attempt = locks
            .try_lock(3, "R", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(attempt.is_none());

        locks.unlock(held).await.unwrap();
        let attempt = locks
            .try_lock(3, "R", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(attempt.is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = Arc::new(MemoryLockService::new(Duration::from_secs(5)));
        let held = locks.lock(5, "R", 1).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock(5, "R", 1).await })
        };

        tokio::task::yield_now().await;
        locks.unlock(held).await.unwrap();

        let token = waiter.await.unwrap().unwrap();
        locks.unlock(token).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_unlock_reports_released() {
        let locks = MemoryLockService::new(Duration::from_millis(50));
        let token = locks.lock(1, "R", 1).await.unwrap();
        let forged = LockToken {
            key: token.key().clone(),
            owner: token.owner,
            acquired_at: Instant::now(),
        };
        locks.unlock(token).await.unwrap();

        let err = locks.unlock(forged).await.unwrap_err();
        assert!(matches!(err, LockError::Released { .. }));
    }

    #[tokio::test]
    async fn test_unlock_by_other_owner_rejected() {
        let locks = MemoryLockService::new(Duration::from_millis(50));
        let token = locks.lock(1, "R", 1).await.unwrap();
        let forged = LockToken {
            key: token.key().clone(),
            owner: token.owner + 100,
            acquired_at: Instant::now(),
        };

        let err = locks.unlock(forged).await.unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        locks.unlock(token).await.unwrap();
    }
}
