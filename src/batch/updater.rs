//! Periodic flush of a [`BatchJob`] under a cluster lock.
//!
//! Each flush runs: pending check → lock → begin → flush → commit → unlock.
//! The unlock is attempted whatever happened in between. Nothing here
//! returns an error to the caller: failures are logged and the next period
//! tries again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::BatchJob;
use crate::lock::{LockService, PLATFORM_SCOPE};
use crate::transaction::TransactionManager;

/// Result of one [`BatchUpdater::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReport {
    /// Nothing accumulated; the lock was not taken.
    Idle,
    Flushed { units: usize },
    /// Logged; retried next period.
    Failed,
}

pub struct BatchUpdater<J: BatchJob> {
    job: Arc<J>,
    locks: Arc<dyn LockService>,
    transactions: Arc<TransactionManager>,
    period: Duration,
}

impl<J: BatchJob> BatchUpdater<J> {
    pub fn new(
        job: Arc<J>,
        locks: Arc<dyn LockService>,
        transactions: Arc<TransactionManager>,
        period: Duration,
    ) -> Self {
        Self {
            job,
            locks,
            transactions,
            period,
        }
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Flush once if anything is pending.
    pub async fn run_once(&self) -> FlushReport {
        if !self.job.has_pending() {
            return FlushReport::Idle;
        }

        let (resource_id, resource_type) = self.job.lock_resource();
        let token = match self
            .locks
            .lock(resource_id, resource_type, PLATFORM_SCOPE)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                error!(job = self.job.name(), error = %e, "Unable to acquire batch lock");
                return FlushReport::Failed;
            }
        };

        let result = self.flush_in_transaction().await;

        if let Err(e) = self.locks.unlock(token).await {
            error!(
                job = self.job.name(),
                resource_id,
                resource_type,
                error = %e,
                "Unable to release batch lock, node restart required to clear it"
            );
        }

        match result {
            Ok(units) => {
                debug!(job = self.job.name(), units, "Batch flushed");
                FlushReport::Flushed { units }
            }
            Err(e) => {
                error!(job = self.job.name(), error = %format!("{:#}", e), "Batch flush failed");
                FlushReport::Failed
            }
        }
    }

    async fn flush_in_transaction(&self) -> Result<usize> {
        let mut tx = self.transactions.begin();
        match self.job.flush(&mut tx).await {
            Ok(units) => {
                tx.commit()?;
                Ok(units)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Flush every period until shutdown, then once more.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        info!(
            job = self.job.name(),
            period_ms = self.period.as_millis() as u64,
            "Batch updater started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        self.run_once().await;
        info!(job = self.job.name(), "Batch updater stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockService;
    use crate::transaction::Transaction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const RESOURCE_ID: i64 = 12;
    const RESOURCE_TYPE: &str = "TEST_BATCH";

    #[derive(Default)]
    struct TestJob {
        pending: AtomicUsize,
        persisted: Arc<AtomicUsize>,
        fail: AtomicBool,
        rollback_only: AtomicBool,
    }

    #[async_trait]
    impl BatchJob for TestJob {
        fn name(&self) -> &str {
            "test"
        }

        fn lock_resource(&self) -> (i64, &str) {
            (RESOURCE_ID, RESOURCE_TYPE)
        }

        fn has_pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst) > 0
        }

        async fn flush(&self, tx: &mut Transaction) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("recompute exploded");
            }
            let units = self.pending.swap(0, Ordering::SeqCst);
            let persisted = self.persisted.clone();
            tx.on_commit(move || {
                persisted.fetch_add(units, Ordering::SeqCst);
            });
            if self.rollback_only.load(Ordering::SeqCst) {
                tx.set_rollback_only();
            }
            Ok(units)
        }
    }

    fn updater(job: Arc<TestJob>, locks: Arc<MemoryLockService>) -> BatchUpdater<TestJob> {
        BatchUpdater::new(
            job,
            locks,
            Arc::new(TransactionManager::new()),
            Duration::from_secs(5),
        )
    }

    async fn lock_is_free(locks: &MemoryLockService) -> bool {
        match locks
            .try_lock(RESOURCE_ID, RESOURCE_TYPE, PLATFORM_SCOPE, Duration::ZERO)
            .await
            .unwrap()
        {
            Some(token) => {
                locks.unlock(token).await.unwrap();
                true
            }
            None => false,
        }
    }

    #[tokio::test]
    async fn test_idle_when_nothing_pending() {
        let job = Arc::new(TestJob::default());
        let u = updater(job, Arc::new(MemoryLockService::default()));
        assert_eq!(u.run_once().await, FlushReport::Idle);
    }

    #[tokio::test]
    async fn test_flush_commits_and_unlocks() {
        let job = Arc::new(TestJob::default());
        job.pending.store(3, Ordering::SeqCst);
        let locks = Arc::new(MemoryLockService::default());
        let u = updater(job.clone(), locks.clone());

        assert_eq!(u.run_once().await, FlushReport::Flushed { units: 3 });
        assert_eq!(job.persisted.load(Ordering::SeqCst), 3);
        assert!(lock_is_free(&locks).await);
    }

    #[tokio::test]
    async fn test_lock_released_when_body_fails() {
        let job = Arc::new(TestJob::default());
        job.pending.store(1, Ordering::SeqCst);
        job.fail.store(true, Ordering::SeqCst);
        let locks = Arc::new(MemoryLockService::default());
        let u = updater(job.clone(), locks.clone());

        assert_eq!(u.run_once().await, FlushReport::Failed);
        assert!(lock_is_free(&locks).await);
        assert_eq!(job.persisted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lock_released_when_commit_fails() {
        let job = Arc::new(TestJob::default());
        job.pending.store(2, Ordering::SeqCst);
        job.rollback_only.store(true, Ordering::SeqCst);
        let locks = Arc::new(MemoryLockService::default());
        let u = updater(job.clone(), locks.clone());

        assert_eq!(u.run_once().await, FlushReport::Failed);
        assert_eq!(job.persisted.load(Ordering::SeqCst), 0);
        assert!(lock_is_free(&locks).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_fails_after_timeout() {
        let job = Arc::new(TestJob::default());
        job.pending.store(1, Ordering::SeqCst);
        let locks = Arc::new(MemoryLockService::new(Duration::from_millis(100)));
        let held = locks
            .lock(RESOURCE_ID, RESOURCE_TYPE, PLATFORM_SCOPE)
            .await
            .unwrap();
        let u = updater(job.clone(), locks.clone());

        assert_eq!(u.run_once().await, FlushReport::Failed);
        // Units stay pending for the next period.
        assert!(job.has_pending());

        locks.unlock(held).await.unwrap();
        assert_eq!(u.run_once().await, FlushReport::Flushed { units: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_periodically_and_on_shutdown() {
        let job = Arc::new(TestJob::default());
        let locks = Arc::new(MemoryLockService::default());
        let u = Arc::new(updater(job.clone(), locks));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = u.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        job.pending.store(4, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(job.persisted.load(Ordering::SeqCst), 4);

        job.pending.store(1, Ordering::SeqCst);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(job.persisted.load(Ordering::SeqCst), 5);
    }
}
