//! Scheduled batch updaters.
//!
//! Producers accumulate into an in-memory counter or buffer without taking
//! any lock. A [`BatchUpdater`] periodically drains the accumulator under a
//! platform-wide cluster lock and persists the result inside a transaction.

pub mod log_batch;
pub mod platform;
pub mod updater;

use anyhow::Result;
use async_trait::async_trait;

use crate::transaction::Transaction;

pub use log_batch::{BatchLogBuffer, LogBatchJob, LogRecord, LogStore, MemoryLogStore};
pub use platform::{
    ChainedDigestProvider, MemoryPlatformInfoStore, PlatformInfoCounter, PlatformInfoStore,
    PlatformInformation, PlatformInformationJob, PlatformInformationProvider,
};
pub use updater::{BatchUpdater, FlushReport};

/// One kind of accumulated work flushed by a [`BatchUpdater`].
#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// `(resource_id, resource_type)` of the lock guarding the flush.
    fn lock_resource(&self) -> (i64, &str);

    /// Cheap check run before taking the lock.
    fn has_pending(&self) -> bool;

    /// Drain the accumulator and stage the persisted result in `tx`.
    ///
    /// Returns the number of drained units. Jobs must give drained units
    /// back when `tx` does not commit, typically through a
    /// [`crate::transaction::TransactionSynchronization`].
    async fn flush(&self, tx: &mut Transaction) -> Result<usize>;
}
