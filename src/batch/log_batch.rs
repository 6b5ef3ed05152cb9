//! Batched insertion of engine log records.
//!
//! Producers append to a [`BatchLogBuffer`] without blocking. The
//! [`LogBatchJob`] drains what was buffered when the flush started and
//! inserts it in chunks of `batch_size` rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::BatchJob;
use crate::transaction::{Transaction, TransactionOutcome, TransactionSynchronization};

pub const LOG_BATCH_LOCK_ID: i64 = 2;
pub const LOG_BATCH_LOCK_TYPE: &str = "LOG_BATCH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub tenant_id: i64,
    pub action_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(tenant_id: i64, action_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tenant_id,
            action_type: action_type.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Unbounded, lock-free buffer of pending log records.
pub struct BatchLogBuffer {
    sender: Sender<LogRecord>,
    receiver: Receiver<LogRecord>,
    appended: AtomicU64,
}

impl Default for BatchLogBuffer {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            appended: AtomicU64::new(0),
        }
    }
}

impl BatchLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks. The buffer owns both channel ends, so the send cannot
    /// fail while `self` is alive.
    #[inline]
    pub fn append(&self, record: LogRecord) {
        if self.sender.send(record).is_ok() {
            self.appended.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Records appended since creation, requeues excluded.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn try_recv_batch(&self, max: usize) -> Vec<LogRecord> {
        let mut batch = Vec::with_capacity(max.min(64));
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    /// Put records back after a failed flush. They go behind anything
    /// appended in the meantime.
    pub fn requeue(&self, records: impl IntoIterator<Item = LogRecord>) {
        for record in records {
            let _ = self.sender.send(record);
        }
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Stage a batch insert in `tx`. Returns the number of staged rows.
    async fn insert_batch(&self, tx: &mut Transaction, records: Vec<LogRecord>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    rows: Arc<Mutex<Vec<LogRecord>>>,
    inserts: AtomicU64,
}

fn rows(rows: &Mutex<Vec<LogRecord>>) -> MutexGuard<'_, Vec<LogRecord>> {
    match rows.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        rows(&self.rows).clone()
    }

    /// Number of batch inserts staged so far.
    pub fn insert_calls(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_batch(&self, tx: &mut Transaction, records: Vec<LogRecord>) -> Result<usize> {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let count = records.len();
        let table = self.rows.clone();
        tx.on_commit(move || {
            rows(&table).extend(records);
        });
        Ok(count)
    }
}

/// Requeues drained records if the flush does not commit.
struct RequeueRecords {
    buffer: Arc<BatchLogBuffer>,
    records: Mutex<Vec<LogRecord>>,
}

impl TransactionSynchronization for RequeueRecords {
    fn after_completion(&self, outcome: TransactionOutcome) {
        if outcome == TransactionOutcome::RolledBack {
            let records = std::mem::take(&mut *rows(&self.records));
            tracing::debug!(count = records.len(), "log records requeued");
            self.buffer.requeue(records);
        }
    }
}

pub struct LogBatchJob {
    buffer: Arc<BatchLogBuffer>,
    store: Arc<dyn LogStore>,
    batch_size: usize,
}

impl LogBatchJob {
    pub fn new(buffer: Arc<BatchLogBuffer>, store: Arc<dyn LogStore>, batch_size: usize) -> Self {
        Self {
            buffer,
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn buffer(&self) -> &Arc<BatchLogBuffer> {
        &self.buffer
    }
}

#[async_trait]
impl BatchJob for LogBatchJob {
    fn name(&self) -> &str {
        "log-batch"
    }

    fn lock_resource(&self) -> (i64, &str) {
        (LOG_BATCH_LOCK_ID, LOG_BATCH_LOCK_TYPE)
    }

    fn has_pending(&self) -> bool {
        self.buffer.pending() > 0
    }

    async fn flush(&self, tx: &mut Transaction) -> Result<usize> {
        let mut remaining = self.buffer.pending();
        let requeue = Arc::new(RequeueRecords {
            buffer: self.buffer.clone(),
            records: Mutex::new(Vec::with_capacity(remaining)),
        });
        tx.register_synchronization(requeue.clone());

        let mut flushed = 0;
        while remaining > 0 {
            let chunk = self.buffer.try_recv_batch(self.batch_size.min(remaining));
            if chunk.is_empty() {
                break;
            }
            remaining -= chunk.len();
            rows(&requeue.records).extend(chunk.iter().cloned());
            flushed += self
                .store
                .insert_batch(tx, chunk)
                .await
                .context("Failed to insert log batch")?;
        }
        Ok(flushed)
    }
}
