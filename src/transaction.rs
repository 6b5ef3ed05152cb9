//! Unit of work with staged writes and completion callbacks.
//!
//! Participants stage their writes with [`Transaction::on_commit`] and are
//! told how the unit of work ended through [`TransactionSynchronization`].
//! Nothing staged is applied unless [`Transaction::commit`] succeeds; a
//! transaction dropped while still active is rolled back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::TransactionError;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Callback run once the transaction has completed.
pub trait TransactionSynchronization: Send + Sync {
    fn after_completion(&self, outcome: TransactionOutcome);
}

type CommitAction = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    RollbackOnly,
    Completed,
}

/// A single unit of work.
pub struct Transaction {
    id: u64,
    state: TxState,
    commit_actions: Vec<CommitAction>,
    synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: TxState::Active,
            commit_actions: Vec::new(),
            synchronizations: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of writes staged so far.
    pub fn staged_writes(&self) -> usize {
        self.commit_actions.len()
    }

    /// Stage a write, applied in registration order on commit.
    pub fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.commit_actions.push(Box::new(action));
    }

    /// Register a completion callback.
    pub fn register_synchronization(&mut self, sync: Arc<dyn TransactionSynchronization>) {
        self.synchronizations.push(sync);
    }

    /// Mark the transaction so that `commit` rolls back instead.
    pub fn set_rollback_only(&mut self) {
        if self.state == TxState::Active {
            self.state = TxState::RollbackOnly;
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state == TxState::RollbackOnly
    }

    /// Apply staged writes, then notify synchronizations.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        match self.state {
            TxState::Completed => Err(TransactionError::AlreadyCompleted(self.id)),
            TxState::RollbackOnly => {
                self.complete(TransactionOutcome::RolledBack);
                Err(TransactionError::CommitFailed {
                    id: self.id,
                    reason: "transaction was marked rollback-only".to_string(),
                })
            }
            TxState::Active => {
                for action in self.commit_actions.drain(..) {
                    action();
                }
                self.complete(TransactionOutcome::Committed);
                Ok(())
            }
        }
    }

    /// Discard staged writes, then notify synchronizations.
    pub fn rollback(mut self) {
        if self.state != TxState::Completed {
            self.complete(TransactionOutcome::RolledBack);
        }
    }

    fn complete(&mut self, outcome: TransactionOutcome) {
        self.state = TxState::Completed;
        self.commit_actions.clear();
        for sync in self.synchronizations.drain(..) {
            sync.after_completion(outcome);
        }
        tracing::trace!(tx_id = self.id, ?outcome, "transaction completed");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxState::Completed {
            tracing::warn!(tx_id = self.id, "transaction dropped while active, rolling back");
            self.complete(TransactionOutcome::RolledBack);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("staged_writes", &self.commit_actions.len())
            .field("synchronizations", &self.synchronizations.len())
            .finish()
    }
}

/// Hands out transactions with process-unique ids.
#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
