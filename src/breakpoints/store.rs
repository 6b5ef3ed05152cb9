//! Breakpoint persistence.
//!
//! Writes go through a [`Transaction`]: they become visible to readers only
//! once the transaction commits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;

use super::types::Breakpoint;
use crate::transaction::Transaction;

#[async_trait]
pub trait BreakpointStore: Send + Sync {
    /// Number of committed breakpoints.
    async fn count(&self) -> Result<usize>;

    /// One page of committed breakpoints, ordered by id.
    async fn list(&self, from_index: usize, max_results: usize) -> Result<Vec<Breakpoint>>;

    async fn get(&self, id: i64) -> Result<Option<Breakpoint>>;

    /// Stage an insert and return the id the breakpoint will have.
    async fn add(&self, tx: &mut Transaction, breakpoint: Breakpoint) -> Result<i64>;

    /// Stage a delete. Returns `false` if no committed breakpoint has `id`.
    async fn delete(&self, tx: &mut Transaction, id: i64) -> Result<bool>;
}

type Rows = Arc<Mutex<BTreeMap<i64, Breakpoint>>>;

fn rows(rows: &Rows) -> MutexGuard<'_, BTreeMap<i64, Breakpoint>> {
    match rows.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct MemoryBreakpointStore {
    rows: Rows,
    next_id: AtomicI64,
}

impl MemoryBreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakpointStore for MemoryBreakpointStore {
    async fn count(&self) -> Result<usize> {
        Ok(rows(&self.rows).len())
    }

    async fn list(&self, from_index: usize, max_results: usize) -> Result<Vec<Breakpoint>> {
        Ok(rows(&self.rows)
            .values()
            .skip(from_index)
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Breakpoint>> {
        Ok(rows(&self.rows).get(&id).cloned())
    }

    async fn add(&self, tx: &mut Transaction, mut breakpoint: Breakpoint) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        breakpoint.id = id;
        let table = self.rows.clone();
        tx.on_commit(move || {
            rows(&table).insert(id, breakpoint);
        });
        Ok(id)
    }

    async fn delete(&self, tx: &mut Transaction, id: i64) -> Result<bool> {
        if !rows(&self.rows).contains_key(&id) {
            return Ok(false);
        }
        let table = self.rows.clone();
        tx.on_commit(move || {
            rows(&table).remove(&id);
        });
        Ok(true)
    }
}
