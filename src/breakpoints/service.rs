//! Breakpoint lookup backed by a lazily synchronized cache.
//!
//! Reads take only the cache's read lock. The cache is rebuilt from the
//! store when it is marked unsynced or when its "any breakpoint active"
//! flag has been evicted. Rebuilds are single-flight: callers queue on an
//! async mutex and re-check before reading the store.
//!
//! ## Invalidation
//!
//! Adding or removing a breakpoint marks the cache unsynced right away, and
//! registers a callback that marks it unsynced again once the transaction
//! commits. A rebuild that ran between the write and the commit therefore
//! never survives the commit. A rolled-back write only causes one redundant
//! rebuild.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};

use super::store::BreakpointStore;
use super::types::{Breakpoint, BreakpointKey, BreakpointScope};
use crate::transaction::{Transaction, TransactionOutcome, TransactionSynchronization};

#[derive(Default)]
struct CacheState {
    entries: HashMap<BreakpointKey, Breakpoint>,
    /// `None` once evicted.
    active: Option<bool>,
}

/// Cached breakpoint index plus the derived "any active" flag.
#[derive(Default)]
pub struct BreakpointCache {
    state: RwLock<CacheState>,
    synced: AtomicBool,
    /// Bumped on every invalidation; a rebuild only marks the cache synced if
    /// no invalidation happened while it was reading the store.
    generation: AtomicU64,
}

impl BreakpointCache {
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn active(&self) -> Option<bool> {
        self.read().active
    }

    fn needs_sync(&self) -> bool {
        !self.is_synced() || self.active().is_none()
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.synced.store(false, Ordering::Release);
    }

    /// Drop every cached entry and the derived flag.
    pub fn evict_all(&self) {
        let mut state = self.write();
        state.entries.clear();
        state.active = None;
    }

    fn get(&self, key: &BreakpointKey) -> Option<Breakpoint> {
        self.read().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marks the cache unsynced once a breakpoint write commits.
struct InvalidateOnCommit {
    cache: Arc<BreakpointCache>,
}

impl TransactionSynchronization for InvalidateOnCommit {
    fn after_completion(&self, outcome: TransactionOutcome) {
        if outcome == TransactionOutcome::Committed {
            self.cache.invalidate();
        }
    }
}

pub struct BreakpointService {
    store: Arc<dyn BreakpointStore>,
    cache: Arc<BreakpointCache>,
    sync_lock: tokio::sync::Mutex<()>,
    batch_size: usize,
    synchronizations: AtomicU64,
}

impl BreakpointService {
    pub fn new(store: Arc<dyn BreakpointStore>, batch_size: usize) -> Self {
        Self {
            store,
            cache: Arc::new(BreakpointCache::default()),
            sync_lock: tokio::sync::Mutex::new(()),
            batch_size: batch_size.max(1),
            synchronizations: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &BreakpointCache {
        &self.cache
    }

    /// Number of rebuilds performed so far.
    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.load(Ordering::Relaxed)
    }

    /// Stage a new breakpoint in `tx`.
    pub async fn add_breakpoint(&self, tx: &mut Transaction, breakpoint: Breakpoint) -> Result<i64> {
        let id = self
            .store
            .add(tx, breakpoint)
            .await
            .context("Failed to add breakpoint")?;
        self.invalidate_in(tx);
        tracing::debug!(breakpoint_id = id, tx_id = tx.id(), "breakpoint added");
        Ok(id)
    }

    /// Stage removal of a breakpoint in `tx`. Returns `false` if it did not
    /// exist.
    pub async fn remove_breakpoint(&self, tx: &mut Transaction, id: i64) -> Result<bool> {
        let removed = self
            .store
            .delete(tx, id)
            .await
            .with_context(|| format!("Failed to remove breakpoint {}", id))?;
        if removed {
            self.invalidate_in(tx);
            tracing::debug!(breakpoint_id = id, tx_id = tx.id(), "breakpoint removed");
        }
        Ok(removed)
    }

    fn invalidate_in(&self, tx: &mut Transaction) {
        self.cache.invalidate();
        tx.register_synchronization(Arc::new(InvalidateOnCommit {
            cache: self.cache.clone(),
        }));
    }

    /// Whether any breakpoint exists.
    pub async fn is_breakpoint_active(&self) -> Result<bool> {
        if self.cache.is_synced() {
            if let Some(active) = self.cache.active() {
                return Ok(active);
            }
        }
        self.synchronize().await?;
        Ok(self.cache.active().unwrap_or(false))
    }

    /// Breakpoint for an element state, instance scope first.
    pub async fn get_breakpoint_for(
        &self,
        definition_id: i64,
        instance_id: i64,
        element_name: &str,
        state_id: i32,
    ) -> Result<Option<Breakpoint>> {
        if !self.is_breakpoint_active().await? {
            return Ok(None);
        }
        let instance_key =
            BreakpointKey::new(BreakpointScope::Instance, instance_id, element_name, state_id);
        if let Some(bp) = self.cache.get(&instance_key) {
            return Ok(Some(bp));
        }
        let definition_key =
            BreakpointKey::new(BreakpointScope::Definition, definition_id, element_name, state_id);
        Ok(self.cache.get(&definition_key))
    }

    /// Rebuild the cache from the store if it is stale.
    pub async fn synchronize(&self) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        if !self.cache.needs_sync() {
            return Ok(());
        }

        let generation = self.cache.generation.load(Ordering::Acquire);
        let count = self
            .store
            .count()
            .await
            .context("Failed to count breakpoints")?;

        let mut entries = HashMap::with_capacity(count);
        let mut from_index = 0;
        loop {
            let page = self
                .store
                .list(from_index, self.batch_size)
                .await
                .with_context(|| format!("Failed to load breakpoints from {}", from_index))?;
            let fetched = page.len();
            for bp in page {
                entries.insert(bp.key(), bp);
            }
            if fetched < self.batch_size {
                break;
            }
            from_index += fetched;
        }

        {
            let mut state = self.cache.write();
            state.entries = entries;
            state.active = Some(count > 0);
        }
        if self.cache.generation.load(Ordering::Acquire) == generation {
            self.cache.synced.store(true, Ordering::Release);
        }
        self.synchronizations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(count, "breakpoint cache synchronized");
        Ok(())
    }
}
