//! Correlation store for pending waiting events and message instances.
//!
//! The store owns both tables and answers the correlation query that pairs
//! them. Couples it returns are snapshots: a concurrent matching pass on
//! another node may claim or delete the rows before this node acts, so every
//! mutating call reports whether it actually found and changed the rows.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::types::{MessageEventCouple, MessageInstance, WaitingMessageEvent};

/// Persistence contract for message correlation.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    // ── Inserts ──

    /// Persist a waiting event and return its id.
    async fn create_waiting_message(&self, event: WaitingMessageEvent) -> Result<i64>;

    /// Persist a message instance and return its id.
    async fn create_message_instance(&self, message: MessageInstance) -> Result<i64>;

    // ── Correlation query ──

    /// One page of candidate couples.
    ///
    /// Ordering is deterministic. Handled messages and in-progress waiting
    /// events are excluded.
    async fn get_message_event_couples(
        &self,
        from_index: usize,
        max_results: usize,
    ) -> Result<Vec<MessageEventCouple>>;

    async fn get_waiting_message(&self, id: i64) -> Result<Option<WaitingMessageEvent>>;
    async fn get_message_instance(&self, id: i64) -> Result<Option<MessageInstance>>;

    // ── Claim / release ──

    /// Mark the message handled and, when `mark_waiting`, the waiting event
    /// in progress. Returns `false` without changing anything if either row
    /// is gone or already claimed.
    async fn claim_couple(
        &self,
        message_instance_id: i64,
        waiting_message_id: i64,
        mark_waiting: bool,
    ) -> Result<bool>;

    /// Undo a claim so the pair can be matched again.
    async fn reset_couple(&self, message_instance_id: i64, waiting_message_id: i64) -> Result<()>;

    // ── Deletes ──

    async fn delete_waiting_message(&self, id: i64) -> Result<bool>;
    async fn delete_message_instance(&self, id: i64) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    waiting: BTreeMap<i64, WaitingMessageEvent>,
    messages: BTreeMap<i64, MessageInstance>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory correlation store.
///
/// Couples are ordered by message id, then waiting event id.
#[derive(Default)]
pub struct MemoryCorrelationStore {
    tables: Mutex<Tables>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.tables().waiting.len()
    }

    pub fn message_count(&self) -> usize {
        self.tables().messages.len()
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn create_waiting_message(&self, mut event: WaitingMessageEvent) -> Result<i64> {
        let mut tables = self.tables();
        let id = tables.next_id();
        event.id = id;
        tables.waiting.insert(id, event);
        Ok(id)
    }

    async fn create_message_instance(&self, mut message: MessageInstance) -> Result<i64> {
        let mut tables = self.tables();
        let id = tables.next_id();
        message.id = id;
        tables.messages.insert(id, message);
        Ok(id)
    }

    async fn get_message_event_couples(
        &self,
        from_index: usize,
        max_results: usize,
    ) -> Result<Vec<MessageEventCouple>> {
        let guard = self.tables();
        let tables: &Tables = &guard;
        let couples = tables
            .messages
            .values()
            .filter(|m| !m.handled)
            .flat_map(|m| {
                tables
                    .waiting
                    .values()
                    .filter(move |w| !w.in_progress && m.correlates_with(w))
                    .map(move |w| MessageEventCouple::new(m.id, w.kind, w.id))
            })
            .skip(from_index)
            .take(max_results)
            .collect();
        Ok(couples)
    }

    async fn get_waiting_message(&self, id: i64) -> Result<Option<WaitingMessageEvent>> {
        Ok(self.tables().waiting.get(&id).cloned())
    }

    async fn get_message_instance(&self, id: i64) -> Result<Option<MessageInstance>> {
        Ok(self.tables().messages.get(&id).cloned())
    }

    async fn claim_couple(
        &self,
        message_instance_id: i64,
        waiting_message_id: i64,
        mark_waiting: bool,
    ) -> Result<bool> {
        let mut tables = self.tables();

        let message_free = matches!(tables.messages.get(&message_instance_id), Some(m) if !m.handled);
        let waiting_free =
            matches!(tables.waiting.get(&waiting_message_id), Some(w) if !w.in_progress);
        if !message_free || !waiting_free {
            return Ok(false);
        }

        if let Some(m) = tables.messages.get_mut(&message_instance_id) {
            m.handled = true;
        }
        if mark_waiting {
            if let Some(w) = tables.waiting.get_mut(&waiting_message_id) {
                w.in_progress = true;
            }
        }
        Ok(true)
    }

    async fn reset_couple(&self, message_instance_id: i64, waiting_message_id: i64) -> Result<()> {
        let mut tables = self.tables();
        if let Some(m) = tables.messages.get_mut(&message_instance_id) {
            m.handled = false;
        }
        if let Some(w) = tables.waiting.get_mut(&waiting_message_id) {
            w.in_progress = false;
        }
        Ok(())
    }

    async fn delete_waiting_message(&self, id: i64) -> Result<bool> {
        Ok(self.tables().waiting.remove(&id).is_some())
    }

    async fn delete_message_instance(&self, id: i64) -> Result<bool> {
        Ok(self.tables().messages.remove(&id).is_some())
    }
}
