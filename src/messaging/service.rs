//! MessagesHandlingService runs one matching cycle.
//!
//! ## Cycle
//!
//! 1. Fetch at most `max_couples` candidate couples from the store.
//! 2. Count them as potential matches, before dedup.
//! 3. Reduce them with the [`DedupPolicy`].
//! 4. Claim and dispatch each surviving couple. A failure on one couple is
//!    logged and the loop moves on.
//! 5. If the page was full, count a retrigger: more couples may be waiting
//!    than fit in one page.
//!
//! A failure to read the page aborts the cycle; nothing has been claimed yet
//! so the next cycle simply starts over.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use super::dedup::DedupPolicy;
use super::dispatcher::{MessageCoupleWork, WorkDispatcher};
use super::store::CorrelationStore;
use super::types::{MessageInstance, WaitingMessageEvent};
use crate::config::MessagingConfig;
use crate::metrics::{
    MetricsRegistry, NUMBER_OF_MESSAGES_EXECUTED, NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS,
    NUMBER_OF_MESSAGES_POTENTIAL_MATCHED,
};

/// Summary of one matching cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Raw candidates returned by the store.
    pub fetched: usize,
    /// Candidates left after dedup.
    pub unique: usize,
    /// Couples claimed and handed to the dispatcher.
    pub executed: usize,
    /// Couples whose rows had vanished or were already claimed.
    pub skipped: usize,
    /// Couples that failed to load or dispatch.
    pub failed: usize,
    /// The page was full.
    pub retriggered: bool,
}

/// What happened to one couple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoupleOutcome {
    Dispatched,
    /// Already handled elsewhere; nothing to do.
    Skipped,
}

pub struct MessagesHandlingService {
    store: Arc<dyn CorrelationStore>,
    dispatcher: Arc<dyn WorkDispatcher>,
    metrics: Arc<dyn MetricsRegistry>,
    policy: DedupPolicy,
    max_couples: usize,
    tenant_id: i64,
    wake: Arc<Notify>,
}

impl MessagesHandlingService {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        dispatcher: Arc<dyn WorkDispatcher>,
        metrics: Arc<dyn MetricsRegistry>,
        config: &MessagingConfig,
        tenant_id: i64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            policy: DedupPolicy::new(config.reusable_event_kinds.iter().copied()),
            max_couples: config.max_couples,
            tenant_id,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    pub fn max_couples(&self) -> usize {
        self.max_couples
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    /// Notified whenever new matching work may exist.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Ask the matching worker to run a cycle soon.
    pub fn trigger_matching(&self) {
        self.wake.notify_one();
    }

    /// Persist a thrown message and wake the matching worker.
    pub async fn send_message(&self, message: MessageInstance) -> Result<i64> {
        let name = message.message_name.clone();
        let id = self
            .store
            .create_message_instance(message)
            .await
            .with_context(|| format!("Failed to store message instance '{}'", name))?;
        tracing::debug!(tenant_id = self.tenant_id, message_id = id, message_name = %name, "message sent");
        self.trigger_matching();
        Ok(id)
    }

    /// Persist a waiting event and wake the matching worker.
    pub async fn register_waiting_event(&self, event: WaitingMessageEvent) -> Result<i64> {
        let kind = event.kind;
        let id = self
            .store
            .create_waiting_message(event)
            .await
            .with_context(|| format!("Failed to store {} waiting event", kind))?;
        tracing::debug!(tenant_id = self.tenant_id, waiting_id = id, %kind, "waiting event registered");
        self.trigger_matching();
        Ok(id)
    }

    /// Run one matching cycle.
    ///
    /// Only a failure to read the candidate page is returned; per-couple
    /// failures are counted in the report.
    pub async fn match_event_couple_and_trigger_execution(&self) -> Result<CycleReport> {
        let candidates = self
            .store
            .get_message_event_couples(0, self.max_couples)
            .await
            .context("Failed to fetch message event couples")?;

        let mut report = CycleReport {
            fetched: candidates.len(),
            ..Default::default()
        };
        self.metrics.increment(
            NUMBER_OF_MESSAGES_POTENTIAL_MATCHED,
            self.tenant_id,
            candidates.len() as u64,
        );

        let unique = self.policy.unique_couples(&candidates);
        report.unique = unique.len();

        for couple in &unique {
            match self
                .execute_message_couple(couple.message_instance_id, couple.waiting_message_id)
                .await
            {
                Ok(CoupleOutcome::Dispatched) => report.executed += 1,
                Ok(CoupleOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        tenant_id = self.tenant_id,
                        message_id = couple.message_instance_id,
                        waiting_id = couple.waiting_message_id,
                        kind = %couple.waiting_message_event_kind,
                        error = %format!("{:#}", e),
                        "failed to execute message couple"
                    );
                }
            }
        }

        if report.fetched == self.max_couples {
            report.retriggered = true;
            self.metrics
                .increment(NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS, self.tenant_id, 1);
        }

        if report.fetched > 0 {
            tracing::debug!(
                tenant_id = self.tenant_id,
                fetched = report.fetched,
                unique = report.unique,
                executed = report.executed,
                skipped = report.skipped,
                failed = report.failed,
                retriggered = report.retriggered,
                "matching cycle complete"
            );
        }

        Ok(report)
    }

    /// Claim one couple and schedule its work.
    ///
    /// Rows that vanished or were claimed by a concurrent pass are skipped
    /// without error. If scheduling fails the claim is released first.
    pub async fn execute_message_couple(
        &self,
        message_instance_id: i64,
        waiting_message_id: i64,
    ) -> Result<CoupleOutcome> {
        let Some(waiting) = self
            .store
            .get_waiting_message(waiting_message_id)
            .await
            .with_context(|| format!("Failed to load waiting message {}", waiting_message_id))?
        else {
            tracing::debug!(waiting_id = waiting_message_id, "waiting message gone, skipping");
            return Ok(CoupleOutcome::Skipped);
        };

        let Some(message) = self
            .store
            .get_message_instance(message_instance_id)
            .await
            .with_context(|| format!("Failed to load message instance {}", message_instance_id))?
        else {
            tracing::debug!(message_id = message_instance_id, "message instance gone, skipping");
            return Ok(CoupleOutcome::Skipped);
        };

        let single_use = !self.policy.is_reusable(waiting.kind);
        let claimed = self
            .store
            .claim_couple(message_instance_id, waiting_message_id, single_use)
            .await
            .context("Failed to claim message couple")?;
        if !claimed {
            tracing::debug!(
                message_id = message_instance_id,
                waiting_id = waiting_message_id,
                "couple already claimed, skipping"
            );
            return Ok(CoupleOutcome::Skipped);
        }

        let work = MessageCoupleWork {
            tenant_id: self.tenant_id,
            message,
            waiting,
        };
        let description = work.description();

        if let Err(e) = self.dispatcher.schedule(work).await {
            if let Err(reset_err) = self
                .store
                .reset_couple(message_instance_id, waiting_message_id)
                .await
            {
                tracing::error!(
                    message_id = message_instance_id,
                    waiting_id = waiting_message_id,
                    error = %reset_err,
                    "failed to release couple after dispatch failure"
                );
            }
            return Err(e.context(format!("Failed to schedule work for {}", description)));
        }

        self.metrics
            .increment(NUMBER_OF_MESSAGES_EXECUTED, self.tenant_id, 1);
        Ok(CoupleOutcome::Dispatched)
    }

    /// Release a claim after its work failed so a later cycle retries it.
    pub async fn reset_message_couple(
        &self,
        message_instance_id: i64,
        waiting_message_id: i64,
    ) -> Result<()> {
        self.store
            .reset_couple(message_instance_id, waiting_message_id)
            .await
            .with_context(|| {
                format!(
                    "Failed to reset couple (message {}, waiting {})",
                    message_instance_id, waiting_message_id
                )
            })
    }

    /// Consume the rows of a work that fired successfully.
    ///
    /// The message is always deleted. Single-use waiting events are deleted
    /// too; reusable ones stay parked for the next message.
    pub async fn complete_message_couple(&self, work: &MessageCoupleWork) -> Result<()> {
        self.store
            .delete_message_instance(work.message.id)
            .await
            .with_context(|| format!("Failed to delete message instance {}", work.message.id))?;
        if !self.policy.is_reusable(work.waiting.kind) {
            self.store
                .delete_waiting_message(work.waiting.id)
                .await
                .with_context(|| format!("Failed to delete waiting message {}", work.waiting.id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::dispatcher::ChannelWorkDispatcher;
    use crate::messaging::store::MemoryCorrelationStore;
    use crate::messaging::types::{MessageEventCouple, WaitingEventKind};
    use crate::metrics::InMemoryMetrics;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const TENANT: i64 = 7;

    /// Records scheduled works; fails for the configured message ids.
    #[derive(Default)]
    struct RecordingDispatcher {
        scheduled: Mutex<Vec<MessageCoupleWork>>,
        fail_for: Mutex<HashSet<i64>>,
    }

    #[async_trait]
    impl WorkDispatcher for RecordingDispatcher {
        async fn schedule(&self, work: MessageCoupleWork) -> Result<()> {
            if self.fail_for.lock().unwrap().contains(&work.message.id) {
                anyhow::bail!("dispatcher rejected message {}", work.message.id);
            }
            self.scheduled.lock().unwrap().push(work);
            Ok(())
        }
    }

    /// Memory store whose page query can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryCorrelationStore,
        fail_page: AtomicBool,
    }

    #[async_trait]
    impl CorrelationStore for FlakyStore {
        async fn create_waiting_message(&self, e: WaitingMessageEvent) -> Result<i64> {
            self.inner.create_waiting_message(e).await
        }
        async fn create_message_instance(&self, m: MessageInstance) -> Result<i64> {
            self.inner.create_message_instance(m).await
        }
        async fn get_message_event_couples(
            &self,
            from: usize,
            max: usize,
        ) -> Result<Vec<MessageEventCouple>> {
            if self.fail_page.load(Ordering::SeqCst) {
                anyhow::bail!("store unavailable");
            }
            self.inner.get_message_event_couples(from, max).await
        }
        async fn get_waiting_message(&self, id: i64) -> Result<Option<WaitingMessageEvent>> {
            self.inner.get_waiting_message(id).await
        }
        async fn get_message_instance(&self, id: i64) -> Result<Option<MessageInstance>> {
            self.inner.get_message_instance(id).await
        }
        async fn claim_couple(&self, m: i64, w: i64, mark: bool) -> Result<bool> {
            self.inner.claim_couple(m, w, mark).await
        }
        async fn reset_couple(&self, m: i64, w: i64) -> Result<()> {
            self.inner.reset_couple(m, w).await
        }
        async fn delete_waiting_message(&self, id: i64) -> Result<bool> {
            self.inner.delete_waiting_message(id).await
        }
        async fn delete_message_instance(&self, id: i64) -> Result<bool> {
            self.inner.delete_message_instance(id).await
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        dispatcher: Arc<RecordingDispatcher>,
        metrics: Arc<InMemoryMetrics>,
        service: MessagesHandlingService,
    }

    fn fixture(max_couples: usize) -> Fixture {
        let store = Arc::new(FlakyStore::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = MessagingConfig {
            max_couples,
            ..Default::default()
        };
        let service = MessagesHandlingService::new(
            store.clone(),
            dispatcher.clone(),
            metrics.clone(),
            &config,
            TENANT,
        );
        Fixture {
            store,
            dispatcher,
            metrics,
            service,
        }
    }

    fn receive_task(order: &str) -> WaitingMessageEvent {
        WaitingMessageEvent::new(WaitingEventKind::ReceiveTask, "paid", "orders", "wait-paid")
            .with_correlation("order", order)
    }

    fn start_event() -> WaitingMessageEvent {
        WaitingMessageEvent::new(WaitingEventKind::StartEvent, "paid", "orders", "start")
    }

    fn paid(order: &str) -> MessageInstance {
        MessageInstance::new("paid", "orders").with_correlation("order", order)
    }

    impl Fixture {
        fn counter(&self, name: &str) -> u64 {
            self.metrics.value(name, TENANT)
        }
    }

    #[tokio::test]
    async fn test_cycle_dispatches_matched_couple() {
        let f = fixture(100);
        let w = f.service.register_waiting_event(receive_task("1")).await.unwrap();
        let m = f.service.send_message(paid("1")).await.unwrap();

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.executed, 1);
        assert!(!report.retriggered);

        let scheduled = f.dispatcher.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].message.id, m);
        assert_eq!(scheduled[0].waiting.id, w);
        assert_eq!(scheduled[0].tenant_id, TENANT);
        drop(scheduled);

        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 1);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_POTENTIAL_MATCHED), 1);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS), 0);

        // Claimed rows are not matched again.
        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 1);
    }

    #[tokio::test]
    async fn test_potential_counts_raw_candidates() {
        let f = fixture(100);
        for _ in 0..3 {
            f.service.register_waiting_event(receive_task("1")).await.unwrap();
        }
        f.service.send_message(paid("1")).await.unwrap();

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.unique, 1);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_POTENTIAL_MATCHED), 3);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 1);
    }

    #[tokio::test]
    async fn test_full_page_retriggers_once() {
        let f = fixture(3);
        f.service.register_waiting_event(start_event()).await.unwrap();
        for i in 0..3 {
            f.service.send_message(paid(&i.to_string())).await.unwrap();
        }

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.executed, 3);
        assert!(report.retriggered);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS), 1);
    }

    #[tokio::test]
    async fn test_partial_page_does_not_retrigger() {
        let f = fixture(3);
        f.service.register_waiting_event(start_event()).await.unwrap();
        for i in 0..2 {
            f.service.send_message(paid(&i.to_string())).await.unwrap();
        }

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert!(!report.retriggered);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_MATCHING_RETRIGGERED_TASKS), 0);
    }

    #[tokio::test]
    async fn test_one_failing_couple_does_not_abort_batch() {
        let f = fixture(100);
        let mut ids = Vec::new();
        for i in 0..3 {
            let order = i.to_string();
            f.service.register_waiting_event(receive_task(&order)).await.unwrap();
            ids.push(f.service.send_message(paid(&order)).await.unwrap());
        }
        f.dispatcher.fail_for.lock().unwrap().insert(ids[0]);

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.unique, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.executed, 2);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 2);

        // The failed couple was released and matches again next cycle.
        f.dispatcher.fail_for.lock().unwrap().clear();
        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 3);
    }

    #[tokio::test]
    async fn test_page_read_failure_aborts_cycle() {
        let f = fixture(100);
        f.service.register_waiting_event(receive_task("1")).await.unwrap();
        f.service.send_message(paid("1")).await.unwrap();
        f.store.fail_page.store(true, Ordering::SeqCst);

        let err = f.service.match_event_couple_and_trigger_execution().await.unwrap_err();
        assert!(format!("{:#}", err).contains("store unavailable"));
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_POTENTIAL_MATCHED), 0);

        f.store.fail_page.store(false, Ordering::SeqCst);
        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.executed, 1);
    }

    #[tokio::test]
    async fn test_vanished_rows_are_skipped() {
        let f = fixture(100);
        let w = f.service.register_waiting_event(receive_task("1")).await.unwrap();
        let m = f.service.send_message(paid("1")).await.unwrap();

        f.store.delete_message_instance(m).await.unwrap();
        assert_eq!(
            f.service.execute_message_couple(m, w).await.unwrap(),
            CoupleOutcome::Skipped
        );

        let m2 = f.service.send_message(paid("1")).await.unwrap();
        f.store.delete_waiting_message(w).await.unwrap();
        assert_eq!(
            f.service.execute_message_couple(m2, w).await.unwrap(),
            CoupleOutcome::Skipped
        );
        assert_eq!(f.counter(NUMBER_OF_MESSAGES_EXECUTED), 0);
    }

    #[tokio::test]
    async fn test_claimed_elsewhere_is_skipped() {
        let f = fixture(100);
        let w = f.service.register_waiting_event(receive_task("1")).await.unwrap();
        let m = f.service.send_message(paid("1")).await.unwrap();

        // Another node got there first.
        assert!(f.store.claim_couple(m, w, true).await.unwrap());
        assert_eq!(
            f.service.execute_message_couple(m, w).await.unwrap(),
            CoupleOutcome::Skipped
        );
        assert!(f.dispatcher.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_keeps_reusable_waiting() {
        let f = fixture(100);
        let start = f.service.register_waiting_event(start_event()).await.unwrap();
        let receive = f.service.register_waiting_event(receive_task("1")).await.unwrap();
        f.service.send_message(paid("1")).await.unwrap();
        f.service.send_message(paid("2")).await.unwrap();

        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.executed, 2);

        let works = f.dispatcher.scheduled.lock().unwrap().clone();
        for work in &works {
            f.service.complete_message_couple(work).await.unwrap();
        }

        assert!(f.store.get_waiting_message(start).await.unwrap().is_some());
        assert_eq!(f.store.inner.message_count(), 0);
        let receive_consumed = works.iter().any(|w| w.waiting.id == receive);
        assert_eq!(
            f.store.get_waiting_message(receive).await.unwrap().is_none(),
            receive_consumed
        );
    }

    #[tokio::test]
    async fn test_reset_message_couple() {
        let f = fixture(100);
        let w = f.service.register_waiting_event(receive_task("1")).await.unwrap();
        let m = f.service.send_message(paid("1")).await.unwrap();
        f.service.match_event_couple_and_trigger_execution().await.unwrap();

        f.service.reset_message_couple(m, w).await.unwrap();
        let report = f.service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.executed, 1);
    }

    #[tokio::test]
    async fn test_send_message_wakes_worker() {
        let f = fixture(100);
        let wake = f.service.wake_handle();
        f.service.send_message(paid("1")).await.unwrap();
        // notify_one stores a permit, so this completes immediately.
        tokio::time::timeout(std::time::Duration::from_millis(50), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_full_queue_releases_claim() {
        let store = Arc::new(MemoryCorrelationStore::new());
        let (dispatcher, _receiver) = ChannelWorkDispatcher::new(1);
        let metrics = Arc::new(InMemoryMetrics::new());
        let service = MessagesHandlingService::new(
            store.clone(),
            Arc::new(dispatcher),
            metrics.clone(),
            &MessagingConfig::default(),
            TENANT,
        );
        for i in 0..2 {
            let order = i.to_string();
            service.register_waiting_event(receive_task(&order)).await.unwrap();
            service.send_message(paid(&order)).await.unwrap();
        }

        let report = service.match_event_couple_and_trigger_execution().await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.failed, 1);
        // The rejected couple is visible again.
        assert_eq!(store.get_message_event_couples(0, 10).await.unwrap().len(), 1);
    }
}
