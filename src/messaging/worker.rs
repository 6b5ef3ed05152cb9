//! Background tasks driving message correlation.
//!
//! - [`MatchingWorker`] runs matching cycles on a poll interval, immediately
//!   when woken by a new message or waiting event, and back to back while
//!   cycles keep hitting the page limit.
//! - [`WorkExecutor`] drains the dispatch queue and fires each work through
//!   the [`CatchEventTrigger`], then consumes or releases the claimed rows.
//!
//! Both stop when the shutdown watch flips to `true`. Works still queued at
//! that point are not fired; their claims are released so the next node to
//! run a cycle matches them again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::dispatcher::{CatchEventTrigger, MessageCoupleWork, WorkReceiver};
use super::service::MessagesHandlingService;

// ---------------------------------------------------------------------------
// MatchingWorker
// ---------------------------------------------------------------------------

pub struct MatchingWorker {
    service: Arc<MessagesHandlingService>,
    poll_interval: Duration,
}

impl MatchingWorker {
    pub fn new(service: Arc<MessagesHandlingService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
        }
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            tenant_id = self.service.tenant_id(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "MatchingWorker started"
        );
        let wake = self.service.wake_handle();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.run_cycle().await {
                // Full page with progress: go again without waiting.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wake.notified() => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("MatchingWorker stopped");
    }

    /// One cycle. Returns whether another should follow immediately.
    ///
    /// A full page that executed nothing (every couple failed or was skipped)
    /// waits for the next tick instead of spinning.
    async fn run_cycle(&self) -> bool {
        match self.service.match_event_couple_and_trigger_execution().await {
            Ok(report) => report.retriggered && report.executed > 0,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "MatchingWorker: matching cycle failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkExecutor
// ---------------------------------------------------------------------------

pub struct WorkExecutor {
    receiver: WorkReceiver,
    trigger: Arc<dyn CatchEventTrigger>,
    service: Arc<MessagesHandlingService>,
}

impl WorkExecutor {
    pub fn new(
        receiver: WorkReceiver,
        trigger: Arc<dyn CatchEventTrigger>,
        service: Arc<MessagesHandlingService>,
    ) -> Self {
        Self {
            receiver,
            trigger,
            service,
        }
    }

    /// Execute works until shutdown or until every dispatcher is gone.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("WorkExecutor started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                work = self.receiver.recv() => match work {
                    Some(work) => self.execute(work).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        let released = self.release_queued().await;
        tracing::info!(released, "WorkExecutor stopped");
    }

    /// Close the queue and release the claim of every work left in it.
    async fn release_queued(&mut self) -> usize {
        self.receiver.close();
        let mut released = 0;
        while let Some(work) = self.receiver.try_recv() {
            match self
                .service
                .reset_message_couple(work.message.id, work.waiting.id)
                .await
            {
                Ok(()) => released += 1,
                Err(e) => tracing::error!(
                    work = %work.description(),
                    error = %format!("{:#}", e),
                    "WorkExecutor: failed to release queued couple"
                ),
            }
        }
        released
    }

    /// Fire one work. Success consumes the rows; failure releases the claim
    /// for a later cycle.
    pub async fn execute(&self, work: MessageCoupleWork) {
        match self.trigger.fire(&work).await {
            Ok(()) => {
                if let Err(e) = self.service.complete_message_couple(&work).await {
                    tracing::error!(
                        work = %work.description(),
                        error = %format!("{:#}", e),
                        "WorkExecutor: failed to consume fired couple"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    work = %work.description(),
                    error = %format!("{:#}", e),
                    "WorkExecutor: trigger failed, releasing couple"
                );
                if let Err(reset_err) = self
                    .service
                    .reset_message_couple(work.message.id, work.waiting.id)
                    .await
                {
                    tracing::error!(
                        work = %work.description(),
                        error = %format!("{:#}", reset_err),
                        "WorkExecutor: failed to release couple"
                    );
                }
            }
        }
    }
}
