//! Engine wiring: builds the services and spawns the background tasks.
//!
//! ```ignore
//! let config = EngineConfig::from_env();
//! let engine = MessagingEngine::start(config.clone(), Collaborators::in_memory(&config))?;
//! engine.messages().send_message(msg).await?;
//! engine.shutdown().await;
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::batch::{
    BatchLogBuffer, BatchUpdater, ChainedDigestProvider, LogBatchJob, LogRecord, LogStore,
    MemoryLogStore, MemoryPlatformInfoStore, PlatformInfoCounter, PlatformInfoStore,
    PlatformInformationJob, PlatformInformationProvider,
};
use crate::breakpoints::{BreakpointService, BreakpointStore, MemoryBreakpointStore};
use crate::config::EngineConfig;
use crate::lock::{LockService, MemoryLockService};
use crate::messaging::{
    CatchEventTrigger, ChannelWorkDispatcher, CorrelationStore, LoggingTrigger, MatchingWorker,
    MemoryCorrelationStore, MessageCoupleWork, MessagesHandlingService, WaitingEventKind,
    WorkExecutor,
};
use crate::metrics::{MetricsRegistry, RecorderMetrics};
use crate::transaction::TransactionManager;

/// External collaborators the engine is built on.
pub struct Collaborators {
    pub correlation_store: Arc<dyn CorrelationStore>,
    pub lock_service: Arc<dyn LockService>,
    pub metrics: Arc<dyn MetricsRegistry>,
    pub trigger: Arc<dyn CatchEventTrigger>,
    pub breakpoint_store: Arc<dyn BreakpointStore>,
    pub platform_info_store: Arc<dyn PlatformInfoStore>,
    pub platform_info_provider: Arc<dyn PlatformInformationProvider>,
    pub log_store: Arc<dyn LogStore>,
}

impl Collaborators {
    /// Process-local collaborators; the trigger only logs and counters go to
    /// the installed `metrics` recorder.
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self {
            correlation_store: Arc::new(MemoryCorrelationStore::new()),
            lock_service: Arc::new(MemoryLockService::new(config.lock.timeout())),
            metrics: Arc::new(RecorderMetrics),
            trigger: Arc::new(LoggingTrigger),
            breakpoint_store: Arc::new(MemoryBreakpointStore::new()),
            platform_info_store: Arc::new(MemoryPlatformInfoStore::new()),
            platform_info_provider: Arc::new(ChainedDigestProvider),
            log_store: Arc::new(MemoryLogStore::new()),
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn CatchEventTrigger>) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Trigger decorator feeding the batch accumulators: a fired start event
/// is a new case, and every fired work leaves a log record.
struct RecordingTrigger {
    inner: Arc<dyn CatchEventTrigger>,
    cases: Arc<PlatformInfoCounter>,
    logs: Arc<BatchLogBuffer>,
}

#[async_trait]
impl CatchEventTrigger for RecordingTrigger {
    async fn fire(&self, work: &MessageCoupleWork) -> Result<()> {
        self.inner.fire(work).await?;
        if work.waiting.kind == WaitingEventKind::StartEvent {
            self.cases.increment();
        }
        self.logs.append(LogRecord::new(
            work.tenant_id,
            "MESSAGE_CORRELATED",
            work.description(),
        ));
        Ok(())
    }
}

pub struct MessagingEngine;

impl MessagingEngine {
    /// Validate `config`, build the services and spawn the matching worker,
    /// the work executor and both batch updaters.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<EngineHandle> {
        config.validate()?;

        let transactions = Arc::new(TransactionManager::new());
        let platform_counter = Arc::new(PlatformInfoCounter::new());
        let log_buffer = Arc::new(BatchLogBuffer::new());

        let (dispatcher, receiver) = ChannelWorkDispatcher::new(config.messaging.work_queue_size);
        let messages = Arc::new(MessagesHandlingService::new(
            collaborators.correlation_store,
            Arc::new(dispatcher),
            collaborators.metrics,
            &config.messaging,
            config.tenant_id,
        ));
        let breakpoints = Arc::new(BreakpointService::new(
            collaborators.breakpoint_store,
            config.breakpoints.batch_size,
        ));

        let trigger = Arc::new(RecordingTrigger {
            inner: collaborators.trigger,
            cases: platform_counter.clone(),
            logs: log_buffer.clone(),
        });

        let platform_updater = BatchUpdater::new(
            Arc::new(PlatformInformationJob::new(
                platform_counter.clone(),
                collaborators.platform_info_provider,
                collaborators.platform_info_store,
            )),
            collaborators.lock_service.clone(),
            transactions.clone(),
            config.batch.flush_interval(),
        );
        let log_updater = BatchUpdater::new(
            Arc::new(LogBatchJob::new(
                log_buffer.clone(),
                collaborators.log_store,
                config.batch.log_batch_size,
            )),
            collaborators.lock_service,
            transactions.clone(),
            config.batch.flush_interval(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(4);

        let worker = MatchingWorker::new(messages.clone(), config.messaging.poll_interval());
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(rx).await }));

        let executor = WorkExecutor::new(receiver, trigger, messages.clone());
        tasks.push(tokio::spawn(executor.run(shutdown_rx.clone())));

        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { platform_updater.run(rx).await }));

        let rx = shutdown_rx;
        tasks.push(tokio::spawn(async move { log_updater.run(rx).await }));

        tracing::info!(
            tenant_id = config.tenant_id,
            max_couples = config.messaging.max_couples,
            "Messaging engine started"
        );

        Ok(EngineHandle {
            messages,
            breakpoints,
            platform_counter,
            log_buffer,
            transactions,
            shutdown_tx,
            tasks,
        })
    }
}

/// Running engine. Dropping it without [`EngineHandle::shutdown`] leaves the
/// tasks running until the runtime stops.
pub struct EngineHandle {
    messages: Arc<MessagesHandlingService>,
    breakpoints: Arc<BreakpointService>,
    platform_counter: Arc<PlatformInfoCounter>,
    log_buffer: Arc<BatchLogBuffer>,
    transactions: Arc<TransactionManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn messages(&self) -> &Arc<MessagesHandlingService> {
        &self.messages
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointService> {
        &self.breakpoints
    }

    pub fn platform_info_counter(&self) -> &Arc<PlatformInfoCounter> {
        &self.platform_counter
    }

    pub fn log_buffer(&self) -> &Arc<BatchLogBuffer> {
        &self.log_buffer
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Signal every task and wait for them. Batch updaters flush once more
    /// on the way out.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Engine task ended abnormally");
            }
        }
        tracing::info!("Messaging engine stopped");
    }
}
