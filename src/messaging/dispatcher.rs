//! Work dispatch to asynchronous execution.
//!
//! The matching cycle never fires a catching flow node itself. It schedules
//! a [`MessageCoupleWork`] through a [`WorkDispatcher`]; the default
//! dispatcher is a bounded queue drained by the work executor, which calls
//! the [`CatchEventTrigger`] that actually resumes the flow node.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::types::{MessageInstance, WaitingMessageEvent};
use crate::error::DispatchError;

/// Everything needed to fire one catching flow node with one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageCoupleWork {
    pub tenant_id: i64,
    pub message: MessageInstance,
    pub waiting: WaitingMessageEvent,
}

impl MessageCoupleWork {
    pub fn description(&self) -> String {
        format!(
            "message '{}' ({}) -> {} '{}' ({})",
            self.message.message_name,
            self.message.id,
            self.waiting.kind,
            self.waiting.flow_node_name,
            self.waiting.id
        )
    }
}

/// Schedules works for asynchronous execution. Fire-and-forget: an `Ok`
/// only means the work was accepted.
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    async fn schedule(&self, work: MessageCoupleWork) -> Result<()>;
}

/// Resumes (or starts) the flow node a work targets.
#[async_trait]
pub trait CatchEventTrigger: Send + Sync {
    async fn fire(&self, work: &MessageCoupleWork) -> Result<()>;
}

/// Dispatcher over a bounded in-process queue.
///
/// `schedule` never waits: a full queue is reported as an error so the
/// matching cycle can release the claim and move on.
#[derive(Clone)]
pub struct ChannelWorkDispatcher {
    sender: mpsc::Sender<MessageCoupleWork>,
    capacity: usize,
}

impl ChannelWorkDispatcher {
    /// Create a dispatcher and the receiver for the work executor.
    pub fn new(capacity: usize) -> (Self, WorkReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, WorkReceiver { receiver })
    }

    /// Works queued and not yet taken by the executor.
    pub fn pending(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

#[async_trait]
impl WorkDispatcher for ChannelWorkDispatcher {
    async fn schedule(&self, work: MessageCoupleWork) -> Result<()> {
        match self.sender.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull {
                capacity: self.capacity,
            }
            .into()),
            Err(TrySendError::Closed(_)) => Err(DispatchError::QueueClosed.into()),
        }
    }
}

/// Receiving end of a [`ChannelWorkDispatcher`].
pub struct WorkReceiver {
    receiver: mpsc::Receiver<MessageCoupleWork>,
}

impl WorkReceiver {
    /// Wait for the next work. `None` once every dispatcher is dropped.
    pub async fn recv(&mut self) -> Option<MessageCoupleWork> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MessageCoupleWork> {
        self.receiver.try_recv().ok()
    }

    /// Refuse further works. Already queued works stay readable through
    /// [`WorkReceiver::try_recv`].
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Trigger that only logs, for nodes without a flow-node runtime attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTrigger;

#[async_trait]
impl CatchEventTrigger for LoggingTrigger {
    async fn fire(&self, work: &MessageCoupleWork) -> Result<()> {
        tracing::info!(
            tenant_id = work.tenant_id,
            message_id = work.message.id,
            waiting_id = work.waiting.id,
            kind = %work.waiting.kind,
            flow_node = %work.waiting.flow_node_name,
            "catch event fired"
        );
        Ok(())
    }
}
