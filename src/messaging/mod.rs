//! Message correlation: waiting events, thrown messages, and the matching
//! cycle that pairs them and dispatches the resulting works.

pub mod dedup;
pub mod dispatcher;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use dedup::DedupPolicy;
pub use dispatcher::{
    CatchEventTrigger, ChannelWorkDispatcher, LoggingTrigger, MessageCoupleWork, WorkDispatcher,
    WorkReceiver,
};
pub use service::{CoupleOutcome, CycleReport, MessagesHandlingService};
pub use store::{CorrelationStore, MemoryCorrelationStore};
pub use types::{MessageEventCouple, MessageInstance, WaitingEventKind, WaitingMessageEvent};
pub use worker::{MatchingWorker, WorkExecutor};
