//! BPMN message correlation and delayed execution.
//!
//! Pairs thrown messages with the catching flow nodes parked on them,
//! deduplicates ambiguous pairings and dispatches the survivors for
//! asynchronous execution. Alongside it run the breakpoint lookup cache and
//! the scheduled batch updaters (platform information, log records).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bpmn_messaging::{Collaborators, EngineConfig, MessagingEngine};
//! use bpmn_messaging::messaging::{MessageInstance, WaitingEventKind, WaitingMessageEvent};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EngineConfig::from_env();
//! let engine = MessagingEngine::start(config.clone(), Collaborators::in_memory(&config))?;
//!
//! engine
//!     .messages()
//!     .register_waiting_event(WaitingMessageEvent::new(
//!         WaitingEventKind::ReceiveTask,
//!         "order-paid",
//!         "fulfilment",
//!         "wait-payment",
//!     ))
//!     .await?;
//! engine
//!     .messages()
//!     .send_message(MessageInstance::new("order-paid", "fulfilment"))
//!     .await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Configuration and logging
pub mod config;
pub mod telemetry;

// Shared collaborators
pub mod lock;
pub mod metrics;
pub mod transaction;

// Message correlation
pub mod messaging;

// Cached breakpoint lookup
pub mod breakpoints;

// Scheduled batch updaters
pub mod batch;

// Wiring
pub mod engine;

pub use config::EngineConfig;
pub use engine::{Collaborators, EngineHandle, MessagingEngine};
pub use error::{ConfigError, DispatchError, LockError, TransactionError};
