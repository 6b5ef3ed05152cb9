//! Typed errors for the messaging engine.
//!
//! Collaborator traits (stores, triggers) return `anyhow::Result` so that
//! backends can attach their own context. The errors below are the ones the
//! engine itself raises and that callers may want to match on.

use std::path::PathBuf;

use thiserror::Error;

/// Cluster lock errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited_ms}ms waiting for lock on {resource_type}:{resource_id} (tenant {tenant_id})")]
    Timeout {
        resource_id: i64,
        resource_type: String,
        tenant_id: i64,
        waited_ms: u64,
    },

    #[error("Lock on {resource_type}:{resource_id} is held by another owner")]
    NotOwner {
        resource_id: i64,
        resource_type: String,
    },

    #[error("Lock on {resource_type}:{resource_id} was already released")]
    Released {
        resource_id: i64,
        resource_type: String,
    },
}

/// Unit-of-work errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction {0} is already completed")]
    AlreadyCompleted(u64),

    #[error("Transaction {id} failed to commit: {reason}")]
    CommitFailed { id: u64, reason: String },
}

/// Work dispatch errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Work queue is closed")]
    QueueClosed,

    #[error("Work queue is full ({capacity} pending works)")]
    QueueFull { capacity: usize },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
