//! Engine configuration with YAML loading and environment overrides.
//!
//! All sections are optional in the YAML file; missing values fall back to
//! the defaults below.
//!
//! ```yaml
//! tenant_id: 1
//! messaging:
//!   max_couples: 100
//!   poll_interval_ms: 1000
//!   reusable_event_kinds: [START_EVENT]
//! batch:
//!   flush_interval_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::messaging::WaitingEventKind;

/// Root configuration for the messaging engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tenant the engine runs for. Tags metrics and scopes tenant locks.
    pub tenant_id: i64,
    pub messaging: MessagingConfig,
    pub batch: BatchConfig,
    pub lock: LockConfig,
    pub breakpoints: BreakpointConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: 1,
            messaging: MessagingConfig::default(),
            batch: BatchConfig::default(),
            lock: LockConfig::default(),
            breakpoints: BreakpointConfig::default(),
        }
    }
}

/// Matching cycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Page size of one matching cycle.
    pub max_couples: usize,

    /// Interval between matching cycles when nothing wakes the worker.
    pub poll_interval_ms: u64,

    /// Waiting event kinds that stay available after being coupled.
    pub reusable_event_kinds: Vec<WaitingEventKind>,

    /// Capacity of the work queue between matching and execution.
    pub work_queue_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_couples: 100,
            poll_interval_ms: 1000,
            reusable_event_kinds: vec![WaitingEventKind::StartEvent],
            work_queue_size: 1024,
        }
    }
}

impl MessagingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Scheduled batch updater configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Interval between flushes (milliseconds).
    pub flush_interval_ms: u64,

    /// Maximum log records written per chunk.
    pub log_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
            log_batch_size: 100,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Cluster lock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum time a blocking `lock` call waits (milliseconds).
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Breakpoint cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointConfig {
    /// Rows loaded per query while rebuilding the cache.
    pub batch_size: usize,
}

impl Default for BreakpointConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl EngineConfig {
    /// Load from a YAML file and validate.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `BPMN_MSG_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `BPMN_MSG_*` environment overrides on top of `self`.
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = var("BPMN_MSG_TENANT_ID") {
            self.tenant_id = v;
        }
        if let Some(v) = var("BPMN_MSG_MAX_COUPLES") {
            self.messaging.max_couples = v;
        }
        if let Some(v) = var("BPMN_MSG_POLL_INTERVAL_MS") {
            self.messaging.poll_interval_ms = v;
        }
        if let Some(v) = var("BPMN_MSG_WORK_QUEUE_SIZE") {
            self.messaging.work_queue_size = v;
        }
        if let Some(v) = var("BPMN_MSG_FLUSH_INTERVAL_MS") {
            self.batch.flush_interval_ms = v;
        }
        if let Some(v) = var("BPMN_MSG_LOG_BATCH_SIZE") {
            self.batch.log_batch_size = v;
        }
        if let Some(v) = var("BPMN_MSG_LOCK_TIMEOUT_MS") {
            self.lock.timeout_ms = v;
        }
        if let Some(v) = var("BPMN_MSG_BREAKPOINT_BATCH_SIZE") {
            self.breakpoints.batch_size = v;
        }
        self
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.max_couples == 0 {
            return Err(ConfigError::Invalid(
                "messaging.max_couples must be > 0".to_string(),
            ));
        }
        if self.messaging.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "messaging.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.messaging.work_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "messaging.work_queue_size must be > 0".to_string(),
            ));
        }
        if self.batch.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch.flush_interval_ms must be > 0".to_string(),
            ));
        }
        if self.batch.log_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch.log_batch_size must be > 0".to_string(),
            ));
        }
        if self.breakpoints.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "breakpoints.batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_tenant_id(mut self, tenant_id: i64) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_max_couples(mut self, max_couples: usize) -> Self {
        self.messaging.max_couples = max_couples;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.messaging.poll_interval_ms = ms;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.batch.flush_interval_ms = ms;
        self
    }

    pub fn with_reusable_event_kinds(mut self, kinds: Vec<WaitingEventKind>) -> Self {
        self.messaging.reusable_event_kinds = kinds;
        self
    }
}
