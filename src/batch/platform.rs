//! Platform information updater.
//!
//! Every started case bumps [`PlatformInfoCounter`]. On each flush the
//! drained count drives exactly that many calls to
//! [`PlatformInformationProvider::update`], each fed the previous result,
//! and the final value is persisted in the flush transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::BatchJob;
use crate::transaction::{Transaction, TransactionOutcome, TransactionSynchronization};

pub const PLATFORM_INFO_LOCK_ID: i64 = 1;
pub const PLATFORM_INFO_LOCK_TYPE: &str = "PLATFORM_INFORMATION";

/// Lock-free accumulator of information updates.
#[derive(Debug, Default)]
pub struct PlatformInfoCounter {
    units: AtomicU64,
}

impl PlatformInfoCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment(&self) {
        self.units.fetch_add(1, Ordering::AcqRel);
    }

    /// Put back units that could not be persisted.
    pub fn add(&self, units: u64) {
        self.units.fetch_add(units, Ordering::AcqRel);
    }

    pub fn pending(&self) -> u64 {
        self.units.load(Ordering::Acquire)
    }

    /// Take every accumulated unit, leaving zero. Increments racing with the
    /// drain land in the next period.
    pub fn drain(&self) -> u64 {
        self.units.swap(0, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInformation {
    pub case_count: u64,
    /// Hex digest chained over every update.
    pub digest: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Recomputes platform information from its previous value.
pub trait PlatformInformationProvider: Send + Sync {
    fn update(&self, previous: &PlatformInformation) -> Result<PlatformInformation>;
}

/// Counts cases and chains a SHA-256 digest so the result depends on how
/// many updates were applied.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChainedDigestProvider;

impl PlatformInformationProvider for ChainedDigestProvider {
    fn update(&self, previous: &PlatformInformation) -> Result<PlatformInformation> {
        let case_count = previous.case_count + 1;
        let mut hasher = Sha256::new();
        hasher.update(previous.digest.as_bytes());
        hasher.update(case_count.to_be_bytes());
        Ok(PlatformInformation {
            case_count,
            digest: hex::encode(hasher.finalize()),
            updated_at: Some(Utc::now()),
        })
    }
}

#[async_trait]
pub trait PlatformInfoStore: Send + Sync {
    /// Last committed value, default if never saved.
    async fn load(&self) -> Result<PlatformInformation>;

    async fn save(&self, tx: &mut Transaction, info: PlatformInformation) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPlatformInfoStore {
    current: Arc<Mutex<PlatformInformation>>,
}

fn guard(current: &Mutex<PlatformInformation>) -> MutexGuard<'_, PlatformInformation> {
    match current.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryPlatformInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> PlatformInformation {
        guard(&self.current).clone()
    }
}

#[async_trait]
impl PlatformInfoStore for MemoryPlatformInfoStore {
    async fn load(&self) -> Result<PlatformInformation> {
        Ok(self.current())
    }

    async fn save(&self, tx: &mut Transaction, info: PlatformInformation) -> Result<()> {
        let current = self.current.clone();
        tx.on_commit(move || {
            *guard(&current) = info;
        });
        Ok(())
    }
}

/// Gives drained units back to the counter if the flush does not commit.
struct RestoreUnits {
    counter: Arc<PlatformInfoCounter>,
    units: u64,
}

impl TransactionSynchronization for RestoreUnits {
    fn after_completion(&self, outcome: TransactionOutcome) {
        if outcome == TransactionOutcome::RolledBack {
            self.counter.add(self.units);
            tracing::debug!(units = self.units, "platform information units restored");
        }
    }
}

pub struct PlatformInformationJob {
    counter: Arc<PlatformInfoCounter>,
    provider: Arc<dyn PlatformInformationProvider>,
    store: Arc<dyn PlatformInfoStore>,
}

impl PlatformInformationJob {
    pub fn new(
        counter: Arc<PlatformInfoCounter>,
        provider: Arc<dyn PlatformInformationProvider>,
        store: Arc<dyn PlatformInfoStore>,
    ) -> Self {
        Self {
            counter,
            provider,
            store,
        }
    }

    pub fn counter(&self) -> &Arc<PlatformInfoCounter> {
        &self.counter
    }
}

#[async_trait]
impl BatchJob for PlatformInformationJob {
    fn name(&self) -> &str {
        "platform-information"
    }

    fn lock_resource(&self) -> (i64, &str) {
        (PLATFORM_INFO_LOCK_ID, PLATFORM_INFO_LOCK_TYPE)
    }

    fn has_pending(&self) -> bool {
        self.counter.pending() > 0
    }

    async fn flush(&self, tx: &mut Transaction) -> Result<usize> {
        let units = self.counter.drain();
        if units == 0 {
            return Ok(0);
        }
        tx.register_synchronization(Arc::new(RestoreUnits {
            counter: self.counter.clone(),
            units,
        }));

        let mut info = self
            .store
            .load()
            .await
            .context("Failed to load platform information")?;
        for _ in 0..units {
            info = self
                .provider
                .update(&info)
                .context("Failed to update platform information")?;
        }
        self.store
            .save(tx, info)
            .await
            .context("Failed to save platform information")?;
        Ok(units as usize)
    }
}
