//! Per-subject consecutive-failure tracking.
//!
//! `CLEAN -> ACCUMULATING -> FROZEN -> CLEAN`. A subject that hits the failure threshold
//! is frozen for a fixed duration; the freeze lapses on its own when read after expiry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use convgate_core::SubjectId;

use crate::clock::{duration_ms, Clock};
use crate::config::FailureConfig;
use crate::store::{keys, KeyedStore, StoreError};
use crate::FreezeStatus;

/// Stored failure state for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureRecord {
    pub count: u32,
    pub frozen_until_ms: Option<u64>,
}

impl FailureRecord {
    /// A freeze that has run out logically resets the record.
    #[must_use]
    pub fn is_spent(&self, now_ms: u64) -> bool {
        self.frozen_until_ms.is_some_and(|until| now_ms >= until)
    }

    #[must_use]
    pub fn status(&self, now_ms: u64) -> FreezeStatus {
        self.frozen_until_ms
            .map_or_else(FreezeStatus::thawed, |until| FreezeStatus::until(until, now_ms))
    }
}

pub struct FailureTracker {
    store: Arc<dyn KeyedStore<FailureRecord>>,
    clock: Arc<dyn Clock>,
    config: FailureConfig,
}

impl FailureTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyedStore<FailureRecord>>,
        clock: Arc<dyn Clock>,
        config: FailureConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Count one more consecutive failure, freezing the subject at the threshold.
    ///
    /// An active freeze is never extended.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record_failure(&self, subject: &SubjectId) -> Result<FailureRecord, StoreError> {
        let now = self.clock.now_ms();
        let max = self.config.max_consecutive;
        let freeze_ms = duration_ms(self.config.freeze());
        let key = keys::failures(subject);

        let mut apply = |slot: &mut Option<FailureRecord>| {
            let mut record = slot
                .take()
                .filter(|record| !record.is_spent(now))
                .unwrap_or_default();
            record.count = record.count.saturating_add(1);
            if record.count >= max && record.frozen_until_ms.is_none() {
                record.frozen_until_ms = Some(now.saturating_add(freeze_ms));
            }
            *slot = Some(record);
        };

        let committed = self
            .store
            .update(&key, self.config.freeze(), &mut apply)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("update of `{key}` not applied")))?;

        if committed.count == max {
            tracing::warn!(
                subject = %subject,
                failures = committed.count,
                freeze_secs = self.config.freeze_secs,
                "Subject frozen after consecutive failures"
            );
        }
        Ok(committed)
    }

    /// Whether `subject` is serving a failure freeze.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn is_frozen(&self, subject: &SubjectId) -> Result<FreezeStatus, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get(&keys::failures(subject))
            .await?
            .map_or_else(FreezeStatus::thawed, |record| record.status(now)))
    }

    /// Clear the subject's record. A no-op for subjects without one.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record_success(&self, subject: &SubjectId) -> Result<(), StoreError> {
        self.store.remove(&keys::failures(subject)).await?;
        Ok(())
    }

    /// Current record, if any.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record(&self, subject: &SubjectId) -> Result<Option<FailureRecord>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get(&keys::failures(subject))
            .await?
            .filter(|record| !record.is_spent(now)))
    }
}
