//! Content-fingerprint abuse caps.
//!
//! Two independent trackers keyed by content fingerprint:
//!
//! - [`GenerationTracker`] caps how many times one piece of content may be converted
//!   within a fixed horizon, across all subjects.
//! - [`AttemptTracker`] caps how many times one subject may submit the same content
//!   within a short window, freezing the pair once the cap is hit.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use convgate_core::{Fingerprint, SubjectId};

use crate::clock::{duration_ms, Clock};
use crate::config::FingerprintConfig;
use crate::store::{keys, KeyedStore, StoreError};
use crate::FreezeStatus;

// ─────────────────────────────────────────────────────────────────────────────
// Generation cap
// ─────────────────────────────────────────────────────────────────────────────

/// Generation count for one fingerprint within its current horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub count: u32,
    pub window_start_ms: u64,
}

/// A generation slot held by an in-progress admission.
///
/// Dropping it keeps the slot; hand it to [`GenerationTracker::release`] to give it back.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a reservation is either kept or released"]
pub struct GenerationReservation {
    key: String,
    window_start_ms: u64,
}

/// Result of [`GenerationTracker::try_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationCheck {
    Reserved(GenerationReservation),
    /// The fingerprint has used its allowance for the current horizon.
    Capped { retry_after: Duration },
}

pub struct GenerationTracker {
    store: Arc<dyn KeyedStore<GenerationRecord>>,
    clock: Arc<dyn Clock>,
    config: FingerprintConfig,
}

impl GenerationTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyedStore<GenerationRecord>>,
        clock: Arc<dyn Clock>,
        config: FingerprintConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Atomically check the cap and take a slot if one is free.
    ///
    /// The horizon starts at the first generation and is not extended by later ones.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn try_reserve(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<GenerationCheck, StoreError> {
        let now = self.clock.now_ms();
        let horizon_ms = duration_ms(self.config.generation_horizon());
        let cap = self.config.generation_cap;
        let key = keys::generations(fingerprint);

        let mut outcome = None;
        let mut apply = |slot: &mut Option<GenerationRecord>| {
            let mut record = slot
                .take()
                .filter(|record| now < record.window_start_ms.saturating_add(horizon_ms))
                .unwrap_or(GenerationRecord {
                    count: 0,
                    window_start_ms: now,
                });
            let window_end = record.window_start_ms.saturating_add(horizon_ms);
            if record.count >= cap {
                outcome = Some(GenerationCheck::Capped {
                    retry_after: Duration::from_millis(window_end.saturating_sub(now)),
                });
            } else {
                record.count += 1;
                outcome = Some(GenerationCheck::Reserved(GenerationReservation {
                    key: key.clone(),
                    window_start_ms: record.window_start_ms,
                }));
            }
            *slot = Some(record);
        };

        // The window itself is judged by `window_start_ms`; the TTL only reclaims memory.
        self.store
            .update(&key, self.config.generation_horizon(), &mut apply)
            .await?;
        outcome.ok_or_else(|| StoreError::Unavailable(format!("update of `{key}` not applied")))
    }

    /// Give a slot back after the admission it was taken for was denied.
    ///
    /// A no-op if the horizon has rolled over since the reservation.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn release(&self, reservation: GenerationReservation) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let horizon_ms = duration_ms(self.config.generation_horizon());
        let window_end = reservation.window_start_ms.saturating_add(horizon_ms);
        if now >= window_end {
            return Ok(());
        }
        let ttl = Duration::from_millis(window_end - now);
        self.store
            .update(&reservation.key, ttl, &mut |slot: &mut Option<GenerationRecord>| {
                if let Some(record) = slot.as_mut() {
                    if record.window_start_ms == reservation.window_start_ms {
                        record.count = record.count.saturating_sub(1);
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Generations recorded for `fingerprint` in the current horizon.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn count(&self, fingerprint: &Fingerprint) -> Result<u32, StoreError> {
        let now = self.clock.now_ms();
        let horizon_ms = duration_ms(self.config.generation_horizon());
        Ok(self
            .store
            .get(&keys::generations(fingerprint))
            .await?
            .filter(|record| now < record.window_start_ms.saturating_add(horizon_ms))
            .map_or(0, |record| record.count))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attempt cap
// ─────────────────────────────────────────────────────────────────────────────

/// Attempts by one subject on one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub count: u32,
    pub last_attempt_ms: u64,
    pub frozen_until_ms: Option<u64>,
}

impl AttemptRecord {
    /// Whether the record no longer carries any weight at `now_ms`.
    #[must_use]
    pub fn is_stale(&self, now_ms: u64, window_ms: u64) -> bool {
        match self.frozen_until_ms {
            Some(until) => now_ms >= until,
            None => now_ms > self.last_attempt_ms.saturating_add(window_ms),
        }
    }
}

pub struct AttemptTracker {
    store: Arc<dyn KeyedStore<AttemptRecord>>,
    clock: Arc<dyn Clock>,
    config: FingerprintConfig,
}

impl AttemptTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyedStore<AttemptRecord>>,
        clock: Arc<dyn Clock>,
        config: FingerprintConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The window includes its far edge, so the record outlives it by a millisecond.
    fn ttl(&self) -> Duration {
        (self.config.attempt_window() + Duration::from_millis(1)).max(self.config.attempt_freeze())
    }

    /// Whether the (subject, fingerprint) pair is frozen.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn check(
        &self,
        subject: &SubjectId,
        fingerprint: &Fingerprint,
    ) -> Result<FreezeStatus, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get(&keys::file_attempts(subject, fingerprint))
            .await?
            .and_then(|record| record.frozen_until_ms)
            .map_or_else(FreezeStatus::thawed, |until| FreezeStatus::until(until, now)))
    }

    /// Count one attempt, freezing the pair once the cap is reached.
    ///
    /// Attempts are counted within a sliding window measured from the latest attempt.
    /// An active freeze is never extended.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record_attempt(
        &self,
        subject: &SubjectId,
        fingerprint: &Fingerprint,
    ) -> Result<AttemptRecord, StoreError> {
        let now = self.clock.now_ms();
        let window_ms = duration_ms(self.config.attempt_window());
        let freeze_ms = duration_ms(self.config.attempt_freeze());
        let cap = self.config.attempt_cap;
        let key = keys::file_attempts(subject, fingerprint);

        let mut apply = |slot: &mut Option<AttemptRecord>| {
            let mut record = slot
                .take()
                .filter(|record| !record.is_stale(now, window_ms))
                .unwrap_or(AttemptRecord {
                    count: 0,
                    last_attempt_ms: now,
                    frozen_until_ms: None,
                });
            record.count = record.count.saturating_add(1);
            record.last_attempt_ms = now;
            if record.count >= cap && record.frozen_until_ms.is_none() {
                record.frozen_until_ms = Some(now.saturating_add(freeze_ms));
            }
            *slot = Some(record);
        };

        let committed = self
            .store
            .update(&key, self.ttl(), &mut apply)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("update of `{key}` not applied")))?;

        if committed.count == cap {
            tracing::debug!(
                subject = %subject,
                fingerprint = %fingerprint,
                attempts = committed.count,
                "File attempts frozen"
            );
        }
        Ok(committed)
    }

    /// Forget the pair's attempts.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn reset(
        &self,
        subject: &SubjectId,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        self.store
            .remove(&keys::file_attempts(subject, fingerprint))
            .await?;
        Ok(())
    }
}
