//! Admission orchestration.
//!
//! [`AdmissionController::decide`] runs the ordered pipeline and short-circuits on the
//! first denial:
//!
//! 1. global load freeze
//! 2. payload ceiling
//! 3. subject freeze
//! 4. fingerprint generation cap
//! 5. (subject, fingerprint) attempt cap
//! 6. token bucket
//!
//! Denials at 2, 4, 5 and 6 count as a failure against the subject; denials at 4, 5
//! and 6 also count as an attempt on the file. Success clears both.
//!
//! The unavailable policy only decides a gate whose own read failed. Once a denial is
//! known it stands, even if recording its side effects fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use convgate_core::{ceil_secs, AdmissionRequest, Decision, ReasonCode, SubjectId, Tier};
use convgate_telemetry::metrics::{self as telemetry, names, Timer};

use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, UnavailablePolicy};
use crate::cost::{token_cost, SizeClass};
use crate::failure::{FailureRecord, FailureTracker};
use crate::fingerprint::{
    AttemptRecord, AttemptTracker, GenerationCheck, GenerationRecord, GenerationReservation,
    GenerationTracker,
};
use crate::load_shedder::{InFlightGuard, LoadShedder};
use crate::store::{KeyedStore, MemoryStore, StoreError};
use crate::token_bucket::{BucketRecord, QuotaState, TokenBucketRegistry};
use crate::AdmissionError;

/// Wait hint attached to `STORE_UNAVAILABLE` denials.
const STORE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Backing stores, one per tracker.
#[derive(Clone)]
pub struct AdmissionStores {
    pub buckets: Arc<dyn KeyedStore<BucketRecord>>,
    pub failures: Arc<dyn KeyedStore<FailureRecord>>,
    pub generations: Arc<dyn KeyedStore<GenerationRecord>>,
    pub attempts: Arc<dyn KeyedStore<AttemptRecord>>,
}

impl AdmissionStores {
    /// Process-local stores.
    #[must_use]
    pub fn in_memory(clock: &Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(MemoryStore::<BucketRecord>::new(Arc::clone(clock))),
            failures: Arc::new(MemoryStore::<FailureRecord>::new(Arc::clone(clock))),
            generations: Arc::new(MemoryStore::<GenerationRecord>::new(Arc::clone(clock))),
            attempts: Arc::new(MemoryStore::<AttemptRecord>::new(Arc::clone(clock))),
        }
    }
}

impl std::fmt::Debug for AdmissionStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionStores").finish_non_exhaustive()
    }
}

/// The admission gate.
pub struct AdmissionController {
    config: AdmissionConfig,
    stores: AdmissionStores,
    load: Arc<LoadShedder>,
    buckets: TokenBucketRegistry,
    failures: FailureTracker,
    generations: GenerationTracker,
    attempts: AttemptTracker,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("load", &self.load)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Controller on the system clock with in-memory stores.
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Controller on `clock` with in-memory stores.
    #[must_use]
    pub fn with_clock(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let stores = AdmissionStores::in_memory(&clock);
        Self::with_stores(config, clock, stores)
    }

    #[must_use]
    pub fn with_stores(config: AdmissionConfig, clock: Arc<dyn Clock>, stores: AdmissionStores) -> Self {
        Self {
            load: Arc::new(LoadShedder::new(config.load, Arc::clone(&clock))),
            buckets: TokenBucketRegistry::new(
                Arc::clone(&stores.buckets),
                Arc::clone(&clock),
                config.quota,
            ),
            failures: FailureTracker::new(
                Arc::clone(&stores.failures),
                Arc::clone(&clock),
                config.failures,
            ),
            generations: GenerationTracker::new(
                Arc::clone(&stores.generations),
                Arc::clone(&clock),
                config.fingerprint,
            ),
            attempts: AttemptTracker::new(Arc::clone(&stores.attempts), clock, config.fingerprint),
            stores,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    #[must_use]
    pub const fn load_shedder(&self) -> &Arc<LoadShedder> {
        &self.load
    }

    /// Mark a request as in flight for the lifetime of the returned guard.
    #[must_use = "the request stops counting as in flight when the guard drops"]
    pub fn enter(&self) -> InFlightGuard {
        self.load.enter()
    }

    /// Validate raw transport values, then [`decide`](Self::decide).
    ///
    /// # Errors
    /// Returns [`AdmissionError::InvalidRequest`] for malformed input; no tracker is touched.
    pub async fn check(
        &self,
        subject: &str,
        tier: Tier,
        size_bytes: i64,
        fingerprint: &str,
    ) -> Result<Decision, AdmissionError> {
        let request = AdmissionRequest::parse(subject, tier, size_bytes, fingerprint)?;
        Ok(self.decide(&request).await)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Policy denials and store outages both come back as a [`Decision`]. A denial that
    /// is already known is returned even if recording it fails.
    pub async fn decide(&self, request: &AdmissionRequest) -> Decision {
        let timer = Timer::start(names::ADMISSION_DURATION, &[]);
        let decision = self.evaluate(request).await.unwrap_or_else(|denial| denial);
        let elapsed = timer.stop();

        telemetry::record_decision(decision.reason.as_str());
        if decision.allowed {
            tracing::debug!(
                subject = %request.subject,
                tier = %request.tier,
                fingerprint = %request.fingerprint,
                size_bytes = request.size_bytes,
                elapsed_ms = elapsed * 1_000.0,
                "Admission allowed"
            );
        } else {
            tracing::warn!(
                subject = %request.subject,
                tier = %request.tier,
                fingerprint = %request.fingerprint,
                size_bytes = request.size_bytes,
                reason = %decision.reason,
                retry_after_secs = ?decision.retry_after_secs,
                "Admission denied"
            );
        }
        decision
    }

    /// Current quota for `subject`, without consuming anything.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn quota(&self, subject: &SubjectId) -> Result<Option<QuotaState>, StoreError> {
        self.bounded("buckets.peek", self.buckets.peek(subject)).await
    }

    /// Drop expired entries from every store. Returns how many were removed.
    ///
    /// # Errors
    /// Returns the first store error.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut purged = self
            .bounded("buckets.purge", self.stores.buckets.purge_expired())
            .await?;
        purged += self
            .bounded("failures.purge", self.stores.failures.purge_expired())
            .await?;
        purged += self
            .bounded("generations.purge", self.stores.generations.purge_expired())
            .await?;
        purged += self
            .bounded("attempts.purge", self.stores.attempts.purge_expired())
            .await?;
        tracing::debug!(purged, "Purged expired admission state");
        Ok(purged)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// `Err` carries a denial made by the unavailable policy.
    async fn evaluate(&self, request: &AdmissionRequest) -> Result<Decision, Decision> {
        let load = self.load.check();
        if load.frozen {
            return Ok(Decision::deny(
                ReasonCode::SystemOverloaded,
                format!(
                    "Server is overloaded. Try again in {} seconds.",
                    ceil_secs(load.remaining)
                ),
                Some(load.remaining),
            ));
        }

        if request.size_bytes > self.config.payload.max_size_bytes {
            self.record_failure(&request.subject, ReasonCode::SizeExceeded)
                .await;
            return Ok(Decision::deny(
                ReasonCode::SizeExceeded,
                "File size exceeds the maximum allowed size.",
                None,
            ));
        }

        let frozen = self
            .gate(
                request,
                "failures.is_frozen",
                self.failures.is_frozen(&request.subject),
            )
            .await?;
        if let Some(frozen) = frozen.filter(|status| status.frozen) {
            let minutes = ceil_secs(frozen.remaining).div_ceil(60);
            return Ok(Decision::deny(
                ReasonCode::SubjectFrozen,
                format!("Too many failed attempts. Try again in {minutes} minutes."),
                Some(frozen.remaining),
            ));
        }

        let reservation = match self
            .gate(
                request,
                "generations.try_reserve",
                self.generations.try_reserve(&request.fingerprint),
            )
            .await?
        {
            Some(GenerationCheck::Reserved(reservation)) => Some(reservation),
            Some(GenerationCheck::Capped { retry_after }) => {
                self.record_denial(request, ReasonCode::FileGenerationCap)
                    .await;
                return Ok(Decision::deny(
                    ReasonCode::FileGenerationCap,
                    "This file has been generated too many times.",
                    Some(retry_after),
                ));
            }
            None => None,
        };

        let outcome = self.evaluate_reserved(request).await;
        if let Some(reservation) = reservation {
            if !matches!(&outcome, Ok(decision) if decision.allowed) {
                self.release_generation(request, reservation).await;
            }
        }
        outcome
    }

    /// Steps after a generation slot is held. The caller releases the slot unless this
    /// admits the request.
    async fn evaluate_reserved(&self, request: &AdmissionRequest) -> Result<Decision, Decision> {
        let attempts = self
            .gate(
                request,
                "attempts.check",
                self.attempts.check(&request.subject, &request.fingerprint),
            )
            .await?;
        if let Some(attempts) = attempts.filter(|status| status.frozen) {
            self.record_denial(request, ReasonCode::FileAttemptCap)
                .await;
            return Ok(Decision::deny(
                ReasonCode::FileAttemptCap,
                "Too many attempts with this file. Try a different file.",
                Some(attempts.remaining),
            ));
        }

        let cost = token_cost(request.size_bytes, &self.config.payload);
        let consumption = self
            .gate(
                request,
                "buckets.consume",
                self.buckets.consume(&request.subject, request.tier, cost),
            )
            .await?;
        match consumption {
            Some(consumption) if !consumption.granted => {
                self.record_denial(request, ReasonCode::RateExceeded)
                    .await;
                return Ok(Decision::deny(
                    ReasonCode::RateExceeded,
                    format!(
                        "Rate limit exceeded. Try again in {} seconds.",
                        ceil_secs(consumption.retry_after)
                    ),
                    Some(consumption.retry_after),
                ));
            }
            Some(consumption) => tracing::trace!(
                subject = %request.subject,
                size_class = SizeClass::of(request.size_bytes, &self.config.payload).as_str(),
                charged = consumption.charged,
                remaining = consumption.remaining,
                limit = consumption.limit,
                "Tokens consumed"
            ),
            None => {}
        }

        self.on_success(request).await;
        Ok(Decision::allow())
    }

    async fn record_failure(&self, subject: &SubjectId, reason: ReasonCode) {
        debug_assert!(reason.counts_as_failure());
        match self
            .bounded("failures.record", self.failures.record_failure(subject))
            .await
        {
            Ok(_) => telemetry::record_failure(reason.as_str()),
            Err(err) => tracing::warn!(
                subject = %subject,
                reason = %reason,
                error = %err,
                "Failed to record failure"
            ),
        }
    }

    /// Failure against the subject plus an attempt on the file.
    async fn record_denial(&self, request: &AdmissionRequest, reason: ReasonCode) {
        self.record_failure(&request.subject, reason).await;
        if let Err(err) = self
            .bounded(
                "attempts.record",
                self.attempts
                    .record_attempt(&request.subject, &request.fingerprint),
            )
            .await
        {
            tracing::warn!(
                subject = %request.subject,
                fingerprint = %request.fingerprint,
                reason = %reason,
                error = %err,
                "Failed to record file attempt"
            );
        }
    }

    /// Clear failure and attempt state. The request is already admitted, so store
    /// trouble here only warns.
    async fn on_success(&self, request: &AdmissionRequest) {
        if let Err(err) = self
            .bounded("failures.clear", self.failures.record_success(&request.subject))
            .await
        {
            tracing::warn!(subject = %request.subject, error = %err, "Failed to clear failure record");
        }
        if let Err(err) = self
            .bounded(
                "attempts.reset",
                self.attempts.reset(&request.subject, &request.fingerprint),
            )
            .await
        {
            tracing::warn!(
                subject = %request.subject,
                fingerprint = %request.fingerprint,
                error = %err,
                "Failed to reset file attempts"
            );
        }
    }

    async fn release_generation(&self, request: &AdmissionRequest, reservation: GenerationReservation) {
        if let Err(err) = self
            .bounded("generations.release", self.generations.release(reservation))
            .await
        {
            tracing::warn!(
                fingerprint = %request.fingerprint,
                error = %err,
                "Failed to release generation slot"
            );
        }
    }

    /// Read one gate's state, applying the unavailable policy when the store fails.
    ///
    /// `Ok(None)` means the store is down and the policy lets this gate pass.
    async fn gate<T, F>(
        &self,
        request: &AdmissionRequest,
        operation: &'static str,
        call: F,
    ) -> Result<Option<T>, Decision>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let err = match self.bounded(operation, call).await {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        match self.config.store.on_unavailable {
            UnavailablePolicy::Deny => {
                tracing::error!(
                    subject = %request.subject,
                    operation,
                    error = %err,
                    "Admission state unavailable, denying"
                );
                Err(Decision::deny(
                    ReasonCode::StoreUnavailable,
                    "Admission state is temporarily unavailable. Try again shortly.",
                    Some(STORE_RETRY_AFTER),
                ))
            }
            UnavailablePolicy::Allow => {
                tracing::warn!(
                    subject = %request.subject,
                    operation,
                    error = %err,
                    "Admission state unavailable, skipping check"
                );
                Ok(None)
            }
        }
    }

    /// Run one store call under the configured timeout.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let limit = self.config.store.timeout();
        let result = tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)));
        if let Err(err) = &result {
            telemetry::record_store_error(operation);
            tracing::debug!(operation, error = %err, "Store call failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use convgate_core::{Fingerprint, Subject};

    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    fn controller() -> (Arc<ManualClock>, AdmissionController) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let controller = AdmissionController::with_clock(AdmissionConfig::default(), clock.clone());
        (clock, controller)
    }

    fn request(subject: &str, tier: Tier, size_bytes: u64, fingerprint: &str) -> AdmissionRequest {
        AdmissionRequest::new(
            Subject::new(subject.parse().unwrap(), tier),
            size_bytes,
            fingerprint.parse::<Fingerprint>().unwrap(),
        )
    }

    #[tokio::test]
    async fn allows_within_quota() {
        let (_clock, controller) = controller();
        let decision = controller
            .decide(&request("u1", Tier::Basic, 10 * KB, "f1"))
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, ReasonCode::Ok);
        assert_eq!(decision.message, "Allowed");
    }

    #[tokio::test]
    async fn rate_denial_message_and_retry() {
        let (_clock, controller) = controller();
        for fp in ["a", "b"] {
            assert!(controller.decide(&request("u1", Tier::Basic, 10 * KB, fp)).await.allowed);
        }
        let denied = controller
            .decide(&request("u1", Tier::Basic, 10 * KB, "c"))
            .await;
        assert_eq!(denied.reason, ReasonCode::RateExceeded);
        assert_eq!(denied.retry_after_secs, Some(3_600));
        assert_eq!(denied.message, "Rate limit exceeded. Try again in 3600 seconds.");
    }

    #[tokio::test]
    async fn size_denial_records_failure_only() {
        let (_clock, controller) = controller();
        let denied = controller
            .decide(&request("u1", Tier::Premium, 60 * MB, "big"))
            .await;
        assert_eq!(denied.reason, ReasonCode::SizeExceeded);
        assert_eq!(denied.retry_after_secs, None);
        assert_eq!(denied.status_code(), 429);

        let subject: SubjectId = "u1".parse().unwrap();
        assert_eq!(controller.failures.record(&subject).await.unwrap().unwrap().count, 1);
        assert!(controller.quota(&subject).await.unwrap().is_none());
        assert_eq!(
            controller.generations.count(&"big".parse().unwrap()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn three_denials_freeze_subject() {
        let (clock, controller) = controller();
        for fp in ["a", "b"] {
            controller.decide(&request("u1", Tier::Basic, KB, fp)).await;
        }
        for fp in ["c", "d", "e"] {
            let denied = controller.decide(&request("u1", Tier::Basic, KB, fp)).await;
            assert_eq!(denied.reason, ReasonCode::RateExceeded);
        }

        let frozen = controller.decide(&request("u1", Tier::Basic, KB, "f")).await;
        assert_eq!(frozen.reason, ReasonCode::SubjectFrozen);
        assert_eq!(frozen.message, "Too many failed attempts. Try again in 30 minutes.");
        assert_eq!(frozen.retry_after_secs, Some(1_800));

        clock.advance(Duration::from_secs(60 * 60));
        assert!(controller.decide(&request("u1", Tier::Basic, KB, "g")).await.allowed);
    }

    #[tokio::test]
    async fn frozen_subject_does_not_extend_freeze() {
        let (clock, controller) = controller();
        for _ in 0..3 {
            controller.decide(&request("u1", Tier::Basic, 60 * MB, "x")).await;
        }
        clock.advance(Duration::from_secs(29 * 60 + 30));
        let frozen = controller.decide(&request("u1", Tier::Basic, KB, "y")).await;
        assert_eq!(frozen.reason, ReasonCode::SubjectFrozen);
        assert_eq!(frozen.message, "Too many failed attempts. Try again in 1 minutes.");
        assert_eq!(frozen.retry_after_secs, Some(30));
    }

    #[tokio::test]
    async fn generation_cap_spans_subjects() {
        let (_clock, controller) = controller();
        for n in 0..5 {
            let subject = format!("s{n}");
            assert!(controller.decide(&request(&subject, Tier::Plus, KB, "shared")).await.allowed);
        }
        let capped = controller.decide(&request("s5", Tier::Plus, KB, "shared")).await;
        assert_eq!(capped.reason, ReasonCode::FileGenerationCap);
        assert_eq!(capped.message, "This file has been generated too many times.");
    }

    #[tokio::test]
    async fn denied_admission_releases_generation_slot() {
        let (_clock, controller) = controller();
        for fp in ["a", "b"] {
            controller.decide(&request("u1", Tier::Basic, KB, fp)).await;
        }
        let denied = controller.decide(&request("u1", Tier::Basic, KB, "f")).await;
        assert_eq!(denied.reason, ReasonCode::RateExceeded);
        assert_eq!(
            controller.generations.count(&"f".parse().unwrap()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn attempt_cap_blocks_the_file_not_the_subject() {
        let config = AdmissionConfig {
            failures: crate::config::FailureConfig {
                max_consecutive: 100,
                ..Default::default()
            },
            ..AdmissionConfig::default()
        };
        let clock = Arc::new(ManualClock::new(0));
        let controller = AdmissionController::with_clock(config, clock.clone());

        for fp in ["a", "b"] {
            controller.decide(&request("u1", Tier::Basic, KB, fp)).await;
        }
        for _ in 0..3 {
            let denied = controller.decide(&request("u1", Tier::Basic, KB, "f")).await;
            assert_eq!(denied.reason, ReasonCode::RateExceeded);
        }
        let capped = controller.decide(&request("u1", Tier::Basic, KB, "f")).await;
        assert_eq!(capped.reason, ReasonCode::FileAttemptCap);
        assert_eq!(capped.message, "Too many attempts with this file. Try a different file.");

        let other = controller.decide(&request("u1", Tier::Basic, KB, "g")).await;
        assert_eq!(other.reason, ReasonCode::RateExceeded);
    }

    #[tokio::test]
    async fn overload_takes_precedence() {
        let (_clock, controller) = controller();
        let _guards: Vec<_> = (0..81).map(|_| controller.enter()).collect();
        let denied = controller
            .decide(&request("u1", Tier::Basic, 60 * MB, "f"))
            .await;
        assert_eq!(denied.reason, ReasonCode::SystemOverloaded);
        assert_eq!(denied.status_code(), 503);
        assert_eq!(denied.message, "Server is overloaded. Try again in 30 seconds.");
    }

    #[tokio::test]
    async fn weighted_cost_drains_basic_bucket() {
        let (_clock, controller) = controller();
        assert!(controller.decide(&request("u1", Tier::Basic, 25 * MB, "big")).await.allowed);
        let denied = controller.decide(&request("u1", Tier::Basic, KB, "small")).await;
        assert_eq!(denied.reason, ReasonCode::RateExceeded);
    }

    #[tokio::test]
    async fn check_rejects_malformed_input() {
        let (_clock, controller) = controller();
        let err = controller.check("", Tier::Basic, 10, "f").await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRequest(_)));
        let err = controller.check("u1", Tier::Basic, -5, "f").await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRequest(_)));
        assert!(controller
            .quota(&"u1".parse().unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn purge_removes_expired_state() {
        let (clock, controller) = controller();
        controller.decide(&request("u1", Tier::Basic, 60 * MB, "x")).await;
        assert!(controller.decide(&request("u2", Tier::Basic, KB, "y")).await.allowed);

        clock.advance(Duration::from_secs(3 * 24 * 60 * 60));
        assert!(controller.purge_expired().await.unwrap() >= 2);
        assert_eq!(controller.purge_expired().await.unwrap(), 0);
    }
}
