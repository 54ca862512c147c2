//! Behaviour when the counter store fails or stalls.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use convgate_core::{AdmissionRequest, ReasonCode, Subject, Tier};
use convgate_ratelimit::{
    AdmissionConfig, AdmissionController, AdmissionStores, AttemptRecord, BucketRecord, Clock,
    FailureRecord, GenerationRecord, KeyedStore, ManualClock, MemoryStore, StoreConfig,
    StoreError, UnavailablePolicy,
};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
enum Fault {
    Fail,
    Stall,
}

/// Wraps a [`MemoryStore`] and injects faults on demand.
struct FaultyStore<V> {
    inner: MemoryStore<V>,
    fault: Mutex<Option<Fault>>,
}

impl<V> FaultyStore<V> {
    fn new(clock: &Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStore::new(Arc::clone(clock)),
            fault: Mutex::new(None),
        }
    }

    fn inject(&self, fault: Option<Fault>) {
        *self.fault.lock() = fault;
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let fault = self.fault.lock().clone();
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(StoreError::Unavailable("connection refused".into())),
            Some(Fault::Stall) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<V> KeyedStore<V> for FaultyStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        apply: &mut (dyn for<'a> FnMut(&'a mut Option<V>) + Send),
    ) -> Result<Option<V>, StoreError> {
        self.gate().await?;
        self.inner.update(key, ttl, apply).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.gate().await?;
        self.inner.remove(key).await
    }
}

struct Harness {
    gate: AdmissionController,
    buckets: Arc<FaultyStore<BucketRecord>>,
    failures: Arc<FaultyStore<FailureRecord>>,
    attempts: Arc<FaultyStore<AttemptRecord>>,
    generations: Arc<MemoryStore<GenerationRecord>>,
}

fn harness(policy: UnavailablePolicy) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let buckets = Arc::new(FaultyStore::new(&clock));
    let failures = Arc::new(FaultyStore::new(&clock));
    let attempts = Arc::new(FaultyStore::new(&clock));
    let generations = Arc::new(MemoryStore::new(Arc::clone(&clock)));
    let stores = AdmissionStores {
        buckets: buckets.clone(),
        failures: failures.clone(),
        generations: generations.clone(),
        attempts: attempts.clone(),
    };
    let config = AdmissionConfig {
        store: StoreConfig::new(policy),
        ..AdmissionConfig::default()
    };
    Harness {
        gate: AdmissionController::with_stores(config, clock, stores),
        buckets,
        failures,
        attempts,
        generations,
    }
}

fn upload(fingerprint: &str) -> AdmissionRequest {
    upload_as(Tier::Plus, 4 * KB, fingerprint)
}

fn upload_as(tier: Tier, size_bytes: u64, fingerprint: &str) -> AdmissionRequest {
    AdmissionRequest::new(
        Subject::new("u1".parse().expect("subject"), tier),
        size_bytes,
        fingerprint.parse().expect("fingerprint"),
    )
}

#[tokio::test]
async fn deny_policy_reports_store_unavailable() {
    let h = harness(UnavailablePolicy::Deny);
    h.buckets.inject(Some(Fault::Fail));

    let decision = h.gate.decide(&upload("f1")).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, ReasonCode::StoreUnavailable);
    assert_eq!(decision.status_code(), 503);
    assert_eq!(decision.retry_after_secs, Some(1));
}

#[tokio::test]
async fn allow_policy_admits_without_enforcement() {
    let h = harness(UnavailablePolicy::Allow);
    h.buckets.inject(Some(Fault::Fail));

    for n in 0..20 {
        let decision = h.gate.decide(&upload(&format!("f{n}"))).await;
        assert!(decision.allowed, "{decision:?}");
        assert_eq!(decision.reason, ReasonCode::Ok);
    }
}

#[tokio::test]
async fn failed_admission_gives_back_generation_slot() {
    let h = harness(UnavailablePolicy::Deny);
    h.buckets.inject(Some(Fault::Fail));

    let decision = h.gate.decide(&upload("f1")).await;
    assert_eq!(decision.reason, ReasonCode::StoreUnavailable);

    let record = h
        .generations
        .get("filegen:f1")
        .await
        .expect("get")
        .expect("record kept for the horizon");
    assert_eq!(record.count, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_store_times_out() {
    let h = harness(UnavailablePolicy::Deny);
    h.buckets.inject(Some(Fault::Stall));

    let decision = h.gate.decide(&upload("f1")).await;
    assert_eq!(decision.reason, ReasonCode::StoreUnavailable);
}

#[tokio::test]
async fn recovers_once_store_is_back() {
    let h = harness(UnavailablePolicy::Deny);
    h.buckets.inject(Some(Fault::Fail));
    assert_eq!(
        h.gate.decide(&upload("f1")).await.reason,
        ReasonCode::StoreUnavailable
    );

    h.buckets.inject(None);
    let decision = h.gate.decide(&upload("f1")).await;
    assert!(decision.allowed, "{decision:?}");

    let quota = h
        .gate
        .quota(&"u1".parse().expect("subject"))
        .await
        .expect("quota")
        .expect("bucket");
    assert_eq!(quota.remaining, 9);
}

// ─────────────────────────────────────────────────────────────────────────────
// Outages while recording a denial
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn size_denial_stands_when_failure_store_is_down() {
    for policy in [UnavailablePolicy::Allow, UnavailablePolicy::Deny] {
        let h = harness(policy);
        h.failures.inject(Some(Fault::Fail));

        let decision = h.gate.decide(&upload_as(Tier::Basic, 60 * MB, "big")).await;
        assert!(!decision.allowed, "{policy:?}: {decision:?}");
        assert_eq!(decision.reason, ReasonCode::SizeExceeded);
        assert_eq!(decision.status_code(), 429);
    }
}

#[tokio::test]
async fn bucket_still_enforced_when_failure_store_is_down() {
    let h = harness(UnavailablePolicy::Allow);
    h.failures.inject(Some(Fault::Fail));

    let mut reasons = Vec::new();
    for n in 0..5 {
        let decision = h.gate.decide(&upload_as(Tier::Basic, KB, &format!("f{n}"))).await;
        reasons.push(decision.reason);
    }
    assert_eq!(
        reasons,
        [
            ReasonCode::Ok,
            ReasonCode::Ok,
            ReasonCode::RateExceeded,
            ReasonCode::RateExceeded,
            ReasonCode::RateExceeded,
        ]
    );
}

#[tokio::test]
async fn rate_denial_stands_when_attempt_store_is_down() {
    let h = harness(UnavailablePolicy::Allow);
    h.attempts.inject(Some(Fault::Fail));

    for fp in ["a", "b"] {
        assert!(h.gate.decide(&upload_as(Tier::Basic, KB, fp)).await.allowed);
    }
    let decision = h.gate.decide(&upload_as(Tier::Basic, KB, "c")).await;
    assert_eq!(decision.reason, ReasonCode::RateExceeded);
    assert_eq!(decision.retry_after_secs, Some(3_600));

    // The denial was still counted against the subject.
    let record = h
        .failures
        .get("attempts:u1")
        .await
        .expect("get")
        .expect("failure recorded");
    assert_eq!(record.count, 1);
}

#[tokio::test]
async fn deny_policy_only_applies_to_failed_reads() {
    let h = harness(UnavailablePolicy::Deny);
    h.attempts.inject(Some(Fault::Fail));

    // Size is decided before any tracker read, so the outage cannot turn it into a 503.
    let decision = h.gate.decide(&upload_as(Tier::Basic, 60 * MB, "big")).await;
    assert_eq!(decision.reason, ReasonCode::SizeExceeded);

    let decision = h.gate.decide(&upload_as(Tier::Basic, KB, "small")).await;
    assert_eq!(decision.reason, ReasonCode::StoreUnavailable);
}

#[test]
fn policy_must_be_explicit_in_config_files() {
    let err = AdmissionConfig::parse_str("[store]\ntimeout_ms = 100\n").expect_err("must fail");
    assert!(err.to_string().contains("on_unavailable"));

    let config = AdmissionConfig::parse_str("[store]\non_unavailable = \"allow\"\n").expect("parse");
    assert_eq!(config.store.on_unavailable, UnavailablePolicy::Allow);
}
