//! Races between admission tasks on the multi-threaded runtime.

#![forbid(unsafe_code)]

use std::sync::Arc;

use convgate_core::{AdmissionRequest, Fingerprint, ReasonCode, Subject, SubjectId, Tier};
use convgate_ratelimit::{
    AdmissionConfig, AdmissionController, BucketRecord, Clock, FingerprintConfig, GenerationCheck,
    GenerationRecord, GenerationTracker, ManualClock, MemoryStore, QuotaConfig,
    TokenBucketRegistry,
};

const TASKS: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_consumers_get_exactly_capacity_grants() {
    let clock = Arc::new(ManualClock::new(0));
    let store: Arc<MemoryStore<BucketRecord>> =
        Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
    let registry = Arc::new(TokenBucketRegistry::new(
        store,
        clock,
        QuotaConfig::default(),
    ));
    let subject: SubjectId = "racer".parse().expect("subject");

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let registry = Arc::clone(&registry);
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            registry
                .consume(&subject, Tier::Plus, 1)
                .await
                .expect("consume")
                .granted
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.expect("task") {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_reservations_never_exceed_generation_cap() {
    let clock = Arc::new(ManualClock::new(0));
    let store: Arc<MemoryStore<GenerationRecord>> =
        Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
    let tracker = Arc::new(GenerationTracker::new(
        store,
        clock,
        FingerprintConfig::default(),
    ));
    let fingerprint: Fingerprint = "contended".parse().expect("fingerprint");

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let tracker = Arc::clone(&tracker);
        let fingerprint = fingerprint.clone();
        handles.push(tokio::spawn(async move {
            matches!(
                tracker.try_reserve(&fingerprint).await.expect("reserve"),
                GenerationCheck::Reserved(_)
            )
        }));
    }

    let mut reserved = 0;
    for handle in handles {
        if handle.await.expect("task") {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 5);
    assert_eq!(tracker.count(&fingerprint).await.expect("count"), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_decisions_for_one_subject_respect_quota() {
    let clock = Arc::new(ManualClock::new(0));
    let gate = Arc::new(AdmissionController::with_clock(
        AdmissionConfig::default(),
        clock,
    ));

    let mut handles = Vec::with_capacity(TASKS);
    for n in 0..TASKS {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let request = AdmissionRequest::new(
                Subject::new("burst".parse().expect("subject"), Tier::Plus),
                1024,
                format!("file-{n}").parse().expect("fingerprint"),
            );
            let _in_flight = gate.enter();
            gate.decide(&request).await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.expect("task");
        if decision.allowed {
            allowed += 1;
        } else {
            assert!(
                matches!(
                    decision.reason,
                    ReasonCode::RateExceeded | ReasonCode::SubjectFrozen
                ),
                "{decision:?}"
            );
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(gate.load_shedder().in_flight(), 0);
}
