//! Metrics for the admission gate.
//!
//! Recorded through the `metrics` facade; every call is a no-op until the embedding
//! process installs a recorder.

use std::sync::OnceLock;
use std::time::Instant;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

/// Metric names.
pub mod names {
    pub const ADMISSION_DECISIONS: &str = "convgate_admission_decisions_total";
    pub const ADMISSION_DURATION: &str = "convgate_admission_duration_seconds";
    pub const FAILURES_RECORDED: &str = "convgate_failures_recorded_total";
    pub const LOAD_IN_FLIGHT: &str = "convgate_load_in_flight";
    pub const STORE_ERRORS: &str = "convgate_store_errors_total";
}

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Register descriptions for every convgate metric. Idempotent.
pub fn init_metrics() {
    if METRICS_INITIALIZED.set(()).is_err() {
        return;
    }

    describe_counter!(
        names::ADMISSION_DECISIONS,
        "Admission decisions, labelled by reason code"
    );
    describe_histogram!(
        names::ADMISSION_DURATION,
        Unit::Seconds,
        "Time spent deciding one admission"
    );
    describe_counter!(
        names::FAILURES_RECORDED,
        "Consecutive-failure records written against subjects"
    );
    describe_gauge!(names::LOAD_IN_FLIGHT, "Requests currently in flight");
    describe_counter!(
        names::STORE_ERRORS,
        "Counter store calls that failed or timed out, labelled by operation"
    );
}

fn owned(labels: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
    labels.iter().map(|(k, v)| (*k, (*v).to_string())).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Primitive operations
// ─────────────────────────────────────────────────────────────────────────────

/// Increment a counter by 1.
pub fn increment_counter(name: &'static str, labels: &[(&'static str, &str)]) {
    let labels = owned(labels);
    counter!(name, &labels).increment(1);
}

/// Set a gauge value.
pub fn set_gauge(name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
    let labels = owned(labels);
    gauge!(name, &labels).set(value);
}

/// Record a histogram value.
pub fn record_histogram(name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
    let labels = owned(labels);
    histogram!(name, &labels).record(value);
}

/// Measures one operation and records it to a histogram.
pub struct Timer {
    start: Instant,
    name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl Timer {
    #[must_use]
    pub fn start(name: &'static str, labels: &[(&'static str, &str)]) -> Self {
        Self {
            start: Instant::now(),
            name,
            labels: owned(labels),
        }
    }

    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop and record, returning elapsed seconds.
    pub fn stop(self) -> f64 {
        let elapsed = self.elapsed_seconds();
        histogram!(self.name, &self.labels).record(elapsed);
        elapsed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Count one admission decision.
pub fn record_decision(reason: &str) {
    increment_counter(names::ADMISSION_DECISIONS, &[("reason", reason)]);
}

/// Count one failure written against a subject.
pub fn record_failure(reason: &str) {
    increment_counter(names::FAILURES_RECORDED, &[("reason", reason)]);
}

/// Count one failed or timed-out store call.
pub fn record_store_error(operation: &str) {
    increment_counter(names::STORE_ERRORS, &[("operation", operation)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures() {
        let timer = Timer::start(names::ADMISSION_DURATION, &[]);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_seconds() >= 0.01);
        assert!(timer.stop() >= 0.01);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        init_metrics();
        record_decision("OK");
        record_failure("RATE_EXCEEDED");
        record_store_error("buckets.consume");
        set_gauge(names::LOAD_IN_FLIGHT, 3.0, &[]);
    }

    #[test]
    fn test_names_share_prefix() {
        for name in [
            names::ADMISSION_DECISIONS,
            names::ADMISSION_DURATION,
            names::FAILURES_RECORDED,
            names::LOAD_IN_FLIGHT,
            names::STORE_ERRORS,
        ] {
            assert!(name.starts_with("convgate_"), "{name}");
        }
    }
}
