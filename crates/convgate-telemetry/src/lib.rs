//! convgate telemetry - logging and metrics for the admission gate
//!
//! - **Structured logging**: `tracing` events rendered as JSON or human-readable lines
//! - **Metrics**: decision, failure, load and store counters through the `metrics` facade
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use convgate_telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::new("convgate").with_json_logs(false))?;
//!
//! tracing::info!(subject = "u1", "Admission checked");
//! convgate_telemetry::metrics::record_decision("OK");
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod logging;
pub mod metrics;

pub use logging::*;

use std::sync::OnceLock;

/// Configuration active since [`init_telemetry`] last succeeded.
static TELEMETRY: OnceLock<TelemetryConfig> = OnceLock::new();

/// Configuration for telemetry initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line.
    pub service_name: String,

    /// Log level filter (e.g., "info", "debug", "convgate_ratelimit=trace").
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "convgate".to_string(),
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    #[must_use]
    pub const fn with_json_logs(mut self, enabled: bool) -> Self {
        self.json_logs = enabled;
        self
    }
}

/// Install the global subscriber and describe convgate metrics.
///
/// Call once at startup. A second call fails because the global subscriber is
/// already set.
///
/// # Errors
///
/// Returns an error if the log filter is invalid or a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    init_logging(config)?;
    metrics::init_metrics();
    let _ = TELEMETRY.set(config.clone());
    tracing::debug!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

/// The configuration telemetry was initialized with, if any.
#[must_use]
pub fn active_config() -> Option<&'static TelemetryConfig> {
    TELEMETRY.get()
}

/// Telemetry error type.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
