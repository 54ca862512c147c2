//! Admission configuration.
//!
//! Loaded from TOML. Every section is optional except `[store]`, whose
//! `on_unavailable` policy must always be stated explicitly.
//!
//! ```toml
//! [quota]
//! basic = 2
//! plus = 10
//! premium = 200
//! refill_period_secs = 3600
//!
//! [store]
//! on_unavailable = "deny"
//! ```

use std::path::Path;
use std::time::Duration;

use convgate_core::Tier;
use serde::{Deserialize, Serialize};

/// Default payload ceiling: 50 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Errors returned by configuration loading/validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Full admission configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub failures: FailureConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub load: LoadConfig,
    pub store: StoreConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            payload: PayloadConfig::default(),
            failures: FailureConfig::default(),
            fingerprint: FingerprintConfig::default(),
            load: LoadConfig::default(),
            store: StoreConfig::new(UnavailablePolicy::Deny),
        }
    }
}

impl AdmissionConfig {
    /// Parse TOML and validate.
    ///
    /// # Errors
    /// Returns an error if parsing or validation fails.
    pub fn parse_str(input: &str) -> Result<Self, ConfigError> {
        let parsed: Self = toml::from_str(input)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_str(&input)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota.validate()?;
        self.payload.validate()?;
        self.failures.validate()?;
        self.fingerprint.validate()?;
        self.load.validate()?;
        self.store.validate()
    }
}

/// Per-tier token bucket sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    pub basic: u32,
    pub plus: u32,
    pub premium: u32,
    /// Buckets are topped up to capacity once per period.
    pub refill_period_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            basic: 2,
            plus: 10,
            premium: 200,
            refill_period_secs: 3_600,
        }
    }
}

impl QuotaConfig {
    #[must_use]
    pub const fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Basic => self.basic,
            Tier::Plus => self.plus,
            Tier::Premium => self.premium,
        }
    }

    #[must_use]
    pub const fn refill_period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.basic == 0 {
            return Err(invalid("quota.basic must be > 0"));
        }
        if self.plus <= self.basic || self.premium <= self.plus {
            return Err(invalid(
                "quota limits must strictly increase: basic < plus < premium",
            ));
        }
        if self.refill_period_secs == 0 {
            return Err(invalid("quota.refill_period_secs must be > 0"));
        }
        Ok(())
    }
}

/// Payload ceiling and size-weighted token costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayloadConfig {
    /// Hard ceiling, independent of tier.
    pub max_size_bytes: u64,
    /// Payloads at or above this size cost `medium_cost`.
    pub medium_threshold_bytes: u64,
    /// Payloads at or above this size cost `large_cost`.
    pub large_threshold_bytes: u64,
    pub small_cost: u32,
    pub medium_cost: u32,
    pub large_cost: u32,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            medium_threshold_bytes: 5 * 1024 * 1024,
            large_threshold_bytes: 20 * 1024 * 1024,
            small_cost: 1,
            medium_cost: 3,
            large_cost: 5,
        }
    }
}

impl PayloadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_bytes == 0 {
            return Err(invalid("payload.max_size_bytes must be > 0"));
        }
        if self.medium_threshold_bytes == 0
            || self.large_threshold_bytes <= self.medium_threshold_bytes
        {
            return Err(invalid(
                "payload thresholds must satisfy 0 < medium_threshold_bytes < large_threshold_bytes",
            ));
        }
        if self.small_cost == 0
            || self.medium_cost < self.small_cost
            || self.large_cost < self.medium_cost
        {
            return Err(invalid(
                "payload costs must satisfy 0 < small_cost <= medium_cost <= large_cost",
            ));
        }
        Ok(())
    }
}

/// Consecutive-failure freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailureConfig {
    pub max_consecutive: u32,
    pub freeze_secs: u64,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            max_consecutive: 3,
            freeze_secs: 30 * 60,
        }
    }
}

impl FailureConfig {
    #[must_use]
    pub const fn freeze(&self) -> Duration {
        Duration::from_secs(self.freeze_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive == 0 {
            return Err(invalid("failures.max_consecutive must be > 0"));
        }
        if self.freeze_secs == 0 {
            return Err(invalid("failures.freeze_secs must be > 0"));
        }
        Ok(())
    }
}

/// Per-content generation cap and per-subject attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FingerprintConfig {
    pub generation_cap: u32,
    pub generation_horizon_secs: u64,
    pub attempt_cap: u32,
    pub attempt_window_secs: u64,
    pub attempt_freeze_secs: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            generation_cap: 5,
            generation_horizon_secs: 24 * 60 * 60,
            attempt_cap: 3,
            attempt_window_secs: 5 * 60,
            attempt_freeze_secs: 5 * 60,
        }
    }
}

impl FingerprintConfig {
    #[must_use]
    pub const fn generation_horizon(&self) -> Duration {
        Duration::from_secs(self.generation_horizon_secs)
    }

    #[must_use]
    pub const fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }

    #[must_use]
    pub const fn attempt_freeze(&self) -> Duration {
        Duration::from_secs(self.attempt_freeze_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_cap == 0 || self.generation_horizon_secs == 0 {
            return Err(invalid(
                "fingerprint.generation_cap and generation_horizon_secs must be > 0",
            ));
        }
        if self.attempt_cap == 0 || self.attempt_window_secs == 0 || self.attempt_freeze_secs == 0
        {
            return Err(invalid(
                "fingerprint.attempt_cap, attempt_window_secs and attempt_freeze_secs must be > 0",
            ));
        }
        Ok(())
    }
}

/// Global load shedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    /// Nominal in-flight capacity.
    pub ceiling: u32,
    /// High-water mark in basis points of `ceiling` (`8_000` = 80%).
    pub high_water_bps: u16,
    pub freeze_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            ceiling: 100,
            high_water_bps: 8_000,
            freeze_secs: 30,
        }
    }
}

impl LoadConfig {
    #[must_use]
    pub const fn freeze(&self) -> Duration {
        Duration::from_secs(self.freeze_secs)
    }

    /// In-flight count above which the global freeze opens.
    #[must_use]
    pub fn high_water_mark(&self) -> u32 {
        let mark = u64::from(self.ceiling) * u64::from(self.high_water_bps) / 10_000;
        u32::try_from(mark).unwrap_or(u32::MAX)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ceiling == 0 {
            return Err(invalid("load.ceiling must be > 0"));
        }
        if self.high_water_bps == 0 || self.high_water_bps > 10_000 {
            return Err(invalid("load.high_water_bps must be within 1..=10000"));
        }
        if self.freeze_secs == 0 {
            return Err(invalid("load.freeze_secs must be > 0"));
        }
        Ok(())
    }
}

/// What to decide when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Deny with `STORE_UNAVAILABLE`.
    Deny,
    /// Skip the gate whose state could not be read; later gates still apply.
    Allow,
}

/// Counter store access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Deliberately has no serde default.
    pub on_unavailable: UnavailablePolicy,
}

const fn default_store_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    #[must_use]
    pub const fn new(on_unavailable: UnavailablePolicy) -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
            on_unavailable,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("store.timeout_ms must be > 0"));
        }
        Ok(())
    }
}
