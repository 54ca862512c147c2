//! Admission decisions and their client-facing rendering.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a request was admitted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Admitted.
    Ok,
    /// Payload larger than the hard size ceiling.
    SizeExceeded,
    /// Subject is serving a consecutive-failure freeze.
    SubjectFrozen,
    /// This content was generated too often within the rolling horizon.
    FileGenerationCap,
    /// This subject retried the same content too often within the attempt window.
    FileAttemptCap,
    /// Subject's token bucket is exhausted.
    RateExceeded,
    /// Global load shedding is active.
    SystemOverloaded,
    /// Counter store unreachable and the configured policy is to deny.
    StoreUnavailable,
}

impl ReasonCode {
    pub const ALL: [Self; 8] = [
        Self::Ok,
        Self::SizeExceeded,
        Self::SubjectFrozen,
        Self::FileGenerationCap,
        Self::FileAttemptCap,
        Self::RateExceeded,
        Self::SystemOverloaded,
        Self::StoreUnavailable,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SizeExceeded => "SIZE_EXCEEDED",
            Self::SubjectFrozen => "SUBJECT_FROZEN",
            Self::FileGenerationCap => "FILE_GENERATION_CAP",
            Self::FileAttemptCap => "FILE_ATTEMPT_CAP",
            Self::RateExceeded => "RATE_EXCEEDED",
            Self::SystemOverloaded => "SYSTEM_OVERLOADED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }

    /// HTTP status the calling layer should answer with.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::SystemOverloaded | Self::StoreUnavailable => 503,
            Self::SizeExceeded
            | Self::SubjectFrozen
            | Self::FileGenerationCap
            | Self::FileAttemptCap
            | Self::RateExceeded => 429,
        }
    }

    /// Whether this denial counts against the subject's consecutive-failure record.
    #[must_use]
    pub const fn counts_as_failure(self) -> bool {
        matches!(
            self,
            Self::SizeExceeded | Self::FileGenerationCap | Self::FileAttemptCap | Self::RateExceeded
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: ReasonCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Admit the request.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Ok,
            message: "Allowed".to_string(),
            retry_after_secs: None,
        }
    }

    /// Deny the request. `retry_after` is rounded up to whole seconds.
    #[must_use]
    pub fn deny(reason: ReasonCode, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            reason,
            message: message.into(),
            retry_after_secs: retry_after.map(ceil_secs),
        }
    }

    #[must_use]
    pub const fn status_code(&self) -> u16 {
        self.reason.status_code()
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_secs.map(Duration::from_secs)
    }

    /// Value for a `Retry-After` response header, if the denial carries a hint.
    #[must_use]
    pub fn retry_after_header(&self) -> Option<String> {
        if self.allowed {
            return None;
        }
        self.retry_after_secs.map(|secs| secs.to_string())
    }

    /// JSON body for a denied request; `None` when the request was admitted.
    #[must_use]
    pub fn denial_body(&self) -> Option<DenialBody> {
        if self.allowed {
            return None;
        }
        Some(DenialBody {
            error: DenialBody::ERROR_KIND.to_string(),
            message: self.message.clone(),
            reason: self.reason,
            retry_after_secs: self.retry_after_secs,
        })
    }
}

/// Wire format returned to clients on denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialBody {
    pub error: String,
    pub message: String,
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl DenialBody {
    pub const ERROR_KIND: &'static str = "rate_limit_exceeded";
}

/// Whole seconds, rounded up; any non-zero wait is at least one second.
#[must_use]
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
