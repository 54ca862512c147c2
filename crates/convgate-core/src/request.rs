//! Admission request descriptor.

use serde::{Deserialize, Serialize};

use crate::{Fingerprint, FingerprintError, Subject, SubjectId, SubjectIdError, Tier};

/// Everything the admission gate needs to know about one conversion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub subject: SubjectId,
    #[serde(default)]
    pub tier: Tier,
    pub size_bytes: u64,
    pub fingerprint: Fingerprint,
}

/// Malformed admission input, rejected before any tracker is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid subject: {0}")]
    Subject(#[from] SubjectIdError),

    #[error("invalid fingerprint: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("payload size must not be negative (got {0})")]
    NegativeSize(i64),
}

impl AdmissionRequest {
    #[must_use]
    pub fn new(subject: Subject, size_bytes: u64, fingerprint: Fingerprint) -> Self {
        Self {
            subject: subject.id,
            tier: subject.tier,
            size_bytes,
            fingerprint,
        }
    }

    /// Build a request from unvalidated transport values.
    ///
    /// # Errors
    /// Returns an error if the subject or fingerprint is malformed or the size is negative.
    pub fn parse(
        subject: &str,
        tier: Tier,
        size_bytes: i64,
        fingerprint: &str,
    ) -> Result<Self, ValidationError> {
        let size_bytes =
            u64::try_from(size_bytes).map_err(|_| ValidationError::NegativeSize(size_bytes))?;
        Ok(Self {
            subject: subject.parse()?,
            tier,
            size_bytes,
            fingerprint: fingerprint.parse()?,
        })
    }

    /// Composite key for per-(subject, fingerprint) state.
    #[must_use]
    pub fn subject_file_key(&self) -> String {
        format!("{}|{}", self.subject, self.fingerprint)
    }
}
