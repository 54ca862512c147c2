//! Content fingerprints.
//!
//! The admission core treats a fingerprint as an opaque key. Deriving one from upload
//! bytes is the request layer's job; [`Fingerprint::of_content`] is provided so every
//! caller derives it the same way.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum length of a fingerprint, in bytes.
pub const MAX_FINGERPRINT_LEN: usize = 256;

/// Number of digest bytes kept by [`Fingerprint::of_content`] (128 bits).
const CONTENT_DIGEST_LEN: usize = 16;

/// Content-derived identifier used to detect repeated requests for the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint must not be empty")]
    Empty,

    #[error("fingerprint too long ({len} bytes > {max} bytes)")]
    TooLong { len: usize, max: usize },

    #[error("fingerprint has invalid character {ch:?} at byte {index}")]
    InvalidChar { ch: char, index: usize },
}

impl Fingerprint {
    /// 128-bit digest of the raw upload bytes, rendered as lowercase hex.
    #[must_use]
    pub fn of_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex::encode(&digest[..CONTENT_DIGEST_LEN]))
    }

    /// Best-effort key for uploads whose body could not be read.
    ///
    /// Combines the declared content type, declared length and the caller's origin, so
    /// repeated blind retries from one origin still collapse onto one key.
    #[must_use]
    pub fn fallback(content_type: Option<&str>, content_length: Option<u64>, origin: &str) -> Self {
        let content_type: String = content_type
            .unwrap_or("unknown")
            .chars()
            .filter(|ch| !ch.is_whitespace() && !ch.is_control())
            .collect();
        let raw = format!("{content_type}_{}_{origin}", content_length.unwrap_or(0));
        if Self::validate(&raw).is_ok() {
            Self(raw)
        } else {
            Self::of_content(raw.as_bytes())
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(value: &str) -> Result<(), FingerprintError> {
        if value.is_empty() {
            return Err(FingerprintError::Empty);
        }
        if value.len() > MAX_FINGERPRINT_LEN {
            return Err(FingerprintError::TooLong {
                len: value.len(),
                max: MAX_FINGERPRINT_LEN,
            });
        }
        if let Some((index, ch)) = value
            .char_indices()
            .find(|(_, ch)| ch.is_whitespace() || ch.is_control())
        {
            return Err(FingerprintError::InvalidChar { ch, index });
        }
        Ok(())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
