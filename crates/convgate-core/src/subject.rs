//! Subjects and subscription tiers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a subject identifier, in bytes.
pub const MAX_SUBJECT_ID_LEN: usize = 256;

/// Identity against which quotas are tracked.
///
/// Either a verified account id supplied by the authentication layer, or an anonymous
/// key derived from the network origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubjectIdError {
    #[error("subject id must not be empty")]
    Empty,

    #[error("subject id too long ({len} bytes > {max} bytes)")]
    TooLong { len: usize, max: usize },

    #[error("subject id has invalid character {ch:?} at byte {index}")]
    InvalidChar { ch: char, index: usize },
}

impl SubjectId {
    /// Prefix used for callers without a verified identity.
    pub const ANONYMOUS_PREFIX: &'static str = "anonymous_";

    /// Key for a caller that presented no verified credential.
    #[must_use]
    pub fn anonymous(origin: IpAddr) -> Self {
        Self(format!("{}{origin}", Self::ANONYMOUS_PREFIX))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(Self::ANONYMOUS_PREFIX)
    }

    fn validate(id: &str) -> Result<(), SubjectIdError> {
        if id.is_empty() {
            return Err(SubjectIdError::Empty);
        }
        if id.len() > MAX_SUBJECT_ID_LEN {
            return Err(SubjectIdError::TooLong {
                len: id.len(),
                max: MAX_SUBJECT_ID_LEN,
            });
        }
        // `|` separates subject and fingerprint in composite store keys.
        if let Some((index, ch)) = id
            .char_indices()
            .find(|(_, ch)| ch.is_control() || *ch == '|')
        {
            return Err(SubjectIdError::InvalidChar { ch, index });
        }
        Ok(())
    }
}

impl TryFrom<String> for SubjectId {
    type Error = SubjectIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.0
    }
}

impl FromStr for SubjectId {
    type Err = SubjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SubjectId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Subscription level determining quota capacity.
///
/// The legacy plan names (`free`, `pro`, `vip`) are accepted as aliases.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    #[serde(alias = "free", alias = "BASIC", alias = "FREE")]
    Basic,
    #[serde(alias = "pro", alias = "PLUS", alias = "PRO")]
    Plus,
    #[serde(alias = "vip", alias = "PREMIUM", alias = "VIP")]
    Premium,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription tier: {0}")]
pub struct UnknownTier(pub String);

impl Tier {
    pub const ALL: [Self; 3] = [Self::Basic, Self::Plus, Self::Premium];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Plus => "plus",
            Self::Premium => "premium",
        }
    }

    /// Monthly list price in minor currency units.
    #[must_use]
    pub const fn price(self) -> u32 {
        match self {
            Self::Basic => 0,
            Self::Plus => 1_000,
            Self::Premium => 5_000,
        }
    }
}

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" | "free" => Ok(Self::Basic),
            "plus" | "pro" => Ok(Self::Plus),
            "premium" | "vip" => Ok(Self::Premium),
            _ => Err(UnknownTier(s.to_owned())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified (or anonymous) caller and their subscription tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub tier: Tier,
}

impl Subject {
    #[must_use]
    pub const fn new(id: SubjectId, tier: Tier) -> Self {
        Self { id, tier }
    }

    /// Unauthenticated caller keyed by network origin, always on the basic tier.
    #[must_use]
    pub fn anonymous(origin: IpAddr) -> Self {
        Self {
            id: SubjectId::anonymous(origin),
            tier: Tier::Basic,
        }
    }
}
