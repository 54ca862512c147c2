//! Size-weighted token cost.
//!
//! Large uploads draw more quota than small ones: a payload's cost is picked from
//! three bands (small, medium, large) configured in [`PayloadConfig`].

use crate::config::PayloadConfig;

/// Size band of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    #[must_use]
    pub const fn of(size_bytes: u64, payload: &PayloadConfig) -> Self {
        if size_bytes >= payload.large_threshold_bytes {
            Self::Large
        } else if size_bytes >= payload.medium_threshold_bytes {
            Self::Medium
        } else {
            Self::Small
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Tokens a payload of `size_bytes` consumes.
#[must_use]
pub const fn token_cost(size_bytes: u64, payload: &PayloadConfig) -> u32 {
    match SizeClass::of(size_bytes, payload) {
        SizeClass::Small => payload.small_cost,
        SizeClass::Medium => payload.medium_cost,
        SizeClass::Large => payload.large_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn bands_use_inclusive_lower_bounds() {
        let payload = PayloadConfig::default();
        assert_eq!(token_cost(0, &payload), 1);
        assert_eq!(token_cost(10 * 1024, &payload), 1);
        assert_eq!(token_cost(5 * MIB - 1, &payload), 1);
        assert_eq!(token_cost(5 * MIB, &payload), 3);
        assert_eq!(token_cost(20 * MIB - 1, &payload), 3);
        assert_eq!(token_cost(20 * MIB, &payload), 5);
        assert_eq!(token_cost(50 * MIB, &payload), 5);
    }

    #[test]
    fn size_class_labels() {
        let payload = PayloadConfig::default();
        assert_eq!(SizeClass::of(1, &payload).as_str(), "small");
        assert_eq!(SizeClass::of(6 * MIB, &payload), SizeClass::Medium);
        assert_eq!(SizeClass::of(30 * MIB, &payload), SizeClass::Large);
    }
}
