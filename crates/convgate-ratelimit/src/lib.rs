//! convgate rate limit - admission control for conversion requests
//!
//! Every inbound conversion request passes one ordered gate before any work is done:
//!
//! 1. **Load shedding**: global in-flight high-water mark with a freeze window
//! 2. **Payload ceiling**: hard size limit, independent of tier
//! 3. **Subject freeze**: consecutive-failure escalation
//! 4. **Generation cap**: how often one file may be converted per horizon, by anyone
//! 5. **Attempt cap**: how often one subject may retry one file per window
//! 6. **Token bucket**: per-subject quota sized by tier, weighted by payload size
//!
//! All counters live behind [`KeyedStore`], which provides atomic per-key updates.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use convgate_core::AdmissionRequest;
//! use convgate_ratelimit::{AdmissionConfig, AdmissionController};
//!
//! let controller = AdmissionController::new(AdmissionConfig::default());
//!
//! let _in_flight = controller.enter();
//! let decision = controller.decide(&request).await;
//! if !decision.allowed {
//!     // map to 429/503 with decision.denial_body()
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
mod config;
mod controller;
mod cost;
mod failure;
mod fingerprint;
mod load_shedder;
pub mod store;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use controller::*;
pub use cost::*;
pub use failure::*;
pub use fingerprint::*;
pub use load_shedder::*;
pub use store::{KeyedStore, MemoryStore, StoreError};
pub use token_bucket::*;

use std::time::Duration;

use convgate_core::ValidationError;

/// Whether something is currently frozen, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct FreezeStatus {
    pub frozen: bool,
    /// Zero when not frozen.
    pub remaining: Duration,
}

impl FreezeStatus {
    #[must_use]
    pub const fn thawed() -> Self {
        Self {
            frozen: false,
            remaining: Duration::ZERO,
        }
    }

    /// Status for a freeze ending at `until_ms`, observed at `now_ms`.
    #[must_use]
    pub const fn until(until_ms: u64, now_ms: u64) -> Self {
        if now_ms < until_ms {
            Self {
                frozen: true,
                remaining: Duration::from_millis(until_ms - now_ms),
            }
        } else {
            Self::thawed()
        }
    }
}

/// Errors surfaced by the admission controller.
///
/// Policy denials are never errors; they are [`convgate_core::Decision`]s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid admission request: {0}")]
    InvalidRequest(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_status_until() {
        assert_eq!(
            FreezeStatus::until(5_000, 2_000),
            FreezeStatus {
                frozen: true,
                remaining: Duration::from_secs(3),
            }
        );
        assert_eq!(FreezeStatus::until(5_000, 5_000), FreezeStatus::thawed());
        assert_eq!(FreezeStatus::until(5_000, 9_000), FreezeStatus::thawed());
    }
}
