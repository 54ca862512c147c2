//! Global load shedding.
//!
//! Tracks in-flight requests with a single atomic counter. Once the count rises above
//! the high-water mark a global freeze opens; every admission is rejected until it
//! closes, even if load has already dropped.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use convgate_telemetry::metrics::{names, set_gauge};
use serde::Serialize;

use crate::clock::{duration_ms, Clock};
use crate::config::LoadConfig;
use crate::FreezeStatus;

/// Point-in-time view of process load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    pub in_flight: u32,
    pub ceiling: u32,
    /// In-flight count above which the freeze opens.
    pub high_water: u32,
    /// Remaining global freeze; zero when not frozen.
    pub frozen_for: Duration,
}

/// Process-wide in-flight counter with a freeze window.
pub struct LoadShedder {
    in_flight: AtomicU32,
    /// Epoch millis; zero when no freeze was ever opened.
    frozen_until_ms: AtomicU64,
    config: LoadConfig,
    high_water: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LoadShedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadShedder")
            .field("in_flight", &self.in_flight())
            .field("high_water", &self.high_water)
            .field("frozen_until_ms", &self.frozen_until_ms.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LoadShedder {
    #[must_use]
    pub fn new(config: LoadConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            in_flight: AtomicU32::new(0),
            frozen_until_ms: AtomicU64::new(0),
            high_water: config.high_water_mark(),
            config,
            clock,
        }
    }

    /// Count a request as in flight until the returned guard drops.
    #[must_use = "the request stops counting as in flight when the guard drops"]
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        set_gauge(names::LOAD_IN_FLIGHT, f64::from(now), &[]);
        InFlightGuard {
            shedder: Arc::clone(self),
        }
    }

    fn release(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        set_gauge(
            names::LOAD_IN_FLIGHT,
            f64::from(previous.saturating_sub(1)),
            &[],
        );
    }

    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Evaluate load, opening the global freeze if the high-water mark is exceeded.
    #[must_use]
    pub fn check(&self) -> FreezeStatus {
        let now = self.clock.now_ms();
        let in_flight = self.in_flight();
        if in_flight > self.high_water {
            let until = now.saturating_add(duration_ms(self.config.freeze()));
            let previous = self.frozen_until_ms.fetch_max(until, Ordering::AcqRel);
            if previous <= now {
                tracing::warn!(
                    in_flight,
                    high_water = self.high_water,
                    freeze_secs = self.config.freeze_secs,
                    "Load above high-water mark, shedding new admissions"
                );
            }
        }
        self.is_system_frozen()
    }

    /// Whether a new admission may proceed.
    #[must_use]
    pub fn admit(&self) -> bool {
        !self.check().frozen
    }

    /// Current global freeze, without re-evaluating load.
    #[must_use]
    pub fn is_system_frozen(&self) -> FreezeStatus {
        FreezeStatus::until(
            self.frozen_until_ms.load(Ordering::Acquire),
            self.clock.now_ms(),
        )
    }

    #[must_use]
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            in_flight: self.in_flight(),
            ceiling: self.config.ceiling,
            high_water: self.high_water,
            frozen_for: self.is_system_frozen().remaining,
        }
    }
}

/// RAII in-flight marker returned by [`LoadShedder::enter`].
#[derive(Debug)]
pub struct InFlightGuard {
    shedder: Arc<LoadShedder>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shedder.release();
    }
}
