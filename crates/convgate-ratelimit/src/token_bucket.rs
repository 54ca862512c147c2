//! Per-subject token bucket registry.
//!
//! Classic interval-refill bucket: each subject holds up to its tier's capacity and is
//! topped up to full once per refill period. Refills are computed lazily on access and
//! keep their phase, so a request arriving mid-period cannot shift the next refill.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use convgate_core::{SubjectId, Tier};

use crate::clock::{duration_ms, Clock};
use crate::config::QuotaConfig;
use crate::store::{keys, KeyedStore, StoreError};

/// Stored bucket state for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Tier the bucket was sized for.
    pub tier: Tier,
    pub capacity: u32,
    pub tokens: u32,
    pub last_refill_ms: u64,
}

impl BucketRecord {
    #[must_use]
    pub const fn full(tier: Tier, capacity: u32, now_ms: u64) -> Self {
        Self {
            tier,
            capacity,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Apply every refill boundary crossed up to `now_ms`.
    pub fn refill(&mut self, now_ms: u64, period_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if period_ms == 0 || elapsed < period_ms {
            return;
        }
        let periods = elapsed / period_ms;
        self.tokens = self.capacity;
        self.last_refill_ms = self
            .last_refill_ms
            .saturating_add(periods.saturating_mul(period_ms));
    }

    /// Time until the next refill boundary.
    #[must_use]
    pub fn next_refill_in(&self, now_ms: u64, period_ms: u64) -> Duration {
        let next = self.last_refill_ms.saturating_add(period_ms);
        Duration::from_millis(next.saturating_sub(now_ms))
    }
}

/// Outcome of a [`TokenBucketRegistry::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    pub granted: bool,
    /// Tokens actually charged (cost after clamping to capacity).
    pub charged: u32,
    pub remaining: u32,
    pub limit: u32,
    /// Zero when granted; otherwise time until the next refill.
    pub retry_after: Duration,
}

/// Read-only quota snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub tier: Tier,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    pub is_limited: bool,
}

/// One bucket per subject, sized by tier.
pub struct TokenBucketRegistry {
    store: Arc<dyn KeyedStore<BucketRecord>>,
    clock: Arc<dyn Clock>,
    quota: QuotaConfig,
}

impl TokenBucketRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyedStore<BucketRecord>>,
        clock: Arc<dyn Clock>,
        quota: QuotaConfig,
    ) -> Self {
        Self {
            store,
            clock,
            quota,
        }
    }

    #[must_use]
    pub const fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    /// Atomically take `cost` tokens from `subject`'s bucket.
    ///
    /// A cost above the tier's capacity is clamped to the capacity, so an oversized
    /// request drains the bucket instead of being unsatisfiable. A bucket created for a
    /// different tier (or capacity) is replaced by a full bucket for the current one.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn consume(
        &self,
        subject: &SubjectId,
        tier: Tier,
        cost: u32,
    ) -> Result<Consumption, StoreError> {
        let now = self.clock.now_ms();
        let capacity = self.quota.limit_for(tier);
        let period_ms = duration_ms(self.quota.refill_period());
        let charged = cost.clamp(1, capacity.max(1));
        let key = keys::bucket(subject);

        let mut outcome = None;
        let mut apply = |slot: &mut Option<BucketRecord>| {
            let mut bucket = match slot.take() {
                Some(bucket) if bucket.tier == tier && bucket.capacity == capacity => bucket,
                Some(stale) => {
                    tracing::info!(
                        subject = %subject,
                        from_tier = %stale.tier,
                        to_tier = %tier,
                        capacity,
                        "Re-creating token bucket after tier change"
                    );
                    BucketRecord::full(tier, capacity, now)
                }
                None => BucketRecord::full(tier, capacity, now),
            };
            bucket.refill(now, period_ms);

            let granted = bucket.tokens >= charged;
            if granted {
                bucket.tokens -= charged;
            }
            outcome = Some(Consumption {
                granted,
                charged,
                remaining: bucket.tokens,
                limit: bucket.capacity,
                retry_after: if granted {
                    Duration::ZERO
                } else {
                    bucket.next_refill_in(now, period_ms)
                },
            });
            *slot = Some(bucket);
        };

        // Outlive one full period so an idle bucket keeps its refill phase.
        let ttl = self.quota.refill_period().saturating_mul(2);
        self.store.update(&key, ttl, &mut apply).await?;
        outcome.ok_or_else(|| StoreError::Unavailable(format!("update of `{key}` not applied")))
    }

    /// Current quota for `subject` without consuming anything.
    ///
    /// Returns `None` if the subject has no live bucket.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn peek(&self, subject: &SubjectId) -> Result<Option<QuotaState>, StoreError> {
        let now = self.clock.now_ms();
        let period_ms = duration_ms(self.quota.refill_period());
        let Some(mut bucket) = self.store.get(&keys::bucket(subject)).await? else {
            return Ok(None);
        };
        bucket.refill(now, period_ms);
        Ok(Some(QuotaState {
            tier: bucket.tier,
            limit: bucket.capacity,
            remaining: bucket.tokens,
            reset_after: bucket.next_refill_in(now, period_ms),
            is_limited: bucket.tokens == 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn registry() -> (Arc<ManualClock>, TokenBucketRegistry) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store: Arc<MemoryStore<BucketRecord>> =
            Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
        let registry = TokenBucketRegistry::new(store, clock.clone(), QuotaConfig::default());
        (clock, registry)
    }

    fn subject(id: &str) -> SubjectId {
        id.parse().unwrap()
    }

    #[tokio::test]
    async fn capacity_then_denial_then_refill() {
        let (clock, registry) = registry();
        let u1 = subject("u1");

        assert!(registry.consume(&u1, Tier::Basic, 1).await.unwrap().granted);
        assert!(registry.consume(&u1, Tier::Basic, 1).await.unwrap().granted);

        let denied = registry.consume(&u1, Tier::Basic, 1).await.unwrap();
        assert!(!denied.granted);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_secs(3_600));

        clock.advance(Duration::from_secs(3_600));
        assert!(registry.consume(&u1, Tier::Basic, 1).await.unwrap().granted);
    }

    #[tokio::test]
    async fn retry_after_counts_down_to_refill() {
        let (clock, registry) = registry();
        let u1 = subject("u1");
        registry.consume(&u1, Tier::Basic, 2).await.unwrap();

        clock.advance(Duration::from_secs(600));
        let denied = registry.consume(&u1, Tier::Basic, 1).await.unwrap();
        assert_eq!(denied.retry_after, Duration::from_secs(3_000));
    }

    #[tokio::test]
    async fn refill_keeps_phase() {
        let (clock, registry) = registry();
        let u1 = subject("u1");
        registry.consume(&u1, Tier::Basic, 2).await.unwrap();

        // 1.5 periods later: refilled once, next boundary is half a period away.
        clock.advance(Duration::from_secs(5_400));
        let granted = registry.consume(&u1, Tier::Basic, 2).await.unwrap();
        assert!(granted.granted);
        let denied = registry.consume(&u1, Tier::Basic, 1).await.unwrap();
        assert_eq!(denied.retry_after, Duration::from_secs(1_800));
    }

    #[tokio::test]
    async fn weighted_cost_is_clamped_to_capacity() {
        let (_clock, registry) = registry();
        let u1 = subject("u1");

        let drained = registry.consume(&u1, Tier::Basic, 5).await.unwrap();
        assert!(drained.granted);
        assert_eq!(drained.charged, 2);
        assert_eq!(drained.remaining, 0);
    }

    #[tokio::test]
    async fn insufficient_tokens_deny_without_partial_charge() {
        let (_clock, registry) = registry();
        let u1 = subject("u1");

        assert!(registry.consume(&u1, Tier::Plus, 8).await.unwrap().granted);
        let denied = registry.consume(&u1, Tier::Plus, 3).await.unwrap();
        assert!(!denied.granted);
        assert_eq!(denied.remaining, 2);
    }

    #[tokio::test]
    async fn tier_change_recreates_bucket() {
        let (_clock, registry) = registry();
        let u1 = subject("u1");

        registry.consume(&u1, Tier::Basic, 2).await.unwrap();
        assert!(!registry.consume(&u1, Tier::Basic, 1).await.unwrap().granted);

        let upgraded = registry.consume(&u1, Tier::Plus, 1).await.unwrap();
        assert!(upgraded.granted);
        assert_eq!(upgraded.limit, 10);
        assert_eq!(upgraded.remaining, 9);
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let (_clock, registry) = registry();
        registry.consume(&subject("a"), Tier::Basic, 2).await.unwrap();
        assert!(registry
            .consume(&subject("b"), Tier::Basic, 1)
            .await
            .unwrap()
            .granted);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (clock, registry) = registry();
        let u1 = subject("u1");
        assert!(registry.peek(&u1).await.unwrap().is_none());

        registry.consume(&u1, Tier::Plus, 4).await.unwrap();
        let state = registry.peek(&u1).await.unwrap().unwrap();
        assert_eq!(state.limit, 10);
        assert_eq!(state.remaining, 6);
        assert!(!state.is_limited);

        clock.advance(Duration::from_secs(3_601));
        let refilled = registry.peek(&u1).await.unwrap().unwrap();
        assert_eq!(refilled.remaining, 10);
        assert_eq!(refilled.reset_after, Duration::from_secs(3_599));
    }
}
