//! Keyed TTL storage for admission counters.
//!
//! All tracker state lives behind [`KeyedStore`]. A store provides atomic
//! read-modify-write per key; unrelated keys never contend with each other.
//! [`MemoryStore`] is the in-process implementation: a sharded map whose shard locks
//! give per-key atomicity, with lazy expiry evaluated on every access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{duration_ms, Clock};

/// Failure talking to the counter store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer within the configured timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be interpreted.
    #[error("corrupt record under `{key}`: {message}")]
    Corrupt { key: String, message: String },
}

/// Key-value storage with per-entry expiry and atomic per-key updates.
#[async_trait]
pub trait KeyedStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Read the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError>;

    /// Atomically transform the value under `key`.
    ///
    /// `apply` receives the live value (`None` if absent or expired). Leaving `Some`
    /// writes it back with a fresh `ttl`; leaving `None` deletes the entry. Backends
    /// built on compare-and-swap may invoke `apply` more than once; only the final
    /// invocation's effects are committed. Returns the committed value.
    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        apply: &mut (dyn for<'a> FnMut(&'a mut Option<V>) + Send),
    ) -> Result<Option<V>, StoreError>;

    /// Delete `key`. Returns whether a live entry was removed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop expired entries. Only affects memory use, never results.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Logical namespaces for store keys.
pub mod keys {
    use convgate_core::{Fingerprint, SubjectId};

    #[must_use]
    pub fn bucket(subject: &SubjectId) -> String {
        format!("bucket:{subject}")
    }

    #[must_use]
    pub fn failures(subject: &SubjectId) -> String {
        format!("attempts:{subject}")
    }

    #[must_use]
    pub fn generations(fingerprint: &Fingerprint) -> String {
        format!("filegen:{fingerprint}")
    }

    #[must_use]
    pub fn file_attempts(subject: &SubjectId, fingerprint: &Fingerprint) -> String {
        format!("fileattempt:{subject}|{fingerprint}")
    }
}

#[derive(Debug, Clone)]
struct Stored<V> {
    value: V,
    expires_at_ms: u64,
}

impl<V> Stored<V> {
    const fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// In-process [`KeyedStore`].
pub struct MemoryStore<V> {
    entries: DashMap<String, Stored<V>>,
    clock: Arc<dyn Clock>,
}

impl<V> MemoryStore<V> {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> std::fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<V> KeyedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone()))
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        apply: &mut (dyn for<'a> FnMut(&'a mut Option<V>) + Send),
    ) -> Result<Option<V>, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = now.saturating_add(duration_ms(ttl));

        // The entry guard holds the shard lock for the whole read-modify-write.
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get())
                    .filter(|stored| stored.is_live(now))
                    .map(|stored| stored.value.clone());
                apply(&mut slot);
                match slot {
                    Some(value) => {
                        *occupied.get_mut() = Stored {
                            value: value.clone(),
                            expires_at_ms,
                        };
                        Ok(Some(value))
                    }
                    None => {
                        occupied.remove();
                        Ok(None)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                apply(&mut slot);
                if let Some(value) = slot {
                    vacant.insert(Stored {
                        value: value.clone(),
                        expires_at_ms,
                    });
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
