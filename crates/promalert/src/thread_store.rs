//! Thread state per alert identity, and the per-identity critical section.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use slack::Block;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::StoreError;

/// The thread an identity's messages go to.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadState {
    /// Channel of the top-level message
    pub channel: String,
    /// Timestamp of the top-level message
    pub ts: String,
    /// Blocks of the last full message, reused when the thread is closed
    pub body: Vec<Block>,
    pub updated_at: DateTime<Utc>,
}

/// Maps identity to thread. The only authority on new-thread-vs-reply.
#[async_trait]
pub trait ThreadStateStore: Send + Sync {
    async fn lookup(&self, identity: &str) -> Result<Option<ThreadState>, StoreError>;

    /// Insert or replace the entry for `identity`.
    async fn upsert(&self, identity: &str, state: ThreadState) -> Result<(), StoreError>;

    /// Number of tracked threads.
    async fn len(&self) -> Result<usize, StoreError>;
}

/// Process-local store. Entries live until evicted by the optional TTL.
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    entries: DashMap<String, ThreadState>,
    ttl: Option<TimeDelta>,
}

impl InMemoryThreadStore {
    #[must_use]
    pub fn new(ttl: Option<TimeDelta>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn is_expired(&self, state: &ThreadState, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now - state.updated_at > ttl)
    }

    /// Drop entries not updated within the TTL. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, state| !self.is_expired(state, now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "Evicted expired thread entries");
        }
        evicted
    }
}

#[async_trait]
impl ThreadStateStore for InMemoryThreadStore {
    async fn lookup(&self, identity: &str) -> Result<Option<ThreadState>, StoreError> {
        Ok(self
            .entries
            .get(identity)
            .filter(|entry| !self.is_expired(entry.value(), Utc::now()))
            .map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, identity: &str, state: ThreadState) -> Result<(), StoreError> {
        self.entries.insert(identity.to_string(), state);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

/// One async mutex per identity, so events for the same identity run one at a
/// time while unrelated identities never contend.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identity`. Released when the guard drops.
    pub async fn lock(&self, identity: &str) -> OwnedMutexGuard<()> {
        // Clone out of the map so no shard lock is held across the await.
        let mutex = self
            .locks
            .entry(identity.to_string())
            .or_default()
            .value()
            .clone();
        mutex.lock_owned().await
    }

    /// Forget locks nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
