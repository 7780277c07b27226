//! Per-channel mutual exclusion.
//!
//! Every check-then-mutate sequence on a channel runs under that channel's
//! lock. Locks are created on first use and removed when the last holder
//! or waiter lets go, so the map only holds channels with activity.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Lazily created async mutexes keyed by channel id.
#[derive(Default)]
pub struct GrainedLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GrainedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> ChannelGuard<'_> {
        // Clone the Arc out of the map so the shard lock is not held while waiting
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        trace!(channel_id = key, "Channel lock acquired");
        ChannelGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Locks several keys in sorted order; duplicates are locked once.
    pub async fn acquire_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<ChannelGuard<'_>> {
        let mut sorted: Vec<&str> = keys.iter().map(|k| k.as_ref()).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.acquire(key).await);
        }
        guards
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock on one channel; releases on drop.
pub struct ChannelGuard<'a> {
    owner: &'a GrainedLock,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ChannelGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits this lock
        self.owner
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(channel_id = %self.key, "Channel lock released");
    }
}
