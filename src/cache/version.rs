//! Per-key versions, close locks and pending-write tracking

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::key::CacheKey;

/// Process-wide monotonic version per key
#[derive(Debug, Default)]
pub struct VersionCounter {
    versions: DashMap<CacheKey, i64>,
}

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next version; the first one for a key is 1
    pub fn next(&self, key: &CacheKey) -> i64 {
        let mut entry = self.versions.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Raise the counter to at least `version` (remote or recovered state)
    pub fn observe(&self, key: &CacheKey, version: i64) {
        let mut entry = self.versions.entry(key.clone()).or_insert(0);
        if *entry < version {
            *entry = version;
        }
    }

    /// Highest version minted or observed; 0 if none
    pub fn latest(&self, key: &CacheKey) -> i64 {
        self.versions.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Keys tracked
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Lazily created per-key async mutexes, kept for the process lifetime
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of `key`, waiting for the current holder
    pub async fn lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Number of keys that ever took a lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Open write sessions per key
#[derive(Debug, Default)]
pub struct PendingWrites {
    counts: DashMap<CacheKey, usize>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; released when the guard drops
    pub fn begin(self: &Arc<Self>, key: &CacheKey) -> PendingGuard {
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        PendingGuard {
            pending: self.clone(),
            key: key.clone(),
        }
    }

    /// True while any session for `key` is open
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.counts.get(key).map(|c| *c > 0).unwrap_or(false)
    }

    /// Total open sessions
    pub fn total(&self) -> usize {
        self.counts.iter().map(|c| *c).sum()
    }

    fn end(&self, key: &CacheKey) {
        self.counts.remove_if_mut(key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// Keeps a key marked as pending while alive
#[derive(Debug)]
pub struct PendingGuard {
    pending: Arc<PendingWrites>,
    key: CacheKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.end(&self.key);
    }
}

// =============================================================================
// Tests
// =============================================================================
