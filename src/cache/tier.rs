//! Tier managers
//!
//! One [`TierManager`] per local tier owns the visibility map of that tier:
//! at most one CacheFile per key, highest version wins. Files enter the map
//! only once they are finalized, so readers never observe a file that is
//! still being written.
//!
//! Version reconciliation happens under the map's entry lock; deleting the
//! losing file (which may touch the filesystem) happens after the lock is
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backing::{BlockAllocator, TierUsage};
use super::eviction::ItemPolicy;
use super::file::{CacheFile, FileReadHandle};
use super::key::CacheKey;
use super::remote::ObjectInfo;
use super::stats::{LatencyTracker, StatisticsSink};
use super::writer::MultiBlockWriter;
use super::CacheTier;

/// Outcome of [`TierManager::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    /// No copy was mapped
    Inserted,
    /// The same file was already mapped; its accounting was refreshed
    AlreadyVisible,
    /// An older version was replaced and deleted
    Replaced,
    /// A same or newer version is mapped; the incoming file was deleted
    Rejected,
}

impl PutOutcome {
    /// True if the incoming file is now the visible copy
    pub fn is_visible(self) -> bool {
        !matches!(self, PutOutcome::Rejected)
    }
}

#[derive(Debug, Clone)]
struct MappedFile {
    file: Arc<CacheFile>,
    /// Bytes credited to `mapped_bytes` for this file
    bytes: u64,
}

/// Point-in-time view of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub tier: CacheTier,
    pub objects: usize,
    pub mapped_bytes: u64,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_percent: f64,
    pub pending_fills: usize,
    pub tracked_items: usize,
}

/// Visibility map and accounting for one local tier
pub struct TierManager {
    tier: CacheTier,
    files: DashMap<CacheKey, MappedFile>,
    /// Cache fills in flight, shared by concurrent readers of one version
    fills: DashMap<CacheKey, Arc<CacheFile>>,
    usage: Arc<TierUsage>,
    mapped_bytes: AtomicU64,
    allocator: Arc<dyn BlockAllocator>,
    chunk_size: usize,
    items: Arc<dyn ItemPolicy>,
    stats: Arc<dyn StatisticsSink>,
}

impl TierManager {
    pub fn new(
        usage: Arc<TierUsage>,
        allocator: Arc<dyn BlockAllocator>,
        items: Arc<dyn ItemPolicy>,
        stats: Arc<dyn StatisticsSink>,
        chunk_size: usize,
    ) -> Self {
        let tier = usage.tier();
        info!(
            "Initializing {} tier with capacity {} bytes",
            tier,
            usage.capacity()
        );
        Self {
            tier,
            files: DashMap::new(),
            fills: DashMap::new(),
            usage,
            mapped_bytes: AtomicU64::new(0),
            allocator,
            chunk_size: chunk_size.max(1),
            items,
            stats,
        }
    }

    #[inline]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn usage(&self) -> &Arc<TierUsage> {
        &self.usage
    }

    pub fn items(&self) -> &Arc<dyn ItemPolicy> {
        &self.items
    }

    /// Bytes of all visible files
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes.load(Ordering::Acquire)
    }

    /// Visible objects
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// New unmapped file for a client write
    pub fn create_file(&self, key: CacheKey) -> Arc<CacheFile> {
        Arc::new(CacheFile::new(key, self.tier))
    }

    /// File a cache fill of `version` writes into.
    ///
    /// Concurrent fills of the same version share one file; a visible copy
    /// of that version is extended in place.
    pub fn fill_target(&self, key: &CacheKey, version: i64) -> Arc<CacheFile> {
        if let Some(mapped) = self.files.get(key) {
            if mapped.file.version() == version && !mapped.file.is_obsolete() {
                return mapped.file.clone();
            }
        }
        let fresh = || {
            let file = Arc::new(CacheFile::new(key.clone(), self.tier));
            file.set_version(version);
            file
        };
        match self.fills.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.version() == version && !current.is_obsolete() {
                    return current.clone();
                }
                let file = fresh();
                slot.insert(file.clone());
                file
            }
            Entry::Vacant(slot) => slot.insert(fresh()).clone(),
        }
    }

    /// Forget a fill target that will not be mapped
    pub fn drop_fill(&self, file: &Arc<CacheFile>) {
        self.fills
            .remove_if(file.key(), |_, current| Arc::ptr_eq(current, file));
    }

    /// Writer for `[start, stop]` of `file`; `stop = None` is unbounded
    pub fn writer(&self, file: Arc<CacheFile>, start: i64, stop: Option<i64>) -> MultiBlockWriter {
        MultiBlockWriter::new(
            file,
            self.allocator.clone(),
            self.usage.clone(),
            self.chunk_size,
            start,
            stop,
        )
    }

    // =========================================================================
    // Map operations
    // =========================================================================

    /// Make a finalized file visible; the highest version wins.
    pub fn put(&self, file: Arc<CacheFile>) -> PutOutcome {
        let timer = LatencyTracker::start();
        let key = file.key().clone();
        let version = file.version();
        let bytes = file.size();

        let (outcome, displaced) = match self.files.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(MappedFile {
                    file: file.clone(),
                    bytes,
                });
                (PutOutcome::Inserted, None)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if Arc::ptr_eq(&existing.file, &file) {
                    let previous = std::mem::replace(&mut existing.bytes, bytes);
                    self.mapped_bytes.fetch_sub(previous, Ordering::AcqRel);
                    (PutOutcome::AlreadyVisible, None)
                } else if existing.file.version() >= version {
                    (PutOutcome::Rejected, None)
                } else {
                    let old = slot.insert(MappedFile {
                        file: file.clone(),
                        bytes,
                    });
                    (PutOutcome::Replaced, Some(old))
                }
            }
        };
        self.drop_fill(&file);

        match outcome {
            PutOutcome::Inserted => {
                self.mapped_bytes.fetch_add(bytes, Ordering::AcqRel);
                self.items.on_item_add(&key, bytes);
            }
            PutOutcome::AlreadyVisible => {
                self.mapped_bytes.fetch_add(bytes, Ordering::AcqRel);
                self.items.on_item_update(&key, bytes);
            }
            PutOutcome::Replaced => {
                self.mapped_bytes.fetch_add(bytes, Ordering::AcqRel);
                if let Some(old) = displaced {
                    self.mapped_bytes.fetch_sub(old.bytes, Ordering::AcqRel);
                    debug!(
                        key = %key,
                        tier = %self.tier,
                        old = old.file.version(),
                        new = version,
                        "Replacing older version"
                    );
                    old.file.delete();
                }
                self.items.on_item_update(&key, bytes);
            }
            PutOutcome::Rejected => {
                debug!(key = %key, tier = %self.tier, version, "Discarding superseded file");
                file.delete();
            }
        }

        if outcome.is_visible() {
            self.stats.on_put(self.tier, bytes, timer.elapsed());
        }
        self.report_usage();
        outcome
    }

    /// Read handle on the visible copy
    pub fn get(&self, key: &CacheKey) -> Option<FileReadHandle> {
        let file = self.files.get(key).map(|m| m.file.clone())?;
        let handle = file.open_reader()?;
        self.items.on_item_access(key);
        Some(handle)
    }

    /// Visible copy without counting an access
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheFile>> {
        self.files.get(key).map(|m| m.file.clone())
    }

    /// Version of the visible copy
    pub fn version_of(&self, key: &CacheKey) -> Option<i64> {
        self.files.get(key).map(|m| m.file.version())
    }

    /// Unmap and delete the visible copy
    pub fn delete(&self, key: &CacheKey) -> bool {
        let timer = LatencyTracker::start();
        let Some((_, mapped)) = self.files.remove(key) else {
            return false;
        };
        self.unmapped(key, &mapped);
        mapped.file.delete();
        self.stats.on_delete(self.tier, mapped.bytes, timer.elapsed());
        self.report_usage();
        true
    }

    /// Unmap `file` without deleting its data.
    ///
    /// Nothing happens if the key now maps a different file.
    pub fn evict(&self, key: &CacheKey, file: &Arc<CacheFile>) -> Option<Arc<CacheFile>> {
        let (_, mapped) = self
            .files
            .remove_if(key, |_, m| Arc::ptr_eq(&m.file, file))?;
        self.unmapped(key, &mapped);
        Some(mapped.file)
    }

    fn unmapped(&self, key: &CacheKey, mapped: &MappedFile) {
        self.mapped_bytes.fetch_sub(mapped.bytes, Ordering::AcqRel);
        self.items.on_item_delete(key);
    }

    /// Drop the visible copy if it is older than `min_version`.
    ///
    /// Returns true when a stale copy was dropped.
    pub fn check_version(&self, key: &CacheKey, min_version: i64) -> bool {
        let Some((_, mapped)) = self
            .files
            .remove_if(key, |_, m| m.file.version() < min_version)
        else {
            return false;
        };
        info!(
            "Dropping stale {} copy of {} (version {} < {})",
            self.tier,
            key,
            mapped.file.version(),
            min_version
        );
        self.unmapped(key, &mapped);
        mapped.file.delete();
        self.report_usage();
        true
    }

    /// Confirm the remote copy of `version`
    pub fn mark_uploaded(&self, key: &CacheKey, version: i64) -> bool {
        let Some(file) = self.peek(key) else {
            return false;
        };
        if file.version() != version {
            return false;
        }
        match file.mark_uploaded() {
            Ok(changed) => changed,
            Err(e) => {
                warn!(key = %key, tier = %self.tier, error = %e, "Failed to mark upload");
                false
            }
        }
    }

    /// Visible objects in `bucket` whose key starts with `prefix`
    pub fn list(&self, bucket: &str, prefix: &str) -> Vec<ObjectInfo> {
        self.files
            .iter()
            .filter(|m| m.key().bucket() == bucket && m.key().has_prefix(prefix))
            .map(|m| m.file.info())
            .collect()
    }

    /// Push the current usage to the statistics sink
    pub fn report_usage(&self) {
        self.stats
            .on_usage(self.tier, self.usage.used(), self.usage.capacity());
    }

    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            tier: self.tier,
            objects: self.files.len(),
            mapped_bytes: self.mapped_bytes(),
            used_bytes: self.usage.used(),
            capacity_bytes: self.usage.capacity(),
            usage_percent: self.usage.percent(),
            pending_fills: self.fills.len(),
            tracked_items: self.items.len(),
        }
    }
}

impl std::fmt::Debug for TierManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierManager")
            .field("tier", &self.tier)
            .field("objects", &self.files.len())
            .field("used", &self.usage.used())
            .field("capacity", &self.usage.capacity())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
