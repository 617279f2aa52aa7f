//! Eviction subsystem
//!
//! Three policies cooperate per tier:
//!
//! - a [`TriggerPolicy`] decides when a tier is too full,
//! - an [`ItemPolicy`] ranks mapped objects and names the next victim,
//! - a [`PlacementPolicy`] decides whether the victim is deleted, moved to
//!   disk, or kept.
//!
//! Memory victims that are moved to disk are re-streamed into a new disk
//! CacheFile at the same version by a bounded pool of downgrade tasks.

mod item;
mod placement;
mod trigger;

pub use item::{ItemObserver, ItemPolicy, RankedItemPolicy, Ranking};
pub use placement::{DefaultPlacement, Placement, PlacementPolicy};
pub use trigger::{trigger_from_config, ThresholdTrigger, TriggerPolicy, WatermarkTrigger};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::file::{CacheFile, FileState};
use super::range::{self, BlockRange};
use super::stats::StatisticsSink;
use super::tier::TierManager;
use super::version::KeyLocks;
use crate::config::EvictionConfig;
use crate::error::{Error, Result};

/// Outcome of one eviction pass
#[derive(Debug, Default)]
pub struct EvictionReport {
    pub evicted: usize,
    pub evicted_bytes: u64,
    /// Victims the item policy named that were no longer mapped
    pub stale: usize,
    pub retained: usize,
    /// Downgrade tasks started by this pass
    pub downgrades: Vec<JoinHandle<Result<bool>>>,
}

impl EvictionReport {
    /// Wait for the downgrades of this pass; returns how many landed on disk
    pub async fn wait(self) -> usize {
        let mut landed = 0;
        for result in join_all(self.downgrades).await {
            match result {
                Ok(Ok(true)) => landed += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!("Downgrade failed: {}", e),
                Err(e) => error!("Downgrade task panicked: {}", e),
            }
        }
        landed
    }
}

/// Eviction counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionSnapshot {
    pub passes: u64,
    pub evicted: u64,
    pub stale_victims: u64,
    pub downgraded: u64,
    pub downgrade_failures: u64,
}

#[derive(Debug, Default)]
struct EvictionCounters {
    passes: AtomicU64,
    evicted: AtomicU64,
    stale_victims: AtomicU64,
    downgraded: AtomicU64,
    downgrade_failures: AtomicU64,
}

struct TierEviction {
    tier: Arc<TierManager>,
    trigger: Box<dyn TriggerPolicy>,
}

/// Runs trigger, item and placement policies over the local tiers
pub struct EvictionManager {
    memory: Option<TierEviction>,
    disk: Option<TierEviction>,
    placement: Box<dyn PlacementPolicy>,
    locks: Arc<KeyLocks>,
    downgrade_permits: Semaphore,
    stats: Arc<dyn StatisticsSink>,
    config: EvictionConfig,
    read_chunk: usize,
    counters: EvictionCounters,
}

impl EvictionManager {
    pub fn new(
        config: EvictionConfig,
        memory: Option<Arc<TierManager>>,
        disk: Option<Arc<TierManager>>,
        locks: Arc<KeyLocks>,
        stats: Arc<dyn StatisticsSink>,
        read_chunk: usize,
    ) -> Self {
        let placement = DefaultPlacement::new(
            disk.is_some(),
            config.downgrade_to_disk,
            config.downgrade_mirrored,
        );
        let tier = |tier: Arc<TierManager>| TierEviction {
            tier,
            trigger: trigger_from_config(&config),
        };
        Self {
            memory: memory.map(tier),
            disk: disk.map(tier),
            placement: Box::new(placement),
            locks,
            downgrade_permits: Semaphore::new(config.max_parallel_downgrades.max(1)),
            stats,
            read_chunk: read_chunk.max(1),
            counters: EvictionCounters::default(),
            config,
        }
    }

    /// Replace the placement policy
    pub fn with_placement(mut self, placement: Box<dyn PlacementPolicy>) -> Self {
        self.placement = placement;
        self
    }

    /// Background loop; one pass per interval until cancelled
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Starting eviction manager (interval={}ms, trigger={}%)",
            self.config.interval_ms, self.config.trigger_percent
        );
        let mut tick = interval(self.config.interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Eviction manager shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let report = self.run_once();
                    if report.evicted > 0 || report.stale > 0 {
                        debug!(
                            "Eviction pass: {} evicted ({} bytes), {} stale, {} downgrades",
                            report.evicted,
                            report.evicted_bytes,
                            report.stale,
                            report.downgrades.len()
                        );
                    }
                }
            }
        }
    }

    /// One pass over both tiers, memory first.
    ///
    /// Must be called from within a tokio runtime; downgrades are spawned.
    pub fn run_once(self: &Arc<Self>) -> EvictionReport {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        let mut report = EvictionReport::default();
        for entry in [&self.memory, &self.disk].into_iter().flatten() {
            self.evict_tier(entry, &mut report);
        }
        report
    }

    fn evict_tier(self: &Arc<Self>, entry: &TierEviction, report: &mut EvictionReport) {
        let tier = &entry.tier;
        let usage = tier.usage();
        let items = tier.items();
        // Bytes of victims whose storage outlives this pass (open readers,
        // pending downgrades); they no longer count against the trigger.
        let mut pending_release = 0u64;
        let mut skip = HashSet::new();
        let mut budget = items.len() + tier.len() + 1;

        while budget > 0
            && entry
                .trigger
                .should_evict(usage.used().saturating_sub(pending_release), usage.capacity())
        {
            budget -= 1;
            let Some(key) = items.next_victim(&skip) else {
                break;
            };
            let Some(file) = tier.peek(&key) else {
                warn!("Eviction victim {} is not mapped in {} tier", key, tier.tier());
                items.on_item_delete(&key);
                report.stale += 1;
                self.counters.stale_victims.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let placement = self.placement.place(tier.tier(), &file);
            if placement == Placement::Retain {
                skip.insert(key);
                report.retained += 1;
                continue;
            }
            if tier.evict(&key, &file).is_none() {
                // remapped to a newer file meanwhile
                skip.insert(key);
                continue;
            }

            let bytes = file.size();
            self.stats.on_evict(tier.tier(), bytes);
            report.evicted += 1;
            report.evicted_bytes += bytes;
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);

            match placement {
                Placement::Downgrade => {
                    debug!(key = %key, version = file.version(), bytes, "Downgrading to disk");
                    pending_release += bytes;
                    let manager = Arc::clone(self);
                    report
                        .downgrades
                        .push(tokio::spawn(async move { manager.downgrade(file).await }));
                }
                _ => {
                    debug!(key = %key, tier = %tier.tier(), bytes, "Evicting");
                    file.delete();
                    if !file.is_deleted() {
                        pending_release += bytes;
                    }
                }
            }
        }
        tier.report_usage();
    }

    /// Copy an evicted memory file into the disk tier at the same version
    async fn downgrade(self: Arc<Self>, source: Arc<CacheFile>) -> Result<bool> {
        let _permit = self
            .downgrade_permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("Failed to acquire downgrade permit: {}", e)))?;
        let _lock = self.locks.lock(source.key()).await;

        let disk = match &self.disk {
            Some(entry) => entry.tier.clone(),
            None => {
                source.delete();
                return Ok(false);
            }
        };
        let key = source.key().clone();
        let version = source.version();
        if disk.version_of(&key).is_some_and(|v| v > version) {
            debug!(key = %key, version, "Disk already holds a newer version");
            source.delete();
            return Ok(false);
        }
        let Some(handle) = source.open_reader() else {
            return Ok(false);
        };

        // A same-version disk copy holds the continuation of a write that
        // spilled from memory; the memory prefix is merged into it.
        let existing = disk.peek(&key).filter(|f| f.version() == version);
        if let Some(existing) = &existing {
            let held = existing.covered();
            if source
                .covered()
                .into_iter()
                .all(|wanted| range::subtract(wanted, &held).is_empty())
            {
                debug!(key = %key, version, "Disk already holds every byte of this version");
                drop(handle);
                source.delete();
                return Ok(false);
            }
        }
        let merging = existing.is_some();
        let target = existing.unwrap_or_else(|| {
            let file = disk.create_file(key.clone());
            file.set_version(version);
            file
        });
        let pending =
            source.state() == FileState::ToBePushed || target.state() == FileState::ToBePushed;

        let copied = self.copy_blocks(&disk, &handle, &target).and_then(|()| {
            target.set_actual_size(source.actual_size());
            target.set_last_modified(source.last_modified());
            if pending {
                target.to_be_pushed()
            } else {
                target.complete()
            }
        });

        match copied {
            Ok(()) => {
                let visible = disk.put(target.clone()).is_visible();
                // the upload may have finished while we were copying
                if visible && source.state() == FileState::Complete {
                    let _ = target.mark_uploaded();
                }
                drop(handle);
                source.delete();
                self.counters.downgraded.fetch_add(1, Ordering::Relaxed);
                Ok(visible)
            }
            Err(e) => {
                self.counters.downgrade_failures.fetch_add(1, Ordering::Relaxed);
                drop(handle);
                if merging {
                    // seal whatever prefix landed; the disk copy keeps its state
                    let sealed = if target.state() == FileState::ToBePushed {
                        target.to_be_pushed()
                    } else {
                        target.complete()
                    };
                    if let Err(e) = sealed {
                        warn!(key = %key, version, error = %e, "Failed to seal merged disk copy");
                    }
                    disk.put(target);
                } else {
                    target.delete();
                }
                if merging || source.state() == FileState::ToBePushed {
                    // bytes exist nowhere else locally; map the copy back
                    match &self.memory {
                        Some(memory) => {
                            memory.tier.put(source);
                        }
                        None => {
                            source.delete();
                        }
                    }
                } else {
                    source.delete();
                }
                Err(e)
            }
        }
    }

    fn copy_blocks(
        &self,
        disk: &TierManager,
        source: &CacheFile,
        target: &Arc<CacheFile>,
    ) -> Result<()> {
        for covered in source.covered() {
            let mut writer = disk.writer(target.clone(), covered.start, Some(covered.stop));
            let mut cursor = covered.start;
            while cursor <= covered.stop {
                let chunk = BlockRange::new(
                    cursor,
                    covered.stop.min(cursor + self.read_chunk as i64 - 1),
                );
                let written = source.read(chunk).and_then(|data| writer.write(&data));
                if let Err(e) = written {
                    writer.abort();
                    return Err(e);
                }
                cursor = chunk.stop + 1;
            }
            writer.finish()?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> EvictionSnapshot {
        EvictionSnapshot {
            passes: self.counters.passes.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            stale_victims: self.counters.stale_victims.load(Ordering::Relaxed),
            downgraded: self.counters.downgraded.load(Ordering::Relaxed),
            downgrade_failures: self.counters.downgrade_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing::{DiskAllocator, TierUsage};
    use crate::cache::key::CacheKey;
    use crate::cache::stats::CacheMetrics;
    use crate::cache::tier::tests::{finished_file, memory_tier};
    use crate::cache::CacheTier;
    use tempfile::TempDir;

    fn disk_tier(dir: &TempDir, capacity: u64) -> Arc<TierManager> {
        Arc::new(TierManager::new(
            Arc::new(TierUsage::new(CacheTier::Disk, capacity)),
            Arc::new(DiskAllocator::new(dir.path()).unwrap()),
            Arc::new(RankedItemPolicy::new(Ranking::Lru)),
            Arc::new(CacheMetrics::new()),
            64,
        ))
    }

    fn manager(
        config: EvictionConfig,
        memory: Option<Arc<TierManager>>,
        disk: Option<Arc<TierManager>>,
    ) -> Arc<EvictionManager> {
        Arc::new(EvictionManager::new(
            config,
            memory,
            disk,
            Arc::new(KeyLocks::new()),
            Arc::new(CacheMetrics::new()),
            100,
        ))
    }

    #[tokio::test]
    async fn test_fifo_evicts_oldest_at_threshold() {
        let memory = Arc::new(memory_tier(1124, Ranking::Fifo));
        memory.put(finished_file(&memory, "big", 1, &vec![7u8; 1024]));
        memory.put(finished_file(&memory, "small", 1, &vec![8u8; 100]));
        assert_eq!(memory.usage().used(), 1124);

        let config = EvictionConfig {
            trigger_percent: 90.0,
            ..EvictionConfig::default()
        };
        let manager = manager(config, Some(memory.clone()), None);
        let report = manager.run_once();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.evicted_bytes, 1024);
        assert!(memory.peek(&CacheKey::new("bucket", "big")).is_none());
        assert!(memory.peek(&CacheKey::new("bucket", "small")).is_some());
        assert_eq!(memory.usage().used(), 100);
    }

    #[tokio::test]
    async fn test_stale_victim_does_not_stall() {
        let memory = Arc::new(memory_tier(100, Ranking::Fifo));
        // tracked but never mapped
        memory.items().on_item_add(&CacheKey::new("bucket", "ghost"), 10);
        memory.put(finished_file(&memory, "real", 1, &[1u8; 95]));

        let manager = manager(EvictionConfig::default(), Some(memory.clone()), None);
        let report = manager.run_once();
        assert_eq!(report.stale, 1);
        assert_eq!(report.evicted, 1);
        assert!(memory.is_empty());
        assert!(memory.items().is_empty());
        assert_eq!(manager.snapshot().stale_victims, 1);
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let memory = Arc::new(memory_tier(1000, Ranking::Lru));
        memory.put(finished_file(&memory, "a", 1, &[1u8; 100]));
        let manager = manager(EvictionConfig::default(), Some(memory.clone()), None);
        let report = manager.run_once();
        assert_eq!(report.evicted, 0);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_upload_downgraded_to_disk() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(memory_tier(100, Ranking::Lru));
        let disk = disk_tier(&dir, 10_000);

        let file = memory.create_file(CacheKey::new("bucket", "k"));
        let mut writer = memory.writer(file.clone(), 0, Some(94));
        writer.write(&[3u8; 95]).unwrap();
        writer.finish().unwrap();
        file.set_version(4);
        file.set_actual_size(Some(95));
        file.to_be_pushed().unwrap();
        memory.put(file.clone());

        let manager = manager(EvictionConfig::default(), Some(memory.clone()), Some(disk.clone()));
        let report = manager.run_once();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.wait().await, 1);

        let key = CacheKey::new("bucket", "k");
        assert!(memory.peek(&key).is_none());
        assert!(file.is_deleted());
        assert_eq!(memory.usage().used(), 0);

        let copy = disk.get(&key).unwrap();
        assert_eq!(copy.version(), 4);
        assert_eq!(copy.state(), FileState::ToBePushed);
        assert!(copy.is_full_file());
        assert_eq!(&copy.read(BlockRange::new(0, 94)).unwrap()[..], &[3u8; 95][..]);
    }

    #[tokio::test]
    async fn test_downgrade_merges_into_disk_continuation() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(memory_tier(50, Ranking::Lru));
        let disk = disk_tier(&dir, 10_000);
        let key = CacheKey::new("bucket", "spilled");

        // the write filled memory with [0, 49] and continued on disk
        let tail = disk.create_file(key.clone());
        let mut writer = disk.writer(tail.clone(), 50, Some(99));
        writer.write(&[2u8; 50]).unwrap();
        writer.finish().unwrap();
        tail.set_version(5);
        tail.set_actual_size(Some(100));
        tail.to_be_pushed().unwrap();
        disk.put(tail.clone());

        let head = memory.create_file(key.clone());
        let mut writer = memory.writer(head.clone(), 0, Some(49));
        writer.write(&[1u8; 50]).unwrap();
        writer.finish().unwrap();
        head.set_version(5);
        head.set_actual_size(Some(100));
        head.to_be_pushed().unwrap();
        memory.put(head.clone());

        let manager = manager(EvictionConfig::default(), Some(memory.clone()), Some(disk.clone()));
        let report = manager.run_once();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.wait().await, 1);

        assert!(memory.peek(&key).is_none());
        assert!(head.is_deleted());
        let copy = disk.get(&key).unwrap();
        assert!(Arc::ptr_eq(copy.file(), &tail));
        assert_eq!(copy.covered(), vec![BlockRange::new(0, 99)]);
        assert!(copy.is_full_file());
        assert_eq!(copy.state(), FileState::ToBePushed);
        let data = copy.read(BlockRange::new(0, 99)).unwrap();
        assert_eq!(&data[..50], &[1u8; 50][..]);
        assert_eq!(&data[50..], &[2u8; 50][..]);
        assert_eq!(disk.usage().used(), 100);
    }

    #[tokio::test]
    async fn test_pending_upload_retained_without_disk() {
        let memory = Arc::new(memory_tier(100, Ranking::Lru));
        let file = memory.create_file(CacheKey::new("bucket", "k"));
        let mut writer = memory.writer(file.clone(), 0, Some(94));
        writer.write(&[3u8; 95]).unwrap();
        writer.finish().unwrap();
        file.set_version(1);
        file.set_actual_size(Some(95));
        file.to_be_pushed().unwrap();
        memory.put(file);

        let manager = manager(EvictionConfig::default(), Some(memory.clone()), None);
        let report = manager.run_once();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.retained, 1);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_skipped_when_disk_is_newer() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(memory_tier(100, Ranking::Lru));
        let disk = disk_tier(&dir, 10_000);
        disk.put(finished_file(&disk, "k", 9, b"newer"));
        memory.put(finished_file(&memory, "k", 3, &[1u8; 95]));

        let config = EvictionConfig {
            downgrade_to_disk: true,
            downgrade_mirrored: true,
            ..EvictionConfig::default()
        };
        let manager = manager(config, Some(memory.clone()), Some(disk.clone()));
        let report = manager.run_once();
        assert_eq!(report.wait().await, 0);
        assert_eq!(disk.version_of(&CacheKey::new("bucket", "k")), Some(9));
        assert_eq!(memory.usage().used(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let memory = Arc::new(memory_tier(100, Ranking::Lru));
        let manager = manager(
            EvictionConfig {
                interval_ms: 10,
                ..EvictionConfig::default()
            },
            Some(memory),
            None,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.clone().run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(manager.snapshot().passes >= 1);
    }
}
