//! Cache engine
//!
//! Front door of the gateway. Owns the tier managers, the per-key version
//! counter and close locks, the uploader and the eviction manager, and
//! exposes the object operations: create, read, delete and list.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::admission::{AdmissionPolicy, ObjectCandidate, SizeAdmissionPolicy, WriteTarget};
use super::backing::{DiskAllocator, MemoryAllocator, TierUsage};
use super::eviction::{EvictionManager, EvictionReport, EvictionSnapshot, RankedItemPolicy, Ranking};
use super::file::FileReadHandle;
use super::key::CacheKey;
use super::pool::BufferPool;
use super::range::{self, BlockRange};
use super::recovery::{recover_disk_tier, RecoveryReport};
use super::remote::{ObjectInfo, RemoteStore};
use super::session::{RemoteRole, WriteSession};
use super::stats::{LatencyTracker, StatisticsSink};
use super::tier::{TierManager, TierSnapshot};
use super::uploader::{UploadJob, Uploader, UploaderSnapshot};
use super::version::{KeyLocks, PendingWrites, VersionCounter};
use super::CacheTier;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// State shared by the engine, its write sessions and background tasks
pub(crate) struct EngineCore {
    pub(crate) config: CacheConfig,
    pub(crate) memory: Option<Arc<TierManager>>,
    pub(crate) disk: Option<Arc<TierManager>>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) admission: Box<dyn AdmissionPolicy>,
    pub(crate) versions: Arc<VersionCounter>,
    pub(crate) locks: Arc<KeyLocks>,
    pub(crate) pending: Arc<PendingWrites>,
    pub(crate) uploader: Arc<Uploader>,
    pub(crate) stats: Arc<dyn StatisticsSink>,
}

impl EngineCore {
    /// Local tiers, fastest first
    fn tiers(&self) -> impl Iterator<Item = &Arc<TierManager>> {
        self.memory.iter().chain(self.disk.iter())
    }
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub memory: Option<TierSnapshot>,
    pub disk: Option<TierSnapshot>,
    pub uploads: UploaderSnapshot,
    pub eviction: EvictionSnapshot,
    pub pending_writes: usize,
    pub tracked_keys: usize,
}

/// Tiered object cache in front of a remote store
pub struct CacheEngine {
    core: Arc<EngineCore>,
    eviction: Arc<EvictionManager>,
}

impl CacheEngine {
    /// Build the tiers described by `config`
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        stats: Arc<dyn StatisticsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let ranking = Ranking::from(&config.eviction.item_policy);

        let memory = if config.memory.enabled {
            let pool = Arc::new(BufferPool::new(
                config.memory.segment_size,
                config.memory.max_pooled_segments,
            ));
            Some(Arc::new(TierManager::new(
                Arc::new(TierUsage::new(CacheTier::Memory, config.memory.capacity_bytes)),
                Arc::new(MemoryAllocator::new(pool)),
                Arc::new(RankedItemPolicy::new(ranking.clone())),
                stats.clone(),
                config.write.chunk_size,
            )))
        } else {
            None
        };

        let disk = if config.disk.enabled {
            Some(Arc::new(TierManager::new(
                Arc::new(TierUsage::new(CacheTier::Disk, config.disk.capacity_bytes)),
                Arc::new(DiskAllocator::new(&config.disk.root)?),
                Arc::new(RankedItemPolicy::new(ranking)),
                stats.clone(),
                config.write.chunk_size,
            )))
        } else {
            None
        };

        let versions = Arc::new(VersionCounter::new());
        let locks = Arc::new(KeyLocks::new());
        let uploader = Arc::new(Uploader::new(
            config.upload.clone(),
            remote.clone(),
            versions.clone(),
            memory.clone(),
            disk.clone(),
            stats.clone(),
        ));
        let eviction = Arc::new(EvictionManager::new(
            config.eviction.clone(),
            memory.clone(),
            disk.clone(),
            locks.clone(),
            stats.clone(),
            config.upload.read_chunk_size,
        ));
        let admission = Box::new(SizeAdmissionPolicy::new(
            config.admission.clone(),
            memory.is_some(),
            disk.is_some(),
        ));

        info!(
            "Cache engine ready: memory={} disk={} policy={:?}",
            memory.is_some(),
            disk.is_some(),
            config.eviction.item_policy
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                config,
                memory,
                disk,
                remote,
                admission,
                versions,
                locks,
                pending: Arc::new(PendingWrites::new()),
                uploader,
                stats,
            }),
            eviction,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    pub fn memory(&self) -> Option<&Arc<TierManager>> {
        self.core.memory.as_ref()
    }

    pub fn disk(&self) -> Option<&Arc<TierManager>> {
        self.core.disk.as_ref()
    }

    pub fn versions(&self) -> &Arc<VersionCounter> {
        &self.core.versions
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Rebuild the disk tier and requeue copies still waiting for upload
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let Some(disk) = self.core.disk.as_ref() else {
            return Ok(RecoveryReport::default());
        };
        let report = recover_disk_tier(&self.core.config.disk.root, disk, &self.core.versions)?;

        for file in &report.pending_uploads {
            let Some(length) = file.actual_size() else {
                // only part of the object survived; nothing complete to push
                warn!(key = %file.key(), version = file.version(), "Dropping partial pending copy");
                disk.delete(file.key());
                continue;
            };
            let Some(handle) = file.open_reader() else {
                continue;
            };
            let job = UploadJob {
                key: file.key().clone(),
                version: file.version(),
                length,
                last_modified: file.last_modified(),
                sources: vec![handle],
            };
            self.core.uploader.enqueue(job).await?;
        }
        Ok(report)
    }

    /// Spawn the eviction loop and the uploader
    pub fn start_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.eviction.clone().run(cancel.clone())),
            tokio::spawn(self.core.uploader.clone().run(cancel)),
        ]
    }

    /// Wait until every queued upload has finished
    pub async fn wait_for_uploads(&self) {
        self.core.uploader.wait_idle().await;
    }

    /// One eviction pass over both tiers
    pub fn run_eviction_once(&self) -> EvictionReport {
        self.eviction.run_once()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Open a write session for a new version of `bucket/key`.
    ///
    /// With `async_upload` the object is acknowledged once cached locally
    /// and pushed to the remote store in the background.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        bucket: &str,
        key: &str,
        async_upload: bool,
        known_length: Option<u64>,
    ) -> Result<WriteSession> {
        let cache_key = CacheKey::new(bucket, key);
        let candidate = ObjectCandidate::new(bucket, key, known_length);
        let target = self.core.admission.select_write_target(&candidate);

        let role = if async_upload && target != WriteTarget::RemoteOnly {
            RemoteRole::Async
        } else {
            RemoteRole::Sync
        };
        let remote = match role {
            RemoteRole::Sync => Some(
                self.core
                    .remote
                    .create_writer(bucket, key, known_length)
                    .await?,
            ),
            _ => None,
        };
        debug!(target = ?target, role = ?role, "Creating write session");

        Ok(WriteSession::for_write(
            self.core.clone(),
            cache_key,
            target,
            role,
            known_length,
            remote,
        ))
    }

    /// Write a whole object in one call
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        async_upload: bool,
    ) -> Result<ObjectInfo> {
        let mut session = self
            .create(bucket, key, async_upload, Some(data.len() as u64))
            .await?;
        session.write(data).await?;
        session.close().await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an object, or `[start, stop]` of it.
    ///
    /// Bytes come from memory, then disk copies of the same version, then
    /// the remote store; remote bytes are cached on the way back.
    #[instrument(skip(self))]
    pub async fn read(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(i64, i64)>,
    ) -> Result<Option<Bytes>> {
        let timer = LatencyTracker::start();
        let cache_key = CacheKey::new(bucket, key);
        let mut local = self.local_sources(&cache_key);
        let mut length = local.iter().find_map(|h| h.actual_size());

        if length.is_none() {
            match self.core.remote.head(bucket, key).await? {
                Some(info) => {
                    self.core.versions.observe(&cache_key, info.version);
                    if local.first().is_some_and(|h| h.version() < info.version) {
                        self.invalidate(&cache_key, info.version);
                        local.clear();
                    }
                    length = Some(info.length);
                }
                None if local.is_empty() => return Ok(None),
                // only a partial local copy of unknown length is left
                None if range.is_none() => return Ok(None),
                None => {}
            }
        }

        let Some(want) = resolve_range(range, length)? else {
            return Ok(Some(Bytes::new()));
        };
        let local_version = local.first().map(|h| h.version());

        let mut parts: Vec<(BlockRange, Bytes)> = Vec::new();
        let mut gaps = vec![want];
        for handle in &local {
            let covered = handle.covered();
            let mut rest = Vec::new();
            let mut hit = 0u64;
            for gap in gaps {
                for held in &covered {
                    if let Some(part) = held.intersect(&gap) {
                        parts.push((part, handle.read(part)?));
                        hit += part.len();
                    }
                }
                rest.extend(range::subtract(gap, &covered));
            }
            if hit > 0 {
                self.core.stats.on_get(handle.tier(), hit, timer.elapsed());
            }
            gaps = rest;
        }

        let mut fetched = Vec::new();
        for gap in gaps {
            let Some(object) = self.core.remote.read(bucket, key, Some(gap)).await? else {
                debug!("Object vanished from the remote store");
                return Ok(None);
            };
            if let Some(version) = local_version {
                if object.info.version > version {
                    self.invalidate(&cache_key, object.info.version);
                    drop(local);
                    return self.read_remote(&cache_key, want).await;
                }
                if object.info.version < version {
                    return Err(Error::StaleVersion {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        version: object.info.version,
                        current: version,
                    });
                }
            }
            self.core
                .stats
                .on_get(CacheTier::Remote, object.data.len() as u64, timer.elapsed());
            if let Some(range) = object.range {
                parts.push((range, object.data.clone()));
                fetched.push((object.info, range, object.data));
            }
        }
        drop(local);

        let data = assemble(parts);
        for (info, range, bytes) in fetched {
            self.fill(&cache_key, &info, range, bytes).await;
        }
        Ok(Some(data))
    }

    /// Newest local copies, memory first
    fn local_sources(&self, key: &CacheKey) -> Vec<FileReadHandle> {
        let handles: Vec<FileReadHandle> = self.core.tiers().filter_map(|t| t.get(key)).collect();
        let newest = handles.iter().map(|h| h.version()).max();
        handles
            .into_iter()
            .filter(|h| Some(h.version()) == newest)
            .collect()
    }

    async fn read_remote(&self, key: &CacheKey, want: BlockRange) -> Result<Option<Bytes>> {
        let timer = LatencyTracker::start();
        let Some(object) = self
            .core
            .remote
            .read(key.bucket(), key.key(), Some(want))
            .await?
        else {
            return Ok(None);
        };
        self.core
            .stats
            .on_get(CacheTier::Remote, object.data.len() as u64, timer.elapsed());
        if let Some(range) = object.range {
            self.fill(key, &object.info, range, object.data.clone()).await;
        }
        Ok(Some(object.data))
    }

    /// Cache bytes fetched from the remote store.
    ///
    /// Skipped while a local write of the key is open or once a newer
    /// version is known.
    async fn fill(&self, key: &CacheKey, info: &ObjectInfo, range: BlockRange, data: Bytes) {
        if self.core.pending.is_pending(key) || self.core.versions.latest(key) > info.version {
            return;
        }
        self.core.versions.observe(key, info.version);

        let candidate = ObjectCandidate::new(key.bucket(), key.key(), Some(info.length));
        let target = self.core.admission.select_read_target(&candidate);
        if target.local_tiers() == 0 {
            return;
        }

        let mut session = WriteSession::for_fill(self.core.clone(), key.clone(), target, info, range);
        if let Err(e) = session.write(data).await {
            debug!(key = %key, error = %e, "Cache fill stopped");
            return;
        }
        if let Err(e) = session.close().await {
            debug!(key = %key, error = %e, "Cache fill not kept");
        }
    }

    fn invalidate(&self, key: &CacheKey, min_version: i64) {
        for tier in self.core.tiers() {
            tier.check_version(key, min_version);
        }
    }

    // =========================================================================
    // Delete, list, notifications
    // =========================================================================

    /// Delete an object from every tier.
    ///
    /// The key's version moves forward, so queued uploads and fills of the
    /// deleted version are dropped.
    #[instrument(skip(self))]
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let cache_key = CacheKey::new(bucket, key);
        let _lock = self.core.locks.lock(&cache_key).await;
        let version = self.core.versions.next(&cache_key);

        let mut found = false;
        for tier in self.core.tiers() {
            found |= tier.delete(&cache_key);
        }
        let timer = LatencyTracker::start();
        if self.core.remote.delete(bucket, key).await? {
            self.core
                .stats
                .on_delete(CacheTier::Remote, 0, timer.elapsed());
            found = true;
        }
        info!("Deleted {} (found={}, version now {})", cache_key, found, version);
        Ok(found)
    }

    /// Objects under `prefix`, local copies overriding older remote entries
    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let remote = self.core.remote.list(bucket, prefix).await?;
        let local = self.core.tiers().flat_map(|t| t.list(bucket, prefix));

        let mut merged: BTreeMap<String, ObjectInfo> = BTreeMap::new();
        for info in remote.into_iter().chain(local) {
            match merged.entry(info.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(info);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().version < info.version {
                        slot.insert(info);
                    }
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Another writer committed `version` of the object to the remote store
    pub fn on_remote_update(&self, bucket: &str, key: &str, version: i64) {
        let cache_key = CacheKey::new(bucket, key);
        self.core.versions.observe(&cache_key, version);
        if self.core.pending.is_pending(&cache_key) {
            debug!(key = %cache_key, version, "Remote update while a local write is open");
            return;
        }
        self.invalidate(&cache_key, version);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            memory: self.core.memory.as_ref().map(|t| t.snapshot()),
            disk: self.core.disk.as_ref().map(|t| t.snapshot()),
            uploads: self.core.uploader.snapshot(),
            eviction: self.eviction.snapshot(),
            pending_writes: self.core.pending.total(),
            tracked_keys: self.core.versions.len(),
        }
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("memory", &self.core.memory)
            .field("disk", &self.core.disk)
            .field("uploader", &self.core.uploader)
            .finish()
    }
}

/// Clamp a requested range to the object; `None` means nothing to return
fn resolve_range(range: Option<(i64, i64)>, length: Option<u64>) -> Result<Option<BlockRange>> {
    match (range, length) {
        (Some((start, stop)), _) if start < 0 || stop < start => {
            Err(Error::InvalidRange { start, stop })
        }
        (Some((start, _)), Some(len)) if start as u64 >= len => Ok(None),
        (Some((start, stop)), Some(len)) => Ok(Some(BlockRange::new(start, stop.min(len as i64 - 1)))),
        (Some((start, stop)), None) => Ok(Some(BlockRange::new(start, stop))),
        (None, Some(0)) => Ok(None),
        (None, Some(len)) => Ok(Some(BlockRange::with_len(0, len))),
        (None, None) => Err(Error::InvalidRange { start: 0, stop: -1 }),
    }
}

fn assemble(mut parts: Vec<(BlockRange, Bytes)>) -> Bytes {
    if parts.len() == 1 {
        return parts.remove(0).1;
    }
    parts.sort_by_key(|(range, _)| range.start);
    let total = parts.iter().map(|(_, data)| data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for (_, data) in parts {
        out.extend_from_slice(&data);
    }
    out.freeze()
}

// =============================================================================
// Tests
// =============================================================================
