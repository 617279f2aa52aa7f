//! Write sessions
//!
//! A [`WriteSession`] fans one object write out to zero, one or two local
//! tier streams plus an optional remote writer, and finalizes everything
//! under the per-key lock at close.
//!
//! ```text
//!            memory full, disk absent from fan-out, continue-to-disk
//!   Local2 ──────────────┐   ┌──────────────────────────────┐
//!     │ a tier full      ▼   │                              ▼
//!     └──────────────► Local1(tier) ── last tier full ──► RemoteOnly
//!                                    (no remote writer) ──► Discard
//! ```
//!
//! Capacity exhaustion never fails a client write by itself: the exhausted
//! tier is dropped, the write continues on disk, or it switches to
//! write-through to the remote store after replaying the bytes already
//! cached.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::admission::WriteTarget;
use super::engine::EngineCore;
use super::file::{CacheFile, FileState};
use super::key::CacheKey;
use super::range::{self, BlockRange};
use super::remote::{ObjectInfo, RemoteWriter};
use super::stats::LatencyTracker;
use super::tier::TierManager;
use super::uploader::UploadJob;
use super::version::PendingGuard;
use super::writer::MultiBlockWriter;
use super::CacheTier;
use crate::error::{Error, Result};

// =============================================================================
// Fan-out state machine
// =============================================================================

/// What the session writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Client write; the version is minted at close
    Write { async_upload: bool },
    /// Caching data fetched from the remote store
    Fill {
        version: i64,
        length: Option<u64>,
        last_modified: DateTime<Utc>,
    },
}

/// How the remote store takes part in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteRole {
    /// Local tiers only
    None,
    /// Every byte goes to the remote writer as it arrives
    Sync,
    /// Uploaded from the local copies after close
    Async,
}

/// Where bytes currently go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FanoutState {
    Local2,
    Local1(CacheTier),
    RemoteOnly,
    Discard,
}

impl FanoutState {
    /// Starting state for an admission target
    pub fn initial(target: WriteTarget, remote: RemoteRole) -> Self {
        match target {
            WriteTarget::MemoryDisk => FanoutState::Local2,
            WriteTarget::MemoryOnly => FanoutState::Local1(CacheTier::Memory),
            WriteTarget::DiskOnly => FanoutState::Local1(CacheTier::Disk),
            WriteTarget::RemoteOnly if remote == RemoteRole::None => FanoutState::Discard,
            WriteTarget::RemoteOnly => FanoutState::RemoteOnly,
        }
    }
}

/// Action the session takes after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Forget the exhausted tier
    Drop,
    /// Keep the exhausted memory copy and open a disk stream where it stopped
    ContinueOnDisk,
    /// Replay the cached bytes to a new remote writer, then write through
    SwitchToRemote,
    /// Stop caching; keep what was written
    Discard,
}

/// Session facts the transition depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutContext {
    pub continue_to_disk: bool,
    pub disk_available: bool,
    pub remote: RemoteRole,
}

/// Next fan-out state after `exhausted` ran out of capacity
pub fn transition(state: FanoutState, exhausted: CacheTier, ctx: &FanoutContext) -> (FanoutState, Step) {
    match state {
        FanoutState::Local2 => {
            let remaining = match exhausted {
                CacheTier::Memory => CacheTier::Disk,
                _ => CacheTier::Memory,
            };
            (FanoutState::Local1(remaining), Step::Drop)
        }
        FanoutState::Local1(tier) if tier == exhausted => {
            if tier == CacheTier::Memory && ctx.continue_to_disk && ctx.disk_available {
                return (FanoutState::Local1(CacheTier::Disk), Step::ContinueOnDisk);
            }
            match ctx.remote {
                RemoteRole::Sync => (FanoutState::RemoteOnly, Step::Drop),
                RemoteRole::Async => (FanoutState::RemoteOnly, Step::SwitchToRemote),
                RemoteRole::None => (FanoutState::Discard, Step::Discard),
            }
        }
        other => (other, Step::Drop),
    }
}

// =============================================================================
// Session
// =============================================================================

struct TierStream {
    tier: Arc<TierManager>,
    writer: MultiBlockWriter,
}

impl TierStream {
    fn tier(&self) -> CacheTier {
        self.tier.tier()
    }

    fn file(&self) -> &Arc<CacheFile> {
        self.writer.file()
    }
}

/// One object write (or cache fill) across the tiers
pub struct WriteSession {
    core: Arc<EngineCore>,
    key: CacheKey,
    kind: SessionKind,
    state: FanoutState,
    ctx: FanoutContext,
    /// Streams still receiving bytes
    streams: Vec<TierStream>,
    /// Streams that stopped but whose files stay part of the object
    retired: Vec<TierStream>,
    remote: Option<Box<dyn RemoteWriter>>,
    start: i64,
    stop: Option<i64>,
    position: i64,
    timer: LatencyTracker,
    pending: Option<PendingGuard>,
    closed: bool,
}

impl WriteSession {
    pub(crate) fn for_write(
        core: Arc<EngineCore>,
        key: CacheKey,
        target: WriteTarget,
        role: RemoteRole,
        known_length: Option<u64>,
        remote: Option<Box<dyn RemoteWriter>>,
    ) -> Self {
        let pending = core.pending.begin(&key);
        let kind = SessionKind::Write {
            async_upload: role == RemoteRole::Async,
        };
        let stop = known_length.map(|len| len as i64 - 1);
        Self::build(core, key, kind, target, role, 0, stop, remote, Some(pending))
    }

    pub(crate) fn for_fill(
        core: Arc<EngineCore>,
        key: CacheKey,
        target: WriteTarget,
        info: &ObjectInfo,
        range: BlockRange,
    ) -> Self {
        let kind = SessionKind::Fill {
            version: info.version,
            length: Some(info.length),
            last_modified: info.last_modified,
        };
        Self::build(
            core,
            key,
            kind,
            target,
            RemoteRole::None,
            range.start,
            Some(range.stop),
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        core: Arc<EngineCore>,
        key: CacheKey,
        kind: SessionKind,
        target: WriteTarget,
        role: RemoteRole,
        start: i64,
        stop: Option<i64>,
        remote: Option<Box<dyn RemoteWriter>>,
        pending: Option<PendingGuard>,
    ) -> Self {
        let ctx = FanoutContext {
            continue_to_disk: core.config.write.continue_to_disk,
            disk_available: core.disk.is_some(),
            remote: role,
        };
        let mut session = Self {
            core,
            key,
            kind,
            state: FanoutState::initial(target, role),
            ctx,
            streams: Vec::with_capacity(2),
            retired: Vec::new(),
            remote,
            start,
            stop,
            position: start,
            timer: LatencyTracker::start(),
            pending,
            closed: false,
        };

        let tiers = [
            (target.has_memory(), session.core.memory.clone()),
            (target.has_disk(), session.core.disk.clone()),
        ];
        for (wanted, manager) in tiers {
            if let (true, Some(manager)) = (wanted, manager) {
                let file = session.open_file(&manager);
                session.streams.push(TierStream {
                    writer: manager.writer(file, start, stop),
                    tier: manager,
                });
            }
        }
        debug!(
            key = %session.key,
            state = ?session.state,
            remote = ?role,
            "Opened write session"
        );
        session
    }

    fn open_file(&self, manager: &Arc<TierManager>) -> Arc<CacheFile> {
        match self.kind {
            SessionKind::Fill { version, .. } => manager.fill_target(&self.key, version),
            SessionKind::Write { .. } => manager.create_file(self.key.clone()),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> FanoutState {
        self.state
    }

    /// Absolute offset of the next byte
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Tiers still receiving bytes
    pub fn active_tiers(&self) -> Vec<CacheTier> {
        self.streams.iter().map(|s| s.tier()).collect()
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Append the next bytes of the object
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed(self.key.to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let base = self.position;
        let mut i = 0;
        while i < self.streams.len() {
            // a continuation stream starts where the exhausted one stopped
            let offset = (self.streams[i].writer.position() - base).clamp(0, data.len() as i64);
            match self.streams[i].writer.write(&data[offset as usize..]) {
                Ok(()) => i += 1,
                Err(e) if e.is_out_of_capacity() => {
                    let stream = self.streams.remove(i);
                    if let Err(e) = self.on_exhausted(stream, base).await {
                        self.fail().await;
                        return Err(e);
                    }
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Local write failed, aborting session");
                    self.fail().await;
                    return Err(e);
                }
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            if let Err(e) = remote.write(data.clone()).await {
                self.fail().await;
                return Err(e);
            }
        }
        self.position = base + data.len() as i64;
        Ok(())
    }

    async fn on_exhausted(&mut self, stream: TierStream, base: i64) -> Result<()> {
        let exhausted = stream.tier();
        let (next, step) = transition(self.state, exhausted, &self.ctx);
        info!(
            "{} tier full while writing {} at offset {}: {:?} -> {:?} ({:?})",
            exhausted,
            self.key,
            stream.writer.position(),
            self.state,
            next,
            step
        );
        self.state = next;

        match step {
            Step::Drop => self.discard(stream),
            Step::ContinueOnDisk => {
                let disk = self
                    .core
                    .disk
                    .clone()
                    .ok_or_else(|| Error::Internal("continuation without a disk tier".into()))?;
                let from = stream.writer.position();
                self.retired.push(stream);
                let file = self.open_file(&disk);
                self.streams.push(TierStream {
                    writer: disk.writer(file, from, self.stop),
                    tier: disk,
                });
            }
            Step::SwitchToRemote => {
                self.retired.push(stream);
                self.switch_to_remote(base).await?;
            }
            Step::Discard => self.retired.push(stream),
        }
        Ok(())
    }

    /// Replay `[start, base)` from the cached copies into a fresh remote writer
    async fn switch_to_remote(&mut self, base: i64) -> Result<()> {
        let known_length = self.stop.map(|stop| (stop + 1) as u64);
        let mut remote = self
            .core
            .remote
            .create_writer(self.key.bucket(), self.key.key(), known_length)
            .await?;

        let chunk = self.core.config.upload.read_chunk_size.max(1) as i64;
        let mut cursor = self.start;
        for stream in &self.retired {
            let end = stream.writer.position().min(base);
            if stream.writer.start() > cursor {
                remote.abort().await;
                return Err(Error::InvariantViolation(format!(
                    "gap at {} replaying {}",
                    cursor, self.key
                )));
            }
            while cursor < end {
                let part = BlockRange::new(cursor, end.min(cursor + chunk) - 1);
                let data = match stream.file().read(part) {
                    Ok(data) => data,
                    Err(e) => {
                        remote.abort().await;
                        return Err(e);
                    }
                };
                remote.write(data).await?;
                cursor = part.stop + 1;
            }
        }
        if cursor != base {
            remote.abort().await;
            return Err(Error::InvariantViolation(format!(
                "replayed {} of {} bytes of {}",
                cursor - self.start,
                base - self.start,
                self.key
            )));
        }

        info!(
            "Switched {} to write-through after replaying {} bytes",
            self.key,
            base - self.start
        );
        for stream in std::mem::take(&mut self.retired) {
            self.discard(stream);
        }
        self.remote = Some(remote);
        self.ctx.remote = RemoteRole::Sync;
        Ok(())
    }

    /// Abort a stream and drop its file
    fn discard(&self, mut stream: TierStream) {
        stream.writer.abort();
        let file = stream.file();
        match self.kind {
            SessionKind::Write { .. } => {
                file.delete();
            }
            SessionKind::Fill { .. } => {
                // shared fill targets keep what other fills wrote
                if file.block_count() == 0 && !file.has_incomplete() {
                    stream.tier.drop_fill(file);
                }
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Finalize the object under the per-key lock
    pub async fn close(mut self) -> Result<ObjectInfo> {
        if self.closed {
            return Err(Error::SessionClosed(self.key.to_string()));
        }
        self.closed = true;
        let core = self.core.clone();
        let _lock = core.locks.lock(&self.key).await;

        let result = match self.finish_streams() {
            Ok(()) => match self.kind {
                SessionKind::Fill { .. } => self.finish_fill(),
                SessionKind::Write { .. } => self.finish_write().await,
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(key = %self.key, error = %e, "Closing write session failed, rolling back");
            self.rollback().await;
        }
        self.pending = None;
        result
    }

    /// Seal every writer; all streams end up in `retired`, in creation order
    fn finish_streams(&mut self) -> Result<()> {
        let active = std::mem::take(&mut self.streams);
        self.retired.extend(active);
        for stream in self.retired.iter_mut() {
            stream.writer.finish()?;
        }
        Ok(())
    }

    fn finish_fill(&mut self) -> Result<ObjectInfo> {
        let SessionKind::Fill {
            version,
            length,
            last_modified,
        } = self.kind
        else {
            return Err(Error::Internal("fill finalization of a client write".into()));
        };

        for stream in std::mem::take(&mut self.retired) {
            let file = stream.file().clone();
            if file.block_count() == 0 {
                let mapped = stream
                    .tier
                    .peek(&self.key)
                    .is_some_and(|m| Arc::ptr_eq(&m, &file));
                if !mapped && !file.has_incomplete() {
                    stream.tier.drop_fill(&file);
                    file.delete();
                }
                continue;
            }
            file.set_actual_size(length);
            file.set_last_modified(last_modified);
            // a fill extending a copy still waiting for upload keeps it pending
            let finalized = if file.state() == FileState::ToBePushed {
                file.to_be_pushed()
            } else {
                file.complete()
            };
            match finalized {
                Ok(()) => {
                    stream.tier.put(file);
                }
                Err(e) => debug!(key = %self.key, error = %e, "Dropping fill"),
            }
        }

        Ok(ObjectInfo {
            bucket: self.key.bucket().to_string(),
            key: self.key.key().to_string(),
            length: length.unwrap_or(0),
            last_modified,
            version,
        })
    }

    async fn finish_write(&mut self) -> Result<ObjectInfo> {
        let length = (self.position - self.start) as u64;
        let version = self
            .retired
            .iter()
            .map(|s| s.file().version())
            .find(|v| *v != 0)
            .unwrap_or_else(|| self.core.versions.next(&self.key));
        for stream in &self.retired {
            stream.file().set_version(version);
            stream.file().set_actual_size(Some(length));
        }

        match self.ctx.remote {
            RemoteRole::Async if length > 0 && !self.retired.is_empty() => {
                self.commit_async(version, length).await
            }
            _ => self.commit_sync(version, length).await,
        }
    }

    async fn commit_sync(&mut self, version: i64, length: u64) -> Result<ObjectInfo> {
        let mut remote = match self.remote.take() {
            Some(remote) => remote,
            None => {
                self.core
                    .remote
                    .create_writer(self.key.bucket(), self.key.key(), Some(length))
                    .await?
            }
        };
        remote.set_version(version);

        let committed = match remote.close().await {
            Ok(()) => remote.complete_file().await,
            Err(e) => Err(e),
        };
        let reason = match committed {
            Ok(true) => None,
            Ok(false) => Some("remote store rejected the upload".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            remote.abort().await;
            return Err(Error::RemoteCommitFailure {
                bucket: self.key.bucket().to_string(),
                key: self.key.key().to_string(),
                reason,
            });
        }
        self.core
            .stats
            .on_put(CacheTier::Remote, length, self.timer.elapsed());

        let last_modified = remote.object().last_modified;
        for stream in std::mem::take(&mut self.retired) {
            let file = stream.file().clone();
            if file.block_count() == 0 {
                file.delete();
                continue;
            }
            file.set_last_modified(last_modified);
            match file.complete() {
                Ok(()) => {
                    stream.tier.put(file);
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Dropping local copy after commit");
                    file.delete();
                }
            }
        }
        debug!(key = %self.key, version, length, "Committed write-through");

        Ok(ObjectInfo {
            bucket: self.key.bucket().to_string(),
            key: self.key.key().to_string(),
            length,
            last_modified,
            version,
        })
    }

    async fn commit_async(&mut self, version: i64, length: u64) -> Result<ObjectInfo> {
        // a full memory copy is the cheapest upload source, then a full disk
        // copy, then the memory prefix chained with its disk continuation
        let full = [CacheTier::Memory, CacheTier::Disk].into_iter().find_map(|tier| {
            self.retired
                .iter()
                .position(|s| s.tier() == tier && s.file().is_full_file())
        });
        let sources: Vec<usize> = match full {
            Some(idx) => vec![idx],
            None => (0..self.retired.len()).collect(),
        };

        let covered: Vec<BlockRange> = sources
            .iter()
            .flat_map(|&i| self.retired[i].file().covered())
            .collect();
        if range::unify(&covered) != vec![BlockRange::with_len(0, length)] {
            return Err(Error::InvariantViolation(format!(
                "local copies of {} do not cover {} bytes",
                self.key, length
            )));
        }

        let last_modified = Utc::now();
        let mut handles = Vec::with_capacity(sources.len());
        for (i, stream) in self.retired.iter().enumerate() {
            let file = stream.file();
            file.set_last_modified(last_modified);
            if sources.contains(&i) {
                file.to_be_pushed()?;
                let handle = file.open_reader().ok_or_else(|| {
                    Error::Internal(format!("upload source of {} became obsolete", self.key))
                })?;
                handles.push(handle);
            } else {
                file.complete()?;
            }
        }
        for stream in std::mem::take(&mut self.retired) {
            stream.tier.put(stream.file().clone());
        }

        let job = UploadJob {
            key: self.key.clone(),
            version,
            length,
            last_modified,
            sources: handles,
        };
        if let Err(e) = self.core.uploader.enqueue(job).await {
            warn!(key = %self.key, version, error = %e, "Upload not queued; copy stays pending");
        }
        debug!(key = %self.key, version, length, "Queued write-back upload");

        Ok(ObjectInfo {
            bucket: self.key.bucket().to_string(),
            key: self.key.key().to_string(),
            length,
            last_modified,
            version,
        })
    }

    // =========================================================================
    // Abort
    // =========================================================================

    /// Abandon the write; nothing becomes visible
    pub async fn abort(mut self) {
        self.fail().await;
    }

    async fn fail(&mut self) {
        self.closed = true;
        self.rollback().await;
        self.pending = None;
    }

    async fn rollback(&mut self) {
        self.discard_all();
        if let Some(mut remote) = self.remote.take() {
            remote.abort().await;
        }
    }

    fn discard_all(&mut self) {
        let streams: Vec<TierStream> = std::mem::take(&mut self.streams)
            .into_iter()
            .chain(std::mem::take(&mut self.retired))
            .collect();
        for stream in streams {
            self.discard(stream);
        }
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!(key = %self.key, "Write session dropped without close");
        self.discard_all();
        if let Some(mut remote) = self.remote.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { remote.abort().await });
            }
        }
    }
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("position", &self.position)
            .finish()
    }
}

/// Read `range` from a chain of copies, first match wins per byte
pub(crate) fn read_stitched(files: &[&CacheFile], range: BlockRange) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(range.len() as usize);
    let mut cursor = range.start;
    while cursor <= range.stop {
        let found = files.iter().find_map(|file| {
            range::find_block_contains(&file.covered(), cursor).map(|c| (file, c))
        });
        let Some((file, covered)) = found else {
            return Err(Error::InvalidRange {
                start: cursor,
                stop: range.stop,
            });
        };
        let part = BlockRange::new(cursor, covered.stop.min(range.stop));
        out.extend_from_slice(&file.read(part)?);
        cursor = part.stop + 1;
    }
    Ok(out.freeze())
}

// =============================================================================
// Tests
// =============================================================================
