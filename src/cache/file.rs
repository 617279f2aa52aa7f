//! Cache files
//!
//! A CacheFile is the cached copy of one object within one tier: the
//! committed blocks, the blocks still being written, and the list of ranges
//! writers have claimed.
//!
//! ```text
//!   INCOMPLETE ──► TOBEPUSHED ──► COMPLETE ──► OBSOLETE
//!        └─────────────────────────┘   ▲
//!        └─────────────────────────────┘ (abort)
//! ```
//!
//! Physical deletion is deferred while read handles are open; whichever of
//! `delete()` or the last `FileReadHandle` drop comes second performs it,
//! exactly once.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::block::CacheBlock;
use super::key::CacheKey;
use super::range::{self, BlockRange};
use super::remote::ObjectInfo;
use super::{now_millis, CacheTier};
use crate::error::{Error, Result};

/// Lifecycle state of a cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Being written, not mapped
    Incomplete,
    /// Visible, waiting for remote upload
    ToBePushed,
    /// Visible
    Complete,
    /// Superseded or deleted
    Obsolete,
}

/// Result of a range claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The cursor lies in this already reserved range
    Covered(BlockRange),
    /// This gap is now reserved for the caller
    Granted(BlockRange),
}

struct FileInner {
    state: FileState,
    /// Committed blocks, sorted by start
    blocks: Vec<Arc<CacheBlock>>,
    incomplete: Vec<Arc<CacheBlock>>,
    actual_size: Option<u64>,
    partial: bool,
    last_modified: DateTime<Utc>,
}

/// Cached copy of one object in one tier
pub struct CacheFile {
    key: CacheKey,
    tier: CacheTier,
    version: AtomicI64,
    last_used: AtomicI64,
    reservations: Mutex<Vec<BlockRange>>,
    inner: Mutex<FileInner>,
    readers: AtomicUsize,
    obsolete: AtomicBool,
    deleted: AtomicBool,
}

impl CacheFile {
    /// Create an empty, unversioned file
    pub fn new(key: CacheKey, tier: CacheTier) -> Self {
        Self {
            key,
            tier,
            version: AtomicI64::new(0),
            last_used: AtomicI64::new(now_millis()),
            reservations: Mutex::new(Vec::new()),
            inner: Mutex::new(FileInner {
                state: FileState::Incomplete,
                blocks: Vec::new(),
                incomplete: Vec::new(),
                actual_size: None,
                partial: false,
                last_modified: Utc::now(),
            }),
            readers: AtomicUsize::new(0),
            obsolete: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[inline]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Stamp the version on the file and its blocks; later stamps are no-ops
    pub fn set_version(&self, version: i64) -> bool {
        if version == 0
            || self
                .version
                .compare_exchange(0, version, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        let inner = self.inner.lock();
        for block in inner.blocks.iter().chain(inner.incomplete.iter()) {
            block.set_version(version);
        }
        true
    }

    pub fn state(&self) -> FileState {
        self.inner.lock().state
    }

    /// Length of the whole object, when known
    pub fn actual_size(&self) -> Option<u64> {
        self.inner.lock().actual_size
    }

    pub fn set_actual_size(&self, size: Option<u64>) {
        self.inner.lock().actual_size = size;
    }

    pub fn is_partial(&self) -> bool {
        self.inner.lock().partial
    }

    /// Flag the file as never going to hold the whole object
    pub fn mark_partial(&self) {
        self.inner.lock().partial = true;
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.inner.lock().last_modified
    }

    pub fn set_last_modified(&self, at: DateTime<Utc>) {
        self.inner.lock().last_modified = at;
    }

    /// Last access, milliseconds since the epoch
    pub fn last_used(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Claim the range starting at `cursor`.
    ///
    /// If another writer already reserved `cursor`, the covering reservation
    /// is returned and nothing is claimed.
    pub fn claim(&self, cursor: i64, final_stop: Option<i64>) -> Result<Claim> {
        let mut reservations = self.reservations.lock();
        let unified = range::unify(&reservations);
        if let Some(covered) = range::find_block_contains(&unified, cursor) {
            return Ok(Claim::Covered(covered));
        }
        let gap = range::find_empty_space(&unified, cursor, final_stop).ok_or(
            Error::InvalidRange {
                start: cursor,
                stop: final_stop.unwrap_or(cursor),
            },
        )?;
        reservations.push(gap);
        Ok(Claim::Granted(gap))
    }

    /// Replace a claimed range after it was re-split or truncated
    pub fn replace_reserved_range(&self, old: BlockRange, new: Option<BlockRange>) {
        let mut reservations = self.reservations.lock();
        match reservations.iter().position(|r| *r == old) {
            Some(idx) => match new {
                Some(new) => reservations[idx] = new,
                None => {
                    reservations.swap_remove(idx);
                }
            },
            None => warn!(key = %self.key, range = %old, "Replacing unknown reservation"),
        }
    }

    /// Unified list of reserved ranges
    pub fn reserved(&self) -> Vec<BlockRange> {
        range::unify(&self.reservations.lock())
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Register a block that is being written
    pub fn attach_block(&self, block: Arc<CacheBlock>) {
        block.set_version(self.version());
        self.inner.lock().incomplete.push(block);
    }

    /// Make a sealed block part of the file
    pub fn commit_block(&self, block: &Arc<CacheBlock>) {
        let keep = {
            let mut inner = self.inner.lock();
            inner.incomplete.retain(|b| !Arc::ptr_eq(b, block));
            let keep = block.written() > 0 && !self.obsolete.load(Ordering::SeqCst);
            if keep {
                block.set_version(self.version());
                let start = block.range().start;
                let idx = inner.blocks.partition_point(|b| b.range().start < start);
                inner.blocks.insert(idx, block.clone());
            }
            keep
        };
        if !keep {
            block.delete();
        }
    }

    /// Drop a block that will never become visible
    pub fn discard_block(&self, block: &Arc<CacheBlock>) {
        self.inner
            .lock()
            .incomplete
            .retain(|b| !Arc::ptr_eq(b, block));
        block.abort_write();
    }

    /// True while any block is still being written
    pub fn has_incomplete(&self) -> bool {
        !self.inner.lock().incomplete.is_empty()
    }

    /// Number of committed blocks
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Committed blocks, sorted by start
    pub fn blocks(&self) -> Vec<Arc<CacheBlock>> {
        self.inner.lock().blocks.clone()
    }

    /// Bytes held by committed blocks
    pub fn size(&self) -> u64 {
        self.inner.lock().blocks.iter().map(|b| b.written()).sum()
    }

    /// Unified ranges held by committed blocks
    pub fn covered(&self) -> Vec<BlockRange> {
        let ranges: Vec<BlockRange> = self.inner.lock().blocks.iter().map(|b| b.range()).collect();
        range::unify(&ranges)
    }

    /// Committed bytes equal the object length and no block is in flight
    pub fn is_full_file(&self) -> bool {
        let inner = self.inner.lock();
        if !inner.incomplete.is_empty() {
            return false;
        }
        let committed: u64 = inner
            .blocks
            .iter()
            .filter(|b| b.state().is_committed())
            .map(|b| b.written())
            .sum();
        inner.actual_size == Some(committed) && !inner.blocks.is_empty()
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Finalize as visible
    pub fn complete(&self) -> Result<()> {
        self.finalize(FileState::Complete)
    }

    /// Finalize as visible and pending upload
    pub fn to_be_pushed(&self) -> Result<()> {
        self.finalize(FileState::ToBePushed)
    }

    fn finalize(&self, target: FileState) -> Result<()> {
        if self.obsolete.load(Ordering::SeqCst) {
            return Err(Error::InvariantViolation(format!(
                "finalizing obsolete {} file {}",
                self.tier, self.key
            )));
        }
        let partial = !self.is_full_file();
        let blocks = {
            let mut inner = self.inner.lock();
            inner.state = target;
            inner.partial = partial;
            inner.blocks.clone()
        };
        for block in &blocks {
            match target {
                FileState::ToBePushed => block.to_be_pushed(partial)?,
                _ => block.complete(partial)?,
            }
        }
        Ok(())
    }

    /// Remote copy confirmed; a pending upload becomes a plain complete file
    pub fn mark_uploaded(&self) -> Result<bool> {
        if self.state() != FileState::ToBePushed {
            return Ok(false);
        }
        self.complete()?;
        Ok(true)
    }

    // =========================================================================
    // Readers and deletion
    // =========================================================================

    /// Open a read handle; `None` once the file is obsolete
    pub fn open_reader(self: &Arc<Self>) -> Option<FileReadHandle> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let handle = FileReadHandle { file: self.clone() };
        if self.obsolete.load(Ordering::SeqCst) {
            return None;
        }
        self.touch();
        Some(handle)
    }

    /// Active read handles
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }

    /// True once storage has been released
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Mark obsolete; storage goes once no reader remains.
    ///
    /// Returns false if the file was already obsolete.
    pub fn delete(&self) -> bool {
        if self.obsolete.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.lock().state = FileState::Obsolete;
        if self.readers.load(Ordering::SeqCst) == 0 {
            self.release_storage();
        } else {
            debug!(key = %self.key, tier = %self.tier, readers = self.readers(), "Deferring file deletion");
        }
        true
    }

    fn release_storage(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        let (blocks, incomplete) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.blocks),
                std::mem::take(&mut inner.incomplete),
            )
        };
        for block in incomplete {
            block.abort_write();
        }
        for block in blocks {
            block.delete();
        }
        debug!(key = %self.key, tier = %self.tier, version = self.version(), "Deleted cache file");
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `range`, which committed blocks must fully cover
    pub fn read(&self, range: BlockRange) -> Result<Bytes> {
        let blocks = self.blocks();
        let mut out = BytesMut::with_capacity(range.len() as usize);
        let mut cursor = range.start;
        for block in blocks {
            let Some(part) = block.range().intersect(&range) else {
                continue;
            };
            if part.start != cursor {
                break;
            }
            out.extend_from_slice(&block.read(part)?);
            cursor = part.stop + 1;
            if cursor > range.stop {
                return Ok(out.freeze());
            }
        }
        Err(Error::InvalidRange {
            start: range.start,
            stop: range.stop,
        })
    }

    /// Listing metadata for this copy
    pub fn info(&self) -> ObjectInfo {
        let inner = self.inner.lock();
        let committed: u64 = inner.blocks.iter().map(|b| b.written()).sum();
        ObjectInfo {
            bucket: self.key.bucket().to_string(),
            key: self.key.key().to_string(),
            length: inner.actual_size.unwrap_or(committed),
            last_modified: inner.last_modified,
            version: self.version(),
        }
    }
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("version", &self.version())
            .field("readers", &self.readers())
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

/// Counted read access to a CacheFile
pub struct FileReadHandle {
    file: Arc<CacheFile>,
}

impl FileReadHandle {
    /// The underlying file
    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }
}

impl Deref for FileReadHandle {
    type Target = CacheFile;

    fn deref(&self) -> &CacheFile {
        &self.file
    }
}

impl Drop for FileReadHandle {
    fn drop(&mut self) {
        if self.file.readers.fetch_sub(1, Ordering::SeqCst) == 1 && self.file.is_obsolete() {
            self.file.release_storage();
        }
    }
}

impl std::fmt::Debug for FileReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileReadHandle").field(&self.file).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing::{MemoryBacking, TierUsage};
    use crate::cache::block::BlockState;
    use crate::cache::pool::BufferPool;
    use assert_matches::assert_matches;

    struct Fixture {
        file: Arc<CacheFile>,
        usage: Arc<TierUsage>,
        pool: Arc<BufferPool>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                file: Arc::new(CacheFile::new(CacheKey::new("b", "k"), CacheTier::Memory)),
                usage: Arc::new(TierUsage::new(CacheTier::Memory, 1 << 20)),
                pool: Arc::new(BufferPool::new(64, 64)),
            }
        }

        fn add_block(&self, range: BlockRange, data: &[u8]) -> Arc<CacheBlock> {
            let block = Arc::new(CacheBlock::new(
                self.file.key().clone(),
                CacheTier::Memory,
                range,
                Box::new(MemoryBacking::new(self.pool.clone())),
                self.usage.clone(),
            ));
            self.file.attach_block(block.clone());
            block.write(data).unwrap();
            block.close();
            self.file.commit_block(&block);
            block
        }
    }

    #[test]
    fn test_claims_never_overlap() {
        let fx = Fixture::new();
        assert_eq!(
            fx.file.claim(0, Some(999)).unwrap(),
            Claim::Granted(BlockRange::new(0, 999))
        );
        assert_eq!(
            fx.file.claim(500, Some(999)).unwrap(),
            Claim::Covered(BlockRange::new(0, 999))
        );
    }

    #[test]
    fn test_claim_stops_before_next_reservation() {
        let fx = Fixture::new();
        fx.file.claim(500, Some(999)).unwrap();
        assert_eq!(
            fx.file.claim(0, Some(999)).unwrap(),
            Claim::Granted(BlockRange::new(0, 499))
        );
        assert_eq!(fx.file.reserved(), vec![BlockRange::new(0, 999)]);
    }

    #[test]
    fn test_replace_reserved_range() {
        let fx = Fixture::new();
        let Claim::Granted(claimed) = fx.file.claim(0, None).unwrap() else {
            panic!("expected a granted claim");
        };
        fx.file
            .replace_reserved_range(claimed, Some(BlockRange::new(0, 9)));
        assert_eq!(fx.file.reserved(), vec![BlockRange::new(0, 9)]);

        fx.file.replace_reserved_range(BlockRange::new(0, 9), None);
        assert!(fx.file.reserved().is_empty());
    }

    #[test]
    fn test_full_file_requires_actual_size() {
        let fx = Fixture::new();
        fx.add_block(BlockRange::new(0, 4), b"hello");
        assert!(!fx.file.is_full_file());

        fx.file.set_actual_size(Some(10));
        assert!(!fx.file.is_full_file());

        fx.add_block(BlockRange::new(5, 9), b"world");
        assert!(fx.file.is_full_file());
        assert_eq!(&fx.file.read(BlockRange::new(3, 6)).unwrap()[..], b"lowo");
    }

    #[test]
    fn test_full_file_false_with_block_in_flight() {
        let fx = Fixture::new();
        fx.add_block(BlockRange::new(0, 4), b"hello");
        fx.file.set_actual_size(Some(5));
        assert!(fx.file.is_full_file());

        let block = Arc::new(CacheBlock::new(
            fx.file.key().clone(),
            CacheTier::Memory,
            BlockRange::new(5, 9),
            Box::new(MemoryBacking::new(fx.pool.clone())),
            fx.usage.clone(),
        ));
        fx.file.attach_block(block.clone());
        assert!(!fx.file.is_full_file());
        fx.file.discard_block(&block);
        assert!(fx.file.is_full_file());
    }

    #[test]
    fn test_read_rejects_gap() {
        let fx = Fixture::new();
        fx.add_block(BlockRange::new(0, 4), b"hello");
        fx.add_block(BlockRange::new(10, 14), b"world");
        assert_matches!(
            fx.file.read(BlockRange::new(0, 14)),
            Err(Error::InvalidRange { .. })
        );
        assert_eq!(
            fx.file.covered(),
            vec![BlockRange::new(0, 4), BlockRange::new(10, 14)]
        );
    }

    #[test]
    fn test_version_stamps_blocks_once() {
        let fx = Fixture::new();
        let block = fx.add_block(BlockRange::new(0, 1), b"ab");
        assert!(fx.file.set_version(3));
        assert!(!fx.file.set_version(5));
        assert_eq!(fx.file.version(), 3);
        assert_eq!(block.version(), 3);
    }

    #[test]
    fn test_complete_and_upload_transitions() {
        let fx = Fixture::new();
        let block = fx.add_block(BlockRange::new(0, 1), b"ab");
        fx.file.set_actual_size(Some(2));
        fx.file.to_be_pushed().unwrap();
        assert_eq!(fx.file.state(), FileState::ToBePushed);
        assert_eq!(block.state(), BlockState::Pushed);

        assert!(fx.file.mark_uploaded().unwrap());
        assert_eq!(block.state(), BlockState::Complete);
        assert!(!fx.file.mark_uploaded().unwrap());
    }

    #[test]
    fn test_delete_deferred_until_last_reader() {
        let fx = Fixture::new();
        fx.add_block(BlockRange::new(0, 4), b"hello");
        let used = fx.usage.used();
        assert_eq!(used, 5);

        let r1 = fx.file.open_reader().unwrap();
        let r2 = fx.file.open_reader().unwrap();
        assert_eq!(fx.file.readers(), 2);

        assert!(fx.file.delete());
        assert!(!fx.file.delete());
        assert!(!fx.file.is_deleted());
        assert!(fx.file.open_reader().is_none());
        assert_eq!(&r1.read(BlockRange::new(0, 4)).unwrap()[..], b"hello");

        drop(r1);
        assert!(!fx.file.is_deleted());
        drop(r2);
        assert!(fx.file.is_deleted());
        assert_eq!(fx.usage.used(), 0);
        assert_eq!(fx.file.readers(), 0);
    }

    #[test]
    fn test_delete_without_readers_is_immediate() {
        let fx = Fixture::new();
        fx.add_block(BlockRange::new(0, 4), b"hello");
        assert!(fx.file.delete());
        assert!(fx.file.is_deleted());
        assert_eq!(fx.file.state(), FileState::Obsolete);
        assert_eq!(fx.usage.used(), 0);
    }
}
