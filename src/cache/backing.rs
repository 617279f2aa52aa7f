//! Block storage backends
//!
//! A CacheBlock stores its bytes through a [`BlockBacking`]: pooled buffer
//! segments for the memory tier, one file per block for the disk tier. The
//! tier-wide byte budget is enforced by [`TierUsage`] before any physical
//! write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::naming::BlockLabel;
use super::pool::BufferPool;
use super::CacheTier;
use crate::error::{Error, Result};

// =============================================================================
// Capacity accounting
// =============================================================================

/// Physical byte budget of one tier
#[derive(Debug)]
pub struct TierUsage {
    tier: CacheTier,
    capacity: u64,
    used: AtomicU64,
}

impl TierUsage {
    /// Create a budget of `capacity` bytes
    pub fn new(tier: CacheTier, capacity: u64) -> Self {
        Self {
            tier,
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Reserve bytes for a pending write.
    ///
    /// Fails with `OutOfCapacity` when usage including the write would exceed
    /// the capacity.
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(bytes)?;
                (next <= self.capacity).then_some(next)
            })
            .map(|_| ())
            .map_err(|used| Error::OutOfCapacity {
                tier: self.tier,
                requested: bytes,
                available: self.capacity.saturating_sub(used),
            })
    }

    /// Account bytes that already exist (startup recovery)
    pub fn force_reserve(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Return bytes to the budget
    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Tier this budget belongs to
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    /// Bytes currently held
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Usage as a percentage of capacity
    pub fn percent(&self) -> f64 {
        if self.capacity == 0 {
            return 100.0;
        }
        self.used() as f64 * 100.0 / self.capacity as f64
    }
}

// =============================================================================
// Backing trait
// =============================================================================

/// Physical storage of one block
pub trait BlockBacking: Send + Sync + std::fmt::Debug {
    /// Append bytes at the end
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Read `len` bytes starting at `offset` within the block
    fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Bytes stored
    fn len(&self) -> u64;

    /// True if nothing is stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything past `len`
    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Persist a new identity (state, version, final range)
    fn relabel(&mut self, label: &BlockLabel) -> Result<()>;

    /// Release the storage
    fn release(&mut self) -> Result<()>;
}

/// Creates backings for new blocks of one tier
pub trait BlockAllocator: Send + Sync {
    /// Tier the backings belong to
    fn tier(&self) -> CacheTier;

    /// Create an empty backing for a block being written
    fn allocate(&self, label: &BlockLabel) -> Result<Box<dyn BlockBacking>>;
}

// =============================================================================
// Memory
// =============================================================================

/// Block bytes held in pooled buffer segments
#[derive(Debug)]
pub struct MemoryBacking {
    pool: Arc<BufferPool>,
    segments: Vec<BytesMut>,
    len: u64,
}

impl MemoryBacking {
    /// Create an empty backing drawing from `pool`
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            segments: Vec::new(),
            len: 0,
        }
    }
}

impl BlockBacking for MemoryBacking {
    fn append(&mut self, mut data: &[u8]) -> Result<()> {
        let segment_size = self.pool.segment_size();
        while !data.is_empty() {
            let needs_segment = self
                .segments
                .last()
                .map_or(true, |segment| segment.len() >= segment_size);
            if needs_segment {
                self.segments.push(self.pool.take());
            }
            let segment = self
                .segments
                .last_mut()
                .ok_or_else(|| Error::Internal("memory block has no segment".into()))?;
            let n = (segment_size - segment.len()).min(data.len());
            segment.extend_from_slice(&data[..n]);
            self.len += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset + len as u64 > self.len {
            return Err(Error::InvalidRange {
                start: offset as i64,
                stop: offset as i64 + len as i64 - 1,
            });
        }
        let segment_size = self.pool.segment_size() as u64;
        let mut out = BytesMut::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let segment = &self.segments[(pos / segment_size) as usize];
            let within = (pos % segment_size) as usize;
            let n = (segment.len() - within).min((end - pos) as usize);
            out.extend_from_slice(&segment[within..within + n]);
            pos += n as u64;
        }
        Ok(out.freeze())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.len {
            return Ok(());
        }
        let segment_size = self.pool.segment_size() as u64;
        let keep = len.div_ceil(segment_size) as usize;
        for segment in self.segments.drain(keep..) {
            self.pool.give(segment);
        }
        if let Some(last) = self.segments.last_mut() {
            let tail = (len - (keep as u64 - 1) * segment_size) as usize;
            last.truncate(tail);
        }
        self.len = len;
        Ok(())
    }

    fn relabel(&mut self, _label: &BlockLabel) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        for segment in self.segments.drain(..) {
            self.pool.give(segment);
        }
        self.len = 0;
        Ok(())
    }
}

/// Allocates pooled memory backings
#[derive(Debug)]
pub struct MemoryAllocator {
    pool: Arc<BufferPool>,
}

impl MemoryAllocator {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// Pool shared by all memory blocks
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl BlockAllocator for MemoryAllocator {
    fn tier(&self) -> CacheTier {
        CacheTier::Memory
    }

    fn allocate(&self, _label: &BlockLabel) -> Result<Box<dyn BlockBacking>> {
        Ok(Box::new(MemoryBacking::new(self.pool.clone())))
    }
}

// =============================================================================
// Disk
// =============================================================================

/// Block bytes held in a dedicated file
#[derive(Debug)]
pub struct DiskBacking {
    root: PathBuf,
    path: PathBuf,
    writer: Option<File>,
    len: u64,
}

impl DiskBacking {
    /// Create a new, empty block file
    pub fn create(root: &Path, name: &str) -> Result<Self> {
        let path = root.join(name);
        let writer = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            root: root.to_path_buf(),
            path,
            writer: Some(writer),
            len: 0,
        })
    }

    /// Adopt an existing, fully written block file
    pub fn existing(path: PathBuf, len: u64) -> Self {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            root,
            path,
            writer: None,
            len,
        }
    }

    /// Current location of the block file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockBacking for DiskBacking {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::InvariantViolation(format!("block {} is sealed", self.path.display()))
        })?;
        writer.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset + len as u64 > self.len {
            return Err(Error::InvalidRange {
                start: offset as i64,
                stop: offset as i64 + len as i64 - 1,
            });
        }
        // Independent handle so concurrent readers never share a cursor
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.len {
            return Ok(());
        }
        match self.writer.as_mut() {
            Some(writer) => {
                writer.flush()?;
                writer.set_len(len)?;
                writer.seek(SeekFrom::Start(len))?;
            }
            None => OpenOptions::new().write(true).open(&self.path)?.set_len(len)?,
        }
        self.len = len;
        Ok(())
    }

    fn relabel(&mut self, label: &BlockLabel) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let target = self.root.join(label.file_name());
        if target != self.path {
            std::fs::rename(&self.path, &target)?;
            debug!(from = %self.path.display(), to = %target.display(), "Relabeled disk block");
            self.path = target;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.writer = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Disk block already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.len = 0;
        Ok(())
    }
}

/// Allocates one file per block under a root directory
#[derive(Debug)]
pub struct DiskAllocator {
    root: PathBuf,
}

impl DiskAllocator {
    /// Create an allocator, making sure the root directory exists
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding block files
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlockAllocator for DiskAllocator {
    fn tier(&self) -> CacheTier {
        CacheTier::Disk
    }

    fn allocate(&self, label: &BlockLabel) -> Result<Box<dyn BlockBacking>> {
        let name = label.in_progress_name(&uuid::Uuid::new_v4());
        Ok(Box::new(DiskBacking::create(&self.root, &name)?))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::BlockState;
    use crate::cache::key::CacheKey;
    use crate::cache::range::BlockRange;
    use assert_matches::assert_matches;

    fn label(state: BlockState) -> BlockLabel {
        BlockLabel {
            state,
            version: 1,
            key: CacheKey::new("bucket", "key"),
            range: BlockRange::new(0, 99),
            partial: false,
        }
    }

    #[test]
    fn test_usage_rejects_over_capacity() {
        let usage = TierUsage::new(CacheTier::Memory, 100);
        usage.try_reserve(60).unwrap();
        assert_matches!(
            usage.try_reserve(50),
            Err(Error::OutOfCapacity {
                tier: CacheTier::Memory,
                requested: 50,
                available: 40
            })
        );
        usage.try_reserve(40).unwrap();
        assert_eq!(usage.used(), 100);
        assert_eq!(usage.percent(), 100.0);

        usage.release(30);
        assert_eq!(usage.used(), 70);
        usage.release(500);
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn test_memory_backing_spans_segments() {
        let pool = Arc::new(BufferPool::new(4, 8));
        let mut backing = MemoryBacking::new(pool.clone());
        backing.append(b"0123456789").unwrap();
        assert_eq!(backing.len(), 10);

        assert_eq!(&backing.read(0, 10).unwrap()[..], b"0123456789");
        assert_eq!(&backing.read(3, 6).unwrap()[..], b"345678");
        assert_matches!(backing.read(8, 5), Err(Error::InvalidRange { .. }));

        backing.truncate(5).unwrap();
        assert_eq!(&backing.read(0, 5).unwrap()[..], b"01234");
        backing.append(b"xy").unwrap();
        assert_eq!(&backing.read(0, 7).unwrap()[..], b"01234xy");

        backing.release().unwrap();
        assert!(backing.is_empty());
        assert!(pool.idle() >= 2);
    }

    #[test]
    fn test_disk_backing_relabel_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DiskAllocator::new(dir.path()).unwrap();
        let mut backing = allocator.allocate(&label(BlockState::Incomplete)).unwrap();
        backing.append(b"hello disk").unwrap();
        assert_eq!(&backing.read(6, 4).unwrap()[..], b"disk");

        let complete = label(BlockState::Complete);
        backing.relabel(&complete).unwrap();
        let expected = dir.path().join(complete.file_name());
        assert!(expected.exists());
        assert_eq!(&backing.read(0, 5).unwrap()[..], b"hello");

        backing.release().unwrap();
        assert!(!expected.exists());
    }

    #[test]
    fn test_disk_backing_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DiskAllocator::new(dir.path()).unwrap();
        let mut backing = allocator.allocate(&label(BlockState::Incomplete)).unwrap();
        backing.append(b"abcdefgh").unwrap();
        backing.truncate(3).unwrap();
        backing.append(b"XY").unwrap();
        assert_eq!(backing.len(), 5);
        assert_eq!(&backing.read(0, 5).unwrap()[..], b"abcXY");
    }
}
