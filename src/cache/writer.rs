//! Multi-block writer
//!
//! Streams one requested byte range into a CacheFile. Sub-ranges another
//! writer already reserved are skipped; blocks are created only for the
//! gaps this writer claims. Each claim ends right before the next existing
//! reservation (or at the final stop), so two writers never write the same
//! byte.

use std::sync::Arc;

use tracing::{debug, trace};

use super::backing::{BlockAllocator, TierUsage};
use super::block::{BlockState, CacheBlock};
use super::file::{CacheFile, Claim};
use super::naming::BlockLabel;
use super::range::BlockRange;
use crate::error::{Error, Result};

/// Writes one byte range of a CacheFile as a sequence of blocks
pub struct MultiBlockWriter {
    file: Arc<CacheFile>,
    allocator: Arc<dyn BlockAllocator>,
    usage: Arc<TierUsage>,
    chunk_size: usize,
    start: i64,
    position: i64,
    /// Inclusive; `None` while the object length is unknown
    stop: Option<i64>,
    /// Block being written and the reservation it was claimed under
    current: Option<(Arc<CacheBlock>, BlockRange)>,
    written: u64,
    skipped: u64,
    exhausted: bool,
}

impl MultiBlockWriter {
    pub fn new(
        file: Arc<CacheFile>,
        allocator: Arc<dyn BlockAllocator>,
        usage: Arc<TierUsage>,
        chunk_size: usize,
        start: i64,
        stop: Option<i64>,
    ) -> Self {
        Self {
            file,
            allocator,
            usage,
            chunk_size: chunk_size.max(1),
            start,
            position: start,
            stop,
            current: None,
            written: 0,
            skipped: 0,
            exhausted: false,
        }
    }

    /// Next byte offset this writer expects
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    #[inline]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Bytes this writer stored itself
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes consumed because another writer had reserved them
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// True once the tier ran out of capacity
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }

    /// Write the next bytes of the range.
    ///
    /// On `OutOfCapacity` the current block keeps its written prefix, the
    /// file is marked partial, and every later call fails the same way.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if self.exhausted {
            return Err(Error::OutOfCapacity {
                tier: self.usage.tier(),
                requested: data.len() as u64,
                available: self.usage.capacity().saturating_sub(self.usage.used()),
            });
        }

        while !data.is_empty() {
            if let Some(stop) = self.stop {
                if self.position > stop {
                    return Err(Error::InvalidRange {
                        start: self.position,
                        stop,
                    });
                }
            }

            let (block, claimed) = match self.current.take() {
                Some(current) => current,
                None => match self.file.claim(self.position, self.stop)? {
                    Claim::Covered(range) => {
                        let skip = ((range.stop - self.position) as u64 + 1).min(data.len() as u64);
                        trace!(key = %self.file.key(), from = self.position, skip, "Skipping reserved bytes");
                        data = &data[skip as usize..];
                        self.position += skip as i64;
                        self.skipped += skip;
                        continue;
                    }
                    Claim::Granted(range) => (self.open_block(range)?, range),
                },
            };

            let n = data.len().min(self.chunk_size);
            match block.write(&data[..n]) {
                Ok(taken) => {
                    data = &data[taken..];
                    self.position += taken as i64;
                    self.written += taken as u64;
                    if block.remaining() == 0 {
                        block.close();
                        self.file.commit_block(&block);
                    } else {
                        self.current = Some((block, claimed));
                    }
                }
                Err(e) if e.is_out_of_capacity() => {
                    debug!(
                        key = %self.file.key(),
                        tier = %self.usage.tier(),
                        position = self.position,
                        "Tier out of capacity, keeping written prefix"
                    );
                    self.keep_prefix(block, claimed);
                    self.file.mark_partial();
                    self.exhausted = true;
                    return Err(e);
                }
                Err(e) => {
                    self.file.replace_reserved_range(claimed, None);
                    self.file.discard_block(&block);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn open_block(&self, range: BlockRange) -> Result<Arc<CacheBlock>> {
        let label = BlockLabel {
            state: BlockState::Incomplete,
            version: self.file.version(),
            key: self.file.key().clone(),
            range,
            partial: false,
        };
        let backing = match self.allocator.allocate(&label) {
            Ok(backing) => backing,
            Err(e) => {
                self.file.replace_reserved_range(range, None);
                return Err(e);
            }
        };
        let block = Arc::new(CacheBlock::new(
            self.file.key().clone(),
            self.usage.tier(),
            range,
            backing,
            self.usage.clone(),
        ));
        self.file.attach_block(block.clone());
        Ok(block)
    }

    /// Shrink the block and its reservation to the written prefix
    fn keep_prefix(&self, block: Arc<CacheBlock>, claimed: BlockRange) {
        match block.truncate() {
            Some(range) => {
                if range != claimed {
                    self.file.replace_reserved_range(claimed, Some(range));
                }
                block.close();
                self.file.commit_block(&block);
            }
            None => {
                self.file.replace_reserved_range(claimed, None);
                self.file.discard_block(&block);
            }
        }
    }

    /// Seal the block in progress.
    ///
    /// An unbounded or short claim is fixed to the bytes actually written.
    pub fn finish(&mut self) -> Result<()> {
        if let Some((block, claimed)) = self.current.take() {
            self.keep_prefix(block, claimed);
        }
        Ok(())
    }

    /// Drop the block in progress without making it visible
    pub fn abort(&mut self) {
        if let Some((block, claimed)) = self.current.take() {
            self.file.replace_reserved_range(claimed, None);
            self.file.discard_block(&block);
        }
    }
}

impl std::fmt::Debug for MultiBlockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBlockWriter")
            .field("key", self.file.key())
            .field("tier", &self.usage.tier())
            .field("start", &self.start)
            .field("position", &self.position)
            .field("stop", &self.stop)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing::MemoryAllocator;
    use crate::cache::key::CacheKey;
    use crate::cache::pool::BufferPool;
    use crate::cache::range::OPEN_END;
    use crate::cache::CacheTier;
    use assert_matches::assert_matches;

    struct Fixture {
        file: Arc<CacheFile>,
        allocator: Arc<dyn BlockAllocator>,
        usage: Arc<TierUsage>,
    }

    impl Fixture {
        fn new(capacity: u64) -> Self {
            Self {
                file: Arc::new(CacheFile::new(CacheKey::new("b", "k"), CacheTier::Memory)),
                allocator: Arc::new(MemoryAllocator::new(Arc::new(BufferPool::new(64, 16)))),
                usage: Arc::new(TierUsage::new(CacheTier::Memory, capacity)),
            }
        }

        fn writer(&self, start: i64, stop: Option<i64>) -> MultiBlockWriter {
            MultiBlockWriter::new(
                self.file.clone(),
                self.allocator.clone(),
                self.usage.clone(),
                100,
                start,
                stop,
            )
        }
    }

    fn pattern(range: std::ops::Range<usize>) -> Vec<u8> {
        range.map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_two_writers_split_range() {
        let fx = Fixture::new(1 << 20);
        let data = pattern(0..1000);

        // second half claimed first
        let mut tail = fx.writer(500, Some(999));
        tail.write(&data[500..501]).unwrap();
        let mut head = fx.writer(0, Some(999));
        head.write(&data[..]).unwrap();
        head.finish().unwrap();
        assert_eq!(head.written(), 500);
        assert_eq!(head.skipped(), 500);

        tail.write(&data[501..]).unwrap();
        tail.finish().unwrap();

        fx.file.set_actual_size(Some(1000));
        assert!(fx.file.is_full_file());
        assert_eq!(fx.usage.used(), 1000);
        assert_eq!(&fx.file.read(BlockRange::new(0, 999)).unwrap()[..], &data[..]);
        assert_eq!(fx.file.reserved(), vec![BlockRange::new(0, 999)]);
    }

    #[test]
    fn test_no_byte_written_twice() {
        let fx = Fixture::new(1 << 20);
        let data = pattern(0..300);
        let mut first = fx.writer(0, Some(299));
        first.write(&data).unwrap();
        first.finish().unwrap();

        let mut second = fx.writer(0, Some(299));
        second.write(&data).unwrap();
        second.finish().unwrap();
        assert_eq!(second.written(), 0);
        assert_eq!(fx.usage.used(), 300);
    }

    #[test]
    fn test_blocks_are_chunked_by_claim_not_chunk_size() {
        let fx = Fixture::new(1 << 20);
        let mut writer = fx.writer(0, Some(249));
        writer.write(&pattern(0..250)).unwrap();
        writer.finish().unwrap();
        assert_eq!(fx.file.block_count(), 1);
        assert_eq!(fx.file.size(), 250);
    }

    #[test]
    fn test_out_of_capacity_keeps_prefix() {
        let fx = Fixture::new(150);
        let mut writer = fx.writer(0, Some(999));
        let err = writer.write(&pattern(0..1000)).unwrap_err();
        assert!(err.is_out_of_capacity());
        assert!(writer.is_exhausted());
        assert_eq!(writer.position(), 100);
        assert!(fx.file.is_partial());
        assert_eq!(fx.file.covered(), vec![BlockRange::new(0, 99)]);
        assert_eq!(fx.file.reserved(), vec![BlockRange::new(0, 99)]);
        assert_matches!(writer.write(b"x"), Err(Error::OutOfCapacity { .. }));
    }

    #[test]
    fn test_unbounded_write_fixed_on_finish() {
        let fx = Fixture::new(1 << 20);
        let mut writer = fx.writer(0, None);
        writer.write(&pattern(0..120)).unwrap();
        writer.write(&pattern(120..130)).unwrap();
        writer.finish().unwrap();
        assert_eq!(fx.file.covered(), vec![BlockRange::new(0, 129)]);
        assert_eq!(fx.file.reserved(), vec![BlockRange::new(0, 129)]);
        assert!(!fx.file.reserved().iter().any(|r| r.stop == OPEN_END));
    }

    #[test]
    fn test_write_past_stop_rejected() {
        let fx = Fixture::new(1 << 20);
        let mut writer = fx.writer(0, Some(3));
        assert_matches!(writer.write(b"12345"), Err(Error::InvalidRange { .. }));
        assert_eq!(writer.written(), 4);
    }

    #[test]
    fn test_abort_releases_reservation() {
        let fx = Fixture::new(1 << 20);
        let mut writer = fx.writer(0, Some(99));
        writer.write(&pattern(0..50)).unwrap();
        writer.abort();
        assert!(fx.file.reserved().is_empty());
        assert!(!fx.file.has_incomplete());
        assert_eq!(fx.usage.used(), 0);
    }
}
