//! Buffer pool for memory-tier blocks
//!
//! Segments are fixed-capacity `BytesMut` buffers recycled through a
//! lock-free bounded queue. A segment belongs to exactly one block between
//! `take()` and `give()`.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Lock-free pool of reusable buffer segments
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    segment_size: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    /// Create a pool retaining at most `max_pooled` idle segments
    pub fn new(segment_size: usize, max_pooled: usize) -> Self {
        Self {
            free: ArrayQueue::new(max_pooled.max(1)),
            segment_size,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Capacity of one segment
    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Take an empty segment, reusing a pooled one when available
    pub fn take(&self) -> BytesMut {
        match self.free.pop() {
            Some(segment) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                segment
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.segment_size)
            }
        }
    }

    /// Return a segment; dropped when the pool is full
    pub fn give(&self, mut segment: BytesMut) {
        segment.clear();
        if segment.capacity() < self.segment_size {
            return;
        }
        let _ = self.free.push(segment);
    }

    /// Idle segments currently pooled
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Segments allocated fresh since creation
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Segments served from the pool since creation
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_allocates_when_empty() {
        let pool = BufferPool::new(128, 4);
        let segment = pool.take();
        assert!(segment.capacity() >= 128);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.reused(), 0);
    }

    #[test]
    fn test_given_segment_is_reused_cleared() {
        let pool = BufferPool::new(128, 4);
        let mut segment = pool.take();
        segment.extend_from_slice(b"hello");
        pool.give(segment);
        assert_eq!(pool.idle(), 1);

        let again = pool.take();
        assert!(again.is_empty());
        assert_eq!(pool.reused(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(16, 2);
        let segments: Vec<_> = (0..4).map(|_| pool.take()).collect();
        for segment in segments {
            pool.give(segment);
        }
        assert_eq!(pool.idle(), 2);
    }
}
