//! Cache blocks
//!
//! A block is one contiguous stored byte range of a CacheFile.
//!
//! ```text
//!   INCOMPLETE ──► COMPLETE ──┐
//!        │    └──► PUSHED ────┼──► OBSOLETE
//!        └──► ABORTED ────────┘
//! ```
//!
//! Reads hold the block's read lock; `delete()` takes the write lock, so it
//! waits for in-progress range reads before releasing storage.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{trace, warn};

use super::backing::{BlockBacking, TierUsage};
use super::key::CacheKey;
use super::naming::BlockLabel;
use super::range::BlockRange;
use super::CacheTier;
use crate::error::{Error, Result};

/// Lifecycle state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    /// Being written
    Incomplete,
    /// Fully written and visible
    Complete,
    /// Fully written, waiting for the remote upload
    Pushed,
    /// Superseded or deleted
    Obsolete,
    /// Write abandoned before completion
    Aborted,
}

impl BlockState {
    /// Complete or pushed
    #[inline]
    pub fn is_committed(self) -> bool {
        matches!(self, BlockState::Complete | BlockState::Pushed)
    }
}

struct BlockInner {
    range: BlockRange,
    state: BlockState,
    written: u64,
    partial: bool,
    backing: Option<Box<dyn BlockBacking>>,
}

/// One contiguous stored byte range
pub struct CacheBlock {
    key: CacheKey,
    tier: CacheTier,
    /// 0 until stamped
    version: AtomicI64,
    usage: Arc<TierUsage>,
    inner: RwLock<BlockInner>,
}

impl CacheBlock {
    /// Create an empty block for `range`
    pub fn new(
        key: CacheKey,
        tier: CacheTier,
        range: BlockRange,
        backing: Box<dyn BlockBacking>,
        usage: Arc<TierUsage>,
    ) -> Self {
        Self {
            key,
            tier,
            version: AtomicI64::new(0),
            usage,
            inner: RwLock::new(BlockInner {
                range,
                state: BlockState::Incomplete,
                written: 0,
                partial: false,
                backing: Some(backing),
            }),
        }
    }

    /// Adopt a block found on disk at startup
    pub fn recovered(
        label: &BlockLabel,
        tier: CacheTier,
        backing: Box<dyn BlockBacking>,
        usage: Arc<TierUsage>,
    ) -> Self {
        let written = backing.len();
        usage.force_reserve(written);
        Self {
            key: label.key.clone(),
            tier,
            version: AtomicI64::new(label.version),
            usage,
            inner: RwLock::new(BlockInner {
                range: label.range,
                state: label.state,
                written,
                partial: label.partial,
                backing: Some(backing),
            }),
        }
    }

    #[inline]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current span
    pub fn range(&self) -> BlockRange {
        self.inner.read().range
    }

    pub fn state(&self) -> BlockState {
        self.inner.read().state
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.inner.read().written
    }

    /// Bytes the span can still take
    pub fn remaining(&self) -> u64 {
        let inner = self.inner.read();
        inner.range.len() - inner.written
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Stamp the version; only the first non-zero stamp sticks
    pub fn set_version(&self, version: i64) -> bool {
        version != 0
            && self
                .version
                .compare_exchange(0, version, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Append bytes, bounded by the remaining span.
    ///
    /// Returns the number of bytes taken. The tier budget is checked before
    /// anything touches the backing.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.write();
        if inner.state != BlockState::Incomplete {
            return Err(Error::InvariantViolation(format!(
                "write to {:?} block {} of {}",
                inner.state, inner.range, self.key
            )));
        }
        let n = (inner.range.len() - inner.written).min(data.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }

        self.usage.try_reserve(n as u64)?;
        let backing = match inner.backing.as_mut() {
            Some(backing) => backing,
            None => {
                self.usage.release(n as u64);
                return Err(Error::InvariantViolation(format!(
                    "write to released block of {}",
                    self.key
                )));
            }
        };
        if let Err(e) = backing.append(&data[..n]) {
            self.usage.release(n as u64);
            return Err(e);
        }
        inner.written += n as u64;
        Ok(n)
    }

    /// Seal the block; reports whether the whole span was written.
    ///
    /// An open-ended span is fixed to the bytes actually written.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.range.is_open() && inner.written > 0 {
            let start = inner.range.start;
            let written = inner.written;
            inner.range.update(start, start + written as i64 - 1);
        }
        inner.written > 0 && inner.written == inner.range.len()
    }

    /// Shrink the span to the written prefix.
    ///
    /// Returns the new span, or `None` when nothing was written.
    pub fn truncate(&self) -> Option<BlockRange> {
        let mut inner = self.inner.write();
        if inner.written == 0 {
            return None;
        }
        let start = inner.range.start;
        let written = inner.written;
        inner.range.update(start, start + written as i64 - 1);
        Some(inner.range)
    }

    /// Mark fully written and visible
    pub fn complete(&self, partial: bool) -> Result<()> {
        self.transition(BlockState::Complete, partial)
    }

    /// Mark fully written and pending remote upload
    pub fn to_be_pushed(&self, partial: bool) -> Result<()> {
        self.transition(BlockState::Pushed, partial)
    }

    fn transition(&self, target: BlockState, partial: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state == target && inner.partial == partial {
            return Ok(());
        }
        if matches!(inner.state, BlockState::Obsolete | BlockState::Aborted) {
            return Err(Error::InvariantViolation(format!(
                "{:?} block {} of {} cannot become {:?}",
                inner.state, inner.range, self.key, target
            )));
        }

        let label = BlockLabel {
            state: target,
            version: self.version(),
            key: self.key.clone(),
            range: inner.range,
            partial,
        };
        if let Some(backing) = inner.backing.as_mut() {
            backing.relabel(&label)?;
        }
        inner.state = target;
        inner.partial = partial;
        Ok(())
    }

    /// Abandon the write; the data never becomes visible
    pub fn abort_write(&self) {
        {
            let mut inner = self.inner.write();
            if inner.state == BlockState::Incomplete {
                inner.state = BlockState::Aborted;
            }
        }
        self.delete();
    }

    /// Release storage. Runs at most once; returns false on repeat calls.
    pub fn delete(&self) -> bool {
        let mut inner = self.inner.write();
        let Some(mut backing) = inner.backing.take() else {
            return false;
        };
        if let Err(e) = backing.release() {
            warn!(key = %self.key, range = %inner.range, error = %e, "Failed to release block storage");
        }
        self.usage.release(inner.written);
        if inner.state != BlockState::Aborted {
            inner.state = BlockState::Obsolete;
        }
        trace!(key = %self.key, tier = %self.tier, range = %inner.range, "Deleted block");
        true
    }

    /// Read the part of `range` this block holds.
    pub fn read(&self, range: BlockRange) -> Result<Bytes> {
        let inner = self.inner.read();
        let backing = inner.backing.as_ref().ok_or_else(|| {
            Error::InvariantViolation(format!("read from released block of {}", self.key))
        })?;
        let written = BlockRange::with_len(inner.range.start, inner.written.max(1));
        if inner.written == 0 || !written.contains_range(&range) {
            return Err(Error::InvalidRange {
                start: range.start,
                stop: range.stop,
            });
        }
        backing.read((range.start - inner.range.start) as u64, range.len() as usize)
    }
}

impl std::fmt::Debug for CacheBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CacheBlock")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("version", &self.version())
            .field("range", &inner.range)
            .field("state", &inner.state)
            .field("written", &inner.written)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
