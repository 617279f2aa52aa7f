//! Tiered Cache Storage Engine
//!
//! Objects are cached as byte-range blocks in a memory tier and a disk tier in
//! front of a remote object store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             CacheEngine                                   │
//! │   create() ──► WriteSession ──┬──► MultiBlockWriter ──► memory CacheFile  │
//! │                               ├──► MultiBlockWriter ──► disk CacheFile    │
//! │                               └──► RemoteWriter (sync) / Uploader (async) │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  TierManager (memory)      │ TierManager (disk)      │ RemoteStore        │
//! │  ┌──────────────────────┐  │ ┌────────────────────┐  │ ┌──────────────┐   │
//! │  │ DashMap<Key, File>   │  │ │ DashMap<Key, File> │  │ │ S3-compatible│   │
//! │  │ pooled buffer blocks │  │ │ one file per block │  │ │ object store │   │
//! │  └──────────────────────┘  │ └────────────────────┘  │ └──────────────┘   │
//! │            │                          ▲                                   │
//! │            └──── EvictionManager ─────┘ (downgrade / delete)              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - At most one visible CacheFile per key per tier; the highest version wins.
//! - A CacheFile is physically deleted only after its last reader is gone.
//! - Concurrent writers of one CacheFile never write the same byte twice.

mod admission;
mod backing;
mod block;
mod engine;
pub mod eviction;
mod file;
mod key;
mod naming;
mod pool;
pub mod range;
mod recovery;
mod remote;
mod session;
mod stats;
mod tier;
mod uploader;
mod version;
mod writer;

pub use admission::{AdmissionPolicy, ObjectCandidate, SizeAdmissionPolicy, WriteTarget};
pub use backing::{
    BlockAllocator, BlockBacking, DiskAllocator, DiskBacking, MemoryAllocator, MemoryBacking,
    TierUsage,
};
pub use block::{BlockState, CacheBlock};
pub use engine::{CacheEngine, EngineSnapshot};
pub use eviction::{EvictionManager, EvictionReport, EvictionSnapshot};
pub use file::{CacheFile, Claim, FileReadHandle, FileState};
pub use key::CacheKey;
pub use naming::BlockLabel;
pub use pool::BufferPool;
pub use range::BlockRange;
pub use recovery::{recover_disk_tier, RecoveryReport};
pub use remote::{
    InMemoryRemoteStore, ObjectInfo, RemoteObject, RemoteStore, RemoteStoreStats, RemoteWriter,
};
pub use session::{transition, FanoutContext, FanoutState, RemoteRole, SessionKind, Step, WriteSession};
pub use stats::{CacheMetrics, CompositeSink, MetricsSnapshot, StatisticsSink, TierMetricsSnapshot};
pub use tier::{PutOutcome, TierManager, TierSnapshot};
pub use uploader::{UploadJob, Uploader, UploaderSnapshot};
pub use version::{KeyLocks, PendingGuard, PendingWrites, VersionCounter};
pub use writer::MultiBlockWriter;

use serde::Serialize;

/// Storage tier an object copy lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Pooled in-memory buffers
    Memory,
    /// One file per block under the disk root
    Disk,
    /// Remote object store
    Remote,
}

impl CacheTier {
    /// Index into per-tier metric arrays
    #[inline]
    pub fn index(self) -> usize {
        match self {
            CacheTier::Memory => 0,
            CacheTier::Disk => 1,
            CacheTier::Remote => 2,
        }
    }

    /// All tiers, fastest first
    pub const ALL: [CacheTier; 3] = [CacheTier::Memory, CacheTier::Disk, CacheTier::Remote];
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Disk => write!(f, "disk"),
            CacheTier::Remote => write!(f, "remote"),
        }
    }
}

/// Milliseconds since the Unix epoch, used for last-used stamps
#[inline]
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(CacheTier::Memory.to_string(), "memory");
        assert_eq!(CacheTier::Disk.to_string(), "disk");
        assert_eq!(CacheTier::Remote.to_string(), "remote");
    }

    #[test]
    fn test_tier_indices_are_distinct() {
        let indices: Vec<usize> = CacheTier::ALL.iter().map(|t| t.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
