//! Placement policies decide where an eviction victim goes.

use crate::cache::file::{CacheFile, FileState};
use crate::cache::CacheTier;

/// Fate of an eviction victim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Remove the copy
    Delete,
    /// Re-stream the copy into the disk tier at the same version
    Downgrade,
    /// Keep it mapped; nothing else holds the data yet
    Retain,
}

/// Decides the fate of a victim
pub trait PlacementPolicy: Send + Sync {
    fn place(&self, tier: CacheTier, file: &CacheFile) -> Placement;
}

/// Downgrade memory victims to disk when possible
///
/// Files still waiting for their remote upload are downgraded whenever a
/// disk tier exists and retained otherwise. Files the remote store already
/// holds are downgraded only with `downgrade_mirrored`.
#[derive(Debug, Clone)]
pub struct DefaultPlacement {
    disk_available: bool,
    downgrade_to_disk: bool,
    downgrade_mirrored: bool,
}

impl DefaultPlacement {
    pub fn new(disk_available: bool, downgrade_to_disk: bool, downgrade_mirrored: bool) -> Self {
        Self {
            disk_available,
            downgrade_to_disk,
            downgrade_mirrored,
        }
    }
}

impl PlacementPolicy for DefaultPlacement {
    fn place(&self, tier: CacheTier, file: &CacheFile) -> Placement {
        let pending_upload = file.state() == FileState::ToBePushed;
        match tier {
            CacheTier::Memory if pending_upload && self.disk_available => Placement::Downgrade,
            CacheTier::Memory
                if self.disk_available && self.downgrade_to_disk && self.downgrade_mirrored =>
            {
                Placement::Downgrade
            }
            _ if pending_upload => Placement::Retain,
            _ => Placement::Delete,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
