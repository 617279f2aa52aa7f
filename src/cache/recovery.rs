//! Disk tier recovery
//!
//! Rebuilds the disk tier map from block file names at startup. Committed
//! (`C`) and pending-upload (`P`) blocks are adopted; in-progress, aborted,
//! obsolete and unparseable files are removed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::backing::DiskBacking;
use super::block::{BlockState, CacheBlock};
use super::file::{CacheFile, FileState};
use super::key::CacheKey;
use super::naming::BlockLabel;
use super::range::BlockRange;
use super::tier::TierManager;
use super::version::VersionCounter;
use super::CacheTier;
use crate::error::Result;

/// What recovery found under the disk root
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub files: usize,
    pub blocks: usize,
    pub bytes: u64,
    /// Leftover files that were deleted
    pub removed: usize,
    /// Recovered copies still waiting for upload
    #[serde(skip)]
    pub pending_uploads: Vec<Arc<CacheFile>>,
}

struct FoundBlock {
    label: BlockLabel,
    path: PathBuf,
    len: u64,
}

/// Adopt the block files under `root` into `disk`
pub fn recover_disk_tier(
    root: &Path,
    disk: &TierManager,
    versions: &VersionCounter,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    // ordered by version so the newest copy of a key is put last
    let mut groups: BTreeMap<(i64, CacheKey), Vec<FoundBlock>> = BTreeMap::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        let label = name.to_str().and_then(BlockLabel::parse);
        match label {
            Some(label)
                if matches!(label.state, BlockState::Complete | BlockState::Pushed)
                    && meta.len() == label.range.len() =>
            {
                groups
                    .entry((label.version, label.key.clone()))
                    .or_default()
                    .push(FoundBlock {
                        label,
                        path,
                        len: meta.len(),
                    });
            }
            _ => {
                debug!("Removing leftover block file {}", path.display());
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
                report.removed += 1;
            }
        }
    }

    let mut pushed = Vec::new();
    for ((version, key), mut found) in groups {
        found.sort_by_key(|b| b.label.range.start);
        let file = Arc::new(CacheFile::new(key.clone(), CacheTier::Disk));
        file.set_version(version);

        let mut partial = false;
        let mut pending = false;
        let mut bytes = 0u64;
        for block in found {
            partial |= block.label.partial;
            pending |= block.label.state == BlockState::Pushed;
            bytes += block.len;
            let backing = DiskBacking::existing(block.path, block.len);
            let block = Arc::new(CacheBlock::recovered(
                &block.label,
                CacheTier::Disk,
                Box::new(backing),
                disk.usage().clone(),
            ));
            file.commit_block(&block);
            report.blocks += 1;
        }

        let contiguous = file.covered() == vec![BlockRange::with_len(0, bytes)];
        file.set_actual_size(if partial || !contiguous { None } else { Some(bytes) });
        let finalized = if pending {
            file.to_be_pushed()
        } else {
            file.complete()
        };
        if let Err(e) = finalized {
            warn!(key = %key, version, error = %e, "Dropping unrecoverable copy");
            file.delete();
            continue;
        }

        versions.observe(&key, version);
        if disk.put(file.clone()).is_visible() {
            report.files += 1;
            report.bytes += bytes;
            if pending {
                pushed.push(file);
            }
        }
    }

    report.pending_uploads = pushed
        .into_iter()
        .filter(|f| !f.is_obsolete() && f.state() == FileState::ToBePushed)
        .collect();
    info!(
        "Recovered disk tier at {}: {} objects, {} blocks, {} bytes, {} pending uploads, {} removed",
        root.display(),
        report.files,
        report.blocks,
        report.bytes,
        report.pending_uploads.len(),
        report.removed
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
