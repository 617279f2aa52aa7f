//! Admission policies
//!
//! Decide which local tiers a new write or a cache fill lands in.

use serde::Serialize;

use crate::config::AdmissionConfig;

/// Tiers a write is fanned out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
    MemoryOnly,
    DiskOnly,
    MemoryDisk,
    RemoteOnly,
}

impl WriteTarget {
    #[inline]
    pub fn has_memory(self) -> bool {
        matches!(self, WriteTarget::MemoryOnly | WriteTarget::MemoryDisk)
    }

    #[inline]
    pub fn has_disk(self) -> bool {
        matches!(self, WriteTarget::DiskOnly | WriteTarget::MemoryDisk)
    }

    /// Number of local tiers
    #[inline]
    pub fn local_tiers(self) -> usize {
        self.has_memory() as usize + self.has_disk() as usize
    }

    fn from_tiers(memory: bool, disk: bool) -> Self {
        match (memory, disk) {
            (true, true) => WriteTarget::MemoryDisk,
            (true, false) => WriteTarget::MemoryOnly,
            (false, true) => WriteTarget::DiskOnly,
            (false, false) => WriteTarget::RemoteOnly,
        }
    }
}

/// Object under consideration for admission
#[derive(Debug, Clone)]
pub struct ObjectCandidate {
    pub bucket: String,
    pub key: String,
    /// Length when known up front
    pub length: Option<u64>,
}

impl ObjectCandidate {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, length: Option<u64>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            length,
        }
    }
}

/// Tier selection for writes and cache fills
pub trait AdmissionPolicy: Send + Sync {
    /// Tiers a client write goes to
    fn select_write_target(&self, candidate: &ObjectCandidate) -> WriteTarget;

    /// Tiers data fetched from the remote store is cached in
    fn select_read_target(&self, candidate: &ObjectCandidate) -> WriteTarget;
}

/// Size based admission
///
/// Small objects go to memory, objects at least `disk_min_object_bytes` long
/// go to disk. When both tiers admit an object it lands in memory alone,
/// unless `write_both_tiers` is set.
#[derive(Debug, Clone)]
pub struct SizeAdmissionPolicy {
    config: AdmissionConfig,
    memory_enabled: bool,
    disk_enabled: bool,
}

impl SizeAdmissionPolicy {
    pub fn new(config: AdmissionConfig, memory_enabled: bool, disk_enabled: bool) -> Self {
        Self {
            config,
            memory_enabled,
            disk_enabled,
        }
    }

    fn admits_memory(&self, length: Option<u64>) -> bool {
        self.memory_enabled
            && match length {
                Some(len) => len <= self.config.memory_max_object_bytes,
                None => self.config.unknown_length_to_memory,
            }
    }

    fn admits_disk(&self, length: Option<u64>) -> bool {
        self.disk_enabled
            && length.map_or(true, |len| len >= self.config.disk_min_object_bytes)
    }
}

impl AdmissionPolicy for SizeAdmissionPolicy {
    fn select_write_target(&self, candidate: &ObjectCandidate) -> WriteTarget {
        let memory = self.admits_memory(candidate.length);
        let disk = self.admits_disk(candidate.length);
        if memory && disk && !self.config.write_both_tiers {
            return WriteTarget::MemoryOnly;
        }
        WriteTarget::from_tiers(memory, disk)
    }

    fn select_read_target(&self, candidate: &ObjectCandidate) -> WriteTarget {
        let memory = self.admits_memory(candidate.length);
        let disk = self.admits_disk(candidate.length);
        // Fills never duplicate into both tiers
        WriteTarget::from_tiers(memory, disk && !memory)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(write_both: bool) -> SizeAdmissionPolicy {
        SizeAdmissionPolicy::new(
            AdmissionConfig {
                memory_max_object_bytes: 1000,
                disk_min_object_bytes: 100,
                write_both_tiers: write_both,
                unknown_length_to_memory: true,
            },
            true,
            true,
        )
    }

    fn candidate(length: Option<u64>) -> ObjectCandidate {
        ObjectCandidate::new("bucket", "key", length)
    }

    #[test]
    fn test_size_routing() {
        let policy = policy(false);
        assert_eq!(policy.select_write_target(&candidate(Some(50))), WriteTarget::MemoryOnly);
        assert_eq!(policy.select_write_target(&candidate(Some(500))), WriteTarget::MemoryOnly);
        assert_eq!(policy.select_write_target(&candidate(Some(5000))), WriteTarget::DiskOnly);
        assert_eq!(policy.select_write_target(&candidate(None)), WriteTarget::MemoryOnly);
    }

    #[test]
    fn test_write_both_tiers() {
        let policy = policy(true);
        assert_eq!(policy.select_write_target(&candidate(Some(500))), WriteTarget::MemoryDisk);
        assert_eq!(policy.select_write_target(&candidate(Some(50))), WriteTarget::MemoryOnly);
        assert_eq!(policy.select_read_target(&candidate(Some(500))), WriteTarget::MemoryOnly);
    }

    #[test]
    fn test_disabled_tiers_fall_back_to_remote() {
        let policy = SizeAdmissionPolicy::new(AdmissionConfig::default(), false, false);
        assert_eq!(policy.select_write_target(&candidate(Some(1))), WriteTarget::RemoteOnly);

        let disk_only = SizeAdmissionPolicy::new(AdmissionConfig::default(), false, true);
        assert_eq!(disk_only.select_write_target(&candidate(Some(1))), WriteTarget::DiskOnly);
    }

    #[test]
    fn test_target_helpers() {
        assert_eq!(WriteTarget::MemoryDisk.local_tiers(), 2);
        assert_eq!(WriteTarget::RemoteOnly.local_tiers(), 0);
        assert!(WriteTarget::DiskOnly.has_disk());
        assert!(!WriteTarget::DiskOnly.has_memory());
    }
}
