//! Gateway configuration
//!
//! All sections default to a usable single-node setup so a YAML file only
//! needs to name what it changes:
//!
//! ```yaml
//! memory:
//!   capacity_bytes: 1073741824
//! disk:
//!   root: /var/cache/tiergate
//! eviction:
//!   item_policy:
//!     kind: lrfu
//!     lambda: 0.1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default memory tier capacity (1GB)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Default disk tier capacity (50GB)
pub const DEFAULT_DISK_CAPACITY: u64 = 50 * 1024 * 1024 * 1024;

/// Default pooled buffer segment size (64KB)
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier
    pub memory: MemoryTierConfig,
    /// Disk tier
    pub disk: DiskTierConfig,
    /// Admission (tier selection)
    pub admission: AdmissionConfig,
    /// Write path behaviour
    pub write: WriteConfig,
    /// Eviction subsystem
    pub eviction: EvictionConfig,
    /// Background remote uploads
    pub upload: UploadConfig,
}

impl CacheConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.memory.enabled && !self.disk.enabled {
            return Err(Error::Config(
                "at least one of memory or disk tier must be enabled".into(),
            ));
        }
        if self.memory.enabled && self.memory.capacity_bytes == 0 {
            return Err(Error::Config("memory.capacity_bytes must be > 0".into()));
        }
        if self.disk.enabled && self.disk.capacity_bytes == 0 {
            return Err(Error::Config("disk.capacity_bytes must be > 0".into()));
        }
        if self.memory.segment_size == 0 {
            return Err(Error::Config("memory.segment_size must be > 0".into()));
        }
        if self.write.chunk_size == 0 {
            return Err(Error::Config("write.chunk_size must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&self.eviction.trigger_percent) {
            return Err(Error::Config(
                "eviction.trigger_percent must be within 0-100".into(),
            ));
        }
        if let Some(low) = self.eviction.low_watermark_percent {
            if low >= self.eviction.trigger_percent {
                return Err(Error::Config(
                    "eviction.low_watermark_percent must be below trigger_percent".into(),
                ));
            }
        }
        if self.upload.max_parallel == 0 {
            return Err(Error::Config("upload.max_parallel must be > 0".into()));
        }
        if self.eviction.max_parallel_downgrades == 0 {
            return Err(Error::Config(
                "eviction.max_parallel_downgrades must be > 0".into(),
            ));
        }
        self.eviction.item_policy.validate()
    }
}

/// Memory tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Enable the memory tier
    pub enabled: bool,
    /// Maximum bytes held by memory blocks
    pub capacity_bytes: u64,
    /// Size of one pooled buffer segment
    pub segment_size: usize,
    /// Segments retained in the pool for reuse
    pub max_pooled_segments: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: DEFAULT_MEMORY_CAPACITY,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_pooled_segments: 4096,
        }
    }
}

/// Disk tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    /// Enable the disk tier
    pub enabled: bool,
    /// Maximum bytes held by disk blocks
    pub capacity_bytes: u64,
    /// Directory holding block files
    pub root: PathBuf,
    /// Rebuild the tier from the block directory at startup
    pub recover_on_start: bool,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: DEFAULT_DISK_CAPACITY,
            root: PathBuf::from("/var/cache/tiergate"),
            recover_on_start: true,
        }
    }
}

/// Admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Objects above this size skip the memory tier
    pub memory_max_object_bytes: u64,
    /// Objects below this size skip the disk tier
    pub disk_min_object_bytes: u64,
    /// Write new objects to both local tiers when both admit them
    pub write_both_tiers: bool,
    /// Objects of unknown length are admitted to memory
    pub unknown_length_to_memory: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            memory_max_object_bytes: 64 * 1024 * 1024,
            disk_min_object_bytes: 0,
            write_both_tiers: false,
            unknown_length_to_memory: true,
        }
    }
}

/// Write path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Continue a write on disk when memory runs out mid-object
    pub continue_to_disk: bool,
    /// Largest slice handed to a block per capacity check
    pub chunk_size: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            continue_to_disk: true,
            chunk_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

/// Item ranking used to pick eviction victims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemPolicyKind {
    /// Insertion order
    Fifo,
    /// Least recently used
    Lru,
    /// Most recently used
    Mru,
    /// Least frequently used
    Lfu,
    /// Least recently/frequently used with decay bias `lambda` per access tick
    Lrfu { lambda: f64 },
    /// Objects accessed within `window_secs` are protected; stale large first
    Life { window_secs: u64 },
    /// Exponential decay with a half-life
    Exd { half_life_secs: f64 },
}

impl Default for ItemPolicyKind {
    fn default() -> Self {
        ItemPolicyKind::Lru
    }
}

impl ItemPolicyKind {
    fn validate(&self) -> Result<()> {
        match self {
            ItemPolicyKind::Lrfu { lambda } if !(0.0..=1.0).contains(lambda) => Err(
                Error::Config("eviction.item_policy.lambda must be within 0-1".into()),
            ),
            ItemPolicyKind::Exd { half_life_secs } if *half_life_secs <= 0.0 => Err(
                Error::Config("eviction.item_policy.half_life_secs must be > 0".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Interval between eviction scans (milliseconds)
    pub interval_ms: u64,
    /// Usage percentage that starts eviction
    pub trigger_percent: f64,
    /// Optional percentage eviction continues down to once started
    pub low_watermark_percent: Option<f64>,
    /// Victim ranking
    pub item_policy: ItemPolicyKind,
    /// Move memory victims to disk instead of deleting them
    pub downgrade_to_disk: bool,
    /// Downgrade even when the remote store already holds the object
    pub downgrade_mirrored: bool,
    /// Concurrent memory-to-disk downgrades
    pub max_parallel_downgrades: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            trigger_percent: 90.0,
            low_watermark_percent: None,
            item_policy: ItemPolicyKind::default(),
            downgrade_to_disk: true,
            downgrade_mirrored: true,
            max_parallel_downgrades: 4,
        }
    }
}

impl EvictionConfig {
    /// Interval between eviction scans
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Background upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Concurrent background uploads
    pub max_parallel: usize,
    /// Queued uploads before `close()` waits for room
    pub queue_depth: usize,
    /// Retry attempts after the first failed upload
    pub max_retries: u32,
    /// Initial retry delay, doubled per attempt (milliseconds)
    pub retry_delay_ms: u64,
    /// Bytes read from the local copy per remote write call
    pub read_chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            queue_depth: 1024,
            max_retries: 3,
            retry_delay_ms: 100,
            read_chunk_size: 1024 * 1024,
        }
    }
}

impl UploadConfig {
    /// Initial retry delay
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.capacity_bytes, DEFAULT_MEMORY_CAPACITY);
        assert_eq!(config.eviction.item_policy, ItemPolicyKind::Lru);
    }

    #[test]
    fn test_yaml_partial_override() {
        let raw = r#"
memory:
  capacity_bytes: 4096
disk:
  enabled: false
eviction:
  trigger_percent: 75
  item_policy:
    kind: lrfu
    lambda: 0.25
"#;
        let config = CacheConfig::from_yaml_str(raw).unwrap();
        assert_eq!(config.memory.capacity_bytes, 4096);
        assert_eq!(config.memory.segment_size, DEFAULT_SEGMENT_SIZE);
        assert!(!config.disk.enabled);
        assert_eq!(config.eviction.trigger_percent, 75.0);
        assert_eq!(
            config.eviction.item_policy,
            ItemPolicyKind::Lrfu { lambda: 0.25 }
        );
    }

    #[test]
    fn test_both_tiers_disabled_rejected() {
        let mut config = CacheConfig::default();
        config.memory.enabled = false;
        config.disk.enabled = false;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_watermark_must_be_below_trigger() {
        let mut config = CacheConfig::default();
        config.eviction.low_watermark_percent = Some(95.0);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        config.eviction.low_watermark_percent = Some(70.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_item_policy_parameters() {
        let mut config = CacheConfig::default();
        config.eviction.item_policy = ItemPolicyKind::Lrfu { lambda: 2.0 };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        config.eviction.item_policy = ItemPolicyKind::Exd {
            half_life_secs: 0.0,
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_malformed_yaml_is_reported() {
        let result = CacheConfig::from_yaml_str("memory: [1, 2");
        assert_matches!(result, Err(Error::Yaml(_)));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiergate.yaml");
        std::fs::write(&path, "write:\n  continue_to_disk: false\n").unwrap();

        let config = CacheConfig::from_yaml_file(&path).unwrap();
        assert!(!config.write.continue_to_disk);
    }
}
