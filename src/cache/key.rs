//! Object identity shared by every tier

use std::hash::{Hash, Hasher};

/// Cache key - composite of bucket and object key
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Bucket name hash (for fast comparison)
    bucket_hash: u64,
    /// Object key hash
    key_hash: u64,
    bucket: String,
    key: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let key = key.into();

        let bucket_hash = Self::fx_hash(bucket.as_bytes());
        let key_hash = Self::fx_hash(key.as_bytes());

        Self {
            bucket_hash,
            key_hash,
            bucket,
            key,
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Get bucket name
    #[inline]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get object key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True if the object key starts with `prefix`
    #[inline]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.key.starts_with(prefix)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        if self.bucket_hash != other.bucket_hash || self.key_hash != other.key_hash {
            return false;
        }
        self.bucket == other.bucket && self.key == other.key
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.bucket.as_str(), self.key.as_str()).cmp(&(other.bucket.as_str(), other.key.as_str()))
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bucket_hash.hash(state);
        self.key_hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

// =============================================================================
// Tests
// =============================================================================
