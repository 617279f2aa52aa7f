//! tiergate - tiered caching gateway for S3-compatible object stores
//!
//! Objects written through the gateway fan out across a memory tier, a disk
//! tier and the remote store. Reads are served from the fastest tier holding
//! the bytes; the remote store eventually holds a complete copy carrying the
//! per-key version it was written with.
//!
//! # Modules
//!
//! - [`cache`] - Tiered cache storage engine
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus statistics sink

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cache::{
    CacheEngine, CacheKey, CacheMetrics, CacheTier, EngineSnapshot, InMemoryRemoteStore,
    ObjectInfo, RemoteStore, StatisticsSink, WriteSession,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use metrics::PrometheusStats;
