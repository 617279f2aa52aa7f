//! Cache statistics
//!
//! Tier managers and the eviction manager report through a
//! [`StatisticsSink`]; [`CacheMetrics`] is the in-process collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::CacheTier;

/// Fire-and-forget statistics notifications
pub trait StatisticsSink: Send + Sync {
    fn on_put(&self, tier: CacheTier, bytes: u64, elapsed: Duration);
    fn on_get(&self, tier: CacheTier, bytes: u64, elapsed: Duration);
    fn on_delete(&self, tier: CacheTier, bytes: u64, elapsed: Duration);
    fn on_evict(&self, tier: CacheTier, bytes: u64);
    fn on_usage(&self, tier: CacheTier, used: u64, capacity: u64);
}

#[derive(Debug, Default)]
struct TierCounters {
    puts: AtomicU64,
    put_bytes: AtomicU64,
    gets: AtomicU64,
    get_bytes: AtomicU64,
    deletes: AtomicU64,
    deleted_bytes: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    used_bytes: AtomicU64,
    capacity_bytes: AtomicU64,
    // Exponential moving averages (microseconds)
    put_latency_us: AtomicU64,
    get_latency_us: AtomicU64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    tiers: [TierCounters; 3],
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: CacheTier) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn gets(&self, tier: CacheTier) -> u64 {
        self.tier(tier).gets.load(Ordering::Relaxed)
    }

    pub fn puts(&self, tier: CacheTier) -> u64 {
        self.tier(tier).puts.load(Ordering::Relaxed)
    }

    pub fn evictions(&self, tier: CacheTier) -> u64 {
        self.tier(tier).evictions.load(Ordering::Relaxed)
    }

    /// Share of reads served by local tiers
    pub fn local_hit_ratio(&self) -> f64 {
        let local = self.gets(CacheTier::Memory) + self.gets(CacheTier::Disk);
        let total = local + self.gets(CacheTier::Remote);
        if total == 0 {
            0.0
        } else {
            local as f64 / total as f64
        }
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tier = |tier: CacheTier| {
            let c = self.tier(tier);
            TierMetricsSnapshot {
                tier,
                puts: c.puts.load(Ordering::Relaxed),
                put_bytes: c.put_bytes.load(Ordering::Relaxed),
                gets: c.gets.load(Ordering::Relaxed),
                get_bytes: c.get_bytes.load(Ordering::Relaxed),
                deletes: c.deletes.load(Ordering::Relaxed),
                deleted_bytes: c.deleted_bytes.load(Ordering::Relaxed),
                evictions: c.evictions.load(Ordering::Relaxed),
                evicted_bytes: c.evicted_bytes.load(Ordering::Relaxed),
                used_bytes: c.used_bytes.load(Ordering::Relaxed),
                capacity_bytes: c.capacity_bytes.load(Ordering::Relaxed),
                put_latency: Duration::from_micros(c.put_latency_us.load(Ordering::Relaxed)),
                get_latency: Duration::from_micros(c.get_latency_us.load(Ordering::Relaxed)),
            }
        };
        MetricsSnapshot {
            memory: tier(CacheTier::Memory),
            disk: tier(CacheTier::Disk),
            remote: tier(CacheTier::Remote),
            local_hit_ratio: self.local_hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for c in &self.tiers {
            c.puts.store(0, Ordering::Relaxed);
            c.put_bytes.store(0, Ordering::Relaxed);
            c.gets.store(0, Ordering::Relaxed);
            c.get_bytes.store(0, Ordering::Relaxed);
            c.deletes.store(0, Ordering::Relaxed);
            c.deleted_bytes.store(0, Ordering::Relaxed);
            c.evictions.store(0, Ordering::Relaxed);
            c.evicted_bytes.store(0, Ordering::Relaxed);
        }
    }
}

impl StatisticsSink for CacheMetrics {
    fn on_put(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        let c = self.tier(tier);
        c.puts.fetch_add(1, Ordering::Relaxed);
        c.put_bytes.fetch_add(bytes, Ordering::Relaxed);
        Self::update_latency_ema(&c.put_latency_us, elapsed);
    }

    fn on_get(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        let c = self.tier(tier);
        c.gets.fetch_add(1, Ordering::Relaxed);
        c.get_bytes.fetch_add(bytes, Ordering::Relaxed);
        Self::update_latency_ema(&c.get_latency_us, elapsed);
    }

    fn on_delete(&self, tier: CacheTier, bytes: u64, _elapsed: Duration) {
        let c = self.tier(tier);
        c.deletes.fetch_add(1, Ordering::Relaxed);
        c.deleted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_evict(&self, tier: CacheTier, bytes: u64) {
        let c = self.tier(tier);
        c.evictions.fetch_add(1, Ordering::Relaxed);
        c.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_usage(&self, tier: CacheTier, used: u64, capacity: u64) {
        let c = self.tier(tier);
        c.used_bytes.store(used, Ordering::Relaxed);
        c.capacity_bytes.store(capacity, Ordering::Relaxed);
    }
}

/// Forwards every notification to several sinks
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn StatisticsSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn StatisticsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatisticsSink for CompositeSink {
    fn on_put(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        self.sinks.iter().for_each(|s| s.on_put(tier, bytes, elapsed));
    }

    fn on_get(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        self.sinks.iter().for_each(|s| s.on_get(tier, bytes, elapsed));
    }

    fn on_delete(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        self.sinks.iter().for_each(|s| s.on_delete(tier, bytes, elapsed));
    }

    fn on_evict(&self, tier: CacheTier, bytes: u64) {
        self.sinks.iter().for_each(|s| s.on_evict(tier, bytes));
    }

    fn on_usage(&self, tier: CacheTier, used: u64, capacity: u64) {
        self.sinks.iter().for_each(|s| s.on_usage(tier, used, capacity));
    }
}

/// Per-tier counters at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct TierMetricsSnapshot {
    pub tier: CacheTier,
    pub puts: u64,
    pub put_bytes: u64,
    pub gets: u64,
    pub get_bytes: u64,
    pub deletes: u64,
    pub deleted_bytes: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub put_latency: Duration,
    pub get_latency: Duration,
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub memory: TierMetricsSnapshot,
    pub disk: TierMetricsSnapshot,
    pub remote: TierMetricsSnapshot,
    pub local_hit_ratio: f64,
}

/// Latency tracker helper
pub(crate) struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.gets(CacheTier::Memory), 0);
        assert_eq!(metrics.local_hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        metrics.on_get(CacheTier::Memory, 10, Duration::from_micros(5));
        metrics.on_get(CacheTier::Disk, 10, Duration::from_micros(50));
        metrics.on_get(CacheTier::Disk, 10, Duration::from_micros(50));
        metrics.on_get(CacheTier::Remote, 10, Duration::from_millis(5));
        assert!((metrics.local_hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.on_put(CacheTier::Memory, 1, Duration::from_micros(100));
        assert_eq!(
            metrics.snapshot().memory.put_latency,
            Duration::from_micros(100)
        );

        metrics.on_put(CacheTier::Memory, 1, Duration::from_micros(200));
        let latency = metrics.snapshot().memory.put_latency.as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.on_evict(CacheTier::Memory, 1024);
        metrics.on_usage(CacheTier::Disk, 500, 1000);
        metrics.on_delete(CacheTier::Disk, 20, Duration::ZERO);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory.evictions, 1);
        assert_eq!(snapshot.memory.evicted_bytes, 1024);
        assert_eq!(snapshot.disk.used_bytes, 500);
        assert_eq!(snapshot.disk.deleted_bytes, 20);

        metrics.reset();
        assert_eq!(metrics.evictions(CacheTier::Memory), 0);
        // usage is a gauge and survives reset
        assert_eq!(metrics.snapshot().disk.used_bytes, 500);
    }

    #[test]
    fn test_composite_sink_fans_out() {
        let a = Arc::new(CacheMetrics::new());
        let b = Arc::new(CacheMetrics::new());
        let sink = CompositeSink::new(vec![a.clone() as Arc<dyn StatisticsSink>, b.clone()]);
        sink.on_put(CacheTier::Disk, 7, Duration::from_micros(1));
        assert_eq!(a.puts(CacheTier::Disk), 1);
        assert_eq!(b.puts(CacheTier::Disk), 1);
    }
}
