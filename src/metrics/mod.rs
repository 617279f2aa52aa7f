//! Prometheus metrics
//!
//! [`PrometheusStats`] mirrors every statistics notification into the
//! process-wide registry served at `/metrics`. Series are labelled by tier.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::cache::{CacheTier, StatisticsSink};
use crate::error::{Error, Result};

const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
];

static PUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_puts_total", "Objects stored per tier", &["tier"]).unwrap()
});
static PUT_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_put_bytes_total", "Bytes stored per tier", &["tier"])
        .unwrap()
});
static GETS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_gets_total", "Reads served per tier", &["tier"]).unwrap()
});
static GET_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_get_bytes_total", "Bytes served per tier", &["tier"])
        .unwrap()
});
static DELETES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_deletes_total", "Objects deleted per tier", &["tier"])
        .unwrap()
});
static EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tiergate_evictions_total", "Objects evicted per tier", &["tier"])
        .unwrap()
});
static EVICTED_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tiergate_evicted_bytes_total",
        "Bytes evicted per tier",
        &["tier"]
    )
    .unwrap()
});
static USED_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("tiergate_used_bytes", "Bytes held per tier", &["tier"]).unwrap()
});
static CAPACITY_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("tiergate_capacity_bytes", "Capacity per tier", &["tier"]).unwrap()
});
static PUT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tiergate_put_seconds",
        "Latency of stores in seconds",
        &["tier"],
        LATENCY_BUCKETS.to_vec()
    )
    .unwrap()
});
static GET_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tiergate_get_seconds",
        "Latency of reads in seconds",
        &["tier"],
        LATENCY_BUCKETS.to_vec()
    )
    .unwrap()
});

/// Statistics sink backed by the default Prometheus registry
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusStats;

impl PrometheusStats {
    /// Register every family so scrapes see them before the first event
    pub fn new() -> Self {
        Lazy::force(&PUTS);
        Lazy::force(&PUT_BYTES);
        Lazy::force(&GETS);
        Lazy::force(&GET_BYTES);
        Lazy::force(&DELETES);
        Lazy::force(&EVICTIONS);
        Lazy::force(&EVICTED_BYTES);
        Lazy::force(&USED_BYTES);
        Lazy::force(&CAPACITY_BYTES);
        Lazy::force(&PUT_SECONDS);
        Lazy::force(&GET_SECONDS);
        Self
    }
}

fn label(tier: CacheTier) -> [&'static str; 1] {
    match tier {
        CacheTier::Memory => ["memory"],
        CacheTier::Disk => ["disk"],
        CacheTier::Remote => ["remote"],
    }
}

impl StatisticsSink for PrometheusStats {
    fn on_put(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        let l = label(tier);
        PUTS.with_label_values(&l).inc();
        PUT_BYTES.with_label_values(&l).inc_by(bytes);
        PUT_SECONDS.with_label_values(&l).observe(elapsed.as_secs_f64());
    }

    fn on_get(&self, tier: CacheTier, bytes: u64, elapsed: Duration) {
        let l = label(tier);
        GETS.with_label_values(&l).inc();
        GET_BYTES.with_label_values(&l).inc_by(bytes);
        GET_SECONDS.with_label_values(&l).observe(elapsed.as_secs_f64());
    }

    fn on_delete(&self, tier: CacheTier, _bytes: u64, _elapsed: Duration) {
        DELETES.with_label_values(&label(tier)).inc();
    }

    fn on_evict(&self, tier: CacheTier, bytes: u64) {
        let l = label(tier);
        EVICTIONS.with_label_values(&l).inc();
        EVICTED_BYTES.with_label_values(&l).inc_by(bytes);
    }

    fn on_usage(&self, tier: CacheTier, used: u64, capacity: u64) {
        let l = label(tier);
        USED_BYTES.with_label_values(&l).set(used as i64);
        CAPACITY_BYTES.with_label_values(&l).set(capacity as i64);
    }
}

/// Encode the default registry in the text exposition format
pub fn encode_text() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}

// =============================================================================
// Tests
// =============================================================================
