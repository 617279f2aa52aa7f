//! Trigger policies decide when a tier needs eviction.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::EvictionConfig;

/// Decides whether eviction should run given the current usage
pub trait TriggerPolicy: Send + Sync {
    fn should_evict(&self, used: u64, capacity: u64) -> bool;

    /// Policy name for logs
    fn name(&self) -> &'static str;
}

fn usage_percent(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 100.0;
    }
    used as f64 * 100.0 / capacity as f64
}

/// Fires while usage/capacity is at or above a percentage
#[derive(Debug, Clone)]
pub struct ThresholdTrigger {
    percent: f64,
}

impl ThresholdTrigger {
    pub fn new(percent: f64) -> Self {
        Self { percent }
    }
}

impl TriggerPolicy for ThresholdTrigger {
    fn should_evict(&self, used: u64, capacity: u64) -> bool {
        used > 0 && usage_percent(used, capacity) >= self.percent
    }

    fn name(&self) -> &'static str {
        "threshold"
    }
}

/// Starts at the high watermark and keeps firing down to the low one
#[derive(Debug)]
pub struct WatermarkTrigger {
    high: f64,
    low: f64,
    active: AtomicBool,
}

impl WatermarkTrigger {
    pub fn new(high: f64, low: f64) -> Self {
        Self {
            high,
            low,
            active: AtomicBool::new(false),
        }
    }
}

impl TriggerPolicy for WatermarkTrigger {
    fn should_evict(&self, used: u64, capacity: u64) -> bool {
        let percent = usage_percent(used, capacity);
        if used > 0 && percent >= self.high {
            self.active.store(true, Ordering::Relaxed);
        } else if used == 0 || percent <= self.low {
            self.active.store(false, Ordering::Relaxed);
        }
        self.active.load(Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        "watermark"
    }
}

/// Build the configured trigger for one tier
pub fn trigger_from_config(config: &EvictionConfig) -> Box<dyn TriggerPolicy> {
    match config.low_watermark_percent {
        Some(low) => Box::new(WatermarkTrigger::new(config.trigger_percent, low)),
        None => Box::new(ThresholdTrigger::new(config.trigger_percent)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_trigger() {
        let trigger = ThresholdTrigger::new(90.0);
        assert!(trigger.should_evict(1124, 1124));
        assert!(trigger.should_evict(1012, 1124));
        assert!(!trigger.should_evict(100, 1124));
        assert!(!trigger.should_evict(0, 1124));
    }

    #[test]
    fn test_watermark_hysteresis() {
        let trigger = WatermarkTrigger::new(90.0, 70.0);
        assert!(!trigger.should_evict(80, 100));
        assert!(trigger.should_evict(95, 100));
        // still above the low watermark
        assert!(trigger.should_evict(80, 100));
        assert!(!trigger.should_evict(70, 100));
        assert!(!trigger.should_evict(80, 100));
    }

    #[test]
    fn test_trigger_from_config() {
        let mut config = EvictionConfig::default();
        assert_eq!(trigger_from_config(&config).name(), "threshold");
        config.low_watermark_percent = Some(50.0);
        assert_eq!(trigger_from_config(&config).name(), "watermark");
    }
}
